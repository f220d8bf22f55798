//! Tracks live circuits and holds disconnected ones for reconnection.
//!
//! A circuit id lives in at most one of the two maps, never both. Both
//! maps sit behind one short-held lock; claiming an entry under that lock
//! is the transaction that resolves every race between reconnects, the
//! expiry timer, eviction, and explicit termination: whoever removes the
//! entry first wins, and all host work happens after the lock is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use metrics::counter;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CircuitOptions;
use crate::host::CircuitHost;
use crate::identity::{CircuitId, ConnectionToken, IdentityError, IdentityIssuer};
use crate::proxy::ClientConnection;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// The same circuit id was registered twice: an identity or factory
    /// defect, never an expected runtime condition.
    #[error("circuit id already registered: {0}")]
    DuplicateCircuit(CircuitId),
    /// No circuit to resume: unknown id, stale or mismatched token, or the
    /// circuit already expired. The caller must start a new circuit, not
    /// retry.
    #[error("no circuit available for reconnection")]
    NotFound,
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

#[derive(Clone)]
pub struct CircuitRegistry {
    shared: Arc<RegistryShared>,
}

struct RegistryShared {
    state: parking_lot::Mutex<RegistryState>,
    issuer: Arc<IdentityIssuer>,
    options: CircuitOptions,
    epochs: AtomicU64,
}

#[derive(Default)]
struct RegistryState {
    connected: HashMap<CircuitId, ConnectedEntry>,
    disconnected: HashMap<CircuitId, DisconnectedEntry>,
}

struct ConnectedEntry {
    host: Arc<CircuitHost>,
    token: ConnectionToken,
}

struct DisconnectedEntry {
    host: Arc<CircuitHost>,
    token: ConnectionToken,
    disconnected_at: Instant,
    epoch: u64,
    expiry: JoinHandle<()>,
}

impl CircuitRegistry {
    pub fn new(issuer: Arc<IdentityIssuer>, options: CircuitOptions) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                state: parking_lot::Mutex::new(RegistryState::default()),
                issuer,
                options,
                epochs: AtomicU64::new(0),
            }),
        }
    }

    /// Admits a freshly created circuit and issues its initial connection
    /// token, which the transport layer hands to the client for later
    /// reconnection requests.
    pub fn register_connected(
        &self,
        host: Arc<CircuitHost>,
    ) -> Result<ConnectionToken, RegistryError> {
        let circuit_id = host.circuit_id().clone();
        let token = self.shared.issuer.issue_token(&circuit_id)?;

        let mut state = self.shared.state.lock();
        if state.connected.contains_key(&circuit_id) || state.disconnected.contains_key(&circuit_id)
        {
            error!(circuit_id = %circuit_id, "circuit id registered twice");
            return Err(RegistryError::DuplicateCircuit(circuit_id));
        }
        state.connected.insert(
            circuit_id,
            ConnectedEntry {
                host,
                token: token.clone(),
            },
        );
        counter!("filament_circuits_registered_total", 1);
        Ok(token)
    }

    /// Transport loss: moves the circuit into the disconnected-pending set,
    /// starts its expiry timer, and drives the host's own disconnect
    /// transition. Unknown ids are a no-op. When the pending set outgrows
    /// its capacity the oldest disconnect is evicted to make room, a
    /// deliberate backpressure policy.
    pub async fn disconnect(&self, circuit_id: &CircuitId) {
        let (host, evicted) = {
            let mut state = self.shared.state.lock();
            let Some(entry) = state.connected.remove(circuit_id) else {
                debug!(circuit_id = %circuit_id, "disconnect for a circuit not registered");
                return;
            };
            let epoch = self.shared.epochs.fetch_add(1, Ordering::Relaxed);
            let expiry = self.spawn_expiry(circuit_id.clone(), epoch);
            state.disconnected.insert(
                circuit_id.clone(),
                DisconnectedEntry {
                    host: Arc::clone(&entry.host),
                    token: entry.token,
                    disconnected_at: Instant::now(),
                    epoch,
                    expiry,
                },
            );
            let evicted = evict_over_capacity(
                &mut state,
                self.shared.options.max_retained_disconnected,
            );
            (entry.host, evicted)
        };

        host.mark_disconnected().await;
        info!(
            circuit_id = %circuit_id,
            retention_secs = self.shared.options.disconnected_retention.as_secs(),
            "circuit held for reconnection"
        );

        if let Some((victim_id, victim)) = evicted {
            victim.expiry.abort();
            warn!(circuit_id = %victim_id, "evicting oldest disconnected circuit");
            counter!("filament_circuits_evicted_total", 1);
            victim.host.dispose().await;
        }
    }

    /// Reattaches a disconnected circuit to a new transport connection.
    /// The presented token must pass MAC validation and match the one on
    /// file; on success the expiry timer is cancelled, the host reconnects,
    /// and a fresh token replaces the old one. Any mismatch or missing
    /// entry is `NotFound` and leaves the registry untouched.
    pub async fn connect(
        &self,
        circuit_id: &CircuitId,
        presented_token: &str,
        connection: Arc<dyn ClientConnection>,
    ) -> Result<(Arc<CircuitHost>, ConnectionToken), RegistryError> {
        let Some(presented) = self
            .shared
            .issuer
            .validate_token(circuit_id, presented_token)
        else {
            debug!(circuit_id = %circuit_id, "reconnect token failed validation");
            return Err(RegistryError::NotFound);
        };

        let fresh = self.shared.issuer.issue_token(circuit_id)?;

        let entry = {
            let mut state = self.shared.state.lock();
            let token_matches = state
                .disconnected
                .get(circuit_id)
                .map(|entry| entry.token == presented)
                .unwrap_or(false);
            if !token_matches {
                return Err(RegistryError::NotFound);
            }
            match state.disconnected.remove(circuit_id) {
                Some(entry) => entry,
                None => return Err(RegistryError::NotFound),
            }
        };

        entry.expiry.abort();

        if let Err(err) = entry.host.reconnect(connection).await {
            warn!(
                circuit_id = %circuit_id,
                error = %err,
                "reconnect failed after claiming the circuit; disposing it"
            );
            entry.host.dispose().await;
            return Err(RegistryError::NotFound);
        }

        {
            let mut state = self.shared.state.lock();
            state.connected.insert(
                circuit_id.clone(),
                ConnectedEntry {
                    host: Arc::clone(&entry.host),
                    token: fresh.clone(),
                },
            );
        }
        info!(circuit_id = %circuit_id, "circuit resumed");
        Ok((entry.host, fresh))
    }

    /// The transport-facing reconnection surface: both values arrive as
    /// untrusted wire strings. Anything malformed is `NotFound`, never an
    /// error.
    pub async fn resume(
        &self,
        raw_circuit_id: &str,
        raw_token: &str,
        connection: Arc<dyn ClientConnection>,
    ) -> Result<(Arc<CircuitHost>, ConnectionToken), RegistryError> {
        let Some(circuit_id) = self.shared.issuer.validate(raw_circuit_id) else {
            debug!("reconnect with an invalid circuit id");
            return Err(RegistryError::NotFound);
        };
        self.connect(&circuit_id, raw_token, connection).await
    }

    /// Client-initiated teardown. Removes the circuit from whichever set
    /// holds it and disposes it. Returns whether a circuit was found.
    pub async fn terminate(&self, circuit_id: &CircuitId) -> bool {
        let host = {
            let mut state = self.shared.state.lock();
            if let Some(entry) = state.connected.remove(circuit_id) {
                Some(entry.host)
            } else if let Some(entry) = state.disconnected.remove(circuit_id) {
                entry.expiry.abort();
                Some(entry.host)
            } else {
                None
            }
        };
        match host {
            Some(host) => {
                info!(circuit_id = %circuit_id, "terminating circuit");
                host.dispose().await;
                true
            }
            None => false,
        }
    }

    /// Disposes every tracked circuit. Host shutdown path.
    pub async fn shutdown(&self) {
        let hosts = {
            let mut state = self.shared.state.lock();
            let mut hosts: Vec<Arc<CircuitHost>> = Vec::new();
            hosts.extend(state.connected.drain().map(|(_, entry)| entry.host));
            for (_, entry) in state.disconnected.drain() {
                entry.expiry.abort();
                hosts.push(entry.host);
            }
            hosts
        };
        for host in hosts {
            host.dispose().await;
        }
    }

    pub fn connected_count(&self) -> usize {
        self.shared.state.lock().connected.len()
    }

    pub fn disconnected_count(&self) -> usize {
        self.shared.state.lock().disconnected.len()
    }

    fn spawn_expiry(&self, circuit_id: CircuitId, epoch: u64) -> JoinHandle<()> {
        let weak: Weak<RegistryShared> = Arc::downgrade(&self.shared);
        let retention = self.shared.options.disconnected_retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            // Claim under the lock; a reconnect or terminate that got
            // there first already removed the entry, and a newer
            // disconnect carries a newer epoch.
            let claimed = {
                let mut state = shared.state.lock();
                match state.disconnected.get(&circuit_id) {
                    Some(entry) if entry.epoch == epoch => state.disconnected.remove(&circuit_id),
                    _ => None,
                }
            };
            if let Some(entry) = claimed {
                info!(circuit_id = %circuit_id, "disconnected circuit expired");
                counter!("filament_circuits_expired_total", 1);
                entry.host.dispose().await;
            }
        })
    }
}

fn evict_over_capacity(
    state: &mut RegistryState,
    max_retained: usize,
) -> Option<(CircuitId, DisconnectedEntry)> {
    if state.disconnected.len() <= max_retained {
        return None;
    }
    let oldest = state
        .disconnected
        .iter()
        .min_by_key(|(_, entry)| entry.disconnected_at)
        .map(|(id, _)| id.clone())?;
    let entry = state.disconnected.remove(&oldest)?;
    Some((oldest, entry))
}
