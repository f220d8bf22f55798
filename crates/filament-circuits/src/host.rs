//! The circuit host: authoritative owner of one circuit's execution
//! context.
//!
//! Lifecycle: `Created → Active → Disconnected → (Active | Disposed)`,
//! with `Disposed` terminal. Every lifecycle operation and every UI event
//! runs as a job on the circuit's dispatcher, which is what makes the
//! transitions and the event stream mutually exclusive and FIFO-ordered.

use std::fmt;
use std::sync::Arc;

use metrics::counter;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CircuitOptions;
use crate::dispatcher::Dispatcher;
use crate::handler::HandlerPipeline;
use crate::identity::CircuitId;
use crate::program::{EventEnvelope, ProgramDescriptor, ProgramError, ProgramRuntime};
use crate::proxy::{ClientConnection, ClientProxy};
use crate::scope::{NavigationState, ScopedServices};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Active,
    Disconnected,
    Disposed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Created => "created",
            LifecycleState::Active => "active",
            LifecycleState::Disconnected => "disconnected",
            LifecycleState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum CircuitError {
    /// The circuit is disconnected or disposed; the caller should create
    /// or reconnect a circuit instead of retrying.
    #[error("circuit is unavailable")]
    Unavailable,
    #[error("invalid lifecycle transition from the {from} state")]
    InvalidTransition { from: LifecycleState },
    #[error(transparent)]
    Program(#[from] ProgramError),
}

/// The handle application-level code and circuit handlers see. Wraps the
/// circuit's identity and connectivity without exposing host internals.
#[derive(Clone)]
pub struct Circuit {
    id: CircuitId,
    proxy: Arc<ClientProxy>,
}

impl Circuit {
    pub fn new(id: CircuitId, proxy: Arc<ClientProxy>) -> Self {
        Self { id, proxy }
    }

    pub fn id(&self) -> &CircuitId {
        &self.id
    }

    pub fn is_connected(&self) -> bool {
        self.proxy.connected()
    }
}

impl fmt::Debug for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Circuit")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

pub struct CircuitHost {
    shared: Arc<HostShared>,
    dispatcher: Dispatcher,
}

struct HostShared {
    circuit: Circuit,
    proxy: Arc<ClientProxy>,
    scope: Arc<dyn ScopedServices>,
    runtime: Arc<dyn ProgramRuntime>,
    navigation: Arc<NavigationState>,
    pipeline: HandlerPipeline,
    descriptors: Vec<ProgramDescriptor>,
    state: parking_lot::Mutex<LifecycleState>,
}

impl CircuitHost {
    /// Builds a host in the `Created` state. The caller still runs
    /// [`CircuitHost::initialize`]. Must run inside a tokio runtime (the
    /// dispatcher worker is spawned here).
    pub fn new(
        id: CircuitId,
        proxy: ClientProxy,
        scope: Arc<dyn ScopedServices>,
        descriptors: Vec<ProgramDescriptor>,
        pipeline: HandlerPipeline,
        options: &CircuitOptions,
    ) -> Self {
        let proxy = Arc::new(proxy);
        let circuit = Circuit::new(id, Arc::clone(&proxy));
        let dispatcher = Dispatcher::new(circuit.clone(), options.dispatcher_queue_depth);
        let shared = Arc::new(HostShared {
            runtime: scope.program_runtime(),
            navigation: scope.navigation(),
            circuit,
            proxy,
            scope,
            pipeline,
            descriptors,
            state: parking_lot::Mutex::new(LifecycleState::Created),
        });
        Self { shared, dispatcher }
    }

    pub fn circuit(&self) -> &Circuit {
        &self.shared.circuit
    }

    pub fn circuit_id(&self) -> &CircuitId {
        self.shared.circuit.id()
    }

    /// Observational only; the authoritative checks happen inside
    /// dispatcher jobs.
    pub fn state(&self) -> LifecycleState {
        *self.shared.state.lock()
    }

    /// Binds collaborators, starts the UI programs, runs the
    /// `circuit_opened` pipeline stage, and transitions to `Active`. With
    /// a proxy that reports not-connected this is the prerendering path:
    /// no client-bound attachment happens and the circuit comes up in
    /// degraded, non-interactive mode.
    pub async fn initialize(&self) -> Result<(), CircuitError> {
        let shared = Arc::clone(&self.shared);
        match self
            .dispatcher
            .run(move |circuit| async move { shared.initialize(&circuit).await })
            .await
        {
            Ok(result) => result,
            Err(_) => Err(CircuitError::Unavailable),
        }
    }

    /// Routes one UI event to the program runtime on the circuit's
    /// dispatcher. Events never overlap each other, a render, or a
    /// lifecycle transition; arrival order is preserved. Rejected once the
    /// circuit is no longer `Active`; events racing a disconnect are
    /// dropped with an error rather than queued for replay.
    pub async fn dispatch_event(&self, event: EventEnvelope) -> Result<(), CircuitError> {
        let shared = Arc::clone(&self.shared);
        match self
            .dispatcher
            .run(move |circuit| async move { shared.dispatch_event(&circuit, event).await })
            .await
        {
            Ok(result) => result,
            Err(_) => Err(CircuitError::Unavailable),
        }
    }

    /// Transport closure notification. Detaches the client proxy and runs
    /// the `connection_down` stage; the scope and dispatcher stay alive so
    /// the circuit can be resumed. Idempotent, and a no-op outside
    /// `Active`.
    pub async fn mark_disconnected(&self) {
        let shared = Arc::clone(&self.shared);
        let _ = self
            .dispatcher
            .run(move |circuit| async move { shared.mark_disconnected(&circuit).await })
            .await;
    }

    /// Rebinds the proxy to a fresh transport connection, resynchronizes
    /// the client with a full render batch, and runs the `connection_up`
    /// stage. Valid only from `Disconnected`.
    pub async fn reconnect(&self, connection: Arc<dyn ClientConnection>) -> Result<(), CircuitError> {
        let shared = Arc::clone(&self.shared);
        match self
            .dispatcher
            .run(move |circuit| async move { shared.reconnect(&circuit, connection).await })
            .await
        {
            Ok(result) => result,
            Err(_) => Err(CircuitError::InvalidTransition {
                from: LifecycleState::Disposed,
            }),
        }
    }

    /// Terminal teardown: runs the `circuit_closed` stage, disposes the
    /// scope synchronously, releases the proxy and the dispatcher.
    /// Idempotent; everything after this fails.
    pub async fn dispose(&self) {
        let shared = Arc::clone(&self.shared);
        let _ = self
            .dispatcher
            .run(move |circuit| async move { shared.dispose(&circuit).await })
            .await;
        self.dispatcher.close();
    }
}

impl fmt::Debug for CircuitHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitHost")
            .field("id", self.circuit_id())
            .field("state", &self.state())
            .finish()
    }
}

impl HostShared {
    async fn initialize(&self, circuit: &Circuit) -> Result<(), CircuitError> {
        let state = *self.state.lock();
        if state != LifecycleState::Created {
            return Err(CircuitError::InvalidTransition { from: state });
        }

        if self.proxy.connected() {
            self.navigation.attach_client();
        } else {
            debug!(circuit_id = %circuit.id(), "initializing without a client (prerender)");
        }

        self.runtime.start(&self.descriptors).await?;
        self.pipeline.circuit_opened(circuit).await;
        *self.state.lock() = LifecycleState::Active;
        counter!("filament_circuits_opened_total", 1);
        info!(circuit_id = %circuit.id(), programs = self.descriptors.len(), "circuit opened");
        Ok(())
    }

    async fn dispatch_event(
        &self,
        circuit: &Circuit,
        event: EventEnvelope,
    ) -> Result<(), CircuitError> {
        let state = *self.state.lock();
        if state != LifecycleState::Active {
            debug!(
                circuit_id = %circuit.id(),
                state = %state,
                event = %event.name,
                "dropping event for unavailable circuit"
            );
            return Err(CircuitError::Unavailable);
        }
        self.runtime.handle_event(circuit, event).await?;
        counter!("filament_events_dispatched_total", 1);
        Ok(())
    }

    async fn mark_disconnected(&self, circuit: &Circuit) {
        let state = *self.state.lock();
        if state != LifecycleState::Active {
            debug!(circuit_id = %circuit.id(), state = %state, "disconnect is a no-op");
            return;
        }
        self.proxy.unbind();
        self.navigation.detach_client();
        self.pipeline.connection_down(circuit).await;
        *self.state.lock() = LifecycleState::Disconnected;
        info!(circuit_id = %circuit.id(), "circuit disconnected");
    }

    async fn reconnect(
        &self,
        circuit: &Circuit,
        connection: Arc<dyn ClientConnection>,
    ) -> Result<(), CircuitError> {
        let state = *self.state.lock();
        if state != LifecycleState::Disconnected {
            return Err(CircuitError::InvalidTransition { from: state });
        }

        self.proxy.bind(connection);
        self.navigation.attach_client();

        // The client may have lost in-flight updates; push a full snapshot
        // before any new renders. A failed push is left to the transport
        // layer, which will report the connection down again.
        match self.runtime.resync().await {
            Ok(batch) => {
                if let Err(err) = self.proxy.send(batch).await {
                    warn!(circuit_id = %circuit.id(), error = %err, "resync send failed");
                }
            }
            Err(err) => {
                warn!(circuit_id = %circuit.id(), error = %err, "resync render failed");
            }
        }

        self.pipeline.connection_up(circuit).await;
        *self.state.lock() = LifecycleState::Active;
        counter!("filament_circuits_reconnected_total", 1);
        info!(circuit_id = %circuit.id(), "circuit reconnected");
        Ok(())
    }

    async fn dispose(&self, circuit: &Circuit) {
        {
            let state = *self.state.lock();
            if state == LifecycleState::Disposed {
                return;
            }
        }
        self.pipeline.circuit_closed(circuit).await;
        self.scope.dispose();
        self.proxy.unbind();
        *self.state.lock() = LifecycleState::Disposed;
        counter!("filament_circuits_closed_total", 1);
        info!(circuit_id = %circuit.id(), "circuit closed");
    }
}
