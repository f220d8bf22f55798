//! The client proxy: "the current transport connection for a circuit".
//!
//! The binding is an explicit two-state machine, `Unbound` or
//! `Bound(handle)`, swapped atomically under a short-held lock. Payloads
//! are opaque to this layer.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

/// One live transport connection, supplied by the hub/transport layer.
#[async_trait]
pub trait ClientConnection: Send + Sync {
    fn connection_id(&self) -> Uuid;

    fn connected(&self) -> bool;

    async fn send(&self, payload: Bytes) -> Result<(), TransportSendError>;
}

#[derive(Debug, Error)]
pub enum TransportSendError {
    #[error("transport connection closed")]
    Closed,
    #[error("transport failure: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no client connection is bound")]
    NotConnected,
    #[error(transparent)]
    Send(#[from] TransportSendError),
}

enum Binding {
    Unbound,
    Bound(Arc<dyn ClientConnection>),
}

/// Rebindable proxy over the circuit's transport connection.
pub struct ClientProxy {
    binding: parking_lot::Mutex<Binding>,
}

impl ClientProxy {
    /// A proxy with no live transport, the prerendering construction.
    pub fn unbound() -> Self {
        Self {
            binding: parking_lot::Mutex::new(Binding::Unbound),
        }
    }

    pub fn bound(connection: Arc<dyn ClientConnection>) -> Self {
        Self {
            binding: parking_lot::Mutex::new(Binding::Bound(connection)),
        }
    }

    /// Swaps in a new connection, returning the one it replaced.
    pub fn bind(&self, connection: Arc<dyn ClientConnection>) -> Option<Arc<dyn ClientConnection>> {
        let mut guard = self.binding.lock();
        match std::mem::replace(&mut *guard, Binding::Bound(connection)) {
            Binding::Bound(previous) => Some(previous),
            Binding::Unbound => None,
        }
    }

    /// Drops the current connection, returning it.
    pub fn unbind(&self) -> Option<Arc<dyn ClientConnection>> {
        let mut guard = self.binding.lock();
        match std::mem::replace(&mut *guard, Binding::Unbound) {
            Binding::Bound(previous) => Some(previous),
            Binding::Unbound => None,
        }
    }

    pub fn connected(&self) -> bool {
        match &*self.binding.lock() {
            Binding::Bound(connection) => connection.connected(),
            Binding::Unbound => false,
        }
    }

    pub fn connection_id(&self) -> Option<Uuid> {
        match &*self.binding.lock() {
            Binding::Bound(connection) => Some(connection.connection_id()),
            Binding::Unbound => None,
        }
    }

    pub async fn send(&self, payload: Bytes) -> Result<(), ProxyError> {
        let connection = match &*self.binding.lock() {
            Binding::Bound(connection) => Arc::clone(connection),
            Binding::Unbound => return Err(ProxyError::NotConnected),
        };
        connection.send(payload).await.map_err(ProxyError::from)
    }
}

impl fmt::Debug for ClientProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.binding.lock() {
            Binding::Bound(connection) => format!("Bound({})", connection.connection_id()),
            Binding::Unbound => "Unbound".to_string(),
        };
        f.debug_tuple("ClientProxy").field(&state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeConnection {
        id: Uuid,
        up: AtomicBool,
        sent: parking_lot::Mutex<Vec<Bytes>>,
    }

    impl FakeConnection {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: Uuid::new_v4(),
                up: AtomicBool::new(true),
                sent: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ClientConnection for FakeConnection {
        fn connection_id(&self) -> Uuid {
            self.id
        }

        fn connected(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }

        async fn send(&self, payload: Bytes) -> Result<(), TransportSendError> {
            if !self.connected() {
                return Err(TransportSendError::Closed);
            }
            self.sent.lock().push(payload);
            Ok(())
        }
    }

    #[test_deadline::tokio_deadline]
    async fn unbound_proxy_rejects_sends() {
        let proxy = ClientProxy::unbound();
        assert!(!proxy.connected());
        assert!(proxy.connection_id().is_none());
        assert!(matches!(
            proxy.send(Bytes::from_static(b"batch")).await,
            Err(ProxyError::NotConnected)
        ));
    }

    #[test_deadline::tokio_deadline]
    async fn bind_swaps_the_underlying_connection() {
        let first = FakeConnection::new();
        let second = FakeConnection::new();
        let proxy = ClientProxy::bound(first.clone());

        proxy.send(Bytes::from_static(b"one")).await.unwrap();

        let replaced = proxy.bind(second.clone()).expect("first was bound");
        assert_eq!(replaced.connection_id(), first.id);

        proxy.send(Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(first.sent.lock().len(), 1);
        assert_eq!(second.sent.lock().len(), 1);
        assert_eq!(proxy.connection_id(), Some(second.id));
    }

    #[test_deadline::tokio_deadline]
    async fn unbind_disconnects_without_dropping_the_proxy() {
        let connection = FakeConnection::new();
        let proxy = ClientProxy::bound(connection.clone());

        assert!(proxy.connected());
        let released = proxy.unbind().expect("was bound");
        assert_eq!(released.connection_id(), connection.id);
        assert!(!proxy.connected());
        assert!(proxy.unbind().is_none());
    }

    #[test_deadline::tokio_deadline]
    async fn a_dead_connection_reports_not_connected() {
        let connection = FakeConnection::new();
        let proxy = ClientProxy::bound(connection.clone());
        connection.up.store(false, Ordering::SeqCst);
        assert!(!proxy.connected());
    }
}
