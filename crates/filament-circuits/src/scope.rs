//! Per-circuit service scope.
//!
//! Each circuit owns exactly one scope, created by the factory and
//! disposed, synchronously, when the circuit is disposed. The scope hands
//! the lifecycle subsystem its per-circuit collaborators: the program
//! runtime, navigation and auth state, and the registered circuit
//! handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::handler::CircuitHandler;
use crate::program::ProgramRuntime;

/// Navigation state for one circuit. Starts detached; a connected circuit
/// attaches it during initialization so location changes reach the client,
/// while a prerendering circuit leaves it in degraded, non-interactive
/// mode.
#[derive(Debug, Default)]
pub struct NavigationState {
    inner: parking_lot::RwLock<NavigationInner>,
}

#[derive(Debug, Default)]
struct NavigationInner {
    current_uri: String,
    base_uri: String,
    interactive: bool,
}

impl NavigationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&self, current_uri: &str, base_uri: &str) {
        let mut inner = self.inner.write();
        inner.current_uri = current_uri.to_string();
        inner.base_uri = base_uri.to_string();
    }

    /// Records a location change driven by the UI program.
    pub fn set_location(&self, uri: &str) {
        self.inner.write().current_uri = uri.to_string();
    }

    pub fn attach_client(&self) {
        self.inner.write().interactive = true;
    }

    pub fn detach_client(&self) {
        self.inner.write().interactive = false;
    }

    pub fn current_uri(&self) -> String {
        self.inner.read().current_uri.clone()
    }

    pub fn base_uri(&self) -> String {
        self.inner.read().base_uri.clone()
    }

    /// Whether URI interception is attached to a live client.
    pub fn interactive(&self) -> bool {
        self.inner.read().interactive
    }
}

/// Fixed snapshot of the authenticated principal, captured when the
/// circuit is created. The transport may die and come back; the principal
/// does not change for the life of the circuit.
#[derive(Debug, Default)]
pub struct AuthState {
    principal: parking_lot::RwLock<Option<String>>,
}

impl AuthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&self, principal: Option<String>) {
        *self.principal.write() = principal;
    }

    pub fn principal(&self) -> Option<String> {
        self.principal.read().clone()
    }
}

#[derive(Debug, Error)]
#[error("failed to allocate circuit scope: {0}")]
pub struct ScopeError(#[from] pub anyhow::Error);

/// The scoped container surface the lifecycle subsystem consumes. One
/// scope per circuit, never shared, never reused. `dispose` must be
/// synchronous, deterministic, and idempotent; it cascades to everything
/// the scope owns.
pub trait ScopedServices: Send + Sync {
    fn program_runtime(&self) -> Arc<dyn ProgramRuntime>;

    fn navigation(&self) -> Arc<NavigationState>;

    fn auth(&self) -> Arc<AuthState>;

    /// Handlers registered in this scope, in registration order. The
    /// pipeline applies the priority ordering; implementations must not
    /// pre-sort.
    fn circuit_handlers(&self) -> Vec<Arc<dyn CircuitHandler>>;

    fn dispose(&self);
}

/// Allocates one scope per circuit.
pub trait ScopeFactory: Send + Sync {
    fn create_scope(&self) -> Result<Arc<dyn ScopedServices>, ScopeError>;
}

/// Ready-made [`ScopedServices`] for hosts without a richer container:
/// holds the collaborators directly and runs registered teardown hooks
/// exactly once on dispose.
pub struct CircuitServices {
    runtime: Arc<dyn ProgramRuntime>,
    navigation: Arc<NavigationState>,
    auth: Arc<AuthState>,
    handlers: Vec<Arc<dyn CircuitHandler>>,
    disposed: AtomicBool,
    teardown: parking_lot::Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl CircuitServices {
    pub fn new(runtime: Arc<dyn ProgramRuntime>) -> Self {
        Self {
            runtime,
            navigation: Arc::new(NavigationState::new()),
            auth: Arc::new(AuthState::new()),
            handlers: Vec::new(),
            disposed: AtomicBool::new(false),
            teardown: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn CircuitHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_teardown(self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.teardown.lock().push(Box::new(hook));
        self
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl ScopedServices for CircuitServices {
    fn program_runtime(&self) -> Arc<dyn ProgramRuntime> {
        Arc::clone(&self.runtime)
    }

    fn navigation(&self) -> Arc<NavigationState> {
        Arc::clone(&self.navigation)
    }

    fn auth(&self) -> Arc<AuthState> {
        Arc::clone(&self.auth)
    }

    fn circuit_handlers(&self) -> Vec<Arc<dyn CircuitHandler>> {
        self.handlers.clone()
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let hooks = std::mem::take(&mut *self.teardown.lock());
        for hook in hooks {
            hook();
        }
    }
}
