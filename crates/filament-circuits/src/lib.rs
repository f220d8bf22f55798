//! Circuit lifecycle runtime for server-hosted interactive UI sessions.
//!
//! A *circuit* is one server-resident UI session tied to a single client,
//! reached over a persistent bidirectional connection. This crate owns the
//! hard part of that arrangement: lifecycle under an unreliable
//! connection: creation, per-circuit single-threaded execution, graceful
//! detachment when the transport drops, bounded-time survival for
//! reconnection, and safe disposal. Rendering, wire framing, and the
//! hosting server are collaborators behind narrow traits
//! ([`program::ProgramRuntime`], [`proxy::ClientConnection`],
//! [`scope::ScopedServices`]).

pub mod config;
pub mod dispatcher;
pub mod factory;
pub mod handler;
pub mod host;
pub mod identity;
pub mod program;
pub mod proxy;
pub mod registry;
pub mod scope;

pub use config::CircuitOptions;
pub use dispatcher::{Dispatcher, DispatcherClosed};
pub use factory::{CircuitCreateError, CircuitFactory};
pub use handler::{CircuitHandler, HandlerPipeline};
pub use host::{Circuit, CircuitError, CircuitHost, LifecycleState};
pub use identity::{CircuitId, ConnectionToken, IdentityError, IdentityIssuer};
pub use program::{
    DescriptorResolver, EndpointDescriptorResolver, EventEnvelope, ProgramDescriptor,
    ProgramError, ProgramRuntime, RequestContext, RoutingError,
};
pub use proxy::{ClientConnection, ClientProxy, ProxyError, TransportSendError};
pub use registry::{CircuitRegistry, RegistryError};
pub use scope::{
    AuthState, CircuitServices, NavigationState, ScopeError, ScopeFactory, ScopedServices,
};
