//! External UI program surface.
//!
//! The rendering engine itself lives outside this crate; circuits talk to
//! it through [`ProgramRuntime`] and learn what to host through
//! [`DescriptorResolver`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use async_trait::async_trait;

use crate::host::Circuit;

/// One server-resident UI program plus its placement in the client shell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramDescriptor {
    pub program_id: String,
    pub placement: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl ProgramDescriptor {
    pub fn new(program_id: impl Into<String>, placement: impl Into<String>) -> Self {
        Self {
            program_id: program_id.into(),
            placement: placement.into(),
            parameters: serde_json::Value::Null,
        }
    }
}

/// Request-scoped metadata handed to the factory by the hub endpoint:
/// descriptors attached by the host wiring plus the authenticated
/// principal, if any.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    descriptors: Vec<ProgramDescriptor>,
    principal: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_descriptors(mut self, descriptors: Vec<ProgramDescriptor>) -> Self {
        self.descriptors = descriptors;
        self
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn descriptors(&self) -> &[ProgramDescriptor] {
        &self.descriptors
    }

    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }
}

#[derive(Debug, Error)]
#[error("routing configuration error: {0}")]
pub struct RoutingError(pub String);

/// Resolves the UI programs a request should host. Supplied by routing or
/// endpoint metadata external to this crate.
pub trait DescriptorResolver: Send + Sync {
    fn resolve(&self, request: &RequestContext) -> Result<Vec<ProgramDescriptor>, RoutingError>;
}

/// Default resolver: the endpoint already attached its descriptors to the
/// request context.
#[derive(Debug, Default)]
pub struct EndpointDescriptorResolver;

impl DescriptorResolver for EndpointDescriptorResolver {
    fn resolve(&self, request: &RequestContext) -> Result<Vec<ProgramDescriptor>, RoutingError> {
        Ok(request.descriptors().to_vec())
    }
}

/// An opaque UI event routed from the client to the program runtime.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub name: String,
    pub payload: Bytes,
}

impl EventEnvelope {
    pub fn new(name: impl Into<String>, payload: Bytes) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

#[derive(Debug, Error)]
#[error("ui program error: {0}")]
pub struct ProgramError(#[from] pub anyhow::Error);

/// The render engine behind one circuit. All calls arrive on the circuit's
/// dispatcher, so implementations never observe concurrent re-entry.
#[async_trait]
pub trait ProgramRuntime: Send + Sync {
    /// Attach and render the initial program set.
    async fn start(&self, descriptors: &[ProgramDescriptor]) -> Result<(), ProgramError>;

    /// Apply one UI event.
    async fn handle_event(&self, circuit: &Circuit, event: EventEnvelope)
        -> Result<(), ProgramError>;

    /// Produce a full render snapshot so a freshly attached client can be
    /// resynchronized after missing in-flight updates.
    async fn resync(&self) -> Result<Bytes, ProgramError>;
}
