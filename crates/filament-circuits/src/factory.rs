//! Builds fully-wired circuit hosts from inbound request context.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::config::CircuitOptions;
use crate::handler::HandlerPipeline;
use crate::host::CircuitHost;
use crate::identity::{IdentityError, IdentityIssuer};
use crate::program::{DescriptorResolver, RequestContext, RoutingError};
use crate::proxy::ClientProxy;
use crate::scope::{ScopeError, ScopeFactory};

#[derive(Debug, Error)]
pub enum CircuitCreateError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    /// A live connection resolved zero UI programs: the host wiring is
    /// broken. Only a prerendering construction (proxy not connected) may
    /// start with an empty descriptor set.
    #[error("a connected circuit resolved no program descriptors")]
    NoDescriptors,
    #[error(transparent)]
    Scope(#[from] ScopeError),
}

pub struct CircuitFactory {
    issuer: Arc<IdentityIssuer>,
    scopes: Arc<dyn ScopeFactory>,
    resolver: Arc<dyn DescriptorResolver>,
    options: CircuitOptions,
}

impl CircuitFactory {
    pub fn new(
        issuer: Arc<IdentityIssuer>,
        scopes: Arc<dyn ScopeFactory>,
        resolver: Arc<dyn DescriptorResolver>,
        options: CircuitOptions,
    ) -> Self {
        Self {
            issuer,
            scopes,
            resolver,
            options,
        }
    }

    /// Builds a host in the `Created` state: resolves the UI programs to
    /// run, allocates a fresh scope (never reused), issues a new circuit
    /// identity, and freezes the handler pipeline ordering. The caller
    /// still runs `initialize`. Must run inside a tokio runtime.
    pub fn create(
        &self,
        request: &RequestContext,
        proxy: ClientProxy,
        current_uri: &str,
        base_uri: &str,
    ) -> Result<Arc<CircuitHost>, CircuitCreateError> {
        let descriptors = self.resolver.resolve(request)?;
        if descriptors.is_empty() && proxy.connected() {
            return Err(CircuitCreateError::NoDescriptors);
        }

        let scope = self.scopes.create_scope()?;
        let id = self.issuer.issue()?;

        scope
            .auth()
            .initialize(request.principal().map(str::to_string));
        scope.navigation().initialize(current_uri, base_uri);

        let pipeline = HandlerPipeline::new(scope.circuit_handlers());
        let host = Arc::new(CircuitHost::new(
            id,
            proxy,
            scope,
            descriptors,
            pipeline,
            &self.options,
        ));
        info!(
            circuit_id = %host.circuit_id(),
            connected = host.circuit().is_connected(),
            "created circuit host"
        );
        Ok(host)
    }
}
