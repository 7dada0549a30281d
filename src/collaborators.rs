//! Client-only services started after the backends.
//!
//! A client process needs four services the server never runs: a
//! connection pool, the distribution policy, a background-operation pool and
//! an operation cache.  Their implementations live in the client layer;
//! here they are opaque [`ClientCollaborator`]s started in a fixed order and
//! stopped in the reverse one.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::config::Configuration;

/// A service with a start/stop lifecycle tied to client bring-up.
pub trait ClientCollaborator: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    fn start(&self, configuration: &Configuration) -> anyhow::Result<()>;

    fn stop(&self) -> anyhow::Result<()>;
}

/// The four client collaborators, one per slot.
#[derive(Clone)]
pub struct ClientCollaborators {
    pub connection_pool: Arc<dyn ClientCollaborator>,
    pub distribution: Arc<dyn ClientCollaborator>,
    pub background_operations: Arc<dyn ClientCollaborator>,
    pub operation_cache: Arc<dyn ClientCollaborator>,
}

impl ClientCollaborators {
    /// Slots in start order.
    pub fn start_order(&self) -> [&Arc<dyn ClientCollaborator>; 4] {
        [
            &self.connection_pool,
            &self.distribution,
            &self.background_operations,
            &self.operation_cache,
        ]
    }
}

impl Default for ClientCollaborators {
    fn default() -> Self {
        Self {
            connection_pool: Arc::new(Detached::new("connection-pool")),
            distribution: Arc::new(Detached::new("distribution")),
            background_operations: Arc::new(Detached::new("background-operations")),
            operation_cache: Arc::new(Detached::new("operation-cache")),
        }
    }
}

impl fmt::Debug for ClientCollaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.start_order().iter().map(|c| c.name()))
            .finish()
    }
}

/// Placeholder used when no client layer is linked in.  Logs and succeeds.
#[derive(Debug)]
pub struct Detached {
    name: &'static str,
}

impl Detached {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl ClientCollaborator for Detached {
    fn name(&self) -> &'static str {
        self.name
    }

    fn start(&self, configuration: &Configuration) -> anyhow::Result<()> {
        debug!(
            collaborator = self.name,
            max_connections = configuration.max_connections(),
            stripe_size = configuration.stripe_size(),
            "client collaborator detached"
        );
        Ok(())
    }

    fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
