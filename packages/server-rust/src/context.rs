//! Shared collaborators handed to the dispatcher.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::ServerConfig;
use crate::sasl::MechanismRegistry;
use crate::traits::{Backend, IdentityMapper};

/// Configuration plus the pluggable services operations run against.
///
/// Configuration is behind `ArcSwap` so a reconfigure is visible to the
/// next operation without blocking running ones.
#[derive(Clone)]
pub struct ServerContext {
    config: Arc<ArcSwap<ServerConfig>>,
    backend: Arc<dyn Backend>,
    identities: Arc<dyn IdentityMapper>,
    mechanisms: Arc<MechanismRegistry>,
}

impl ServerContext {
    /// Uses the built-in mechanism set.
    pub fn new(
        config: ServerConfig,
        backend: Arc<dyn Backend>,
        identities: Arc<dyn IdentityMapper>,
    ) -> Self {
        Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            backend,
            identities,
            mechanisms: Arc::new(MechanismRegistry::with_builtin()),
        }
    }

    #[must_use]
    pub fn with_mechanisms(mut self, mechanisms: MechanismRegistry) -> Self {
        self.mechanisms = Arc::new(mechanisms);
        self
    }

    #[must_use]
    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.load_full()
    }

    pub(crate) fn store_config(&self, config: ServerConfig) {
        self.config.store(Arc::new(config));
    }

    #[must_use]
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    #[must_use]
    pub fn identities(&self) -> &dyn IdentityMapper {
        self.identities.as_ref()
    }

    #[must_use]
    pub fn mechanisms(&self) -> &MechanismRegistry {
        &self.mechanisms
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("config", &self.config.load())
            .field("mechanisms", &self.mechanisms)
            .finish_non_exhaustive()
    }
}
