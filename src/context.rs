//! Process-wide collaborators, built once at startup and shared by reference.

use std::sync::Arc;

use crate::auth::{AllowAll, Authorizer, TokenAuthorizer};
use crate::blob::{BlobStore, MemoryBlobStore};
use crate::config::Config;
use crate::env::Environment;
use crate::relay::Relay;
use crate::worker::{ProcessLauncher, Supervisor, WorkerLauncher};

/// Everything a broker needs from the rest of the process.
#[derive(Debug, Clone)]
pub struct ProcessContext {
    /// Effective configuration.
    pub config: Arc<Config>,
    /// Worker supervisor.
    pub supervisor: Supervisor,
    /// Relay settings.
    pub relay: Relay,
    /// Shared blob store.
    pub blobs: Arc<dyn BlobStore>,
    /// Join authorization.
    pub authorizer: Arc<dyn Authorizer>,
}

impl ProcessContext {
    /// Build the production context: workers are re-executions of
    /// `config.worker_binary()`, tokens come from the config table.
    ///
    /// # Errors
    ///
    /// If the worker binary cannot be determined.
    pub fn from_config(config: Config, environment: Environment) -> anyhow::Result<Self> {
        let launcher = Arc::new(ProcessLauncher::new(config.worker_binary()?));
        Ok(Self::with_launcher(config, environment, launcher))
    }

    /// Build a context with a custom worker launcher.
    pub fn with_launcher(config: Config, environment: Environment, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let authorizer: Arc<dyn Authorizer> = if !config.tokens.is_empty() {
            Arc::new(TokenAuthorizer::new(config.tokens.clone()))
        } else if environment.is_production() {
            log::warn!("[server] No tokens configured; every join will be refused");
            Arc::new(TokenAuthorizer::new(Default::default()))
        } else {
            Arc::new(AllowAll)
        };
        Self {
            supervisor: Supervisor::new(&config, launcher),
            relay: Relay::new(config.chunk_size),
            blobs: Arc::new(MemoryBlobStore::new(config.blob_capacity)),
            authorizer,
            config: Arc::new(config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::InProcessLauncher;

    #[test]
    fn test_production_without_tokens_denies() {
        let ctx = ProcessContext::with_launcher(Config::default(), Environment::Production, Arc::new(InProcessLauncher));
        assert!(!ctx.authorizer.authorize("doc", "").allowed);
    }

    #[test]
    fn test_development_without_tokens_allows() {
        let ctx = ProcessContext::with_launcher(Config::default(), Environment::Development, Arc::new(InProcessLauncher));
        assert!(ctx.authorizer.authorize("doc", "").allowed);
    }
}
