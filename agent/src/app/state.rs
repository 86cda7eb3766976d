//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::app::options::AppOptions;
use crate::deploy::git::GitCloner;
use crate::deploy::hub::LogHub;
use crate::deploy::orchestrator::{Orchestrator, OrchestratorOptions};
use crate::deploy::store::DeploymentStore;
use crate::errors::AgentError;

/// Main application state
pub struct AppState {
    /// Deployment registry
    pub store: Arc<DeploymentStore>,

    /// Log fan-out hub
    pub hub: Arc<LogHub>,

    /// Lifecycle orchestrator
    pub orchestrator: Orchestrator,
}

impl AppState {
    /// Initialize application state
    pub async fn init(options: &AppOptions) -> Result<Self, AgentError> {
        info!("Initializing application state...");

        options.layout.setup().await?;

        let store = Arc::new(DeploymentStore::new());
        let hub = Arc::new(LogHub::new(options.log_buffer));

        let deploy_root = options
            .deploy_root
            .clone()
            .unwrap_or_else(|| options.layout.deployments_dir());

        let orchestrator = Orchestrator::new(
            store.clone(),
            hub.clone(),
            Arc::new(GitCloner),
            OrchestratorOptions {
                deploy_root,
                halt_on_build_failure: options.halt_on_build_failure,
            },
        );

        Ok(Self {
            store,
            hub,
            orchestrator,
        })
    }

    /// Shutdown application state: cancel pipelines and kill tracked
    /// processes. Bookkeeping is in memory only, so nothing is persisted.
    pub async fn shutdown(&self) -> Result<(), AgentError> {
        info!("Shutting down application state...");
        self.store.kill_all().await;
        Ok(())
    }
}
