//! Server state

use std::sync::Arc;

use crate::deploy::hub::LogHub;
use crate::deploy::orchestrator::Orchestrator;
use crate::deploy::store::DeploymentStore;

/// Server state shared across handlers
pub struct ServerState {
    pub orchestrator: Orchestrator,
    pub store: Arc<DeploymentStore>,
    pub hub: Arc<LogHub>,
}

impl ServerState {
    pub fn new(orchestrator: Orchestrator, store: Arc<DeploymentStore>, hub: Arc<LogHub>) -> Self {
        Self {
            orchestrator,
            store,
            hub,
        }
    }
}
