//! In-memory deployment registry
//!
//! The only structure mutated by concurrent lifecycle tasks. The lock
//! guards the mapping itself; nothing long-running runs under it. One
//! instance is constructed at startup and injected into every component
//! that needs it.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::deploy::record::{
    Deployment, DeploymentSnapshot, DeploymentState, DeploymentSummary,
};
use crate::deploy::supervisor::ProcessHandle;
use crate::errors::AgentError;

/// Concurrent registry of deployment id to record
#[derive(Debug, Default)]
pub struct DeploymentStore {
    records: RwLock<HashMap<String, Deployment>>,
}

impl DeploymentStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a freshly created record and return its snapshot. Returns
    /// immediately; no downstream work happens here.
    pub async fn create(&self, record: Deployment) -> DeploymentSnapshot {
        let snapshot = record.snapshot();
        let mut records = self.records.write().await;
        records.insert(record.id.clone(), record);
        snapshot
    }

    pub async fn get(&self, id: &str) -> Option<DeploymentSnapshot> {
        self.records.read().await.get(id).map(Deployment::snapshot)
    }

    /// Listing rows for all records; order is unspecified.
    pub async fn list_all(&self) -> Vec<DeploymentSummary> {
        self.records
            .read()
            .await
            .values()
            .map(Deployment::summary)
            .collect()
    }

    /// Apply a state transition. Transitions the state machine does not
    /// permit are rejected so a racing command cannot corrupt a record.
    pub async fn update_state(
        &self,
        id: &str,
        new_state: DeploymentState,
    ) -> Result<(), AgentError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| AgentError::NotFound(id.to_string()))?;

        if !record.state.permits(new_state) {
            return Err(AgentError::Internal(format!(
                "invalid transition {} -> {} for deployment {}",
                record.state, new_state, id
            )));
        }

        debug!("Deployment {}: {} -> {}", id, record.state, new_state);
        record.state = new_state;
        Ok(())
    }

    /// Attach a new process handle, superseding any previous one. Returns
    /// the generation that identifies this handle in exit notifications.
    pub async fn attach_process(
        &self,
        id: &str,
        handle: ProcessHandle,
    ) -> Result<u64, AgentError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| AgentError::NotFound(id.to_string()))?;

        record.generation += 1;
        record.process = Some(handle);
        Ok(record.generation)
    }

    /// Detach and return the current handle, if any.
    pub async fn clear_process(&self, id: &str) -> Result<Option<ProcessHandle>, AgentError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| AgentError::NotFound(id.to_string()))?;
        Ok(record.process.take())
    }

    /// Operator stop, in one critical section: cancel the pipeline token,
    /// detach the handle, and mark a running record stopped. Stopping a
    /// record with no live process changes nothing and still succeeds.
    pub async fn take_for_stop(&self, id: &str) -> Result<Option<ProcessHandle>, AgentError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| AgentError::NotFound(id.to_string()))?;

        record.cancel.cancel();
        let handle = record.process.take();
        if handle.is_some() && record.state == DeploymentState::Running {
            debug!("Deployment {}: running -> stopped (operator)", id);
            record.state = DeploymentState::Stopped;
        }
        Ok(handle)
    }

    /// Exit-notification handler: move the record to `stopped` only when
    /// `generation` still identifies the current handle and the record is
    /// still running. A handle superseded by restart (or already stopped)
    /// changes nothing.
    pub async fn complete_if_current(&self, id: &str, generation: u64) -> bool {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(id) else {
            return false;
        };
        if record.generation != generation || record.state != DeploymentState::Running {
            return false;
        }

        debug!("Deployment {}: running -> stopped (exit)", id);
        record.process = None;
        record.state = DeploymentState::Stopped;
        true
    }

    /// Pipeline cancellation token for a deployment.
    pub async fn cancel_token(&self, id: &str) -> Option<CancellationToken> {
        self.records.read().await.get(id).map(|r| r.cancel.clone())
    }

    /// Cancel every pipeline and kill every live process. Used on graceful
    /// shutdown; a crash instead orphans the children.
    pub async fn kill_all(&self) {
        let mut records = self.records.write().await;
        for record in records.values_mut() {
            record.cancel.cancel();
            if let Some(handle) = record.process.take() {
                warn!("Killing deployment {} on shutdown", record.id);
                handle.kill();
                if record.state == DeploymentState::Running {
                    record.state = DeploymentState::Stopped;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::record::DeploySpec;
    use std::path::Path;

    fn record(run_cmd: &str) -> Deployment {
        Deployment::new(
            DeploySpec {
                repo_url: "https://example.com/x/sample.git".to_string(),
                build_cmd: None,
                run_cmd: run_cmd.to_string(),
                env: HashMap::new(),
                proxy: None,
            },
            Path::new("/tmp/deployments"),
        )
        .unwrap()
    }

    fn handle() -> ProcessHandle {
        // A real but short-lived process gives us a genuine handle
        let supervisor = crate::deploy::supervisor::ProcessSupervisor::new();
        supervisor
            .spawn("true", Path::new("/tmp"), &HashMap::new())
            .unwrap()
            .handle
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = DeploymentStore::new();
        let snapshot = store.create(record("echo hi")).await;

        let fetched = store.get(&snapshot.id).await.unwrap();
        assert_eq!(fetched.id, snapshot.id);
        assert_eq!(fetched.state, DeploymentState::Cloning);
        assert_eq!(fetched.repo_name, "sample");
    }

    #[tokio::test]
    async fn test_get_unknown_returns_none() {
        let store = DeploymentStore::new();
        assert!(store.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_list_all_snapshots() {
        let store = DeploymentStore::new();
        store.create(record("echo a")).await;
        store.create(record("echo b")).await;

        let all = store.list_all().await;
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|s| s.state == DeploymentState::Cloning));
    }

    #[tokio::test]
    async fn test_update_state_rejects_illegal_transition() {
        let store = DeploymentStore::new();
        let snapshot = store.create(record("echo hi")).await;

        // cloning -> stopped is not an edge of the machine
        let result = store
            .update_state(&snapshot.id, DeploymentState::Stopped)
            .await;
        assert!(result.is_err());
        assert_eq!(
            store.get(&snapshot.id).await.unwrap().state,
            DeploymentState::Cloning
        );
    }

    #[tokio::test]
    async fn test_update_state_unknown_id() {
        let store = DeploymentStore::new();
        let result = store.update_state("missing", DeploymentState::Failed).await;
        assert!(matches!(result, Err(AgentError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_attach_process_bumps_generation() {
        let store = DeploymentStore::new();
        let snapshot = store.create(record("sleep 5")).await;

        let first = store.attach_process(&snapshot.id, handle()).await.unwrap();
        let second = store.attach_process(&snapshot.id, handle()).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn test_complete_if_current_ignores_stale_generation() {
        let store = DeploymentStore::new();
        let snapshot = store.create(record("sleep 5")).await;

        let stale = store.attach_process(&snapshot.id, handle()).await.unwrap();
        store
            .update_state(&snapshot.id, DeploymentState::Running)
            .await
            .unwrap();

        // A restart swapped the handle
        let _current = store.attach_process(&snapshot.id, handle()).await.unwrap();

        assert!(!store.complete_if_current(&snapshot.id, stale).await);
        assert_eq!(
            store.get(&snapshot.id).await.unwrap().state,
            DeploymentState::Running
        );
    }

    #[tokio::test]
    async fn test_complete_if_current_stops_running_record() {
        let store = DeploymentStore::new();
        let snapshot = store.create(record("sleep 5")).await;

        let generation = store.attach_process(&snapshot.id, handle()).await.unwrap();
        store
            .update_state(&snapshot.id, DeploymentState::Running)
            .await
            .unwrap();

        assert!(store.complete_if_current(&snapshot.id, generation).await);
        assert_eq!(
            store.get(&snapshot.id).await.unwrap().state,
            DeploymentState::Stopped
        );
    }

    #[tokio::test]
    async fn test_take_for_stop_without_process_is_noop() {
        let store = DeploymentStore::new();
        let snapshot = store.create(record("echo hi")).await;

        let taken = store.take_for_stop(&snapshot.id).await.unwrap();
        assert!(taken.is_none());
        assert_eq!(
            store.get(&snapshot.id).await.unwrap().state,
            DeploymentState::Cloning
        );
    }

    #[tokio::test]
    async fn test_take_for_stop_unknown_id() {
        let store = DeploymentStore::new();
        assert!(matches!(
            store.take_for_stop("missing").await,
            Err(AgentError::NotFound(_))
        ));
    }
}
