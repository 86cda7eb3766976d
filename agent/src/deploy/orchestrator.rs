//! Deployment lifecycle orchestration
//!
//! Drives each deployment through clone, build and run on its own task,
//! reacting to process exits and to operator stop/restart commands. Every
//! step is reported through the log hub and recorded in the store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::deploy::git::Cloner;
use crate::deploy::hub::LogHub;
use crate::deploy::record::{redact_proxy, Deployment, DeploymentSnapshot, DeploymentState, DeploySpec};
use crate::deploy::store::DeploymentStore;
use crate::deploy::supervisor::{ProcessExit, ProcessSupervisor, SpawnedProcess};
use crate::errors::AgentError;

/// Orchestrator policy options
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Root directory under which per-deployment workdirs are created
    pub deploy_root: PathBuf,

    /// Treat a nonzero build exit code as a deployment failure.
    /// Off by default: the run stage proceeds regardless.
    pub halt_on_build_failure: bool,
}

/// Drives deployment state machines
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<DeploymentStore>,
    hub: Arc<LogHub>,
    cloner: Arc<dyn Cloner>,
    supervisor: ProcessSupervisor,
    options: OrchestratorOptions,
}

impl Orchestrator {
    pub fn new(
        store: Arc<DeploymentStore>,
        hub: Arc<LogHub>,
        cloner: Arc<dyn Cloner>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                hub,
                cloner,
                supervisor: ProcessSupervisor::new(),
                options,
            }),
        }
    }

    /// Validate and register a new deployment, then drive it asynchronously.
    ///
    /// Returns as soon as the record exists, in `cloning` state; all further
    /// progress is reported through the log hub and the record itself.
    pub async fn deploy(&self, spec: DeploySpec) -> Result<DeploymentSnapshot, AgentError> {
        let record = Deployment::new(spec, &self.inner.options.deploy_root)?;
        let cancel = record.cancel_token();
        let snapshot = self.inner.store.create(record).await;

        info!(
            "Deployment {} created for {} ({})",
            snapshot.id, snapshot.repo_url, snapshot.repo_name
        );

        let inner = self.inner.clone();
        let id = snapshot.id.clone();
        tokio::spawn(async move {
            inner.run_pipeline(&id, cancel).await;
        });

        Ok(snapshot)
    }

    /// Stop a deployment: cancel its pipeline and kill any live process.
    /// A record with no live process is a successful no-op.
    pub async fn stop(&self, id: &str) -> Result<(), AgentError> {
        let handle = self.inner.store.take_for_stop(id).await?;
        if let Some(handle) = handle {
            handle.kill();
            self.inner.hub.publish(id, "Stopped by operator");
            info!("Deployment {} stopped", id);
        }
        Ok(())
    }

    /// Replace a deployment's process with a fresh spawn of its stored run
    /// command. The build is not re-run; the stored environment (including
    /// the injected port) is reused.
    pub async fn restart(&self, id: &str) -> Result<(), AgentError> {
        let snapshot = self
            .inner
            .store
            .get(id)
            .await
            .ok_or_else(|| AgentError::NotFound(id.to_string()))?;

        // Kill whatever is currently attached; already-exited is fine
        if let Some(old) = self.inner.store.clear_process(id).await? {
            old.kill();
        }
        self.inner.hub.publish(id, "Restarting deployment");

        let spawned = match self
            .inner
            .supervisor
            .spawn(&snapshot.run_cmd, &snapshot.workdir, &snapshot.env)
        {
            Ok(spawned) => spawned,
            Err(e) => {
                // No handle left; the record is effectively stopped
                if let Err(err) = self
                    .inner
                    .store
                    .update_state(id, DeploymentState::Stopped)
                    .await
                {
                    debug!("Deployment {}: {}", id, err);
                }
                self.inner.hub.publish(id, format!("Restart failed: {}", e));
                return Err(e);
            }
        };

        let generation = self
            .inner
            .store
            .attach_process(id, spawned.handle.clone())
            .await?;
        if let Err(e) = self
            .inner
            .store
            .update_state(id, DeploymentState::Running)
            .await
        {
            spawned.handle.kill();
            return Err(e);
        }

        info!("Deployment {} restarted (generation {})", id, generation);

        let inner = self.inner.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            inner.follow_process(&id, generation, spawned).await;
        });

        Ok(())
    }

    /// Interrupt a deployment's pipeline at the next stage boundary.
    /// The record ends up `failed`; any running process is untouched.
    pub async fn abort(&self, id: &str) -> Result<(), AgentError> {
        let cancel = self
            .inner
            .store
            .cancel_token(id)
            .await
            .ok_or_else(|| AgentError::NotFound(id.to_string()))?;
        cancel.cancel();
        Ok(())
    }
}

impl Inner {
    /// The per-deployment pipeline: clone, optional build, run.
    async fn run_pipeline(&self, id: &str, cancel: CancellationToken) {
        let Some(snapshot) = self.store.get(id).await else {
            return;
        };

        if let Err(e) = tokio::fs::create_dir_all(&self.options.deploy_root).await {
            self.fail(id, format!("Failed to prepare deploy root: {}", e))
                .await;
            return;
        }

        // Clone stage
        self.hub.publish(id, format!("Cloning {}", snapshot.repo_url));
        let clone_result = tokio::select! {
            res = self.cloner.clone_repo(&snapshot.repo_url, &snapshot.workdir) => res,
            _ = cancel.cancelled() => {
                self.abort_pipeline(id, "clone").await;
                return;
            }
        };
        if let Err(e) = clone_result {
            self.fail(id, format!("Clone failed: {}", e)).await;
            return;
        }
        self.hub.publish(id, "Clone complete");

        // Build stage, only when a build command was supplied. The build
        // runs with the agent's ambient environment, not the run env.
        if let Some(build_cmd) = &snapshot.build_cmd {
            if self.transition(id, DeploymentState::Building).await.is_err() {
                return;
            }
            self.hub.publish(id, format!("Building: {}", build_cmd));

            let spawned =
                match self
                    .supervisor
                    .spawn(build_cmd, &snapshot.workdir, &HashMap::new())
                {
                    Ok(spawned) => spawned,
                    Err(e) => {
                        self.fail(id, format!("Build failed to start: {}", e)).await;
                        return;
                    }
                };

            let build_handle = spawned.handle.clone();
            let exit = tokio::select! {
                exit = self.stream_until_exit(id, spawned) => exit,
                _ = cancel.cancelled() => {
                    build_handle.kill();
                    self.abort_pipeline(id, "build").await;
                    return;
                }
            };

            match exit {
                Some(exit) => {
                    self.hub.publish(id, format!("Build finished with {}", exit));
                    if self.options.halt_on_build_failure && exit.code != Some(0) {
                        self.fail(id, "Build failed, aborting deployment").await;
                        return;
                    }
                }
                None => {
                    self.fail(id, "Build exit notification lost").await;
                    return;
                }
            }
        }

        // Run stage
        if cancel.is_cancelled() {
            self.abort_pipeline(id, "run").await;
            return;
        }
        if let Some(proxy) = &snapshot.proxy {
            self.hub
                .publish(id, format!("Using proxy {}", redact_proxy(proxy)));
        }
        self.hub.publish(id, format!("Starting: {}", snapshot.run_cmd));

        let spawned = match self
            .supervisor
            .spawn(&snapshot.run_cmd, &snapshot.workdir, &snapshot.env)
        {
            Ok(spawned) => spawned,
            Err(e) => {
                self.fail(id, format!("Failed to start process: {}", e)).await;
                return;
            }
        };

        let generation = match self.store.attach_process(id, spawned.handle.clone()).await {
            Ok(generation) => generation,
            Err(e) => {
                spawned.handle.kill();
                error!("Deployment {} vanished before running: {}", id, e);
                return;
            }
        };
        if let Err(e) = self.store.update_state(id, DeploymentState::Running).await {
            // A stop raced the startup; honor it
            debug!("Deployment {} superseded before running: {}", id, e);
            spawned.handle.kill();
            return;
        }
        info!("Deployment {} running (generation {})", id, generation);

        self.follow_process(id, generation, spawned).await;
    }

    /// Stream every output line to the hub, then return the exit
    /// notification once both pipes are drained.
    async fn stream_until_exit(&self, id: &str, mut spawned: SpawnedProcess) -> Option<ProcessExit> {
        while let Some(line) = spawned.output.recv().await {
            self.hub.publish(id, line.text);
        }
        spawned.exit.await.ok()
    }

    /// Follow a running process to its end and apply the generation-checked
    /// exit transition.
    async fn follow_process(&self, id: &str, generation: u64, spawned: SpawnedProcess) {
        match self.stream_until_exit(id, spawned).await {
            Some(exit) => {
                self.hub
                    .publish(id, format!("Process exited with {}", exit));
                if self.store.complete_if_current(id, generation).await {
                    info!("Deployment {} stopped ({})", id, exit);
                } else {
                    debug!("Stale exit notification for deployment {} ignored", id);
                }
            }
            None => warn!("Exit notification lost for deployment {}", id),
        }
    }

    async fn transition(&self, id: &str, state: DeploymentState) -> Result<(), AgentError> {
        self.store.update_state(id, state).await.map_err(|e| {
            debug!("Deployment {}: {}", id, e);
            e
        })
    }

    /// Unrecoverable error: report it and move the record to `failed`.
    async fn fail(&self, id: &str, message: impl Into<String>) {
        let message = message.into();
        error!("Deployment {}: {}", id, message);
        self.hub.publish(id, message);
        if let Err(e) = self.store.update_state(id, DeploymentState::Failed).await {
            debug!("Deployment {} could not be marked failed: {}", id, e);
        }
    }

    async fn abort_pipeline(&self, id: &str, stage: &str) {
        self.fail(id, format!("Deployment aborted during {}", stage)).await;
    }
}
