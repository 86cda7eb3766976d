//! Repository retrieval

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::errors::AgentError;

/// Clone collaborator: fetches a repository into a destination directory.
///
/// The orchestrator only sees an opaque asynchronous success or failure;
/// tests substitute their own implementation.
#[async_trait]
pub trait Cloner: Send + Sync {
    async fn clone_repo(&self, repo_url: &str, dest: &Path) -> Result<(), AgentError>;
}

/// Clones repositories by shelling out to `git clone`
#[derive(Debug, Default, Clone)]
pub struct GitCloner;

#[async_trait]
impl Cloner for GitCloner {
    async fn clone_repo(&self, repo_url: &str, dest: &Path) -> Result<(), AgentError> {
        info!("Cloning {} into {}", repo_url, dest.display());

        let output = Command::new("git")
            .arg("clone")
            .arg(repo_url)
            .arg(dest)
            .output()
            .await
            .map_err(|e| AgentError::CloneError(format!("failed to run git: {}", e)))?;

        if !output.status.success() {
            // git reports the actual reason on its last stderr line
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr
                .lines()
                .filter(|line| !line.trim().is_empty())
                .next_back()
                .unwrap_or("git clone failed")
                .trim()
                .to_string();
            return Err(AgentError::CloneError(message));
        }

        debug!("Clone of {} complete", repo_url);
        Ok(())
    }
}
