//! Settings file management

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::errors::AgentError;
use crate::logs::LogLevel;

/// Agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Local HTTP server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Override for the deployment working-directory root
    #[serde(default)]
    pub deploy_root: Option<PathBuf>,

    /// Capacity of the log broadcast buffer, per subscriber
    #[serde(default = "default_log_buffer")]
    pub log_buffer: usize,

    /// Treat a nonzero build exit code as a deployment failure.
    /// The reference behavior runs the application regardless.
    #[serde(default)]
    pub halt_on_build_failure: bool,
}

fn default_log_buffer() -> usize {
    1024
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            server: ServerSettings::default(),
            deploy_root: None,
            log_buffer: default_log_buffer(),
            halt_on_build_failure: false,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file
    pub async fn load(path: &Path) -> Result<Self, AgentError> {
        let contents = fs::read_to_string(path).await?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }
}

/// Local HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7070
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}
