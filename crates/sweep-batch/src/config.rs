//! Batch cluster configuration, parsed once from metadata.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How the backend authenticates against the cluster REST API. The method
/// is an explicit discriminant; a config carrying both a password and a
/// token cannot be expressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum BatchAuth {
    /// Exchange username/password for a token, refreshed on an age gate.
    Password { password: String },
    /// Fixed token supplied by the user, never refreshed.
    Token { token: String },
}

const fn default_https() -> bool {
    true
}

/// Payload of the `batch_config` metadata key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchClusterConfig {
    /// Host (and optional port) of the cluster REST endpoint.
    pub host: String,
    pub user_name: String,
    pub auth: BatchAuth,
    #[serde(default = "default_https")]
    pub https: bool,
}

impl BatchClusterConfig {
    #[must_use]
    pub fn base_url(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        format!("{scheme}://{}", self.host)
    }
}

const fn default_cpus() -> u32 {
    1
}

const fn default_memory_mb() -> u32 {
    4096
}

/// Payload of the `trial_config` metadata key for the batch backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTrialConfig {
    pub command: String,
    /// Only used when a storage adapter is attached for multi-phase
    /// parameter delivery.
    #[serde(default)]
    pub code_dir: Option<PathBuf>,
    pub image: String,
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default)]
    pub gpus: u32,
    #[serde(default)]
    pub virtual_cluster: Option<String>,
}
