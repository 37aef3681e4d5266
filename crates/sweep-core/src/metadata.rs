//! Cluster metadata protocol.
//!
//! Backends are configured after construction through
//! `set_cluster_metadata(key, value)` calls, where `value` is a JSON
//! document. The key constants and the payload types shared by more than
//! one backend live here; backend-specific payloads live next to the
//! backend that consumes them.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Metadata keys understood by at least one backend.
pub mod keys {
    /// Trial command, code directory and resource demand. Required by every
    /// backend before the first submit.
    pub const TRIAL_CONFIG: &str = "trial_config";
    /// Address the trial uses to reach back into the manager.
    pub const MANAGER_IP: &str = "manager_ip";
    /// Whether trials verify their runtime version against the manager's.
    pub const VERSION_CHECK: &str = "version_check";
    /// Log collection mode advertised to trials.
    pub const LOG_COLLECTION: &str = "log_collection";
    /// Comma-separated platform names enabling the hybrid dispatcher.
    pub const PLATFORM_LIST: &str = "platform_list";
    /// Local platform settings.
    pub const LOCAL_CONFIG: &str = "local_config";
    /// Remote SSH machine list.
    pub const REMOTE_CONFIG: &str = "remote_config";
    /// Kubeflow cluster settings.
    pub const KUBEFLOW_CONFIG: &str = "kubeflow_config";
    /// FrameworkController cluster settings.
    pub const FRAMEWORK_CONTROLLER_CONFIG: &str = "framework_controller_config";
    /// Batch cluster endpoint and credentials.
    pub const BATCH_CONFIG: &str = "batch_config";
}

/// Parses a metadata value into its typed payload, tagging parse failures
/// with the key they arrived under.
pub fn parse_value<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|err| Error::invalid_metadata(key, err.to_string()))
}

/// Splits a `platform_list` value into platform names.
#[must_use]
pub fn parse_platform_list(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

/// The trial command and the code it runs, common to every backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialRunConfig {
    pub command: String,
    pub code_dir: PathBuf,
    #[serde(default)]
    pub gpu_count: Option<u32>,
}

/// Payload of the `manager_ip` metadata key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerIpConfig {
    pub ip: String,
}

/// Where a trial reports back to. The ip arrives via the `manager_ip`
/// metadata key; the port is whatever the backend's callback server bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerEndpoint {
    pub ip: String,
    pub port: u16,
}

impl ManagerEndpoint {
    #[must_use]
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }
}

impl fmt::Display for ManagerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_trial_run_config() {
        let raw = r#"{"command": "python3 train.py", "code_dir": "/tmp/code", "gpu_count": 1}"#;
        let config: TrialRunConfig = parse_value(keys::TRIAL_CONFIG, raw).unwrap();
        assert_eq!(config.command, "python3 train.py");
        assert_eq!(config.code_dir, PathBuf::from("/tmp/code"));
        assert_eq!(config.gpu_count, Some(1));
    }

    #[test]
    fn parse_failure_names_the_key() {
        let err = parse_value::<TrialRunConfig>(keys::TRIAL_CONFIG, "not json").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("trial_config"), "unexpected message: {message}");
    }

    #[test]
    fn platform_list_splits_and_trims() {
        assert_eq!(parse_platform_list("local, remote ,kubeflow"), vec!["local", "remote", "kubeflow"]);
        assert!(parse_platform_list("").is_empty());
    }
}
