//! Process-substrate configuration, parsed once from metadata.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Payload of the `local_config` metadata key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalExecConfig {
    /// GPU indices trials are allowed to see. Absent means any GPU a trial
    /// asks for, counted from zero.
    #[serde(default)]
    pub gpu_indices: Option<Vec<u32>>,
}

const fn default_ssh_port() -> u16 {
    22
}

/// One SSH-reachable training host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMachineConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    /// Private key passed to `ssh -i`; omitted means the ambient agent or
    /// default key.
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

impl RemoteMachineConfig {
    /// `user@host` as it appears on the ssh command line.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Payload of the `remote_config` metadata key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteExecConfig {
    pub machines: Vec<RemoteMachineConfig>,
}
