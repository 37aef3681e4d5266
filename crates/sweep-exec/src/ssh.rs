//! Thin wrappers over the system `ssh`/`scp` binaries.

use crate::config::RemoteMachineConfig;
use std::path::Path;
use sweep_core::{Error, Result};
use tokio::process::Command;
use tracing::debug;

/// Runs commands and uploads files on one remote machine.
pub struct SshRunner {
    machine: RemoteMachineConfig,
}

impl SshRunner {
    #[must_use]
    pub fn new(machine: RemoteMachineConfig) -> Self {
        Self { machine }
    }

    #[must_use]
    pub fn machine(&self) -> &RemoteMachineConfig {
        &self.machine
    }

    fn common_options(&self) -> Vec<String> {
        let mut options = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
        ];
        if let Some(identity) = &self.machine.identity_file {
            options.push("-i".to_string());
            options.push(identity.display().to_string());
        }
        options
    }

    fn ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = self.common_options();
        args.push("-p".to_string());
        args.push(self.machine.port.to_string());
        args.push(self.machine.destination());
        args.push(command.to_string());
        args
    }

    fn scp_args(&self, local: &Path, remote_dir: &str) -> Vec<String> {
        let mut args = self.common_options();
        args.push("-r".to_string());
        args.push("-P".to_string());
        args.push(self.machine.port.to_string());
        args.push(local.display().to_string());
        args.push(format!("{}:{remote_dir}", self.machine.destination()));
        args
    }

    /// Runs one command on the machine and returns its stdout.
    pub async fn run(&self, command: &str) -> Result<String> {
        debug!(host = %self.machine.host, command, "ssh");
        let output = Command::new("ssh").args(self.ssh_args(command)).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::cluster(format!(
                "ssh {} failed: {}",
                self.machine.host,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Copies a local file or directory tree under `remote_dir`.
    pub async fn upload(&self, local: &Path, remote_dir: &str) -> Result<()> {
        debug!(host = %self.machine.host, local = %local.display(), remote_dir, "scp");
        let output = Command::new("scp").args(self.scp_args(local, remote_dir)).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::cluster(format!(
                "scp to {} failed: {}",
                self.machine.host,
                stderr.trim()
            )));
        }
        Ok(())
    }
}
