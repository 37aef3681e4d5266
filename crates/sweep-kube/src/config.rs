//! Cluster and trial configuration for the Kubernetes backends.
//!
//! Both arrive as JSON metadata values and are parsed exactly once; any
//! shape problem is a fatal configuration error at that point, never later
//! inside a polling loop.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use sweep_core::{Error, Result};
use sweep_storage::MountSource;

/// Where trial code and outputs live on the cluster. The discriminant is
/// explicit so a config cannot be half one kind and half the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KubeStorage {
    Nfs {
        server: String,
        export_path: String,
    },
    AzureFile {
        account: String,
        share: String,
        access_key: String,
        /// Kubernetes secret holding the share credentials, referenced by
        /// the pod volume.
        secret_name: String,
    },
}

impl KubeStorage {
    /// How this storage is mounted on the orchestrator host.
    #[must_use]
    pub fn mount_source(&self) -> MountSource {
        match self {
            Self::Nfs { server, export_path } => MountSource::Nfs {
                server: server.clone(),
                export_path: export_path.clone(),
            },
            Self::AzureFile { account, share, access_key, .. } => MountSource::AzureFileShare {
                account: account.clone(),
                share: share.clone(),
                access_key: access_key.clone(),
            },
        }
    }

    /// Volume entry for the trial pods.
    #[must_use]
    pub fn volume(&self, volume_name: &str) -> serde_json::Value {
        match self {
            Self::Nfs { server, export_path } => serde_json::json!({
                "name": volume_name,
                "nfs": { "server": server, "path": export_path },
            }),
            Self::AzureFile { share, secret_name, .. } => serde_json::json!({
                "name": volume_name,
                "azureFile": { "secretName": secret_name, "shareName": share, "readOnly": false },
            }),
        }
    }

    /// Output URL advertised on the trial job.
    #[must_use]
    pub fn trial_url(&self, relative: &str) -> String {
        match self {
            Self::Nfs { server, export_path } => format!("nfs://{server}:{export_path}/{relative}"),
            Self::AzureFile { account, share, .. } => format!("azure://{account}/{share}/{relative}"),
        }
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

const fn default_upload_retries() -> u32 {
    3
}

/// Settings shared by every Kubernetes-family backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesClusterConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub storage: KubeStorage,
    #[serde(default)]
    pub service_account: Option<String>,
    #[serde(default)]
    pub image_pull_secret: Option<String>,
    #[serde(default = "default_upload_retries")]
    pub upload_retry_count: u32,
    /// Routed to the pooled dispatcher by the router; the direct backend
    /// carries it but does not act on it.
    #[serde(default)]
    pub reuse: bool,
}

/// Which Kubeflow operator handles the trial jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KubeflowOperator {
    #[serde(rename = "tf-operator")]
    TfOperator,
    #[serde(rename = "pytorch-operator")]
    PyTorchOperator,
}

/// Kubeflow cluster metadata: the common settings plus the operator choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeflowClusterConfig {
    pub operator: KubeflowOperator,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(flatten)]
    pub common: KubernetesClusterConfig,
}

fn default_api_version() -> String {
    "v1".to_string()
}

const fn default_replicas() -> u32 {
    1
}

/// Resource demand of one task role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResources {
    pub cpus: u32,
    pub memory_mb: u32,
    #[serde(default)]
    pub gpus: u32,
}

/// FrameworkController attempt completion policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionPolicy {
    pub min_failed_task_count: u32,
    pub min_succeeded_task_count: u32,
}

/// One role of a (possibly distributed) trial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRole {
    pub name: String,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    pub command: String,
    pub image: String,
    pub resources: TaskResources,
    #[serde(default)]
    pub completion_policy: Option<CompletionPolicy>,
}

impl TaskRole {
    /// Policy to apply when none is configured: one failed task fails the
    /// attempt, all replicas must succeed.
    #[must_use]
    pub fn effective_completion_policy(&self) -> CompletionPolicy {
        self.completion_policy.unwrap_or(CompletionPolicy {
            min_failed_task_count: 1,
            min_succeeded_task_count: self.replicas,
        })
    }
}

/// Payload of the `trial_config` metadata key for Kubernetes backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesTrialConfig {
    pub code_dir: PathBuf,
    pub task_roles: Vec<TaskRole>,
}

impl KubernetesTrialConfig {
    pub fn validate(&self) -> Result<()> {
        if self.task_roles.is_empty() {
            return Err(Error::invalid_metadata(
                sweep_core::metadata::keys::TRIAL_CONFIG,
                "at least one task role is required",
            ));
        }
        for role in &self.task_roles {
            if role.replicas == 0 {
                return Err(Error::invalid_metadata(
                    sweep_core::metadata::keys::TRIAL_CONFIG,
                    format!("task role '{}' has zero replicas", role.name),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_kind_is_tagged() {
        let raw = r#"{"kind": "nfs", "server": "10.1.0.4", "export_path": "/export/sweep"}"#;
        let storage: KubeStorage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            storage,
            KubeStorage::Nfs { server: "10.1.0.4".into(), export_path: "/export/sweep".into() }
        );
        assert!(serde_json::from_str::<KubeStorage>(r#"{"server": "s"}"#).is_err());
    }

    #[test]
    fn kubeflow_config_flattens_common_fields() {
        let raw = r#"{
            "operator": "tf-operator",
            "namespace": "sweep-ns",
            "storage": {"kind": "nfs", "server": "s", "export_path": "/e"},
            "reuse": true
        }"#;
        let config: KubeflowClusterConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.operator, KubeflowOperator::TfOperator);
        assert_eq!(config.api_version, "v1");
        assert_eq!(config.common.namespace, "sweep-ns");
        assert_eq!(config.common.upload_retry_count, 3);
        assert!(config.common.reuse);
    }

    #[test]
    fn empty_task_roles_rejected() {
        let config =
            KubernetesTrialConfig { code_dir: PathBuf::from("/code"), task_roles: Vec::new() };
        assert!(config.validate().is_err());
    }
}
