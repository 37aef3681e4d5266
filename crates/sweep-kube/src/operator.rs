//! Operator-specific behavior behind one adapter interface.
//!
//! The training service itself is operator-agnostic: everything that
//! differs between Kubeflow and FrameworkController (resource coordinates,
//! trial-config validation, manifest shape, status semantics) sits behind
//! [`OperatorAdapter`], and the service holds one boxed adapter.

use crate::config::{KubeflowOperator, KubernetesClusterConfig, KubernetesTrialConfig};
use crate::script::{run_script_name, CONTAINER_MOUNT_PATH};
use kube::api::DynamicObject;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use sweep_core::{metadata::keys, Error, Result, TrialStatus};

/// Coordinates of a custom resource served by an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}

impl OperatorResource {
    fn new(group: &str, version: &str, kind: &str, plural: &str) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            plural: plural.into(),
        }
    }

    #[must_use]
    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }
}

const KUBEFLOW_API_VERSIONS: [&str; 4] = ["v1alpha2", "v1beta1", "v1beta2", "v1"];

/// Resolves the custom resource a Kubeflow operator serves. Unknown
/// operator/version pairs are rejected here, at configuration time.
pub fn kubeflow_resource(operator: KubeflowOperator, api_version: &str) -> Result<OperatorResource> {
    if !KUBEFLOW_API_VERSIONS.contains(&api_version) {
        return Err(Error::invalid_metadata(
            keys::KUBEFLOW_CONFIG,
            format!("unsupported kubeflow api version '{api_version}'"),
        ));
    }
    let resource = match operator {
        KubeflowOperator::TfOperator => {
            OperatorResource::new("kubeflow.org", api_version, "TFJob", "tfjobs")
        }
        KubeflowOperator::PyTorchOperator => {
            OperatorResource::new("kubeflow.org", api_version, "PyTorchJob", "pytorchjobs")
        }
    };
    Ok(resource)
}

#[must_use]
pub fn framework_controller_resource() -> OperatorResource {
    OperatorResource::new("frameworkcontroller.microsoft.com", "v1", "Framework", "frameworks")
}

/// Label set identifying one trial's custom resource.
#[must_use]
pub fn trial_labels(experiment_id: &str, trial_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "sweep".to_string()),
        ("experiment".to_string(), experiment_id.to_string()),
        ("trial".to_string(), trial_id.to_string()),
    ])
}

#[must_use]
pub fn experiment_selector(experiment_id: &str) -> String {
    format!("app=sweep,experiment={experiment_id}")
}

#[must_use]
pub fn trial_selector(experiment_id: &str, trial_id: &str) -> String {
    format!("app=sweep,experiment={experiment_id},trial={trial_id}")
}

/// Inputs to manifest construction for one trial.
#[derive(Debug)]
pub struct ManifestSpec<'a> {
    pub job_name: &'a str,
    pub namespace: &'a str,
    pub labels: &'a BTreeMap<String, String>,
    pub cluster: &'a KubernetesClusterConfig,
    pub trial: &'a KubernetesTrialConfig,
    /// Container-side trial working directory.
    pub working_dir: &'a str,
}

/// What the generic Kubernetes training service needs from one operator.
pub trait OperatorAdapter: Send + Sync {
    /// Platform name stamped into run scripts and logs.
    fn platform(&self) -> &'static str;

    fn resource(&self) -> &OperatorResource;

    /// Rejects trial configs this operator cannot run. Called once when
    /// the `trial_config` metadata arrives.
    fn validate_trial_config(&self, trial: &KubernetesTrialConfig) -> Result<()>;

    /// Builds the full custom-resource manifest for one trial.
    fn build_manifest(&self, spec: &ManifestSpec<'_>) -> Value;

    /// Maps the operator's reported status onto the trial enum. `None`
    /// means the object carries no status yet and the trial keeps its
    /// current one. Phases this adapter does not recognize map to
    /// `Unknown`, never to a terminal status.
    fn map_status(&self, object: &DynamicObject) -> Option<TrialStatus>;
}

fn quantities(resources: &crate::config::TaskResources) -> Value {
    let mut map = serde_json::Map::new();
    map.insert("cpu".into(), json!(resources.cpus.to_string()));
    map.insert("memory".into(), json!(format!("{}Mi", resources.memory_mb)));
    if resources.gpus > 0 {
        map.insert("nvidia.com/gpu".into(), json!(resources.gpus.to_string()));
    }
    Value::Object(map)
}

/// Pod spec shared by both operator families. The container is named by
/// the operator: tf-operator and pytorch-operator match on fixed container
/// names.
fn pod_spec(container_name: &str, role: &crate::config::TaskRole, spec: &ManifestSpec<'_>) -> Value {
    let volume_name = "sweep-storage";
    let mut pod = json!({
        "containers": [{
            "name": container_name,
            "image": role.image,
            "command": ["sh", run_script_name(&role.name)],
            "workingDir": spec.working_dir,
            "resources": {
                "requests": quantities(&role.resources),
                "limits": quantities(&role.resources),
            },
            "volumeMounts": [{ "name": volume_name, "mountPath": CONTAINER_MOUNT_PATH }],
        }],
        "restartPolicy": "Never",
        "volumes": [spec.cluster.storage.volume(volume_name)],
    });
    if let Some(account) = &spec.cluster.service_account {
        pod["serviceAccountName"] = json!(account);
    }
    if let Some(secret) = &spec.cluster.image_pull_secret {
        pod["imagePullSecrets"] = json!([{ "name": secret }]);
    }
    pod
}

/// Kubeflow TFJob / PyTorchJob adapter.
pub struct KubeflowAdapter {
    operator: KubeflowOperator,
    resource: OperatorResource,
}

impl KubeflowAdapter {
    pub fn new(operator: KubeflowOperator, api_version: &str) -> Result<Self> {
        Ok(Self { operator, resource: kubeflow_resource(operator, api_version)? })
    }

    fn replica_key(&self, role_name: &str) -> Option<&'static str> {
        match (self.operator, role_name) {
            (KubeflowOperator::TfOperator, "worker") => Some("Worker"),
            (KubeflowOperator::TfOperator, "ps") => Some("PS"),
            (KubeflowOperator::PyTorchOperator, "master") => Some("Master"),
            (KubeflowOperator::PyTorchOperator, "worker") => Some("Worker"),
            _ => None,
        }
    }

    fn container_name(&self) -> &'static str {
        match self.operator {
            KubeflowOperator::TfOperator => "tensorflow",
            KubeflowOperator::PyTorchOperator => "pytorch",
        }
    }

    fn required_role(&self) -> &'static str {
        match self.operator {
            KubeflowOperator::TfOperator => "worker",
            KubeflowOperator::PyTorchOperator => "master",
        }
    }

    fn replica_specs_key(&self) -> &'static str {
        match self.operator {
            KubeflowOperator::TfOperator => "tfReplicaSpecs",
            KubeflowOperator::PyTorchOperator => "pytorchReplicaSpecs",
        }
    }
}

impl OperatorAdapter for KubeflowAdapter {
    fn platform(&self) -> &'static str {
        "kubeflow"
    }

    fn resource(&self) -> &OperatorResource {
        &self.resource
    }

    fn validate_trial_config(&self, trial: &KubernetesTrialConfig) -> Result<()> {
        trial.validate()?;
        for role in &trial.task_roles {
            if self.replica_key(&role.name).is_none() {
                return Err(Error::invalid_metadata(
                    keys::TRIAL_CONFIG,
                    format!("task role '{}' is not valid for {:?}", role.name, self.operator),
                ));
            }
        }
        if !trial.task_roles.iter().any(|r| r.name == self.required_role()) {
            return Err(Error::invalid_metadata(
                keys::TRIAL_CONFIG,
                format!("task role '{}' is required", self.required_role()),
            ));
        }
        Ok(())
    }

    fn build_manifest(&self, spec: &ManifestSpec<'_>) -> Value {
        let mut replica_specs = serde_json::Map::new();
        for role in &spec.trial.task_roles {
            // validate_trial_config already rejected unknown role names
            let Some(key) = self.replica_key(&role.name) else { continue };
            replica_specs.insert(
                key.to_string(),
                json!({
                    "replicas": role.replicas,
                    "restartPolicy": "Never",
                    "template": {
                        "metadata": { "labels": spec.labels },
                        "spec": pod_spec(self.container_name(), role, spec),
                    },
                }),
            );
        }
        json!({
            "apiVersion": self.resource.api_version(),
            "kind": self.resource.kind,
            "metadata": {
                "name": spec.job_name,
                "namespace": spec.namespace,
                "labels": spec.labels,
            },
            "spec": { self.replica_specs_key(): replica_specs },
        })
    }

    fn map_status(&self, object: &DynamicObject) -> Option<TrialStatus> {
        let conditions = object.data.pointer("/status/conditions")?.as_array()?;
        let mut latest = None;
        for condition in conditions {
            if condition.get("status").and_then(Value::as_str) == Some("True") {
                if let Some(kind) = condition.get("type").and_then(Value::as_str) {
                    latest = Some(kind);
                }
            }
        }
        let status = match latest? {
            "Created" => TrialStatus::Waiting,
            "Running" => TrialStatus::Running,
            "Succeeded" => TrialStatus::Succeeded,
            "Failed" => TrialStatus::Failed,
            _ => TrialStatus::Unknown,
        };
        Some(status)
    }
}

/// FrameworkController adapter.
pub struct FrameworkControllerAdapter {
    resource: OperatorResource,
}

impl FrameworkControllerAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self { resource: framework_controller_resource() }
    }
}

impl Default for FrameworkControllerAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl OperatorAdapter for FrameworkControllerAdapter {
    fn platform(&self) -> &'static str {
        "frameworkcontroller"
    }

    fn resource(&self) -> &OperatorResource {
        &self.resource
    }

    fn validate_trial_config(&self, trial: &KubernetesTrialConfig) -> Result<()> {
        trial.validate()
    }

    fn build_manifest(&self, spec: &ManifestSpec<'_>) -> Value {
        let task_roles: Vec<Value> = spec
            .trial
            .task_roles
            .iter()
            .map(|role| {
                let policy = role.effective_completion_policy();
                json!({
                    "name": role.name,
                    "taskNumber": role.replicas,
                    "frameworkAttemptCompletionPolicy": {
                        "minFailedTaskCount": policy.min_failed_task_count,
                        "minSucceededTaskCount": policy.min_succeeded_task_count,
                    },
                    "task": {
                        "retryPolicy": { "fancyRetryPolicy": false, "maxRetryCount": 0 },
                        "pod": {
                            "metadata": { "labels": spec.labels },
                            "spec": pod_spec("framework", role, spec),
                        },
                    },
                })
            })
            .collect();
        json!({
            "apiVersion": self.resource.api_version(),
            "kind": self.resource.kind,
            "metadata": {
                "name": spec.job_name,
                "namespace": spec.namespace,
                "labels": spec.labels,
            },
            "spec": {
                "executionType": "Start",
                "retryPolicy": { "fancyRetryPolicy": false, "maxRetryCount": 0 },
                "taskRoles": task_roles,
            },
        })
    }

    fn map_status(&self, object: &DynamicObject) -> Option<TrialStatus> {
        let status = object.data.get("status")?;
        let state = status.get("state").and_then(Value::as_str)?;
        let mapped = match state {
            "AttemptCreationPending" | "AttemptCreationRequested" | "AttemptPreparing" => {
                TrialStatus::Waiting
            }
            "AttemptRunning" => TrialStatus::Running,
            "Completed" => {
                match status.pointer("/attemptStatus/completionStatus/code").and_then(Value::as_i64)
                {
                    Some(0) => TrialStatus::Succeeded,
                    // a completed attempt without a zero exit code is a
                    // failure, including the no-completion-status case
                    _ => TrialStatus::Failed,
                }
            }
            _ => TrialStatus::Unknown,
        };
        Some(mapped)
    }
}
