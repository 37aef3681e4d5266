//! Sweep Kube
//!
//! Trial execution on Kubernetes via job operators:
//! - Kubeflow (`TFJob` / `PyTorchJob`) and FrameworkController (`Framework`)
//!   behind one `OperatorAdapter` interface
//! - Dynamic custom-resource client, no per-operator types
//! - Storage staged over NFS or an Azure file share, mounted locally
//! - Collector translating operator status into trial status

pub mod client;
pub mod collector;
pub mod config;
pub mod operator;
pub mod script;
pub mod service;

pub use client::CrdClient;
pub use collector::JobInfoCollector;
pub use config::{
    CompletionPolicy, KubeStorage, KubeflowClusterConfig, KubeflowOperator,
    KubernetesClusterConfig, KubernetesTrialConfig, TaskResources, TaskRole,
};
pub use operator::{
    experiment_selector, framework_controller_resource, kubeflow_resource, trial_labels,
    trial_selector, FrameworkControllerAdapter, KubeflowAdapter, ManifestSpec, OperatorAdapter,
    OperatorResource,
};
pub use script::{render_run_script, run_script_name, RunScriptParams, CONTAINER_MOUNT_PATH};
pub use service::{job_name, KubernetesTrainingService, OperatorFamily};
