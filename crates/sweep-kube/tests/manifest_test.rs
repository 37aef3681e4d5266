use kube::api::DynamicObject;
use serde_json::json;
use std::path::PathBuf;
use sweep_core::TrialStatus;
use sweep_kube::{
    kubeflow_resource, trial_labels, FrameworkControllerAdapter, KubeStorage, KubeflowAdapter,
    KubeflowOperator, KubernetesClusterConfig, KubernetesTrialConfig, ManifestSpec,
    OperatorAdapter, TaskResources, TaskRole,
};

fn cluster_config() -> KubernetesClusterConfig {
    KubernetesClusterConfig {
        namespace: "sweep-ns".into(),
        storage: KubeStorage::Nfs { server: "10.1.0.4".into(), export_path: "/export".into() },
        service_account: Some("sweep-sa".into()),
        image_pull_secret: None,
        upload_retry_count: 3,
        reuse: false,
    }
}

fn role(name: &str, gpus: u32) -> TaskRole {
    TaskRole {
        name: name.into(),
        replicas: 2,
        command: "python3 train.py".into(),
        image: "registry.local/trainer:latest".into(),
        resources: TaskResources { cpus: 4, memory_mb: 8192, gpus },
        completion_policy: None,
    }
}

fn trial_config(roles: Vec<TaskRole>) -> KubernetesTrialConfig {
    KubernetesTrialConfig { code_dir: PathBuf::from("/tmp/code"), task_roles: roles }
}

fn object_with_status(status: serde_json::Value) -> DynamicObject {
    serde_json::from_value(json!({
        "apiVersion": "kubeflow.org/v1",
        "kind": "TFJob",
        "metadata": { "name": "sweep-exp42-abc12345" },
        "status": status,
    }))
    .unwrap()
}

#[test]
fn tfjob_manifest_shape() {
    let adapter = KubeflowAdapter::new(KubeflowOperator::TfOperator, "v1").unwrap();
    let cluster = cluster_config();
    let trial = trial_config(vec![role("worker", 1), role("ps", 0)]);
    let labels = trial_labels("exp42", "abc12345");

    let manifest = adapter.build_manifest(&ManifestSpec {
        job_name: "sweep-exp42-abc12345",
        namespace: "sweep-ns",
        labels: &labels,
        cluster: &cluster,
        trial: &trial,
        working_dir: "/mnt/sweep/exp42/trials/abc12345",
    });

    assert_eq!(manifest["apiVersion"], "kubeflow.org/v1");
    assert_eq!(manifest["kind"], "TFJob");
    assert_eq!(manifest["metadata"]["labels"]["trial"], "abc12345");

    let worker = &manifest["spec"]["tfReplicaSpecs"]["Worker"];
    assert_eq!(worker["replicas"], 2);
    let container = &worker["template"]["spec"]["containers"][0];
    assert_eq!(container["name"], "tensorflow");
    assert_eq!(container["command"][1], "run_worker.sh");
    assert_eq!(container["resources"]["limits"]["nvidia.com/gpu"], "1");
    assert_eq!(container["volumeMounts"][0]["mountPath"], "/mnt/sweep");
    assert_eq!(worker["template"]["spec"]["serviceAccountName"], "sweep-sa");

    let ps = &manifest["spec"]["tfReplicaSpecs"]["PS"];
    let ps_container = &ps["template"]["spec"]["containers"][0];
    assert!(ps_container["resources"]["limits"].get("nvidia.com/gpu").is_none());
}

#[test]
fn pytorch_rejects_foreign_roles() {
    let adapter = KubeflowAdapter::new(KubeflowOperator::PyTorchOperator, "v1").unwrap();
    let wrong = trial_config(vec![role("ps", 0)]);
    assert!(adapter.validate_trial_config(&wrong).is_err());

    let missing_master = trial_config(vec![role("worker", 0)]);
    assert!(adapter.validate_trial_config(&missing_master).is_err());

    let ok = trial_config(vec![role("master", 0), role("worker", 0)]);
    assert!(adapter.validate_trial_config(&ok).is_ok());
}

#[test]
fn unknown_kubeflow_version_is_fatal() {
    assert!(kubeflow_resource(KubeflowOperator::TfOperator, "v2").is_err());
    assert!(kubeflow_resource(KubeflowOperator::TfOperator, "v1beta2").is_ok());
}

#[test]
fn framework_manifest_shape() {
    let adapter = FrameworkControllerAdapter::new();
    let cluster = cluster_config();
    let trial = trial_config(vec![role("train", 0)]);
    let labels = trial_labels("exp42", "abc12345");

    let manifest = adapter.build_manifest(&ManifestSpec {
        job_name: "sweep-exp42-abc12345",
        namespace: "sweep-ns",
        labels: &labels,
        cluster: &cluster,
        trial: &trial,
        working_dir: "/mnt/sweep/exp42/trials/abc12345",
    });

    assert_eq!(manifest["kind"], "Framework");
    assert_eq!(manifest["spec"]["executionType"], "Start");
    let task_role = &manifest["spec"]["taskRoles"][0];
    assert_eq!(task_role["name"], "train");
    assert_eq!(task_role["taskNumber"], 2);
    assert_eq!(task_role["frameworkAttemptCompletionPolicy"]["minSucceededTaskCount"], 2);
    assert_eq!(task_role["task"]["pod"]["spec"]["containers"][0]["name"], "framework");
}

#[test]
fn kubeflow_status_mapping_follows_conditions() {
    let adapter = KubeflowAdapter::new(KubeflowOperator::TfOperator, "v1").unwrap();

    let running = object_with_status(json!({
        "conditions": [
            { "type": "Created", "status": "True" },
            { "type": "Running", "status": "True" },
        ]
    }));
    assert_eq!(adapter.map_status(&running), Some(TrialStatus::Running));

    let succeeded = object_with_status(json!({
        "conditions": [
            { "type": "Running", "status": "False" },
            { "type": "Succeeded", "status": "True" },
        ]
    }));
    assert_eq!(adapter.map_status(&succeeded), Some(TrialStatus::Succeeded));

    let odd = object_with_status(json!({
        "conditions": [{ "type": "Restarting", "status": "True" }]
    }));
    assert_eq!(adapter.map_status(&odd), Some(TrialStatus::Unknown));

    let empty = object_with_status(json!({}));
    assert_eq!(adapter.map_status(&empty), None);
}

#[test]
fn framework_status_mapping_uses_completion_code() {
    let adapter = FrameworkControllerAdapter::new();

    let waiting = object_with_status(json!({ "state": "AttemptPreparing" }));
    assert_eq!(adapter.map_status(&waiting), Some(TrialStatus::Waiting));

    let running = object_with_status(json!({ "state": "AttemptRunning" }));
    assert_eq!(adapter.map_status(&running), Some(TrialStatus::Running));

    let succeeded = object_with_status(json!({
        "state": "Completed",
        "attemptStatus": { "completionStatus": { "code": 0 } }
    }));
    assert_eq!(adapter.map_status(&succeeded), Some(TrialStatus::Succeeded));

    let failed = object_with_status(json!({
        "state": "Completed",
        "attemptStatus": { "completionStatus": { "code": 137 } }
    }));
    assert_eq!(adapter.map_status(&failed), Some(TrialStatus::Failed));

    let novel = object_with_status(json!({ "state": "SomethingNew" }));
    assert_eq!(adapter.map_status(&novel), Some(TrialStatus::Unknown));
}
