//! The Kubernetes-family training service.
//!
//! One service type covers both operator families; everything
//! operator-specific is injected as an [`OperatorAdapter`] once the cluster
//! metadata arrives.

use crate::client::CrdClient;
use crate::collector::JobInfoCollector;
use crate::config::{KubeflowClusterConfig, KubernetesClusterConfig, KubernetesTrialConfig};
use crate::operator::{
    experiment_selector, trial_labels, trial_selector, FrameworkControllerAdapter, KubeflowAdapter,
    ManifestSpec, OperatorAdapter,
};
use crate::script::{render_run_script, run_script_name, RunScriptParams, CONTAINER_MOUNT_PATH, PARAMETER_FILE_NAME};
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use sweep_core::metadata::keys;
use sweep_core::{
    parse_value, Error, ExperimentContext, ManagerEndpoint, ManagerIpConfig, MetricBus, Result,
    TrainingService, TrialForm, TrialId, TrialJob, TrialMetric, TrialRegistry, TrialStatus,
};
use sweep_gateway::CallbackServer;
use sweep_storage::{upload_with_retry, MountedStorage, StorageAdapter};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often job statuses are collected from the cluster.
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Pause between storage upload attempts.
const UPLOAD_BACKOFF: Duration = Duration::from_secs(1);

/// Which operator family a service instance talks to. Decides the metadata
/// key carrying cluster configuration and how the adapter is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorFamily {
    Kubeflow,
    FrameworkController,
}

impl OperatorFamily {
    #[must_use]
    pub const fn config_key(self) -> &'static str {
        match self {
            Self::Kubeflow => keys::KUBEFLOW_CONFIG,
            Self::FrameworkController => keys::FRAMEWORK_CONTROLLER_CONFIG,
        }
    }
}

/// Deterministic, label-safe job name for one trial.
#[must_use]
pub fn job_name(experiment_id: &str, trial_id: &TrialId) -> String {
    format!("sweep-{experiment_id}-{trial_id}").to_lowercase()
}

#[derive(Debug, Clone)]
enum CodeUploadState {
    Pending,
    Ready,
    Failed(String),
}

/// Everything that exists only after cluster metadata arrived.
struct ClusterHandles {
    config: KubernetesClusterConfig,
    adapter: Arc<dyn OperatorAdapter>,
    crd: CrdClient,
    storage: Arc<MountedStorage>,
}

pub struct KubernetesTrainingService {
    family: OperatorFamily,
    ctx: ExperimentContext,
    kube_client: kube::Client,
    registry: TrialRegistry,
    metric_bus: MetricBus,
    callback: CallbackServer,
    cluster: RwLock<Option<ClusterHandles>>,
    trial_config: RwLock<Option<KubernetesTrialConfig>>,
    manager_ip: RwLock<Option<String>>,
    version_check: RwLock<bool>,
    log_collection: RwLock<String>,
    code_upload: Arc<watch::Sender<CodeUploadState>>,
    shutdown: CancellationToken,
}

impl KubernetesTrainingService {
    #[must_use]
    pub fn new(
        family: OperatorFamily,
        ctx: ExperimentContext,
        kube_client: kube::Client,
        metric_bus: MetricBus,
    ) -> Self {
        let callback = CallbackServer::new(metric_bus.clone());
        let (code_upload, _) = watch::channel(CodeUploadState::Pending);
        Self {
            family,
            ctx,
            kube_client,
            registry: TrialRegistry::new(),
            metric_bus,
            callback,
            cluster: RwLock::new(None),
            trial_config: RwLock::new(None),
            manager_ip: RwLock::new(None),
            version_check: RwLock::new(true),
            log_collection: RwLock::new("none".to_string()),
            code_upload: Arc::new(code_upload),
            shutdown: CancellationToken::new(),
        }
    }

    async fn apply_cluster_config(&self, value: &str) -> Result<()> {
        let (config, adapter): (KubernetesClusterConfig, Arc<dyn OperatorAdapter>) =
            match self.family {
                OperatorFamily::Kubeflow => {
                    let parsed: KubeflowClusterConfig = parse_value(keys::KUBEFLOW_CONFIG, value)?;
                    let adapter = KubeflowAdapter::new(parsed.operator, &parsed.api_version)?;
                    (parsed.common, Arc::new(adapter))
                }
                OperatorFamily::FrameworkController => {
                    let parsed: KubernetesClusterConfig =
                        parse_value(keys::FRAMEWORK_CONTROLLER_CONFIG, value)?;
                    (parsed, Arc::new(FrameworkControllerAdapter::new()))
                }
            };

        let mount_point = self.ctx.experiment_root.join("mnt");
        sweep_storage::mount(&config.storage.mount_source(), &mount_point)
            .await
            .map_err(Error::cluster)?;
        let storage = Arc::new(MountedStorage::new(&mount_point));
        storage
            .mkdir(&format!("{}/trials", self.ctx.experiment_id))
            .await
            .map_err(Error::cluster)?;

        let crd = CrdClient::new(self.kube_client.clone(), &config.namespace, adapter.resource());
        info!(
            namespace = %config.namespace,
            platform = adapter.platform(),
            "kubernetes cluster configured"
        );
        *self.cluster.write().await = Some(ClusterHandles { config, adapter, crd, storage });
        Ok(())
    }

    async fn apply_trial_config(&self, value: &str) -> Result<()> {
        let config: KubernetesTrialConfig = parse_value(keys::TRIAL_CONFIG, value)?;
        let cluster = self.cluster.read().await;
        let handles =
            cluster.as_ref().ok_or(Error::MissingMetadata(self.family.config_key()))?;
        handles.adapter.validate_trial_config(&config)?;

        self.code_upload.send_replace(CodeUploadState::Pending);
        let storage = Arc::clone(&handles.storage);
        let retries = handles.config.upload_retry_count;
        let code_dir = config.code_dir.clone();
        let dest = format!("{}/code", self.ctx.experiment_id);
        let gate = Arc::clone(&self.code_upload);
        tokio::spawn(async move {
            let outcome =
                upload_with_retry(storage.as_ref(), &code_dir, &dest, retries, UPLOAD_BACKOFF)
                    .await;
            let state = match outcome {
                Some(_) => CodeUploadState::Ready,
                None => CodeUploadState::Failed("code directory upload exhausted retries".into()),
            };
            gate.send_replace(state);
        });

        *self.trial_config.write().await = Some(config);
        Ok(())
    }

    /// Trials render their callback URL into run scripts, so the server
    /// must be up before the first submission.
    async fn ensure_callback_started(&self) -> Result<u16> {
        let bind: SocketAddr = (Ipv4Addr::UNSPECIFIED, 0).into();
        let addr = self
            .callback
            .ensure_started(bind)
            .await
            .map_err(|err| Error::CallbackServer(err.to_string()))?;
        Ok(addr.port())
    }

    async fn manager_endpoint(&self) -> Result<ManagerEndpoint> {
        let ip = self
            .manager_ip
            .read()
            .await
            .clone()
            .ok_or(Error::MissingMetadata(keys::MANAGER_IP))?;
        let port = self.ensure_callback_started().await?;
        Ok(ManagerEndpoint::new(ip, port))
    }

    /// Blocks until the shared code directory upload settles.
    async fn await_code_upload(&self) -> Result<()> {
        let mut rx = self.code_upload.subscribe();
        let state = rx
            .wait_for(|state| !matches!(state, CodeUploadState::Pending))
            .await
            .map_err(|_| Error::cluster("code upload task dropped"))?;
        if let CodeUploadState::Failed(reason) = &*state {
            return Err(Error::cluster(reason.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl TrainingService for KubernetesTrainingService {
    async fn list_trial_jobs(&self) -> Result<Vec<TrialJob>> {
        Ok(self.registry.list().await)
    }

    async fn get_trial_job(&self, id: &TrialId) -> Result<TrialJob> {
        self.registry.get(id).await
    }

    async fn submit_trial_job(&self, form: TrialForm) -> Result<TrialJob> {
        let cluster = self.cluster.read().await;
        let handles =
            cluster.as_ref().ok_or(Error::MissingMetadata(self.family.config_key()))?;
        let trial_guard = self.trial_config.read().await;
        let trial_config =
            trial_guard.as_ref().ok_or(Error::MissingMetadata(keys::TRIAL_CONFIG))?;

        let manager = self.manager_endpoint().await?;
        self.await_code_upload().await?;

        let id = TrialId::generate();
        let name = job_name(&self.ctx.experiment_id, &id);
        let local_dir = self.ctx.trial_directory(&id);
        tokio::fs::create_dir_all(&local_dir).await?;
        tokio::fs::write(local_dir.join(PARAMETER_FILE_NAME), &form.hyper_parameters).await?;

        let container_trial_dir =
            format!("{CONTAINER_MOUNT_PATH}/{}/trials/{id}", self.ctx.experiment_id);
        let container_code_dir = format!("{CONTAINER_MOUNT_PATH}/{}/code", self.ctx.experiment_id);
        let version = if *self.version_check.read().await {
            self.ctx.version.clone()
        } else {
            String::new()
        };
        let log_collection = self.log_collection.read().await.clone();
        for role in &trial_config.task_roles {
            let script = render_run_script(&RunScriptParams {
                platform: handles.adapter.platform(),
                experiment_id: &self.ctx.experiment_id,
                trial_id: id.as_str(),
                sequence_id: form.sequence_id,
                role: &role.name,
                command: &role.command,
                trial_dir: &container_trial_dir,
                code_dir: &container_code_dir,
                manager: &manager,
                version: &version,
                log_collection: &log_collection,
            });
            tokio::fs::write(local_dir.join(run_script_name(&role.name)), script).await?;
        }

        let mut job = TrialJob::new(id.clone(), TrialStatus::Waiting, form);
        job.job_name = Some(name.clone());
        job.working_directory = Some(local_dir.clone());

        let relative_dest = format!("{}/trials/{id}", self.ctx.experiment_id);
        let uploaded = upload_with_retry(
            handles.storage.as_ref(),
            &local_dir,
            &relative_dest,
            handles.config.upload_retry_count,
            UPLOAD_BACKOFF,
        )
        .await;
        if uploaded.is_none() {
            job.observe_status(TrialStatus::Failed);
            job.message = Some("working directory upload exhausted retries".to_string());
            self.registry.insert(job.clone()).await;
            warn!(trial_id = %id, "trial failed before cluster submission");
            return Ok(job);
        }
        job.url = Some(handles.config.storage.trial_url(&relative_dest));

        let labels = trial_labels(&self.ctx.experiment_id, id.as_str());
        let manifest = handles.adapter.build_manifest(&ManifestSpec {
            job_name: &name,
            namespace: &handles.config.namespace,
            labels: &labels,
            cluster: &handles.config,
            trial: trial_config,
            working_dir: &container_trial_dir,
        });

        // the registry must know the trial before the cluster does
        self.registry.insert(job.clone()).await;
        if let Err(err) = handles.crd.create(&manifest).await {
            let reason = err.to_string();
            self.registry
                .update(&id, |j| {
                    j.observe_status(TrialStatus::Failed);
                    j.message = Some(reason.clone());
                })
                .await;
            return Err(err);
        }

        info!(trial_id = %id, job_name = %name, "trial submitted");
        Ok(job)
    }

    async fn update_trial_job(&self, _id: &TrialId, _form: TrialForm) -> Result<TrialJob> {
        Err(Error::NotSupported("update_trial_job"))
    }

    async fn cancel_trial_job(&self, id: &TrialId, early_stopped: bool) -> Result<()> {
        let job = self.registry.get(id).await?;
        if job.is_terminal() {
            debug!(trial_id = %id, status = %job.status, "cancel ignored, trial already settled");
            return Ok(());
        }
        // a trial the cluster has lost track of is only canceled locally
        if job.status == TrialStatus::Unknown {
            self.registry.observe_status(id, TrialStatus::canceled(early_stopped)).await;
            return Ok(());
        }

        let cluster = self.cluster.read().await;
        let handles =
            cluster.as_ref().ok_or(Error::MissingMetadata(self.family.config_key()))?;
        handles
            .crd
            .delete_by_labels(&trial_selector(&self.ctx.experiment_id, id.as_str()))
            .await?;
        self.registry.observe_status(id, TrialStatus::canceled(early_stopped)).await;
        info!(trial_id = %id, early_stopped, "trial canceled");
        Ok(())
    }

    fn subscribe_metrics(&self) -> broadcast::Receiver<TrialMetric> {
        self.metric_bus.subscribe()
    }

    async fn set_cluster_metadata(&self, key: &str, value: &str) -> Result<()> {
        match key {
            k if k == self.family.config_key() => self.apply_cluster_config(value).await,
            keys::TRIAL_CONFIG => self.apply_trial_config(value).await,
            keys::MANAGER_IP => {
                let parsed: ManagerIpConfig = parse_value(key, value)?;
                *self.manager_ip.write().await = Some(parsed.ip);
                Ok(())
            }
            keys::VERSION_CHECK => {
                *self.version_check.write().await = parse_value(key, value)?;
                Ok(())
            }
            keys::LOG_COLLECTION => {
                *self.log_collection.write().await = parse_value(key, value)?;
                Ok(())
            }
            _ => {
                debug!(key, "ignoring unrecognized cluster metadata");
                Ok(())
            }
        }
    }

    async fn get_cluster_metadata(&self, _key: &str) -> Result<String> {
        Err(Error::NotSupported("get_cluster_metadata"))
    }

    async fn run(&self) -> Result<()> {
        let collector = {
            let cluster = self.cluster.read().await;
            let handles =
                cluster.as_ref().ok_or(Error::MissingMetadata(self.family.config_key()))?;
            JobInfoCollector::new(
                self.registry.clone(),
                handles.crd.clone(),
                Arc::clone(&handles.adapter),
                experiment_selector(&self.ctx.experiment_id),
            )
        };
        self.ensure_callback_started().await?;
        info!(experiment_id = %self.ctx.experiment_id, "kubernetes training service running");

        let mut ticker = tokio::time::interval(JOB_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    collector.refresh().await;
                    if let Some(fault) = self.callback.take_error() {
                        return Err(Error::CallbackServer(fault));
                    }
                }
            }
        }
    }

    async fn clean_up(&self) -> Result<()> {
        self.shutdown.cancel();
        for id in self.registry.non_terminal_ids().await {
            self.registry.observe_status(&id, TrialStatus::SysCanceled).await;
        }
        let cluster = self.cluster.read().await;
        if let Some(handles) = cluster.as_ref() {
            if let Err(err) =
                handles.crd.delete_by_labels(&experiment_selector(&self.ctx.experiment_id)).await
            {
                warn!(error = %err, "leftover custom resource deletion failed");
            }
            if let Err(err) = sweep_storage::unmount(handles.storage.root()).await {
                warn!(error = %err, "cluster storage unmount failed");
            }
        }
        self.callback.stop();
        info!("kubernetes training service cleaned up");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_names_are_lowercase_and_deterministic() {
        let id = TrialId::from("Abc12345");
        assert_eq!(job_name("EXP42", &id), "sweep-exp42-abc12345");
        assert_eq!(job_name("EXP42", &id), job_name("EXP42", &id));
    }
}
