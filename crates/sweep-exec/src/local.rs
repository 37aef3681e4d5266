//! Trials as child processes on the local host.

use crate::config::LocalExecConfig;
use crate::script::{render_exec_script, ExecScriptParams, PARAMETER_FILE_NAME, RUN_SCRIPT_NAME};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::process::Stdio;
use std::time::Duration;
use sweep_core::metadata::keys;
use sweep_core::{
    parse_value, Error, ExperimentContext, ManagerEndpoint, ManagerIpConfig, MetricBus, Result,
    TrainingService, TrialForm, TrialId, TrialJob, TrialMetric, TrialRegistry, TrialRunConfig,
    TrialStatus,
};
use sweep_gateway::{CallbackServer, ParameterFileMeta};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often child processes are reaped.
const REAP_INTERVAL: Duration = Duration::from_secs(1);

pub struct LocalTrainingService {
    ctx: ExperimentContext,
    registry: TrialRegistry,
    metric_bus: MetricBus,
    callback: CallbackServer,
    trial_config: RwLock<Option<TrialRunConfig>>,
    local_config: RwLock<LocalExecConfig>,
    manager_ip: RwLock<Option<String>>,
    version_check: RwLock<bool>,
    log_collection: RwLock<String>,
    children: Mutex<HashMap<TrialId, Child>>,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl LocalTrainingService {
    #[must_use]
    pub fn new(ctx: ExperimentContext, metric_bus: MetricBus) -> Self {
        let callback = CallbackServer::new(metric_bus.clone());
        Self {
            ctx,
            registry: TrialRegistry::new(),
            metric_bus,
            callback,
            trial_config: RwLock::new(None),
            local_config: RwLock::new(LocalExecConfig::default()),
            manager_ip: RwLock::new(None),
            version_check: RwLock::new(true),
            log_collection: RwLock::new("none".to_string()),
            children: Mutex::new(HashMap::new()),
            poll_interval: REAP_INTERVAL,
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn ensure_callback_started(&self) -> Result<u16> {
        let bind: SocketAddr = (Ipv4Addr::UNSPECIFIED, 0).into();
        let addr = self
            .callback
            .ensure_started(bind)
            .await
            .map_err(|err| Error::CallbackServer(err.to_string()))?;
        Ok(addr.port())
    }

    /// Local trials reach back over loopback unless an explicit manager ip
    /// was configured.
    async fn manager_endpoint(&self) -> Result<ManagerEndpoint> {
        let ip = self
            .manager_ip
            .read()
            .await
            .clone()
            .unwrap_or_else(|| Ipv4Addr::LOCALHOST.to_string());
        let port = self.ensure_callback_started().await?;
        Ok(ManagerEndpoint::new(ip, port))
    }

    async fn cuda_devices(&self, gpu_count: Option<u32>) -> String {
        let Some(requested) = gpu_count.filter(|n| *n > 0) else {
            return String::new();
        };
        let config = self.local_config.read().await;
        let indices: Vec<u32> = match &config.gpu_indices {
            Some(indices) => indices.clone(),
            None => (0..requested).collect(),
        };
        indices
            .iter()
            .take(requested as usize)
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// One reap pass: flip freshly spawned trials to `Running`, settle
    /// exited children on their exit code, drop settled handles.
    async fn reap_children(&self) {
        let mut children = self.children.lock().await;
        let mut finished = Vec::new();
        for (id, child) in children.iter_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let trial_status = match status.code() {
                        Some(0) => TrialStatus::Succeeded,
                        _ => TrialStatus::Failed,
                    };
                    finished.push((id.clone(), trial_status));
                }
                Ok(None) => {
                    self.registry.observe_status(id, TrialStatus::Running).await;
                }
                Err(err) => {
                    warn!(trial_id = %id, error = %err, "child wait failed");
                }
            }
        }
        for (id, status) in finished {
            children.remove(&id);
            self.registry.observe_status(&id, status).await;
            info!(trial_id = %id, status = %status, "trial process exited");
        }
    }
}

#[async_trait]
impl TrainingService for LocalTrainingService {
    async fn list_trial_jobs(&self) -> Result<Vec<TrialJob>> {
        Ok(self.registry.list().await)
    }

    async fn get_trial_job(&self, id: &TrialId) -> Result<TrialJob> {
        self.registry.get(id).await
    }

    async fn submit_trial_job(&self, form: TrialForm) -> Result<TrialJob> {
        let trial_config = {
            let guard = self.trial_config.read().await;
            guard.clone().ok_or(Error::MissingMetadata(keys::TRIAL_CONFIG))?
        };
        let manager = self.manager_endpoint().await?;

        let id = TrialId::generate();
        let trial_dir = self.ctx.trial_directory(&id);
        tokio::fs::create_dir_all(&trial_dir).await?;
        tokio::fs::write(trial_dir.join(PARAMETER_FILE_NAME), &form.hyper_parameters).await?;

        let version = if *self.version_check.read().await {
            self.ctx.version.clone()
        } else {
            String::new()
        };
        let script = render_exec_script(&ExecScriptParams {
            platform: "local",
            experiment_id: &self.ctx.experiment_id,
            trial_id: id.as_str(),
            sequence_id: form.sequence_id,
            trial_dir: &trial_dir.display().to_string(),
            code_dir: &trial_config.code_dir.display().to_string(),
            command: &trial_config.command,
            manager: &manager,
            version: &version,
            log_collection: &self.log_collection.read().await.clone(),
            cuda_devices: &self.cuda_devices(trial_config.gpu_count).await,
            record_pid: false,
        });
        let script_path = trial_dir.join(RUN_SCRIPT_NAME);
        tokio::fs::write(&script_path, script).await?;

        let mut job = TrialJob::new(id.clone(), TrialStatus::Waiting, form);
        job.working_directory = Some(trial_dir.clone());
        job.url = Some(format!("file://{}", trial_dir.display()));
        self.registry.insert(job.clone()).await;

        let spawned = Command::new("sh")
            .arg(&script_path)
            .current_dir(&trial_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(child) => {
                self.children.lock().await.insert(id.clone(), child);
                info!(trial_id = %id, "trial process spawned");
                Ok(job)
            }
            Err(err) => {
                let message = format!("spawn failed: {err}");
                self.registry
                    .update(&id, |j| {
                        j.observe_status(TrialStatus::Failed);
                        j.message = Some(message.clone());
                    })
                    .await;
                Err(err.into())
            }
        }
    }

    async fn update_trial_job(&self, id: &TrialId, form: TrialForm) -> Result<TrialJob> {
        let job = self.registry.get(id).await?;
        let trial_dir = job
            .working_directory
            .clone()
            .ok_or_else(|| Error::TrialNotFound(id.to_string()))?;

        let file_name = format!("parameter_{}.cfg", form.parameter_index);
        let file_path = trial_dir.join(&file_name);
        tokio::fs::write(&file_path, &form.hyper_parameters).await?;

        let port = self.ensure_callback_started().await?;
        let meta = ParameterFileMeta {
            trial_id: id.to_string(),
            file_path: file_path.display().to_string(),
            sequence_id: form.sequence_id,
        };
        let response = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/parameter-file-meta"))
            .json(&meta)
            .send()
            .await
            .map_err(Error::cluster)?;
        if !response.status().is_success() {
            return Err(Error::cluster(format!(
                "parameter file registration failed: {}",
                response.status()
            )));
        }

        self.registry.update(id, |j| j.form = form.clone()).await;
        self.registry.get(id).await
    }

    async fn cancel_trial_job(&self, id: &TrialId, early_stopped: bool) -> Result<()> {
        let job = self.registry.get(id).await?;
        if job.is_terminal() {
            debug!(trial_id = %id, status = %job.status, "cancel ignored, trial already settled");
            return Ok(());
        }

        // stamp first so a concurrent reap of the killed child cannot
        // overwrite the cancel status with Failed
        self.registry.observe_status(id, TrialStatus::canceled(early_stopped)).await;
        if let Some(mut child) = self.children.lock().await.remove(id) {
            if let Err(err) = child.kill().await {
                warn!(trial_id = %id, error = %err, "killing trial process failed");
            }
        }
        info!(trial_id = %id, early_stopped, "trial canceled");
        Ok(())
    }

    fn subscribe_metrics(&self) -> broadcast::Receiver<TrialMetric> {
        self.metric_bus.subscribe()
    }

    async fn set_cluster_metadata(&self, key: &str, value: &str) -> Result<()> {
        match key {
            keys::TRIAL_CONFIG => {
                let config: TrialRunConfig = parse_value(key, value)?;
                if !tokio::fs::try_exists(&config.code_dir).await.unwrap_or(false) {
                    return Err(Error::invalid_metadata(
                        key,
                        format!("code_dir {} does not exist", config.code_dir.display()),
                    ));
                }
                *self.trial_config.write().await = Some(config);
                Ok(())
            }
            keys::LOCAL_CONFIG => {
                *self.local_config.write().await = parse_value(key, value)?;
                Ok(())
            }
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
        self.ensure_callback_started().await?;
        info!(experiment_id = %self.ctx.experiment_id, "local training service running");

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    self.reap_children().await;
                    if let Some(fault) = self.callback.take_error() {
                        return Err(Error::CallbackServer(fault));
                    }
                }
            }
        }
    }

    async fn clean_up(&self) -> Result<()> {
        self.shutdown.cancel();
        let mut children = self.children.lock().await;
        for (id, child) in children.iter_mut() {
            self.registry.observe_status(id, TrialStatus::SysCanceled).await;
            if let Err(err) = child.kill().await {
                warn!(trial_id = %id, error = %err, "killing trial process failed");
            }
        }
        children.clear();
        drop(children);
        for id in self.registry.non_terminal_ids().await {
            self.registry.observe_status(&id, TrialStatus::SysCanceled).await;
        }
        self.callback.stop();
        info!("local training service cleaned up");
        Ok(())
    }
}
