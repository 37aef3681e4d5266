//! Trials on SSH-reachable machines.
//!
//! Submission only enqueues; a drain loop stages the trial directory with
//! `scp`, starts the run script detached under `nohup`, and a poll loop
//! reads the recorded exit code to settle trials. Machines are used
//! round-robin.

use crate::config::RemoteExecConfig;
use crate::script::{
    render_exec_script, ExecScriptParams, EXIT_CODE_FILE, PARAMETER_FILE_NAME, PID_FILE,
    RUN_SCRIPT_NAME,
};
use crate::ssh::SshRunner;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sweep_core::metadata::keys;
use sweep_core::{
    parse_value, Error, ExperimentContext, ManagerEndpoint, ManagerIpConfig, MetricBus, Result,
    TrainingService, TrialForm, TrialId, TrialJob, TrialMetric, TrialRegistry, TrialRunConfig,
    TrialStatus,
};
use sweep_gateway::{CallbackServer, ParameterFileMeta};
use sweep_storage::{MountedStorage, StorageAdapter};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause between queue drains.
const QUEUE_DRAIN_INTERVAL: Duration = Duration::from_secs(1);

/// How often remote exit codes are polled.
const EXIT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Where a trial lives on a placed machine.
struct Placement {
    runner: Arc<SshRunner>,
    remote_dir: String,
}

pub struct RemoteTrainingService {
    ctx: ExperimentContext,
    registry: TrialRegistry,
    metric_bus: MetricBus,
    callback: CallbackServer,
    trial_config: RwLock<Option<TrialRunConfig>>,
    machines: RwLock<Vec<Arc<SshRunner>>>,
    next_machine: AtomicUsize,
    manager_ip: RwLock<Option<String>>,
    version_check: RwLock<bool>,
    log_collection: RwLock<String>,
    queue: Mutex<VecDeque<TrialId>>,
    placements: Mutex<HashMap<TrialId, Placement>>,
    drain_interval: Duration,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl RemoteTrainingService {
    #[must_use]
    pub fn new(ctx: ExperimentContext, metric_bus: MetricBus) -> Self {
        let callback = CallbackServer::new(metric_bus.clone());
        Self {
            ctx,
            registry: TrialRegistry::new(),
            metric_bus,
            callback,
            trial_config: RwLock::new(None),
            machines: RwLock::new(Vec::new()),
            next_machine: AtomicUsize::new(0),
            manager_ip: RwLock::new(None),
            version_check: RwLock::new(true),
            log_collection: RwLock::new("none".to_string()),
            queue: Mutex::new(VecDeque::new()),
            placements: Mutex::new(HashMap::new()),
            drain_interval: QUEUE_DRAIN_INTERVAL,
            poll_interval: EXIT_POLL_INTERVAL,
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Trials waiting to be placed on a machine.
    pub async fn queued_trials(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Base directory on every machine.
    fn remote_base(&self) -> String {
        format!("/tmp/sweep-{}", self.ctx.experiment_id)
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

    async fn next_runner(&self) -> Result<Arc<SshRunner>> {
        let machines = self.machines.read().await;
        if machines.is_empty() {
            return Err(Error::MissingMetadata(keys::REMOTE_CONFIG));
        }
        let index = self.next_machine.fetch_add(1, Ordering::SeqCst) % machines.len();
        Ok(machines[index].clone())
    }

    /// One drain pass. Staging is single-shot: a trial whose staging or
    /// launch fails is settled as `Failed` with the reason recorded, and
    /// the queue moves on.
    async fn drain_queue_once(&self) {
        loop {
            let head = { self.queue.lock().await.pop_front() };
            let Some(id) = head else { return };
            let Ok(job) = self.registry.get(&id).await else { continue };
            if job.is_terminal() {
                continue;
            }

            match self.stage_and_launch(&job).await {
                Ok(placement) => {
                    let host = placement.runner.machine().host.clone();
                    let url = format!("file://{host}:{}", placement.remote_dir);
                    self.registry
                        .update(&id, |j| {
                            j.url = Some(url.clone());
                            j.message = Some(format!("placed on {host}"));
                            j.observe_status(TrialStatus::Running);
                        })
                        .await;
                    self.placements.lock().await.insert(id.clone(), placement);
                    info!(trial_id = %id, host = %host, "trial launched");
                }
                Err(err) => {
                    warn!(trial_id = %id, error = %err, "staging failed");
                    self.registry
                        .update(&id, |j| {
                            j.observe_status(TrialStatus::Failed);
                            j.message = Some(format!("staging failed: {err}"));
                        })
                        .await;
                }
            }
        }
    }

    async fn stage_and_launch(&self, job: &TrialJob) -> Result<Placement> {
        let trial_config = {
            let guard = self.trial_config.read().await;
            guard.clone().ok_or(Error::MissingMetadata(keys::TRIAL_CONFIG))?
        };
        let runner = self.next_runner().await?;
        let manager = self.manager_endpoint().await?;

        let id = &job.id;
        let staging = self.ctx.trial_directory(id);
        tokio::fs::create_dir_all(&staging).await?;
        tokio::fs::write(staging.join(PARAMETER_FILE_NAME), &job.form.hyper_parameters).await?;
        MountedStorage::new(&staging)
            .copy_in(&trial_config.code_dir, "code")
            .await
            .map_err(Error::cluster)?;

        let remote_dir = format!("{}/trials/{id}", self.remote_base());
        let version = if *self.version_check.read().await {
            self.ctx.version.clone()
        } else {
            String::new()
        };
        let script = render_exec_script(&ExecScriptParams {
            platform: "remote",
            experiment_id: &self.ctx.experiment_id,
            trial_id: id.as_str(),
            sequence_id: job.form.sequence_id,
            trial_dir: &remote_dir,
            code_dir: &format!("{remote_dir}/code"),
            command: &trial_config.command,
            manager: &manager,
            version: &version,
            log_collection: &self.log_collection.read().await.clone(),
            cuda_devices: &cuda_devices(trial_config.gpu_count),
            record_pid: true,
        });
        tokio::fs::write(staging.join(RUN_SCRIPT_NAME), script).await?;

        let parent = format!("{}/trials", self.remote_base());
        runner.run(&format!("mkdir -p {parent}")).await?;
        runner.upload(&staging, &parent).await?;
        runner
            .run(&format!(
                "cd {remote_dir} && nohup setsid sh {RUN_SCRIPT_NAME} >/dev/null 2>&1 &"
            ))
            .await?;
        Ok(Placement { runner, remote_dir })
    }

    /// One poll pass: read the exit-code file of every placed, unsettled
    /// trial. An unreadable file means the trial is still running.
    async fn refresh_statuses(&self) {
        let open = self.registry.non_terminal_ids().await;
        if open.is_empty() {
            return;
        }
        let placements = self.placements.lock().await;
        for id in open {
            let Some(placement) = placements.get(&id) else { continue };
            let command = format!("cat {}/{EXIT_CODE_FILE}", placement.remote_dir);
            match placement.runner.run(&command).await {
                Ok(raw) => {
                    let status = match raw.trim().parse::<i32>() {
                        Ok(0) => TrialStatus::Succeeded,
                        Ok(_) | Err(_) => TrialStatus::Failed,
                    };
                    self.registry.observe_status(&id, status).await;
                    info!(trial_id = %id, status = %status, "remote trial exited");
                }
                Err(err) => {
                    debug!(trial_id = %id, error = %err, "no exit code yet");
                }
            }
        }
    }
}

/// Visible GPUs for a trial; empty hides them all.
fn cuda_devices(gpu_count: Option<u32>) -> String {
    match gpu_count.filter(|n| *n > 0) {
        Some(n) => (0..n).map(|i| i.to_string()).collect::<Vec<_>>().join(","),
        None => String::new(),
    }
}

#[async_trait]
impl TrainingService for RemoteTrainingService {
    async fn list_trial_jobs(&self) -> Result<Vec<TrialJob>> {
        Ok(self.registry.list().await)
    }

    async fn get_trial_job(&self, id: &TrialId) -> Result<TrialJob> {
        self.registry.get(id).await
    }

    async fn submit_trial_job(&self, form: TrialForm) -> Result<TrialJob> {
        {
            if self.machines.read().await.is_empty() {
                return Err(Error::MissingMetadata(keys::REMOTE_CONFIG));
            }
            if self.trial_config.read().await.is_none() {
                return Err(Error::MissingMetadata(keys::TRIAL_CONFIG));
            }
            if self.manager_ip.read().await.is_none() {
                return Err(Error::MissingMetadata(keys::MANAGER_IP));
            }
        }

        let id = TrialId::generate();
        let mut job = TrialJob::new(id.clone(), TrialStatus::Waiting, form);
        job.working_directory = Some(self.ctx.trial_directory(&id));
        self.registry.insert(job.clone()).await;
        self.queue.lock().await.push_back(id.clone());
        debug!(trial_id = %id, "trial enqueued for placement");
        Ok(job)
    }

    async fn update_trial_job(&self, id: &TrialId, form: TrialForm) -> Result<TrialJob> {
        self.registry.get(id).await?;
        let (runner, remote_dir) = {
            let placements = self.placements.lock().await;
            let placement = placements
                .get(id)
                .ok_or_else(|| Error::cluster(format!("trial {id} not placed yet")))?;
            (placement.runner.clone(), placement.remote_dir.clone())
        };

        let file_name = format!("parameter_{}.cfg", form.parameter_index);
        let staging = self.ctx.trial_directory(id);
        let local_file = staging.join(&file_name);
        tokio::fs::write(&local_file, &form.hyper_parameters).await?;
        runner.upload(&local_file, &remote_dir).await?;

        let port = self.ensure_callback_started().await?;
        let meta = ParameterFileMeta {
            trial_id: id.to_string(),
            file_path: format!("{remote_dir}/{file_name}"),
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

        let placed = self.placements.lock().await.contains_key(id);
        if job.status == TrialStatus::Unknown || !placed {
            self.queue.lock().await.retain(|queued| queued != id);
            self.registry.observe_status(id, TrialStatus::canceled(early_stopped)).await;
            return Ok(());
        }

        {
            let placements = self.placements.lock().await;
            if let Some(placement) = placements.get(id) {
                let command =
                    format!("kill -9 -- -$(cat {}/{PID_FILE})", placement.remote_dir);
                placement.runner.run(&command).await?;
            }
        }
        self.registry.observe_status(id, TrialStatus::canceled(early_stopped)).await;
        info!(trial_id = %id, early_stopped, "trial canceled");
        Ok(())
    }

    fn subscribe_metrics(&self) -> broadcast::Receiver<TrialMetric> {
        self.metric_bus.subscribe()
    }

    async fn set_cluster_metadata(&self, key: &str, value: &str) -> Result<()> {
        match key {
            keys::REMOTE_CONFIG => {
                let config: RemoteExecConfig = parse_value(key, value)?;
                if config.machines.is_empty() {
                    return Err(Error::invalid_metadata(key, "machine list is empty"));
                }
                let runners = config
                    .machines
                    .into_iter()
                    .map(|machine| Arc::new(SshRunner::new(machine)))
                    .collect::<Vec<_>>();
                info!(machines = runners.len(), "remote machines configured");
                *self.machines.write().await = runners;
                Ok(())
            }
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
        if self.machines.read().await.is_empty() {
            return Err(Error::MissingMetadata(keys::REMOTE_CONFIG));
        }
        self.ensure_callback_started().await?;
        info!(experiment_id = %self.ctx.experiment_id, "remote training service running");

        let mut drain = tokio::time::interval(self.drain_interval);
        drain.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return Ok(()),
                _ = drain.tick() => {
                    self.drain_queue_once().await;
                    if let Some(fault) = self.callback.take_error() {
                        return Err(Error::CallbackServer(fault));
                    }
                }
                _ = poll.tick() => {
                    self.refresh_statuses().await;
                }
            }
        }
    }

    async fn clean_up(&self) -> Result<()> {
        self.shutdown.cancel();
        let placements = self.placements.lock().await;
        for id in self.registry.non_terminal_ids().await {
            if let Some(placement) = placements.get(&id) {
                let command =
                    format!("kill -9 -- -$(cat {}/{PID_FILE})", placement.remote_dir);
                if let Err(err) = placement.runner.run(&command).await {
                    warn!(trial_id = %id, error = %err, "cleanup kill failed");
                }
            }
            self.registry.observe_status(&id, TrialStatus::SysCanceled).await;
        }
        drop(placements);
        self.queue.lock().await.clear();
        self.callback.stop();
        info!("remote training service cleaned up");
        Ok(())
    }
}
