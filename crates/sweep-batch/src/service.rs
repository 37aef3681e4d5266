//! The batch-cluster training service.
//!
//! Submission is decoupled from the contract call: `submit_trial_job` only
//! enqueues, and a drain loop walks the FIFO queue, advancing past the head
//! only once the cluster accepted it. A failed head is retried in place on
//! the next drain; a permanently broken head therefore blocks the queue.
//! That mirrors the behavior this backend has always had and is left as-is.

use crate::client::{map_remote_state, render_job_spec, BatchJobClient, JobSpecParams};
use crate::config::{BatchAuth, BatchClusterConfig, BatchTrialConfig};
use crate::token::{TokenKeeper, TokenSource, TOKEN_MAX_AGE, TOKEN_REFRESH_TIMEOUT};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use sweep_core::metadata::keys;
use sweep_core::{
    parse_value, Error, ExperimentContext, ManagerEndpoint, ManagerIpConfig, MetricBus, Result,
    TrainingService, TrialForm, TrialId, TrialJob, TrialMetric, TrialRegistry, TrialStatus,
};
use sweep_gateway::{CallbackServer, ParameterFileMeta};
use sweep_storage::StorageAdapter;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause between queue drains.
const QUEUE_DRAIN_INTERVAL: Duration = Duration::from_secs(1);

/// How often remote job states are polled.
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Deterministic job name on the cluster.
#[must_use]
pub fn batch_job_name(experiment_id: &str, trial_id: &TrialId) -> String {
    format!("sweep-{experiment_id}-{trial_id}").to_lowercase()
}

struct BatchHandles {
    client: BatchJobClient,
    token: TokenSource,
}

pub struct BatchTrainingService {
    ctx: ExperimentContext,
    registry: TrialRegistry,
    metric_bus: MetricBus,
    callback: CallbackServer,
    cluster: RwLock<Option<BatchHandles>>,
    trial_config: RwLock<Option<BatchTrialConfig>>,
    manager_ip: RwLock<Option<String>>,
    version_check: RwLock<bool>,
    log_collection: RwLock<String>,
    queue: Mutex<VecDeque<TrialId>>,
    /// Optional mounted storage for multi-phase parameter files; without it
    /// `update_trial_job` is unsupported.
    storage: Option<Arc<dyn StorageAdapter>>,
    drain_interval: Duration,
    poll_interval: Duration,
    token_max_age: Duration,
    token_refresh_timeout: Duration,
    shutdown: CancellationToken,
}

impl BatchTrainingService {
    #[must_use]
    pub fn new(ctx: ExperimentContext, metric_bus: MetricBus) -> Self {
        let callback = CallbackServer::new(metric_bus.clone());
        Self {
            ctx,
            registry: TrialRegistry::new(),
            metric_bus,
            callback,
            cluster: RwLock::new(None),
            trial_config: RwLock::new(None),
            manager_ip: RwLock::new(None),
            version_check: RwLock::new(true),
            log_collection: RwLock::new("none".to_string()),
            queue: Mutex::new(VecDeque::new()),
            storage: None,
            drain_interval: QUEUE_DRAIN_INTERVAL,
            poll_interval: JOB_POLL_INTERVAL,
            token_max_age: TOKEN_MAX_AGE,
            token_refresh_timeout: TOKEN_REFRESH_TIMEOUT,
            shutdown: CancellationToken::new(),
        }
    }

    /// Attaches mounted storage, enabling multi-phase parameter delivery.
    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn StorageAdapter>) -> Self {
        self.storage = Some(storage);
        self
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

    /// Overrides the token age gate for keepers built from cluster metadata.
    #[must_use]
    pub fn with_token_max_age(mut self, max_age: Duration) -> Self {
        self.token_max_age = max_age;
        self
    }

    /// Overrides the token refresh timeout for keepers built from cluster
    /// metadata.
    #[must_use]
    pub fn with_token_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.token_refresh_timeout = timeout;
        self
    }

    /// Trials left in the submission queue. The head stays put until the
    /// cluster accepts it.
    pub async fn queued_trials(&self) -> usize {
        self.queue.lock().await.len()
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

    /// One drain pass: submit queued trials in order, stopping at the
    /// first head the cluster refuses. Only a fatal credential failure is
    /// an error; an ordinary refusal leaves the head in place for the next
    /// pass.
    async fn drain_queue_once(&self) -> Result<()> {
        loop {
            let head = { self.queue.lock().await.front().cloned() };
            let Some(id) = head else { return Ok(()) };

            let job = match self.registry.get(&id).await {
                Ok(job) => job,
                Err(_) => {
                    self.queue.lock().await.pop_front();
                    continue;
                }
            };
            if job.is_terminal() {
                // canceled while still queued
                self.queue.lock().await.pop_front();
                continue;
            }

            match self.submit_to_cluster(&job).await {
                Ok(job_name) => {
                    self.queue.lock().await.pop_front();
                    self.registry.update(&id, |j| j.job_name = Some(job_name.clone())).await;
                    info!(trial_id = %id, job_name = %job_name, "queued trial submitted");
                }
                Err(Error::TokenTimeout) => return Err(Error::TokenTimeout),
                Err(err) => {
                    warn!(trial_id = %id, error = %err, "head submission failed, retrying next drain");
                    return Ok(());
                }
            }
        }
    }

    async fn submit_to_cluster(&self, job: &TrialJob) -> Result<String> {
        let cluster = self.cluster.read().await;
        let handles = cluster.as_ref().ok_or(Error::MissingMetadata(keys::BATCH_CONFIG))?;
        let trial_guard = self.trial_config.read().await;
        let trial_config =
            trial_guard.as_ref().ok_or(Error::MissingMetadata(keys::TRIAL_CONFIG))?;

        let manager = self.manager_endpoint().await?;
        let version = if *self.version_check.read().await {
            self.ctx.version.clone()
        } else {
            String::new()
        };
        let log_collection = self.log_collection.read().await.clone();

        let job_name = batch_job_name(&self.ctx.experiment_id, &job.id);
        let spec = render_job_spec(&JobSpecParams {
            job_name: &job_name,
            experiment_id: &self.ctx.experiment_id,
            trial_id: job.id.as_str(),
            sequence_id: job.form.sequence_id,
            hyper_parameters: &job.form.hyper_parameters,
            trial: trial_config,
            manager: &manager,
            version: &version,
            log_collection: &log_collection,
        });

        let token = handles.token.token().await?;
        handles.client.submit_job(&token, &spec).await?;
        Ok(job_name)
    }

    /// One status pass over submitted, unsettled trials. Per-trial request
    /// failures are logged and skipped; only a fatal credential failure
    /// propagates.
    async fn refresh_statuses(&self) -> Result<()> {
        let open = self.registry.non_terminal_ids().await;
        if open.is_empty() {
            return Ok(());
        }
        let cluster = self.cluster.read().await;
        let Some(handles) = cluster.as_ref() else { return Ok(()) };

        for id in open {
            let Ok(job) = self.registry.get(&id).await else { continue };
            let Some(job_name) = job.job_name else { continue };
            let token = match handles.token.token().await {
                Ok(token) => token,
                Err(Error::TokenTimeout) => return Err(Error::TokenTimeout),
                Err(err) => {
                    warn!(error = %err, "token unavailable, skipping status poll");
                    return Ok(());
                }
            };
            match handles.client.job_info(&token, &job_name).await {
                Ok(info) => {
                    self.registry.observe_status(&id, map_remote_state(&info.state)).await;
                }
                Err(err) => {
                    warn!(trial_id = %id, error = %err, "job status poll failed");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TrainingService for BatchTrainingService {
    async fn list_trial_jobs(&self) -> Result<Vec<TrialJob>> {
        Ok(self.registry.list().await)
    }

    async fn get_trial_job(&self, id: &TrialId) -> Result<TrialJob> {
        self.registry.get(id).await
    }

    async fn submit_trial_job(&self, form: TrialForm) -> Result<TrialJob> {
        {
            if self.cluster.read().await.is_none() {
                return Err(Error::MissingMetadata(keys::BATCH_CONFIG));
            }
            if self.trial_config.read().await.is_none() {
                return Err(Error::MissingMetadata(keys::TRIAL_CONFIG));
            }
            if self.manager_ip.read().await.is_none() {
                return Err(Error::MissingMetadata(keys::MANAGER_IP));
            }
        }

        let id = TrialId::generate();
        let job = TrialJob::new(id.clone(), TrialStatus::Waiting, form);
        self.registry.insert(job.clone()).await;
        self.queue.lock().await.push_back(id.clone());
        debug!(trial_id = %id, "trial enqueued for batch submission");
        Ok(job)
    }

    async fn update_trial_job(&self, id: &TrialId, form: TrialForm) -> Result<TrialJob> {
        let storage = self.storage.as_ref().ok_or(Error::NotSupported("update_trial_job"))?;
        self.registry.get(id).await?;

        let file_name = format!("parameter_{}.cfg", form.parameter_index);
        let relative = format!("{}/trials/{id}/{file_name}", self.ctx.experiment_id);
        storage
            .append(&relative, form.hyper_parameters.as_bytes())
            .await
            .map_err(Error::cluster)?;

        // tell the trial where to look, through our own callback server
        let port = self.ensure_callback_started().await?;
        let meta = ParameterFileMeta {
            trial_id: id.to_string(),
            file_path: relative,
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

        // trials the cluster never saw (still queued) or lost track of
        // settle locally, without a remote call
        if job.status == TrialStatus::Unknown || job.job_name.is_none() {
            self.queue.lock().await.retain(|queued| queued != id);
            self.registry.observe_status(id, TrialStatus::canceled(early_stopped)).await;
            return Ok(());
        }

        let cluster = self.cluster.read().await;
        let handles = cluster.as_ref().ok_or(Error::MissingMetadata(keys::BATCH_CONFIG))?;
        let token = handles.token.token().await?;
        let job_name = job.job_name.unwrap_or_default();
        handles.client.stop_job(&token, &job_name).await?;
        self.registry.observe_status(id, TrialStatus::canceled(early_stopped)).await;
        info!(trial_id = %id, early_stopped, "trial canceled");
        Ok(())
    }

    fn subscribe_metrics(&self) -> broadcast::Receiver<TrialMetric> {
        self.metric_bus.subscribe()
    }

    async fn set_cluster_metadata(&self, key: &str, value: &str) -> Result<()> {
        match key {
            keys::BATCH_CONFIG => {
                let config: BatchClusterConfig = parse_value(key, value)?;
                let http = reqwest::Client::new();
                let token = match &config.auth {
                    BatchAuth::Password { password } => TokenSource::Keeper(
                        TokenKeeper::new(
                            http.clone(),
                            config.base_url(),
                            config.user_name.clone(),
                            password.clone(),
                        )
                        .with_max_age(self.token_max_age)
                        .with_refresh_timeout(self.token_refresh_timeout),
                    ),
                    BatchAuth::Token { token } => TokenSource::Static(token.clone()),
                };
                let client = BatchJobClient::new(http, config.base_url(), config.user_name.clone());
                info!(host = %config.host, user = %config.user_name, "batch cluster configured");
                *self.cluster.write().await = Some(BatchHandles { client, token });
                Ok(())
            }
            keys::TRIAL_CONFIG => {
                let config: BatchTrialConfig = parse_value(key, value)?;
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
        {
            let cluster = self.cluster.read().await;
            if cluster.is_none() {
                return Err(Error::MissingMetadata(keys::BATCH_CONFIG));
            }
        }
        self.ensure_callback_started().await?;
        info!(experiment_id = %self.ctx.experiment_id, "batch training service running");

        let mut drain = tokio::time::interval(self.drain_interval);
        drain.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return Ok(()),
                _ = drain.tick() => {
                    self.drain_queue_once().await?;
                    if let Some(fault) = self.callback.take_error() {
                        return Err(Error::CallbackServer(fault));
                    }
                }
                _ = poll.tick() => {
                    self.refresh_statuses().await?;
                }
            }
        }
    }

    async fn clean_up(&self) -> Result<()> {
        self.shutdown.cancel();
        let open = self.registry.non_terminal_ids().await;
        let cluster = self.cluster.read().await;
        for id in open {
            if let Ok(job) = self.registry.get(&id).await {
                if let (Some(handles), Some(job_name)) = (cluster.as_ref(), job.job_name.clone()) {
                    match handles.token.token().await {
                        Ok(token) => {
                            if let Err(err) = handles.client.stop_job(&token, &job_name).await {
                                warn!(trial_id = %id, error = %err, "cleanup stop failed");
                            }
                        }
                        Err(err) => warn!(error = %err, "cleanup token unavailable"),
                    }
                }
            }
            self.registry.observe_status(&id, TrialStatus::SysCanceled).await;
        }
        self.queue.lock().await.clear();
        self.callback.stop();
        info!("batch training service cleaned up");
        Ok(())
    }
}
