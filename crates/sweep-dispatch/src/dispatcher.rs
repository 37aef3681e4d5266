//! The dispatching training service.
//!
//! Trials and environments are decoupled: `submit_trial_job` only queues,
//! and a management loop keeps environments stocked, assigns waiting trials
//! to idle environments, and settles trials whose process exited. With
//! reuse enabled an environment hosts trial after trial; with reuse
//! disabled it is stopped as soon as its first trial finishes.

use crate::environment::{
    Environment, EnvironmentId, EnvironmentService, EnvironmentStatus, TrialLaunch,
};
use crate::local_env::LocalEnvironmentService;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sweep_core::metadata::keys;
use sweep_core::{
    parse_platform_list, parse_value, Error, ExperimentContext, ManagerEndpoint, ManagerIpConfig,
    MetricBus, Result, TrainingService, TrialForm, TrialId, TrialJob, TrialMetric, TrialRegistry,
    TrialRunConfig, TrialStatus,
};
use sweep_gateway::CallbackServer;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fallback management cadence when no service suggests one.
const MANAGEMENT_INTERVAL: Duration = Duration::from_secs(1);

pub struct TrialDispatcher {
    ctx: ExperimentContext,
    registry: TrialRegistry,
    metric_bus: MetricBus,
    callback: CallbackServer,
    services: RwLock<Vec<Arc<dyn EnvironmentService>>>,
    environments: Mutex<HashMap<EnvironmentId, Environment>>,
    assignments: Mutex<HashMap<TrialId, EnvironmentId>>,
    waiting: Mutex<VecDeque<TrialId>>,
    trial_config: RwLock<Option<TrialRunConfig>>,
    manager_ip: RwLock<Option<String>>,
    version_check: RwLock<bool>,
    log_collection: RwLock<String>,
    reuse: bool,
    next_service: AtomicUsize,
    poll_interval: Option<Duration>,
    shutdown: CancellationToken,
}

impl TrialDispatcher {
    #[must_use]
    pub fn new(ctx: ExperimentContext, metric_bus: MetricBus) -> Self {
        let callback = CallbackServer::new(metric_bus.clone());
        Self {
            ctx,
            registry: TrialRegistry::new(),
            metric_bus,
            callback,
            services: RwLock::new(Vec::new()),
            environments: Mutex::new(HashMap::new()),
            assignments: Mutex::new(HashMap::new()),
            waiting: Mutex::new(VecDeque::new()),
            trial_config: RwLock::new(None),
            manager_ip: RwLock::new(None),
            version_check: RwLock::new(true),
            log_collection: RwLock::new("none".to_string()),
            reuse: true,
            next_service: AtomicUsize::new(0),
            poll_interval: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Whether environments host more than one trial over their lifetime.
    #[must_use]
    pub fn with_reuse(mut self, reuse: bool) -> Self {
        self.reuse = reuse;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Adds an environment provider. One service per platform; a second
    /// registration for the same platform is ignored.
    pub async fn register_service(&self, service: Arc<dyn EnvironmentService>) {
        let mut services = self.services.write().await;
        if services.iter().any(|s| s.platform() == service.platform()) {
            debug!(platform = service.platform(), "environment service already registered");
            return;
        }
        info!(platform = service.platform(), "environment service registered");
        services.push(service);
    }

    /// Environments currently tracked, for status inspection.
    pub async fn environments(&self) -> Vec<Environment> {
        self.environments.lock().await.values().cloned().collect()
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
            .unwrap_or_else(|| Ipv4Addr::LOCALHOST.to_string());
        let port = self.ensure_callback_started().await?;
        Ok(ManagerEndpoint::new(ip, port))
    }

    async fn service_for(&self, platform: &str) -> Option<Arc<dyn EnvironmentService>> {
        let services = self.services.read().await;
        services.iter().find(|s| s.platform() == platform).cloned()
    }

    /// One management pass: refresh environment state, settle finished
    /// trials, top up capacity, then hand waiting trials to idle
    /// environments.
    async fn management_pass(&self) {
        self.refresh_environments().await;
        self.settle_finished_trials().await;
        self.grow_capacity().await;
        self.assign_waiting_trials().await;
    }

    async fn refresh_environments(&self) {
        let services = self.services.read().await.clone();
        let mut environments = self.environments.lock().await;
        for service in &services {
            let mut group: Vec<Environment> = environments
                .values()
                .filter(|env| env.platform == service.platform())
                .cloned()
                .collect();
            if group.is_empty() {
                continue;
            }
            if let Err(err) = service.refresh_environments(&mut group).await {
                warn!(platform = service.platform(), error = %err, "environment refresh failed");
                continue;
            }
            // only the status comes from the substrate; trial counts are
            // dispatcher bookkeeping
            for refreshed in group {
                if let Some(tracked) = environments.get_mut(&refreshed.id) {
                    tracked.status = refreshed.status;
                }
            }
        }
    }

    async fn settle_finished_trials(&self) {
        let assigned: Vec<(TrialId, EnvironmentId)> = {
            let assignments = self.assignments.lock().await;
            assignments.iter().map(|(t, e)| (t.clone(), e.clone())).collect()
        };
        for (trial_id, env_id) in assigned {
            let Ok(job) = self.registry.get(&trial_id).await else { continue };
            if job.is_terminal() {
                continue;
            }
            let platform = {
                let environments = self.environments.lock().await;
                let Some(env) = environments.get(&env_id) else { continue };
                env.platform.clone()
            };
            let Some(service) = self.service_for(&platform).await else { continue };
            match service.check_trial(&env_id, &trial_id).await {
                Ok(Some(code)) => {
                    let status =
                        if code == 0 { TrialStatus::Succeeded } else { TrialStatus::Failed };
                    self.registry.observe_status(&trial_id, status).await;
                    info!(trial_id = %trial_id, code, "dispatched trial exited");
                    self.release_environment(&trial_id, &env_id).await;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(trial_id = %trial_id, error = %err, "trial check failed");
                }
            }
        }
    }

    /// Frees the environment a trial occupied; stops it when reuse is
    /// disabled.
    async fn release_environment(&self, trial_id: &TrialId, env_id: &EnvironmentId) {
        self.assignments.lock().await.remove(trial_id);
        let platform = {
            let mut environments = self.environments.lock().await;
            let Some(env) = environments.get_mut(env_id) else { return };
            env.running_trial_count = env.running_trial_count.saturating_sub(1);
            if self.reuse {
                return;
            }
            env.status = EnvironmentStatus::Stopped;
            env.platform.clone()
        };
        if let Some(service) = self.service_for(&platform).await {
            if let Err(err) = service.stop_environment(env_id).await {
                warn!(environment = %env_id, error = %err, "stopping used environment failed");
            }
        }
    }

    async fn grow_capacity(&self) {
        let waiting = self.waiting.lock().await.len();
        if waiting == 0 {
            return;
        }
        let idle = {
            let environments = self.environments.lock().await;
            environments.values().filter(|env| env.is_idle()).count()
        };
        let services = self.services.read().await.clone();
        if services.is_empty() {
            return;
        }
        for _ in 0..waiting.saturating_sub(idle) {
            let mut started = false;
            for _ in 0..services.len() {
                let index = self.next_service.fetch_add(1, Ordering::SeqCst) % services.len();
                let service = &services[index];
                if !service.has_more_environments().await {
                    continue;
                }
                match service.start_environment().await {
                    Ok(env) => {
                        info!(environment = %env.id, platform = %env.platform, "environment started");
                        self.environments.lock().await.insert(env.id.clone(), env);
                        started = true;
                        break;
                    }
                    Err(err) => {
                        warn!(platform = service.platform(), error = %err, "starting environment failed");
                    }
                }
            }
            if !started {
                return;
            }
        }
    }

    async fn assign_waiting_trials(&self) {
        let Ok(manager) = self.manager_endpoint().await else { return };
        let trial_config = {
            let guard = self.trial_config.read().await;
            let Some(config) = guard.clone() else { return };
            config
        };
        let version = if *self.version_check.read().await {
            self.ctx.version.clone()
        } else {
            String::new()
        };
        let log_collection = self.log_collection.read().await.clone();
        let code_dir = trial_config.code_dir.display().to_string();

        loop {
            let Some(trial_id) = self.waiting.lock().await.pop_front() else { return };
            let Ok(job) = self.registry.get(&trial_id).await else { continue };
            if job.is_terminal() {
                // canceled while still waiting
                continue;
            }

            let idle = {
                let environments = self.environments.lock().await;
                environments.values().find(|env| env.is_idle()).cloned()
            };
            let Some(env) = idle else {
                // no capacity yet, try again next pass
                self.waiting.lock().await.push_front(trial_id);
                return;
            };
            let Some(service) = self.service_for(&env.platform).await else {
                self.waiting.lock().await.push_front(trial_id);
                return;
            };

            let launch = TrialLaunch {
                trial_id: &trial_id,
                form: &job.form,
                experiment_id: &self.ctx.experiment_id,
                command: &trial_config.command,
                code_dir: &code_dir,
                manager: &manager,
                version: &version,
                log_collection: &log_collection,
            };
            match service.launch_trial(&env.id, &launch).await {
                Ok(()) => {
                    {
                        let mut environments = self.environments.lock().await;
                        if let Some(tracked) = environments.get_mut(&env.id) {
                            tracked.running_trial_count += 1;
                            tracked.assigned_trial_count += 1;
                        }
                    }
                    self.assignments.lock().await.insert(trial_id.clone(), env.id.clone());
                    let url = env.tracking_url.clone();
                    self.registry
                        .update(&trial_id, |j| {
                            j.url = url.clone();
                            j.message = Some(format!("environment {}", env.id));
                            j.observe_status(TrialStatus::Running);
                        })
                        .await;
                    info!(trial_id = %trial_id, environment = %env.id, "trial assigned");
                }
                Err(err) => {
                    warn!(trial_id = %trial_id, environment = %env.id, error = %err, "launch failed");
                    self.registry
                        .update(&trial_id, |j| {
                            j.observe_status(TrialStatus::Failed);
                            j.message = Some(format!("launch failed: {err}"));
                        })
                        .await;
                }
            }
        }
    }

    async fn management_interval(&self) -> Duration {
        if let Some(interval) = self.poll_interval {
            return interval;
        }
        let services = self.services.read().await;
        services.iter().map(|s| s.poll_interval()).min().unwrap_or(MANAGEMENT_INTERVAL)
    }
}

#[async_trait]
impl TrainingService for TrialDispatcher {
    async fn list_trial_jobs(&self) -> Result<Vec<TrialJob>> {
        Ok(self.registry.list().await)
    }

    async fn get_trial_job(&self, id: &TrialId) -> Result<TrialJob> {
        self.registry.get(id).await
    }

    async fn submit_trial_job(&self, form: TrialForm) -> Result<TrialJob> {
        if self.services.read().await.is_empty() {
            return Err(Error::MissingMetadata(keys::PLATFORM_LIST));
        }
        if self.trial_config.read().await.is_none() {
            return Err(Error::MissingMetadata(keys::TRIAL_CONFIG));
        }

        let id = TrialId::generate();
        let job = TrialJob::new(id.clone(), TrialStatus::Waiting, form);
        self.registry.insert(job.clone()).await;
        self.waiting.lock().await.push_back(id.clone());
        debug!(trial_id = %id, "trial queued for dispatch");
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

        let assigned = { self.assignments.lock().await.get(id).cloned() };
        match assigned {
            None => {
                self.waiting.lock().await.retain(|queued| queued != id);
                self.registry.observe_status(id, TrialStatus::canceled(early_stopped)).await;
            }
            Some(env_id) => {
                // stamp first so the settle pass cannot relabel the killed
                // process as Failed
                self.registry.observe_status(id, TrialStatus::canceled(early_stopped)).await;
                let platform = {
                    let environments = self.environments.lock().await;
                    environments.get(&env_id).map(|env| env.platform.clone())
                };
                if let Some(platform) = platform {
                    if let Some(service) = self.service_for(&platform).await {
                        service.kill_trial(&env_id, id).await?;
                    }
                }
                self.release_environment(id, &env_id).await;
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
            keys::PLATFORM_LIST => {
                let platforms = parse_platform_list(value);
                if platforms.is_empty() {
                    return Err(Error::invalid_metadata(key, "no platforms listed"));
                }
                if let Some(unknown) = platforms.iter().find(|p| p.as_str() != "local") {
                    return Err(Error::invalid_metadata(
                        key,
                        format!("no environment service for platform {unknown}"),
                    ));
                }
                self.register_service(Arc::new(LocalEnvironmentService::new(self.ctx.clone())))
                    .await;
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
        if self.services.read().await.is_empty() {
            return Err(Error::MissingMetadata(keys::PLATFORM_LIST));
        }
        self.ensure_callback_started().await?;
        info!(experiment_id = %self.ctx.experiment_id, reuse = self.reuse, "trial dispatcher running");

        let mut ticker = tokio::time::interval(self.management_interval().await);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    self.management_pass().await;
                    if let Some(fault) = self.callback.take_error() {
                        return Err(Error::CallbackServer(fault));
                    }
                }
            }
        }
    }

    async fn clean_up(&self) -> Result<()> {
        self.shutdown.cancel();
        let assigned: Vec<(TrialId, EnvironmentId)> = {
            let assignments = self.assignments.lock().await;
            assignments.iter().map(|(t, e)| (t.clone(), e.clone())).collect()
        };
        for (trial_id, env_id) in assigned {
            self.registry.observe_status(&trial_id, TrialStatus::SysCanceled).await;
            let platform = {
                let environments = self.environments.lock().await;
                environments.get(&env_id).map(|env| env.platform.clone())
            };
            if let Some(platform) = platform {
                if let Some(service) = self.service_for(&platform).await {
                    if let Err(err) = service.kill_trial(&env_id, &trial_id).await {
                        warn!(trial_id = %trial_id, error = %err, "cleanup kill failed");
                    }
                }
            }
        }
        let environments: Vec<Environment> =
            { self.environments.lock().await.values().cloned().collect() };
        for env in environments {
            if !env.is_alive() {
                continue;
            }
            if let Some(service) = self.service_for(&env.platform).await {
                if let Err(err) = service.stop_environment(&env.id).await {
                    warn!(environment = %env.id, error = %err, "cleanup stop failed");
                }
            }
        }
        for id in self.registry.non_terminal_ids().await {
            self.registry.observe_status(&id, TrialStatus::SysCanceled).await;
        }
        self.waiting.lock().await.clear();
        self.assignments.lock().await.clear();
        self.callback.stop();
        info!("trial dispatcher cleaned up");
        Ok(())
    }
}
