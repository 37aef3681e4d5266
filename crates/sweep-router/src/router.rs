//! The routing training service.
//!
//! Holds no backend until cluster metadata identifies a platform. The
//! first recognized key binds exactly one backend for the life of the
//! process; afterwards every call is a pure pass-through. There is no
//! queueing, caching or retry in here.

use crate::factory::{BackendFactory, BackendKind, DefaultBackendFactory};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use sweep_core::metadata::keys;
use sweep_core::{
    Error, ExperimentContext, MetricBus, Result, TrainingService, TrialForm, TrialId, TrialJob,
    TrialMetric,
};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

/// How long `run` sleeps between checks while no backend is bound yet.
const RESOLVE_INTERVAL: Duration = Duration::from_secs(1);

/// Peeks at a config payload for the legacy `"reuse": true` flag without
/// committing to the backend's full schema.
fn reuse_requested(value: &str) -> bool {
    serde_json::from_str::<Value>(value)
        .ok()
        .and_then(|v| v.get("reuse").and_then(Value::as_bool))
        .unwrap_or(false)
}

pub struct RouterTrainingService {
    ctx: ExperimentContext,
    /// Shared with every backend the factory builds, so listeners attached
    /// before resolution keep receiving after it.
    metric_bus: MetricBus,
    factory: Arc<dyn BackendFactory>,
    backend: RwLock<Option<Arc<dyn TrainingService>>>,
    resolve_interval: Duration,
}

impl RouterTrainingService {
    #[must_use]
    pub fn new(ctx: ExperimentContext, factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            ctx,
            metric_bus: MetricBus::new(),
            factory,
            backend: RwLock::new(None),
            resolve_interval: RESOLVE_INTERVAL,
        }
    }

    /// Router over the in-tree backends.
    #[must_use]
    pub fn with_default_backends(ctx: ExperimentContext) -> Self {
        Self::new(ctx, Arc::new(DefaultBackendFactory))
    }

    #[must_use]
    pub fn with_resolve_interval(mut self, interval: Duration) -> Self {
        self.resolve_interval = interval;
        self
    }

    /// Whether a concrete backend has been bound.
    pub async fn is_assigned(&self) -> bool {
        self.backend.read().await.is_some()
    }

    async fn current(&self) -> Option<Arc<dyn TrainingService>> {
        self.backend.read().await.clone()
    }

    async fn backend(&self) -> Result<Arc<dyn TrainingService>> {
        self.current().await.ok_or(Error::NotAssigned)
    }

    /// Backend selection for one metadata key; `None` when the key carries
    /// no platform decision.
    fn kind_for(key: &str, value: &str) -> Option<BackendKind> {
        match key {
            keys::PLATFORM_LIST => Some(BackendKind::Dispatcher),
            keys::LOCAL_CONFIG if reuse_requested(value) => Some(BackendKind::Dispatcher),
            keys::LOCAL_CONFIG => Some(BackendKind::Local),
            keys::REMOTE_CONFIG if reuse_requested(value) => Some(BackendKind::Dispatcher),
            keys::REMOTE_CONFIG => Some(BackendKind::Remote),
            keys::KUBEFLOW_CONFIG => Some(BackendKind::Kubeflow),
            keys::FRAMEWORK_CONTROLLER_CONFIG => Some(BackendKind::FrameworkController),
            keys::BATCH_CONFIG => Some(BackendKind::Batch),
            _ => None,
        }
    }

    /// Platform name the dispatcher registers when it was selected through
    /// a single-platform config rather than a platform list.
    fn platform_for(key: &str) -> Option<&'static str> {
        match key {
            keys::LOCAL_CONFIG => Some("local"),
            keys::REMOTE_CONFIG => Some("remote"),
            _ => None,
        }
    }
}

#[async_trait]
impl TrainingService for RouterTrainingService {
    async fn list_trial_jobs(&self) -> Result<Vec<TrialJob>> {
        self.backend().await?.list_trial_jobs().await
    }

    async fn get_trial_job(&self, id: &TrialId) -> Result<TrialJob> {
        self.backend().await?.get_trial_job(id).await
    }

    async fn submit_trial_job(&self, form: TrialForm) -> Result<TrialJob> {
        self.backend().await?.submit_trial_job(form).await
    }

    async fn update_trial_job(&self, id: &TrialId, form: TrialForm) -> Result<TrialJob> {
        self.backend().await?.update_trial_job(id, form).await
    }

    async fn cancel_trial_job(&self, id: &TrialId, early_stopped: bool) -> Result<()> {
        self.backend().await?.cancel_trial_job(id, early_stopped).await
    }

    fn subscribe_metrics(&self) -> broadcast::Receiver<TrialMetric> {
        self.metric_bus.subscribe()
    }

    async fn set_cluster_metadata(&self, key: &str, value: &str) -> Result<()> {
        if let Some(backend) = self.current().await {
            return backend.set_cluster_metadata(key, value).await;
        }

        let mut slot = self.backend.write().await;
        if let Some(backend) = slot.clone() {
            // lost the binding race; the first writer picked the platform
            drop(slot);
            return backend.set_cluster_metadata(key, value).await;
        }
        let Some(kind) = Self::kind_for(key, value) else {
            debug!(key, "metadata arrived before any platform config");
            return Err(Error::NotAssigned);
        };

        let backend = self.factory.create(kind, &self.ctx, self.metric_bus.clone()).await?;
        // configure before publishing so nothing observes a half-bound
        // backend; a config error here leaves the router unassigned
        if kind == BackendKind::Dispatcher {
            if let Some(platform) = Self::platform_for(key) {
                backend.set_cluster_metadata(keys::PLATFORM_LIST, platform).await?;
            }
        }
        backend.set_cluster_metadata(key, value).await?;
        info!(backend = %kind, key, "training service resolved");
        *slot = Some(backend);
        Ok(())
    }

    async fn get_cluster_metadata(&self, key: &str) -> Result<String> {
        self.backend().await?.get_cluster_metadata(key).await
    }

    async fn run(&self) -> Result<()> {
        let backend = loop {
            if let Some(backend) = self.current().await {
                break backend;
            }
            tokio::time::sleep(self.resolve_interval).await;
        };
        backend.run().await
    }

    async fn clean_up(&self) -> Result<()> {
        self.backend().await?.clean_up().await
    }
}
