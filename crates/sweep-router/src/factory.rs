//! Backend construction behind the router.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use sweep_batch::BatchTrainingService;
use sweep_core::{Error, ExperimentContext, MetricBus, Result, TrainingService};
use sweep_dispatch::TrialDispatcher;
use sweep_exec::{LocalTrainingService, RemoteTrainingService};
use sweep_kube::{KubernetesTrainingService, OperatorFamily};

/// The concrete backend families the router can resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    Remote,
    Kubeflow,
    FrameworkController,
    Batch,
    /// Environment dispatcher, used for hybrid and reuse configurations.
    Dispatcher,
}

impl BackendKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Kubeflow => "kubeflow",
            Self::FrameworkController => "frameworkcontroller",
            Self::Batch => "batch",
            Self::Dispatcher => "dispatcher",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the backend the router resolved to. Injected so hosts and tests
/// decide how concrete services come to life.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(
        &self,
        kind: BackendKind,
        ctx: &ExperimentContext,
        metric_bus: MetricBus,
    ) -> Result<Arc<dyn TrainingService>>;
}

/// Wires each kind to its in-tree implementation. Kubernetes-family kinds
/// discover the cluster from the ambient kubeconfig.
#[derive(Debug, Default)]
pub struct DefaultBackendFactory;

#[async_trait]
impl BackendFactory for DefaultBackendFactory {
    async fn create(
        &self,
        kind: BackendKind,
        ctx: &ExperimentContext,
        metric_bus: MetricBus,
    ) -> Result<Arc<dyn TrainingService>> {
        let service: Arc<dyn TrainingService> = match kind {
            BackendKind::Local => Arc::new(LocalTrainingService::new(ctx.clone(), metric_bus)),
            BackendKind::Remote => Arc::new(RemoteTrainingService::new(ctx.clone(), metric_bus)),
            BackendKind::Kubeflow | BackendKind::FrameworkController => {
                let family = if kind == BackendKind::Kubeflow {
                    OperatorFamily::Kubeflow
                } else {
                    OperatorFamily::FrameworkController
                };
                let client = kube::Client::try_default().await.map_err(Error::cluster)?;
                Arc::new(KubernetesTrainingService::new(family, ctx.clone(), client, metric_bus))
            }
            BackendKind::Batch => Arc::new(BatchTrainingService::new(ctx.clone(), metric_bus)),
            BackendKind::Dispatcher => Arc::new(TrialDispatcher::new(ctx.clone(), metric_bus)),
        };
        Ok(service)
    }
}
