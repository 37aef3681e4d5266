//! Binding and delegation behavior against a stub factory.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sweep_core::{
    Error, ExperimentContext, MetricBus, Result, TrainingService, TrialForm, TrialId, TrialJob,
    TrialMetric, TrialStatus,
};
use sweep_router::{BackendFactory, BackendKind, RouterTrainingService};
use tokio::sync::broadcast;

fn test_context() -> ExperimentContext {
    ExperimentContext::new("exp1", "/tmp/sweep-router-tests", "0.1.0")
}

/// Backend that records every call instead of touching any substrate.
struct StubBackend {
    metric_bus: MetricBus,
    metadata: Mutex<Vec<(String, String)>>,
    submitted: AtomicUsize,
    ran: AtomicUsize,
    cleaned: AtomicUsize,
}

impl StubBackend {
    fn new(metric_bus: MetricBus) -> Self {
        Self {
            metric_bus,
            metadata: Mutex::new(Vec::new()),
            submitted: AtomicUsize::new(0),
            ran: AtomicUsize::new(0),
            cleaned: AtomicUsize::new(0),
        }
    }

    fn metadata(&self) -> Vec<(String, String)> {
        self.metadata.lock().unwrap().clone()
    }
}

#[async_trait]
impl TrainingService for StubBackend {
    async fn list_trial_jobs(&self) -> Result<Vec<TrialJob>> {
        Ok(Vec::new())
    }

    async fn get_trial_job(&self, id: &TrialId) -> Result<TrialJob> {
        Err(Error::TrialNotFound(id.to_string()))
    }

    async fn submit_trial_job(&self, form: TrialForm) -> Result<TrialJob> {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(TrialJob::new(TrialId::generate(), TrialStatus::Waiting, form))
    }

    async fn update_trial_job(&self, _id: &TrialId, _form: TrialForm) -> Result<TrialJob> {
        Err(Error::NotSupported("update_trial_job"))
    }

    async fn cancel_trial_job(&self, _id: &TrialId, _early_stopped: bool) -> Result<()> {
        Ok(())
    }

    fn subscribe_metrics(&self) -> broadcast::Receiver<TrialMetric> {
        self.metric_bus.subscribe()
    }

    async fn set_cluster_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.metadata.lock().unwrap().push((key.to_string(), value.to_string()));
        Ok(())
    }

    async fn get_cluster_metadata(&self, _key: &str) -> Result<String> {
        Err(Error::NotSupported("get_cluster_metadata"))
    }

    async fn run(&self) -> Result<()> {
        self.ran.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clean_up(&self) -> Result<()> {
        self.cleaned.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out stub backends, recording what was asked for.
struct StubFactory {
    created: Mutex<Vec<BackendKind>>,
    backends: Mutex<Vec<Arc<StubBackend>>>,
    fail: AtomicBool,
}

impl StubFactory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            created: Mutex::new(Vec::new()),
            backends: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    fn created(&self) -> Vec<BackendKind> {
        self.created.lock().unwrap().clone()
    }

    fn only_backend(&self) -> Arc<StubBackend> {
        let backends = self.backends.lock().unwrap();
        assert_eq!(backends.len(), 1, "expected exactly one constructed backend");
        backends[0].clone()
    }
}

#[async_trait]
impl BackendFactory for StubFactory {
    async fn create(
        &self,
        kind: BackendKind,
        _ctx: &ExperimentContext,
        metric_bus: MetricBus,
    ) -> Result<Arc<dyn TrainingService>> {
        self.created.lock().unwrap().push(kind);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::cluster("factory offline"));
        }
        let backend = Arc::new(StubBackend::new(metric_bus));
        self.backends.lock().unwrap().push(backend.clone());
        Ok(backend)
    }
}

#[tokio::test]
async fn queries_fail_fast_until_a_platform_config_arrives() {
    let factory = StubFactory::new();
    let router = RouterTrainingService::new(test_context(), factory.clone());

    assert!(!router.is_assigned().await);
    assert!(matches!(router.list_trial_jobs().await.unwrap_err(), Error::NotAssigned));
    assert!(matches!(
        router.get_trial_job(&TrialId::from("abc12345")).await.unwrap_err(),
        Error::NotAssigned
    ));
    assert!(matches!(
        router.submit_trial_job(TrialForm::new(0, "{}")).await.unwrap_err(),
        Error::NotAssigned
    ));
    assert!(matches!(
        router.update_trial_job(&TrialId::from("abc12345"), TrialForm::new(0, "{}"))
            .await
            .unwrap_err(),
        Error::NotAssigned
    ));
    assert!(matches!(
        router.cancel_trial_job(&TrialId::from("abc12345"), false).await.unwrap_err(),
        Error::NotAssigned
    ));
    assert!(matches!(
        router.get_cluster_metadata("trial_config").await.unwrap_err(),
        Error::NotAssigned
    ));
    assert!(matches!(router.clean_up().await.unwrap_err(), Error::NotAssigned));
    // non-platform metadata does not bind anything either
    assert!(matches!(
        router.set_cluster_metadata("trial_config", "{}").await.unwrap_err(),
        Error::NotAssigned
    ));
    assert!(factory.created().is_empty());
}

#[tokio::test]
async fn platform_list_binds_the_dispatcher_once() {
    let factory = StubFactory::new();
    let router = RouterTrainingService::new(test_context(), factory.clone());

    router.set_cluster_metadata("platform_list", "local").await.unwrap();
    assert!(router.is_assigned().await);
    assert_eq!(factory.created(), vec![BackendKind::Dispatcher]);

    let backend = factory.only_backend();
    assert_eq!(backend.metadata(), vec![("platform_list".to_string(), "local".to_string())]);

    // later metadata and contract calls pass straight through
    router.set_cluster_metadata("trial_config", "{}").await.unwrap();
    assert_eq!(backend.metadata().last().unwrap().0, "trial_config");
    router.submit_trial_job(TrialForm::new(0, "{}")).await.unwrap();
    assert_eq!(backend.submitted.load(Ordering::SeqCst), 1);

    // a second platform key never rebinds
    router.set_cluster_metadata("batch_config", "{}").await.unwrap();
    assert_eq!(factory.created(), vec![BackendKind::Dispatcher]);
    assert_eq!(backend.metadata().last().unwrap().0, "batch_config");

    router.clean_up().await.unwrap();
    assert_eq!(backend.cleaned.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reuse_flag_routes_a_single_platform_config_to_the_dispatcher() {
    let factory = StubFactory::new();
    let router = RouterTrainingService::new(test_context(), factory.clone());

    router
        .set_cluster_metadata("remote_config", r#"{"reuse": true, "machines": []}"#)
        .await
        .unwrap();
    assert_eq!(factory.created(), vec![BackendKind::Dispatcher]);

    // the dispatcher learns its platform before it sees the config
    let backend = factory.only_backend();
    let metadata = backend.metadata();
    assert_eq!(metadata[0], ("platform_list".to_string(), "remote".to_string()));
    assert_eq!(metadata[1].0, "remote_config");
}

#[tokio::test]
async fn plain_platform_configs_bind_their_backend() {
    let cases = [
        ("local_config", "{}", BackendKind::Local),
        ("local_config", r#"{"reuse": false}"#, BackendKind::Local),
        ("remote_config", r#"{"machines": []}"#, BackendKind::Remote),
        ("kubeflow_config", "{}", BackendKind::Kubeflow),
        ("framework_controller_config", "{}", BackendKind::FrameworkController),
        ("batch_config", "{}", BackendKind::Batch),
    ];
    for (key, value, expected) in cases {
        let factory = StubFactory::new();
        let router = RouterTrainingService::new(test_context(), factory.clone());
        router.set_cluster_metadata(key, value).await.unwrap();
        assert_eq!(factory.created(), vec![expected], "wrong backend for {key}");
    }
}

#[tokio::test]
async fn run_waits_for_the_binding_then_delegates() {
    let factory = StubFactory::new();
    let router = Arc::new(
        RouterTrainingService::new(test_context(), factory.clone())
            .with_resolve_interval(Duration::from_millis(20)),
    );

    let handle = {
        let router = router.clone();
        tokio::spawn(async move { router.run().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_finished(), "run must keep waiting while unassigned");

    router.set_cluster_metadata("local_config", "{}").await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(factory.only_backend().ran.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn metric_subscriptions_survive_the_binding() {
    let factory = StubFactory::new();
    let router = RouterTrainingService::new(test_context(), factory.clone());

    let mut listener = router.subscribe_metrics();
    router.set_cluster_metadata("local_config", "{}").await.unwrap();

    // the bound backend publishes into the bus the factory was handed
    let backend = factory.only_backend();
    backend
        .metric_bus
        .publish(TrialMetric::new(TrialId::from("abc12345"), r#"{"default": 0.5}"#));

    let metric = listener.recv().await.unwrap();
    assert_eq!(metric.trial_id.as_str(), "abc12345");
    assert_eq!(metric.data, r#"{"default": 0.5}"#);
}

#[tokio::test]
async fn failed_construction_leaves_the_router_unassigned() {
    let factory = StubFactory::new();
    let router = RouterTrainingService::new(test_context(), factory.clone());

    factory.fail.store(true, Ordering::SeqCst);
    let err = router.set_cluster_metadata("local_config", "{}").await.unwrap_err();
    assert!(matches!(err, Error::Cluster(_)));
    assert!(!router.is_assigned().await);
    assert!(matches!(router.list_trial_jobs().await.unwrap_err(), Error::NotAssigned));

    factory.fail.store(false, Ordering::SeqCst);
    router.set_cluster_metadata("local_config", "{}").await.unwrap();
    assert!(router.is_assigned().await);
}
