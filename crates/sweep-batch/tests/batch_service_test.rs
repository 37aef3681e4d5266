//! End-to-end tests against a stub batch cluster.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::Value;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sweep_batch::{BatchTrainingService, TokenKeeper};
use sweep_core::{
    Error, ExperimentContext, MetricBus, TrainingService, TrialForm, TrialStatus,
};
use sweep_storage::MountedStorage;
use tokio::time::Instant;

#[derive(Default)]
struct StubCluster {
    token_calls: AtomicUsize,
    hang_token: AtomicBool,
    submit_failures: AtomicUsize,
    attempts: Mutex<Vec<String>>,
    accepted: Mutex<Vec<String>>,
    stops: Mutex<Vec<String>>,
    job_states: Mutex<HashMap<String, String>>,
}

impl StubCluster {
    fn set_job_state(&self, name: &str, state: &str) {
        self.job_states.lock().unwrap().insert(name.to_string(), state.to_string());
    }

    fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }

    fn accepted(&self) -> Vec<String> {
        self.accepted.lock().unwrap().clone()
    }

    fn stops(&self) -> Vec<String> {
        self.stops.lock().unwrap().clone()
    }
}

async fn token_route(State(stub): State<Arc<StubCluster>>) -> Json<Value> {
    if stub.hang_token.load(Ordering::SeqCst) {
        std::future::pending::<()>().await;
    }
    let n = stub.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
    Json(serde_json::json!({ "token": format!("tok-{n}") }))
}

async fn submit_route(
    State(stub): State<Arc<StubCluster>>,
    Json(spec): Json<Value>,
) -> StatusCode {
    let name = spec["jobName"].as_str().unwrap_or_default().to_string();
    stub.attempts.lock().unwrap().push(name.clone());
    if stub.submit_failures.load(Ordering::SeqCst) > 0 {
        stub.submit_failures.fetch_sub(1, Ordering::SeqCst);
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    stub.set_job_state(&name, "WAITING");
    stub.accepted.lock().unwrap().push(name);
    StatusCode::ACCEPTED
}

async fn info_route(
    State(stub): State<Arc<StubCluster>>,
    Path((_user, name)): Path<(String, String)>,
) -> Result<Json<Value>, StatusCode> {
    let states = stub.job_states.lock().unwrap();
    match states.get(&name) {
        Some(state) => Ok(Json(serde_json::json!({ "state": state }))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn stop_route(
    State(stub): State<Arc<StubCluster>>,
    Path((_user, name)): Path<(String, String)>,
) -> StatusCode {
    stub.stops.lock().unwrap().push(name.clone());
    stub.set_job_state(&name, "STOPPED");
    StatusCode::OK
}

async fn serve_stub(stub: Arc<StubCluster>) -> SocketAddr {
    let app = Router::new()
        .route("/api/v1/token", post(token_route))
        .route("/api/v1/users/:user/jobs", post(submit_route))
        .route("/api/v1/users/:user/jobs/:name", get(info_route))
        .route("/api/v1/users/:user/jobs/:name/execution-type", put(stop_route))
        .with_state(stub);
    let listener = tokio::net::TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn configure(service: &BatchTrainingService, addr: SocketAddr, auth: &str) {
    let cluster =
        format!(r#"{{"host": "{addr}", "user_name": "ada", "auth": {auth}, "https": false}}"#);
    service.set_cluster_metadata("batch_config", &cluster).await.unwrap();
    service
        .set_cluster_metadata(
            "trial_config",
            r#"{"command": "python3 train.py", "image": "trainer:latest"}"#,
        )
        .await
        .unwrap();
    service.set_cluster_metadata("manager_ip", r#"{"ip": "127.0.0.1"}"#).await.unwrap();
}

const TOKEN_AUTH: &str = r#"{"method": "token", "token": "tok-static"}"#;
const PASSWORD_AUTH: &str = r#"{"method": "password", "password": "hunter2"}"#;

fn test_context() -> ExperimentContext {
    ExperimentContext::new("exp1", std::env::temp_dir().join("sweep-batch-test"), "0.1.0")
}

#[tokio::test]
async fn cached_token_is_reused_within_age_gate() {
    let stub = Arc::new(StubCluster::default());
    let addr = serve_stub(stub.clone()).await;

    let keeper = TokenKeeper::new(
        reqwest::Client::new(),
        format!("http://{addr}"),
        "ada",
        "hunter2",
    );
    assert_eq!(keeper.token().await.unwrap(), "tok-1");
    assert_eq!(keeper.token().await.unwrap(), "tok-1");
    assert_eq!(stub.token_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn hung_refresh_falls_back_to_stale_token() {
    let stub = Arc::new(StubCluster::default());
    let addr = serve_stub(stub.clone()).await;

    let keeper = TokenKeeper::new(
        reqwest::Client::new(),
        format!("http://{addr}"),
        "ada",
        "hunter2",
    )
    .with_max_age(Duration::ZERO)
    .with_refresh_timeout(Duration::from_millis(200));

    assert_eq!(keeper.token().await.unwrap(), "tok-1");

    // every later refresh hangs; the expired token is still usable
    stub.hang_token.store(true, Ordering::SeqCst);
    assert_eq!(keeper.token().await.unwrap(), "tok-1");
}

#[tokio::test]
async fn hung_refresh_without_prior_token_is_fatal() {
    let stub = Arc::new(StubCluster::default());
    stub.hang_token.store(true, Ordering::SeqCst);
    let addr = serve_stub(stub.clone()).await;

    let keeper = TokenKeeper::new(
        reqwest::Client::new(),
        format!("http://{addr}"),
        "ada",
        "hunter2",
    )
    .with_refresh_timeout(Duration::from_millis(100));

    assert!(matches!(keeper.token().await, Err(Error::TokenTimeout)));
}

#[tokio::test]
async fn token_timeout_stops_the_run_loop() {
    let stub = Arc::new(StubCluster::default());
    stub.hang_token.store(true, Ordering::SeqCst);
    let addr = serve_stub(stub.clone()).await;

    let service = Arc::new(
        BatchTrainingService::new(test_context(), MetricBus::new())
            .with_drain_interval(Duration::from_millis(10))
            .with_token_refresh_timeout(Duration::from_millis(100)),
    );
    configure(&service, addr, PASSWORD_AUTH).await;
    service.submit_trial_job(TrialForm::new(0, r#"{"lr": 0.1}"#)).await.unwrap();

    let runner = {
        let service = service.clone();
        tokio::spawn(async move { service.run().await })
    };
    let outcome = tokio::time::timeout(Duration::from_secs(5), runner).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(Error::TokenTimeout)));
}

#[tokio::test]
async fn rejected_head_blocks_the_queue_then_drains_in_order() {
    let stub = Arc::new(StubCluster::default());
    stub.submit_failures.store(2, Ordering::SeqCst);
    let addr = serve_stub(stub.clone()).await;

    let service = Arc::new(
        BatchTrainingService::new(test_context(), MetricBus::new())
            .with_drain_interval(Duration::from_millis(10))
            .with_poll_interval(Duration::from_secs(60)),
    );
    configure(&service, addr, TOKEN_AUTH).await;

    let first = service.submit_trial_job(TrialForm::new(0, r#"{"lr": 0.1}"#)).await.unwrap();
    let second = service.submit_trial_job(TrialForm::new(1, r#"{"lr": 0.2}"#)).await.unwrap();
    assert_eq!(service.queued_trials().await, 2);
    assert!(first.job_name.is_none());

    let runner = {
        let service = service.clone();
        tokio::spawn(async move { service.run().await })
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    while service.queued_trials().await > 0 {
        assert!(Instant::now() < deadline, "queue never drained");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let first_name = sweep_batch::batch_job_name("exp1", &first.id);
    let second_name = sweep_batch::batch_job_name("exp1", &second.id);
    // the rejected head was retried in place, never leapfrogged
    assert_eq!(
        stub.attempts(),
        vec![first_name.clone(), first_name.clone(), first_name.clone(), second_name.clone()]
    );
    assert_eq!(stub.accepted(), vec![first_name.clone(), second_name.clone()]);
    assert_eq!(
        service.get_trial_job(&first.id).await.unwrap().job_name,
        Some(first_name)
    );

    service.clean_up().await.unwrap();
    assert!(runner.await.unwrap().is_ok());
    assert_eq!(
        service.get_trial_job(&second.id).await.unwrap().status,
        TrialStatus::SysCanceled
    );
}

#[tokio::test]
async fn unsubmitted_trials_cancel_locally() {
    let stub = Arc::new(StubCluster::default());
    let addr = serve_stub(stub.clone()).await;

    let service = BatchTrainingService::new(test_context(), MetricBus::new());
    configure(&service, addr, TOKEN_AUTH).await;

    let queued = service.submit_trial_job(TrialForm::new(0, "{}")).await.unwrap();
    let early = service.submit_trial_job(TrialForm::new(1, "{}")).await.unwrap();
    assert_eq!(service.queued_trials().await, 2);

    service.cancel_trial_job(&queued.id, false).await.unwrap();
    service.cancel_trial_job(&early.id, true).await.unwrap();

    assert_eq!(
        service.get_trial_job(&queued.id).await.unwrap().status,
        TrialStatus::UserCanceled
    );
    assert_eq!(
        service.get_trial_job(&early.id).await.unwrap().status,
        TrialStatus::EarlyStopped
    );
    assert_eq!(service.queued_trials().await, 0);
    // the cluster never heard about either trial
    assert!(stub.attempts().is_empty());
    assert!(stub.stops().is_empty());

    // canceling a settled trial is a no-op
    service.cancel_trial_job(&queued.id, true).await.unwrap();
    assert_eq!(
        service.get_trial_job(&queued.id).await.unwrap().status,
        TrialStatus::UserCanceled
    );
}

#[tokio::test]
async fn remote_stop_is_observed_as_sys_canceled() {
    let stub = Arc::new(StubCluster::default());
    let addr = serve_stub(stub.clone()).await;

    let service = Arc::new(
        BatchTrainingService::new(test_context(), MetricBus::new())
            .with_drain_interval(Duration::from_millis(10))
            .with_poll_interval(Duration::from_millis(20)),
    );
    configure(&service, addr, TOKEN_AUTH).await;
    let trial = service.submit_trial_job(TrialForm::new(0, "{}")).await.unwrap();

    let runner = {
        let service = service.clone();
        tokio::spawn(async move { service.run().await })
    };

    let job_name = sweep_batch::batch_job_name("exp1", &trial.id);
    let deadline = Instant::now() + Duration::from_secs(5);
    while !stub.accepted().contains(&job_name) {
        assert!(Instant::now() < deadline, "trial never submitted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    stub.set_job_state(&job_name, "STOPPED");

    while service.get_trial_job(&trial.id).await.unwrap().status != TrialStatus::SysCanceled {
        assert!(Instant::now() < deadline, "stop never observed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    service.clean_up().await.unwrap();
    assert!(runner.await.unwrap().is_ok());
    // already terminal, so cleanup had nothing left to stop
    assert!(stub.stops().is_empty());
}

#[tokio::test]
async fn update_appends_a_parameter_file_and_registers_it() {
    let stub = Arc::new(StubCluster::default());
    let addr = serve_stub(stub.clone()).await;
    let dir = tempfile::tempdir().unwrap();

    let service = BatchTrainingService::new(test_context(), MetricBus::new())
        .with_storage(Arc::new(MountedStorage::new(dir.path())));
    configure(&service, addr, TOKEN_AUTH).await;

    let trial = service.submit_trial_job(TrialForm::new(0, r#"{"lr": 0.1}"#)).await.unwrap();
    let updated = service
        .update_trial_job(
            &trial.id,
            TrialForm::new(1, r#"{"lr": 0.01}"#).with_parameter_index(1),
        )
        .await
        .unwrap();
    assert_eq!(updated.form.sequence_id, 1);
    assert_eq!(updated.form.parameter_index, 1);

    let file = dir
        .path()
        .join("exp1")
        .join("trials")
        .join(trial.id.as_str())
        .join("parameter_1.cfg");
    let written = std::fs::read_to_string(file).unwrap();
    assert_eq!(written, r#"{"lr": 0.01}"#);

    service.clean_up().await.unwrap();
}

#[tokio::test]
async fn update_without_storage_is_not_supported() {
    let stub = Arc::new(StubCluster::default());
    let addr = serve_stub(stub.clone()).await;

    let service = BatchTrainingService::new(test_context(), MetricBus::new());
    configure(&service, addr, TOKEN_AUTH).await;
    let trial = service.submit_trial_job(TrialForm::new(0, "{}")).await.unwrap();

    let err = service.update_trial_job(&trial.id, TrialForm::new(1, "{}")).await.unwrap_err();
    assert!(matches!(err, Error::NotSupported(_)));
}

#[tokio::test]
async fn submit_requires_cluster_and_trial_config() {
    let service = BatchTrainingService::new(test_context(), MetricBus::new());
    let err = service.submit_trial_job(TrialForm::new(0, "{}")).await.unwrap_err();
    assert!(matches!(err, Error::MissingMetadata("batch_config")));
}
