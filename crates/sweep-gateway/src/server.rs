//! HTTP endpoint trial processes report back to.
//!
//! Every backend that launches trials on a cluster runs one
//! [`CallbackServer`]: trials POST hyperparameter-file descriptors and
//! metric records to it, and the experiment manager reads descriptors back.
//! A serve-side fault does not crash the owning backend directly; it is
//! recorded and surfaced through [`CallbackServer::take_error`] so the
//! backend's run loop can escalate it to a fatal error on its next tick.

use crate::error::{GatewayError, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use sweep_core::{MetricBus, TrialId, TrialMetric};

/// Descriptor of one hyperparameter file a trial has picked up, kept in
/// submission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterFileMeta {
    pub trial_id: String,
    pub file_path: String,
    pub sequence_id: u64,
}

/// Body of a metrics report. One call may carry several records; each is
/// forwarded separately.
#[derive(Debug, Deserialize)]
struct MetricsBody {
    metrics: Vec<serde_json::Value>,
}

#[derive(Clone)]
struct GatewayState {
    metric_bus: MetricBus,
    parameter_files: Arc<RwLock<Vec<ParameterFileMeta>>>,
}

/// The callback REST server. Cheap to clone; all clones share one
/// underlying server.
#[derive(Clone)]
pub struct CallbackServer {
    state: GatewayState,
    cancel: CancellationToken,
    bound_addr: Arc<Mutex<Option<SocketAddr>>>,
    fault: Arc<Mutex<Option<String>>>,
}

impl CallbackServer {
    /// Builds a server that publishes incoming metrics on `metric_bus`.
    #[must_use]
    pub fn new(metric_bus: MetricBus) -> Self {
        Self {
            state: GatewayState { metric_bus, parameter_files: Arc::new(RwLock::new(Vec::new())) },
            cancel: CancellationToken::new(),
            bound_addr: Arc::new(Mutex::new(None)),
            fault: Arc::new(Mutex::new(None)),
        }
    }

    /// Binds `addr` (port 0 picks an ephemeral port) and serves on a
    /// spawned task until [`stop`] is called.
    ///
    /// [`stop`]: CallbackServer::stop
    pub async fn start(&self, addr: SocketAddr) -> Result<SocketAddr> {
        {
            let bound = self.bound_addr.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if bound.is_some() {
                return Err(GatewayError::AlreadyRunning);
            }
        }

        let app = Router::new()
            .route("/parameter-file-meta", post(post_parameter_file).get(get_parameter_files))
            .route("/metrics/:trial_id", post(post_metrics))
            .route("/health", get(health))
            .with_state(self.state.clone());

        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.record_fault(format!("bind {addr} failed: {source}"));
                return Err(GatewayError::Bind { addr, source });
            }
        };
        let local_addr = listener.local_addr().map_err(|source| {
            self.record_fault(format!("bind {addr} failed: {source}"));
            GatewayError::Bind { addr, source }
        })?;
        *self.bound_addr.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
            Some(local_addr);
        info!(addr = %local_addr, "callback server listening");

        let observer = self.cancel.child_token();
        let fault = Arc::clone(&self.fault);
        tokio::spawn(async move {
            if let Err(err) =
                axum::serve(listener, app).with_graceful_shutdown(observer.cancelled_owned()).await
            {
                error!(error = %err, "callback server stopped unexpectedly");
                *fault.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
                    Some(err.to_string());
            }
        });

        Ok(local_addr)
    }

    /// Like [`start`], but a server that is already running is fine:
    /// callers get the existing bound address back.
    ///
    /// [`start`]: CallbackServer::start
    pub async fn ensure_started(&self, addr: SocketAddr) -> Result<SocketAddr> {
        if let Some(bound) = self.local_addr() {
            return Ok(bound);
        }
        match self.start(addr).await {
            Ok(bound) => Ok(bound),
            Err(GatewayError::AlreadyRunning) => {
                self.local_addr().ok_or(GatewayError::AlreadyRunning)
            }
            Err(err) => Err(err),
        }
    }

    /// Stops serving. Safe to call repeatedly or before `start`.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Address the server actually bound, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Returns a recorded serve-side fault, if any. Run loops poll this and
    /// treat `Some` as fatal.
    #[must_use]
    pub fn take_error(&self) -> Option<String> {
        self.fault.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take()
    }

    /// Descriptors received so far, in submission order.
    pub async fn parameter_files(&self) -> Vec<ParameterFileMeta> {
        self.state.parameter_files.read().await.clone()
    }

    fn record_fault(&self, fault: String) {
        *self.fault.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(fault);
    }
}

async fn post_parameter_file(
    State(state): State<GatewayState>,
    Json(meta): Json<ParameterFileMeta>,
) -> StatusCode {
    debug!(trial_id = %meta.trial_id, file = %meta.file_path, "parameter file registered");
    state.parameter_files.write().await.push(meta);
    StatusCode::OK
}

async fn get_parameter_files(State(state): State<GatewayState>) -> Json<Vec<ParameterFileMeta>> {
    Json(state.parameter_files.read().await.clone())
}

async fn post_metrics(
    State(state): State<GatewayState>,
    Path(trial_id): Path<String>,
    Json(body): Json<MetricsBody>,
) -> StatusCode {
    for record in body.metrics {
        let data = match record {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        state.metric_bus.publish(TrialMetric::new(TrialId::from(trial_id.as_str()), data));
    }
    StatusCode::OK
}

async fn health() -> StatusCode {
    StatusCode::OK
}
