//! The training-service contract every backend implements.

use crate::error::Result;
use crate::metrics::TrialMetric;
use crate::trial::{TrialForm, TrialId, TrialJob};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// One pluggable execution backend for trial jobs.
///
/// Implementations are driven concurrently: the manager submits and cancels
/// trials while `run` loops in its own task, so every method takes `&self`
/// and interior state is shared behind async locks. Operations a backend
/// genuinely cannot provide return [`Error::NotSupported`].
///
/// [`Error::NotSupported`]: crate::Error::NotSupported
#[async_trait]
pub trait TrainingService: Send + Sync {
    /// Snapshot of every trial this backend has accepted, any status.
    async fn list_trial_jobs(&self) -> Result<Vec<TrialJob>>;

    /// Current view of one trial.
    ///
    /// # Errors
    /// [`Error::TrialNotFound`] for ids this backend never accepted.
    ///
    /// [`Error::TrialNotFound`]: crate::Error::TrialNotFound
    async fn get_trial_job(&self, id: &TrialId) -> Result<TrialJob>;

    /// Accepts a new trial and returns it immediately in a non-terminal
    /// status. Provisioning, staging and cluster submission happen on
    /// background loops after this returns.
    async fn submit_trial_job(&self, form: TrialForm) -> Result<TrialJob>;

    /// Delivers an additional hyperparameter payload to a running trial
    /// (multi-phase). Backends without a delivery channel return
    /// `NotSupported`.
    async fn update_trial_job(&self, id: &TrialId, form: TrialForm) -> Result<TrialJob>;

    /// Requests cancellation. `early_stopped` distinguishes an algorithmic
    /// early stop from a user abort in the final status.
    async fn cancel_trial_job(&self, id: &TrialId, early_stopped: bool) -> Result<()>;

    /// Attaches a metric listener. Dropping the receiver detaches it.
    fn subscribe_metrics(&self) -> broadcast::Receiver<TrialMetric>;

    /// Applies one piece of cluster configuration. `value` is a JSON
    /// document; unknown keys are ignored with a log line, malformed values
    /// for known keys are a fatal configuration error.
    async fn set_cluster_metadata(&self, key: &str, value: &str) -> Result<()>;

    /// Reads back cluster configuration. No backend currently supports
    /// this; it exists so the contract stays symmetric with
    /// `set_cluster_metadata`.
    async fn get_cluster_metadata(&self, key: &str) -> Result<String>;

    /// Long-lived service loop: starts auxiliary servers, polls the
    /// substrate, keeps trial statuses fresh. Resolves only on fatal error
    /// or after `clean_up`.
    async fn run(&self) -> Result<()>;

    /// Tears the backend down: best-effort cancel of non-terminal trials
    /// (per-trial failures are logged, not returned), release of cluster
    /// resources, shutdown of auxiliary servers. Idempotent.
    async fn clean_up(&self) -> Result<()>;
}
