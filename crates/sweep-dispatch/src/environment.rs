//! Reusable execution environments and the service that provides them.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use sweep_core::{ManagerEndpoint, Result, TrialForm, TrialId};

/// Identity of one execution environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvironmentId(pub String);

impl EnvironmentId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EnvironmentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle of one environment, independent of the trials inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentStatus {
    Waiting,
    Running,
    Succeeded,
    Failed,
    Stopped,
    Unknown,
}

impl EnvironmentStatus {
    /// Whether the environment can still accept or host trials.
    #[must_use]
    pub fn is_alive(self) -> bool {
        matches!(self, Self::Waiting | Self::Running)
    }
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Waiting => "WAITING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// One slot trials can be dispatched into.
#[derive(Debug, Clone)]
pub struct Environment {
    pub id: EnvironmentId,
    pub name: String,
    /// Platform of the service that started this environment.
    pub platform: String,
    pub status: EnvironmentStatus,
    /// Trials currently executing inside the environment.
    pub running_trial_count: usize,
    /// Trials ever dispatched into the environment.
    pub assigned_trial_count: usize,
    pub tracking_url: Option<String>,
}

impl Environment {
    #[must_use]
    pub fn new(id: EnvironmentId, name: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            platform: platform.into(),
            status: EnvironmentStatus::Waiting,
            running_trial_count: 0,
            assigned_trial_count: 0,
            tracking_url: None,
        }
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.status.is_alive()
    }

    /// Alive and not currently hosting a trial.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.status == EnvironmentStatus::Running && self.running_trial_count == 0
    }
}

/// Everything a service needs to start one trial inside an environment.
#[derive(Debug)]
pub struct TrialLaunch<'a> {
    pub trial_id: &'a TrialId,
    pub form: &'a TrialForm,
    pub experiment_id: &'a str,
    pub command: &'a str,
    pub code_dir: &'a str,
    pub manager: &'a ManagerEndpoint,
    /// Empty string disables the trial-side version check.
    pub version: &'a str,
    pub log_collection: &'a str,
}

/// Provider of execution environments for one platform.
///
/// The dispatcher owns all trial bookkeeping; a service only starts, stops
/// and inspects environments and the processes inside them.
#[async_trait]
pub trait EnvironmentService: Send + Sync {
    fn platform(&self) -> &'static str;

    /// Suggested cadence for the dispatcher's management loop.
    fn poll_interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    /// Whether another environment can still be started.
    async fn has_more_environments(&self) -> bool;

    async fn start_environment(&self) -> Result<Environment>;

    async fn stop_environment(&self, id: &EnvironmentId) -> Result<()>;

    /// Re-reads substrate state for the given environments, updating their
    /// statuses in place.
    async fn refresh_environments(&self, environments: &mut [Environment]) -> Result<()>;

    async fn launch_trial(&self, env: &EnvironmentId, launch: &TrialLaunch<'_>) -> Result<()>;

    /// Exit code of the trial if it finished, `None` while it still runs.
    async fn check_trial(&self, env: &EnvironmentId, id: &TrialId) -> Result<Option<i32>>;

    async fn kill_trial(&self, env: &EnvironmentId, id: &TrialId) -> Result<()>;
}
