//! Trial-job model shared by every training service backend.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Length of generated trial ids. Short ids keep derived cluster job names
/// within label limits.
const TRIAL_ID_LEN: usize = 8;

/// Opaque identifier for one trial job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrialId(pub String);

impl TrialId {
    /// Generates a random lowercase alphanumeric id.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let id: String = (0..TRIAL_ID_LEN)
            .map(|_| {
                const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
                CHARSET[rng.gen_range(0..CHARSET.len())] as char
            })
            .collect();
        Self(id)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TrialId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TrialId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle status of a trial job.
///
/// `Waiting` and `Running` are the only non-terminal states a backend may
/// report after submission; everything else is terminal except `Unknown`,
/// which marks a trial whose substrate state could not be determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrialStatus {
    Waiting,
    Running,
    Succeeded,
    Failed,
    EarlyStopped,
    UserCanceled,
    SysCanceled,
    Unknown,
}

impl TrialStatus {
    /// Whether this status ends the trial's lifecycle. Terminal statuses
    /// must never be overwritten by non-terminal ones.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Waiting | Self::Running | Self::Unknown)
    }

    /// Terminal status recorded for a canceled trial. The flag only selects
    /// the label; cancellation mechanics are identical either way.
    #[must_use]
    pub fn canceled(early_stopped: bool) -> Self {
        if early_stopped { Self::EarlyStopped } else { Self::UserCanceled }
    }
}

impl std::fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Waiting => "WAITING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::EarlyStopped => "EARLY_STOPPED",
            Self::UserCanceled => "USER_CANCELED",
            Self::SysCanceled => "SYS_CANCELED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Hyperparameter assignment submitted with a trial.
///
/// The payload is kept as the serialized string handed over by the
/// experiment manager; backends write it verbatim into the trial's
/// parameter file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialForm {
    /// Position of this trial in the experiment's submission sequence.
    pub sequence_id: u64,
    /// Serialized hyperparameter payload.
    pub hyper_parameters: String,
    /// Delivery index for multi-phase parameter updates; 0 for the initial
    /// assignment.
    #[serde(default)]
    pub parameter_index: u64,
}

impl TrialForm {
    #[must_use]
    pub fn new(sequence_id: u64, hyper_parameters: impl Into<String>) -> Self {
        Self { sequence_id, hyper_parameters: hyper_parameters.into(), parameter_index: 0 }
    }

    #[must_use]
    pub fn with_parameter_index(mut self, index: u64) -> Self {
        self.parameter_index = index;
        self
    }
}

/// One scheduled execution of a search trial.
///
/// Owned exclusively by the backend that created it and kept in the
/// backend's registry for the life of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialJob {
    pub id: TrialId,
    pub status: TrialStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Working directory staged for the trial, if any.
    pub working_directory: Option<PathBuf>,
    /// Location of uploaded trial artifacts (mounted path or tracking URL).
    pub url: Option<String>,
    pub form: TrialForm,
    /// Backend-specific job name or label, e.g. the custom-resource name.
    pub job_name: Option<String>,
    /// Free-form placement or diagnostic note.
    pub message: Option<String>,
}

impl TrialJob {
    /// Creates a freshly submitted trial in the given status.
    #[must_use]
    pub fn new(id: TrialId, status: TrialStatus, form: TrialForm) -> Self {
        Self {
            id,
            status,
            submitted_at: Utc::now(),
            started_at: None,
            ended_at: None,
            working_directory: None,
            url: None,
            form,
            job_name: None,
            message: None,
        }
    }

    /// Applies a status observed from the substrate.
    ///
    /// Terminal statuses are sticky: once the trial is terminal, later
    /// non-terminal observations are ignored so status queries never
    /// regress. Start/end timestamps are stamped on the first transition
    /// into `Running` and into any terminal status respectively.
    pub fn observe_status(&mut self, status: TrialStatus) {
        if self.status.is_terminal() {
            return;
        }
        if status == TrialStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if status.is_terminal() && self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
        self.status = status;
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_short_and_lowercase() {
        for _ in 0..64 {
            let id = TrialId::generate();
            assert_eq!(id.as_str().len(), 8);
            assert!(id.as_str().chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TrialStatus::Waiting.is_terminal());
        assert!(!TrialStatus::Running.is_terminal());
        assert!(!TrialStatus::Unknown.is_terminal());
        assert!(TrialStatus::Succeeded.is_terminal());
        assert!(TrialStatus::Failed.is_terminal());
        assert!(TrialStatus::EarlyStopped.is_terminal());
        assert!(TrialStatus::UserCanceled.is_terminal());
        assert!(TrialStatus::SysCanceled.is_terminal());
    }

    #[test]
    fn cancel_status_follows_flag() {
        assert_eq!(TrialStatus::canceled(true), TrialStatus::EarlyStopped);
        assert_eq!(TrialStatus::canceled(false), TrialStatus::UserCanceled);
    }

    #[test]
    fn status_never_regresses_after_terminal() {
        let mut job =
            TrialJob::new(TrialId::generate(), TrialStatus::Waiting, TrialForm::new(0, "{}"));
        job.observe_status(TrialStatus::Running);
        assert!(job.started_at.is_some());

        job.observe_status(TrialStatus::Succeeded);
        let ended = job.ended_at;
        assert!(ended.is_some());

        job.observe_status(TrialStatus::Running);
        assert_eq!(job.status, TrialStatus::Succeeded);
        assert_eq!(job.ended_at, ended);
    }

    #[test]
    fn status_serializes_screaming_snake() {
        let s = serde_json::to_string(&TrialStatus::EarlyStopped).unwrap();
        assert_eq!(s, "\"EARLY_STOPPED\"");
        let back: TrialStatus = serde_json::from_str("\"USER_CANCELED\"").unwrap();
        assert_eq!(back, TrialStatus::UserCanceled);
    }
}
