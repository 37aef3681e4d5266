//! Per-experiment context, passed explicitly to every backend.

use crate::trial::TrialId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Identity and filesystem layout of the running experiment. One value is
/// built by the host process at startup and cloned into each backend; there
/// is no process-global state behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentContext {
    pub experiment_id: String,
    /// Root directory owned by this experiment; trial working directories
    /// are created underneath.
    pub experiment_root: PathBuf,
    /// Runtime version advertised to trials for the version check.
    pub version: String,
}

impl ExperimentContext {
    #[must_use]
    pub fn new(
        experiment_id: impl Into<String>,
        experiment_root: impl Into<PathBuf>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            experiment_root: experiment_root.into(),
            version: version.into(),
        }
    }

    /// Local working directory for one trial.
    #[must_use]
    pub fn trial_directory(&self, trial_id: &TrialId) -> PathBuf {
        self.experiment_root.join("trials").join(trial_id.as_str())
    }

    #[must_use]
    pub fn experiment_root(&self) -> &Path {
        &self.experiment_root
    }
}
