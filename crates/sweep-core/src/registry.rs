//! Shared trial registry embedded by every backend.
//!
//! The original design spread a job map across a deep inheritance tree; here
//! each backend holds one `TrialRegistry` value instead. The map is guarded
//! by an async `RwLock` because status queries may arrive from any task
//! while a polling loop writes.

use crate::error::{Error, Result};
use crate::trial::{TrialId, TrialJob, TrialStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Map of trial id to trial job, cloneable by handle.
#[derive(Debug, Clone, Default)]
pub struct TrialRegistry {
    trials: Arc<RwLock<HashMap<TrialId, TrialJob>>>,
}

impl TrialRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a freshly submitted trial. A trial id maps to exactly one
    /// job for the life of the process; inserting twice is a logic error
    /// and the original entry wins.
    pub async fn insert(&self, job: TrialJob) {
        let mut trials = self.trials.write().await;
        trials.entry(job.id.clone()).or_insert(job);
    }

    pub async fn get(&self, id: &TrialId) -> Result<TrialJob> {
        let trials = self.trials.read().await;
        trials.get(id).cloned().ok_or_else(|| Error::TrialNotFound(id.to_string()))
    }

    pub async fn list(&self) -> Vec<TrialJob> {
        let trials = self.trials.read().await;
        trials.values().cloned().collect()
    }

    /// Runs `f` against the stored job, if present. Returns whether the
    /// trial existed.
    pub async fn update<F>(&self, id: &TrialId, f: F) -> bool
    where
        F: FnOnce(&mut TrialJob),
    {
        let mut trials = self.trials.write().await;
        match trials.get_mut(id) {
            Some(job) => {
                f(job);
                true
            }
            None => false,
        }
    }

    /// Applies a substrate-observed status through the terminal-status
    /// guard.
    pub async fn observe_status(&self, id: &TrialId, status: TrialStatus) {
        self.update(id, |job| {
            let before = job.status;
            job.observe_status(status);
            if job.status == before && before != status {
                debug!(trial_id = %job.id, kept = %before, observed = %status, "terminal status kept");
            }
        })
        .await;
    }

    /// Ids of every trial that has not reached a terminal status.
    pub async fn non_terminal_ids(&self) -> Vec<TrialId> {
        let trials = self.trials.read().await;
        trials.values().filter(|j| !j.is_terminal()).map(|j| j.id.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.trials.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.trials.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trial::TrialForm;

    fn waiting_job(id: &str) -> TrialJob {
        TrialJob::new(TrialId::from(id), TrialStatus::Waiting, TrialForm::new(0, "{}"))
    }

    #[tokio::test]
    async fn insert_and_get() {
        let registry = TrialRegistry::new();
        registry.insert(waiting_job("abc12345")).await;

        let job = registry.get(&TrialId::from("abc12345")).await.unwrap();
        assert_eq!(job.status, TrialStatus::Waiting);

        let missing = registry.get(&TrialId::from("zzz00000")).await;
        assert!(matches!(missing, Err(Error::TrialNotFound(_))));
    }

    #[tokio::test]
    async fn duplicate_insert_keeps_original() {
        let registry = TrialRegistry::new();
        registry.insert(waiting_job("abc12345")).await;

        let mut dup = waiting_job("abc12345");
        dup.message = Some("late duplicate".to_string());
        registry.insert(dup).await;

        let job = registry.get(&TrialId::from("abc12345")).await.unwrap();
        assert!(job.message.is_none());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn non_terminal_ids_excludes_finished() {
        let registry = TrialRegistry::new();
        registry.insert(waiting_job("aaaaaaaa")).await;
        registry.insert(waiting_job("bbbbbbbb")).await;
        registry.observe_status(&TrialId::from("aaaaaaaa"), TrialStatus::Succeeded).await;

        let open = registry.non_terminal_ids().await;
        assert_eq!(open, vec![TrialId::from("bbbbbbbb")]);
    }

    #[tokio::test]
    async fn observe_status_respects_terminal_guard() {
        let registry = TrialRegistry::new();
        registry.insert(waiting_job("aaaaaaaa")).await;
        let id = TrialId::from("aaaaaaaa");

        registry.observe_status(&id, TrialStatus::Failed).await;
        registry.observe_status(&id, TrialStatus::Running).await;

        assert_eq!(registry.get(&id).await.unwrap().status, TrialStatus::Failed);
    }
}
