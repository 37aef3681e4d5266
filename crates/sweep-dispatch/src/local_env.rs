//! Environments as directories and process slots on the local host.

use crate::environment::{
    Environment, EnvironmentId, EnvironmentService, EnvironmentStatus, TrialLaunch,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use sweep_core::{Error, ExperimentContext, Result, TrialId};
use sweep_exec::script::{render_exec_script, ExecScriptParams, PARAMETER_FILE_NAME, RUN_SCRIPT_NAME};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

struct Slot {
    dir: PathBuf,
    /// The trial currently executing in this slot, if any.
    current: Option<(TrialId, Child)>,
    /// Exit codes of trials that already finished here.
    exited: HashMap<TrialId, i32>,
}

/// Starts reusable process slots under `<experiment_root>/environments`.
pub struct LocalEnvironmentService {
    ctx: ExperimentContext,
    /// Upper bound on concurrently alive environments; `None` is unbounded.
    cap: Option<usize>,
    counter: AtomicUsize,
    slots: Mutex<HashMap<EnvironmentId, Slot>>,
}

impl LocalEnvironmentService {
    #[must_use]
    pub fn new(ctx: ExperimentContext) -> Self {
        Self { ctx, cap: None, counter: AtomicUsize::new(0), slots: Mutex::new(HashMap::new()) }
    }

    #[must_use]
    pub fn with_max_environments(mut self, cap: usize) -> Self {
        self.cap = Some(cap);
        self
    }
}

#[async_trait]
impl EnvironmentService for LocalEnvironmentService {
    fn platform(&self) -> &'static str {
        "local"
    }

    async fn has_more_environments(&self) -> bool {
        let slots = self.slots.lock().await;
        self.cap.is_none_or(|cap| slots.len() < cap)
    }

    async fn start_environment(&self) -> Result<Environment> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = EnvironmentId(format!("local-env-{n}"));
        let dir = self.ctx.experiment_root.join("environments").join(id.as_str());
        tokio::fs::create_dir_all(&dir).await?;

        let mut slots = self.slots.lock().await;
        slots.insert(id.clone(), Slot { dir: dir.clone(), current: None, exited: HashMap::new() });

        let mut env = Environment::new(id.clone(), id.as_str(), self.platform());
        // a directory slot is usable the moment it exists
        env.status = EnvironmentStatus::Running;
        env.tracking_url = Some(format!("file://{}", dir.display()));
        debug!(environment = %id, "local environment started");
        Ok(env)
    }

    async fn stop_environment(&self, id: &EnvironmentId) -> Result<()> {
        let mut slots = self.slots.lock().await;
        if let Some(mut slot) = slots.remove(id) {
            if let Some((trial_id, child)) = slot.current.as_mut() {
                if let Err(err) = child.kill().await {
                    warn!(environment = %id, trial_id = %trial_id, error = %err, "killing slot process failed");
                }
            }
        }
        debug!(environment = %id, "local environment stopped");
        Ok(())
    }

    async fn refresh_environments(&self, environments: &mut [Environment]) -> Result<()> {
        let slots = self.slots.lock().await;
        for env in environments {
            env.status = if slots.contains_key(&env.id) {
                EnvironmentStatus::Running
            } else {
                EnvironmentStatus::Stopped
            };
        }
        Ok(())
    }

    async fn launch_trial(&self, env: &EnvironmentId, launch: &TrialLaunch<'_>) -> Result<()> {
        let mut slots = self.slots.lock().await;
        let slot = slots
            .get_mut(env)
            .ok_or_else(|| Error::cluster(format!("environment {env} is gone")))?;
        if slot.current.is_some() {
            return Err(Error::cluster(format!("environment {env} is busy")));
        }

        let trial_dir = slot.dir.join("trials").join(launch.trial_id.as_str());
        tokio::fs::create_dir_all(&trial_dir).await?;
        tokio::fs::write(trial_dir.join(PARAMETER_FILE_NAME), &launch.form.hyper_parameters)
            .await?;
        let script = render_exec_script(&ExecScriptParams {
            platform: self.platform(),
            experiment_id: launch.experiment_id,
            trial_id: launch.trial_id.as_str(),
            sequence_id: launch.form.sequence_id,
            trial_dir: &trial_dir.display().to_string(),
            code_dir: launch.code_dir,
            command: launch.command,
            manager: launch.manager,
            version: launch.version,
            log_collection: launch.log_collection,
            cuda_devices: "",
            record_pid: false,
        });
        let script_path = trial_dir.join(RUN_SCRIPT_NAME);
        tokio::fs::write(&script_path, script).await?;

        let child = Command::new("sh")
            .arg(&script_path)
            .current_dir(&trial_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        slot.current = Some((launch.trial_id.clone(), child));
        debug!(environment = %env, trial_id = %launch.trial_id, "trial launched in slot");
        Ok(())
    }

    async fn check_trial(&self, env: &EnvironmentId, id: &TrialId) -> Result<Option<i32>> {
        let mut slots = self.slots.lock().await;
        let slot = slots
            .get_mut(env)
            .ok_or_else(|| Error::cluster(format!("environment {env} is gone")))?;
        if let Some(code) = slot.exited.get(id) {
            return Ok(Some(*code));
        }
        let Some((current_id, child)) = slot.current.as_mut() else { return Ok(None) };
        if current_id != id {
            return Ok(None);
        }
        match child.try_wait()? {
            Some(status) => {
                let code = status.code().unwrap_or(-1);
                slot.exited.insert(id.clone(), code);
                slot.current = None;
                Ok(Some(code))
            }
            None => Ok(None),
        }
    }

    async fn kill_trial(&self, env: &EnvironmentId, id: &TrialId) -> Result<()> {
        let mut slots = self.slots.lock().await;
        let Some(slot) = slots.get_mut(env) else { return Ok(()) };
        if let Some((current_id, child)) = slot.current.as_mut() {
            if current_id == id {
                if let Err(err) = child.kill().await {
                    warn!(environment = %env, trial_id = %id, error = %err, "killing trial failed");
                }
                slot.current = None;
            }
        }
        Ok(())
    }
}
