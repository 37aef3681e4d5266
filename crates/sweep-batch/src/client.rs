//! REST client for the batch cluster's job API.

use crate::config::BatchTrialConfig;
use serde::Deserialize;
use serde_json::{json, Value};
use sweep_core::{Error, ManagerEndpoint, Result, TrialStatus};
use tracing::debug;

/// Remote view of one job.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchJobInfo {
    pub state: String,
}

/// Maps the cluster's job state onto the trial enum. `STOPPED` becomes a
/// system cancel; a user cancel that was stamped earlier is terminal and
/// wins regardless. Anything unrecognized is `Unknown`, never terminal.
#[must_use]
pub fn map_remote_state(state: &str) -> TrialStatus {
    match state {
        "WAITING" => TrialStatus::Waiting,
        "RUNNING" => TrialStatus::Running,
        "SUCCEEDED" => TrialStatus::Succeeded,
        "FAILED" => TrialStatus::Failed,
        "STOPPED" => TrialStatus::SysCanceled,
        _ => TrialStatus::Unknown,
    }
}

/// Inputs to the job spec for one trial.
#[derive(Debug)]
pub struct JobSpecParams<'a> {
    pub job_name: &'a str,
    pub experiment_id: &'a str,
    pub trial_id: &'a str,
    pub sequence_id: u64,
    pub hyper_parameters: &'a str,
    pub trial: &'a BatchTrialConfig,
    pub manager: &'a ManagerEndpoint,
    /// Empty string disables the trial-side version check.
    pub version: &'a str,
    pub log_collection: &'a str,
}

/// Builds the JSON job spec submitted to the cluster. Hyperparameters ride
/// in the task command's environment; there is no staged code directory.
#[must_use]
pub fn render_job_spec(p: &JobSpecParams<'_>) -> Value {
    let command = [
        "export SWEEP_PLATFORM=batch".to_string(),
        format!("export SWEEP_EXP_ID={}", p.experiment_id),
        format!("export SWEEP_TRIAL_ID={}", p.trial_id),
        format!("export SWEEP_SEQ_ID={}", p.sequence_id),
        "export SWEEP_OUTPUT_DIR=$PWD/output".to_string(),
        format!("export SWEEP_CALLBACK_URL=http://{}", p.manager),
        format!("export SWEEP_VERSION='{}'", p.version),
        format!("export SWEEP_LOG_COLLECTION={}", p.log_collection),
        format!("export SWEEP_PARAMS='{}'", escape_single_quotes(p.hyper_parameters)),
        "mkdir -p $SWEEP_OUTPUT_DIR".to_string(),
        p.trial.command.clone(),
    ]
    .join(" && ");

    json!({
        "jobName": p.job_name,
        "image": p.trial.image,
        "virtualCluster": p.trial.virtual_cluster.as_deref().unwrap_or("default"),
        "taskRoles": [{
            "name": "trial",
            "taskNumber": 1,
            "cpuNumber": p.trial.cpus,
            "memoryMB": p.trial.memory_mb,
            "gpuNumber": p.trial.gpus,
            "command": command,
        }],
    })
}

fn escape_single_quotes(value: &str) -> String {
    value.replace('\'', "'\\''")
}

/// HTTP access to `/api/v1/users/{user}/jobs`.
pub struct BatchJobClient {
    http: reqwest::Client,
    base_url: String,
    user_name: String,
}

impl BatchJobClient {
    #[must_use]
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self { http, base_url: base_url.into(), user_name: user_name.into() }
    }

    fn jobs_url(&self) -> String {
        format!("{}/api/v1/users/{}/jobs", self.base_url, self.user_name)
    }

    /// Submits one job. Single-shot; the caller owns any retry policy.
    pub async fn submit_job(&self, token: &str, spec: &Value) -> Result<()> {
        let response = self
            .http
            .post(self.jobs_url())
            .bearer_auth(token)
            .json(spec)
            .send()
            .await
            .map_err(Error::cluster)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::cluster(format!("job submission failed: {status} {body}")));
        }
        debug!(job_name = %spec["jobName"], "job submitted to batch cluster");
        Ok(())
    }

    pub async fn job_info(&self, token: &str, job_name: &str) -> Result<BatchJobInfo> {
        let response = self
            .http
            .get(format!("{}/{job_name}", self.jobs_url()))
            .bearer_auth(token)
            .send()
            .await
            .map_err(Error::cluster)?;
        if !response.status().is_success() {
            return Err(Error::cluster(format!(
                "job status request failed: {}",
                response.status()
            )));
        }
        response.json().await.map_err(Error::cluster)
    }

    /// Asks the cluster to stop a job by flipping its execution type.
    pub async fn stop_job(&self, token: &str, job_name: &str) -> Result<()> {
        let response = self
            .http
            .put(format!("{}/{job_name}/execution-type", self.jobs_url()))
            .bearer_auth(token)
            .json(&json!({ "value": "STOP" }))
            .send()
            .await
            .map_err(Error::cluster)?;
        if !response.status().is_success() {
            return Err(Error::cluster(format!("job stop failed: {}", response.status())));
        }
        Ok(())
    }
}
