//! Training service backed by a shared batch cluster's REST API.
//!
//! - [`config`]: cluster endpoint, credentials and per-trial resources
//! - [`token`]: cached bearer token with age-gated, time-boxed refresh
//! - [`client`]: job submission, status and stop calls plus the job spec
//! - [`service`]: the queued [`BatchTrainingService`]

pub mod client;
pub mod config;
pub mod service;
pub mod token;

pub use client::{map_remote_state, BatchJobClient, BatchJobInfo};
pub use config::{BatchAuth, BatchClusterConfig, BatchTrialConfig};
pub use service::{batch_job_name, BatchTrainingService};
pub use token::{TokenKeeper, TokenSource, TOKEN_MAX_AGE, TOKEN_REFRESH_TIMEOUT};
