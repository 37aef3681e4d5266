//! Sweep Core
//!
//! Backend-agnostic primitives for trial-job orchestration:
//! - The `TrainingService` contract every execution backend implements
//! - Trial model (`TrialId`, `TrialStatus`, `TrialForm`, `TrialJob`)
//! - Shared trial registry with the terminal-status guard
//! - Metric fan-out (`MetricBus`)
//! - Cluster metadata protocol (keys + shared payloads)
//! - Experiment context passed explicitly instead of process globals

pub mod error;
pub mod experiment;
pub mod metadata;
pub mod metrics;
pub mod registry;
pub mod service;
pub mod trial;

pub use error::{Error, Result};
pub use experiment::ExperimentContext;
pub use metadata::{parse_platform_list, parse_value, ManagerEndpoint, ManagerIpConfig, TrialRunConfig};
pub use metrics::{MetricBus, TrialMetric};
pub use registry::TrialRegistry;
pub use service::TrainingService;
pub use trial::{TrialForm, TrialId, TrialJob, TrialStatus};
