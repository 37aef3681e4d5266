//! Sweep Dispatch
//!
//! Environment-based trial dispatching with optional reuse:
//! - `EnvironmentService` contract for platform-specific environment
//!   providers, plus the local process-slot implementation
//! - `TrialDispatcher`, a `TrainingService` that stocks environments,
//!   assigns waiting trials to idle ones and settles finished trials

pub mod dispatcher;
pub mod environment;
pub mod local_env;

pub use dispatcher::TrialDispatcher;
pub use environment::{
    Environment, EnvironmentId, EnvironmentService, EnvironmentStatus, TrialLaunch,
};
pub use local_env::LocalEnvironmentService;
