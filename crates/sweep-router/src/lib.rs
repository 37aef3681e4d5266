//! Sweep Router
//!
//! `TrainingService` front that defers backend selection until cluster
//! metadata arrives:
//! - `platform_list` and configs carrying `"reuse": true` bind the
//!   environment dispatcher; other platform config keys bind their
//!   platform backend
//! - binding happens exactly once per process; afterwards every call is a
//!   pure pass-through
//! - queries before binding fail fast with `NotAssigned`; `run` waits for
//!   the binding and then delegates

pub mod factory;
pub mod router;

pub use factory::{BackendFactory, BackendKind, DefaultBackendFactory};
pub use router::RouterTrainingService;
