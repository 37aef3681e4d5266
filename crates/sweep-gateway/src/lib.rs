//! Sweep Gateway
//!
//! The callback REST server trials use to report back:
//! - `POST /parameter-file-meta` / `GET /parameter-file-meta`
//! - `POST /metrics/:trial_id` re-emitted on the shared `MetricBus`
//! - `GET /health`

pub mod error;
pub mod server;

pub use error::{GatewayError, Result};
pub use server::{CallbackServer, ParameterFileMeta};
