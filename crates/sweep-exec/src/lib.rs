//! Training services that run trials as plain processes.
//!
//! - [`local`]: trials as child processes on this host
//! - [`remote`]: trials on SSH-reachable machines, placed round-robin
//! - [`script`]: the run script both substrates render
//! - [`config`]: `local_config` / `remote_config` metadata payloads

pub mod config;
pub mod local;
pub mod remote;
pub mod script;
mod ssh;

pub use config::{LocalExecConfig, RemoteExecConfig, RemoteMachineConfig};
pub use local::LocalTrainingService;
pub use remote::RemoteTrainingService;
pub use script::{render_exec_script, ExecScriptParams, PARAMETER_FILE_NAME, RUN_SCRIPT_NAME};
