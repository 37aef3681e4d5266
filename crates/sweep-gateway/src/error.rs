use std::net::SocketAddr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to bind callback server on {addr}: {source}")]
    Bind { addr: SocketAddr, source: std::io::Error },

    #[error("callback server is already running")]
    AlreadyRunning,
}
