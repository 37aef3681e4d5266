use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by training services and the router.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation exists on the contract but is meaningless for this
    /// backend. Callers get an explicit failure instead of a silent no-op.
    #[error("operation not supported by this training service: {0}")]
    NotSupported(&'static str),

    #[error("trial job {0} not found")]
    TrialNotFound(String),

    /// A required metadata key was never set before an operation needed it.
    #[error("missing cluster metadata: {0}")]
    MissingMetadata(&'static str),

    #[error("invalid cluster metadata for '{key}': {reason}")]
    InvalidMetadata { key: String, reason: String },

    /// Router calls made before any backend has been resolved.
    #[error("training service is not assigned")]
    NotAssigned,

    #[error("cluster request failed: {0}")]
    Cluster(String),

    #[error("callback server failed: {0}")]
    CallbackServer(String),

    /// Credential refresh timed out with no previously-valid token to fall
    /// back on.
    #[error("token refresh timed out")]
    TokenTimeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Shorthand for cluster-side failures wrapping an arbitrary error.
    pub fn cluster(err: impl std::fmt::Display) -> Self {
        Self::Cluster(err.to_string())
    }

    pub fn invalid_metadata(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::InvalidMetadata { key: key.into(), reason: reason.to_string() }
    }
}
