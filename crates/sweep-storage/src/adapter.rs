//! Storage behind a mounted directory, addressed by relative paths.
//!
//! Backends never hold absolute cluster-storage paths; they pass paths
//! relative to a root the adapter owns. The adapter is the only component
//! that knows where that root is mounted.

use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Filesystem-like capability set over one storage root.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Absolute path a relative storage path resolves to.
    ///
    /// # Errors
    /// [`StorageError::PathEscapes`] when `relative` would climb above the
    /// root.
    ///
    /// [`StorageError::PathEscapes`]: crate::StorageError::PathEscapes
    fn resolve(&self, relative: &str) -> Result<PathBuf>;

    async fn exists(&self, relative: &str) -> Result<bool>;

    /// Recursive, idempotent directory creation.
    async fn mkdir(&self, relative: &str) -> Result<()>;

    /// Entry names directly under `relative`, sorted.
    async fn list(&self, relative: &str) -> Result<Vec<String>>;

    /// Copies a local file or directory tree into storage. Returns the
    /// resolved destination. No-op when source and destination are the
    /// same path.
    async fn copy_in(&self, local: &Path, relative_dest: &str) -> Result<PathBuf>;

    /// Copies a storage file or directory tree out to a local path. No-op
    /// when source and destination are the same path.
    async fn copy_out(&self, relative_src: &str, local: &Path) -> Result<()>;

    async fn rename(&self, relative_from: &str, relative_to: &str) -> Result<()>;

    /// Removes a file, or a whole tree when `recursive` is set.
    async fn remove(&self, relative: &str, recursive: bool) -> Result<()>;

    /// Reads up to `length` bytes starting at `offset`.
    async fn read_range(&self, relative: &str, offset: u64, length: u64) -> Result<Vec<u8>>;

    /// Appends to a file, creating it first if needed.
    async fn append(&self, relative: &str, content: &[u8]) -> Result<()>;
}

/// Uploads a local directory with bounded retries and a fixed pause between
/// attempts. Exhaustion is an expected outcome, not an error: the caller
/// gets `None` and decides what that means for the trial.
pub async fn upload_with_retry(
    adapter: &dyn StorageAdapter,
    local: &Path,
    relative_dest: &str,
    attempts: u32,
    backoff: Duration,
) -> Option<PathBuf> {
    for attempt in 1..=attempts.max(1) {
        match adapter.copy_in(local, relative_dest).await {
            Ok(dest) => {
                debug!(local = %local.display(), dest = %dest.display(), attempt, "upload finished");
                return Some(dest);
            }
            Err(err) => {
                warn!(
                    local = %local.display(),
                    dest = relative_dest,
                    attempt,
                    error = %err,
                    "upload attempt failed"
                );
            }
        }
        if attempt < attempts {
            tokio::time::sleep(backoff).await;
        }
    }
    warn!(local = %local.display(), dest = relative_dest, attempts, "upload abandoned");
    None
}
