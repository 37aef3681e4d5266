use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("path escapes the storage root: {0}")]
    PathEscapes(String),

    #[error("not found in storage: {0}")]
    NotFound(String),

    #[error("cannot copy directory {0} without recursive flag")]
    IsDirectory(PathBuf),

    #[error("mount command failed: {0}")]
    Mount(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
