//! Sweep Storage
//!
//! Storage access for trial backends:
//! - `StorageAdapter` capability trait over a mounted root
//! - `MountedStorage` local-filesystem implementation
//! - `upload_with_retry` bounded-retry directory upload
//! - NFS / Azure-file-share mount helpers

pub mod adapter;
pub mod error;
pub mod mount;
pub mod mounted;

pub use adapter::{upload_with_retry, StorageAdapter};
pub use error::{Result, StorageError};
pub use mount::{mount, mount_args, unmount, MountSource};
pub use mounted::MountedStorage;
