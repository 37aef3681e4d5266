//! Mount and unmount helpers for cluster-backed storage roots.
//!
//! NFS exports and Azure file shares are both surfaced as a local mount
//! point and then accessed through [`MountedStorage`], so there is exactly
//! one read/write code path regardless of where the bytes live.
//!
//! [`MountedStorage`]: crate::MountedStorage

use crate::error::{Result, StorageError};
use std::path::Path;
use tokio::process::Command;
use tracing::info;

/// What gets mounted at a storage root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    /// `mount -t nfs <server>:<export> <point>`
    Nfs { server: String, export_path: String },
    /// `mount -t cifs //<account>.file.core.windows.net/<share> <point>`
    AzureFileShare { account: String, share: String, access_key: String },
}

/// Arguments for the mount command, split out so tests can check them
/// without touching real mounts.
#[must_use]
pub fn mount_args(source: &MountSource, mount_point: &Path) -> Vec<String> {
    let point = mount_point.display().to_string();
    match source {
        MountSource::Nfs { server, export_path } => vec![
            "-t".into(),
            "nfs".into(),
            format!("{server}:{export_path}"),
            point,
        ],
        MountSource::AzureFileShare { account, share, access_key } => vec![
            "-t".into(),
            "cifs".into(),
            "-o".into(),
            format!(
                "vers=3.0,username={account},password={access_key},dir_mode=0777,file_mode=0777,serverino"
            ),
            format!("//{account}.file.core.windows.net/{share}"),
            point,
        ],
    }
}

/// Mounts `source` at `mount_point`, creating the directory first.
pub async fn mount(source: &MountSource, mount_point: &Path) -> Result<()> {
    tokio::fs::create_dir_all(mount_point).await?;
    run_checked(Command::new("mount").args(mount_args(source, mount_point))).await?;
    info!(mount_point = %mount_point.display(), "storage mounted");
    Ok(())
}

/// Unmounts a previously mounted storage root.
pub async fn unmount(mount_point: &Path) -> Result<()> {
    run_checked(Command::new("umount").arg(mount_point)).await?;
    info!(mount_point = %mount_point.display(), "storage unmounted");
    Ok(())
}

async fn run_checked(command: &mut Command) -> Result<()> {
    let output = command.output().await?;
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(StorageError::Mount(stderr.trim().to_string()))
    }
}
