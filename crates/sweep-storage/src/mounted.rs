use crate::adapter::StorageAdapter;
use crate::error::{Result, StorageError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

/// [`StorageAdapter`] over a directory on the local filesystem, typically a
/// mount point for NFS or a CIFS file share.
#[derive(Debug, Clone)]
pub struct MountedStorage {
    root: PathBuf,
}

impl MountedStorage {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lexically joins `relative` under the root, rejecting traversal above
    /// it. No filesystem access, so paths that do not exist yet resolve
    /// fine.
    fn join_checked(&self, relative: &str) -> Result<PathBuf> {
        let mut resolved = self.root.clone();
        let mut depth = 0usize;
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir | Component::RootDir => {}
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(StorageError::PathEscapes(relative.to_string()));
                    }
                    resolved.pop();
                    depth -= 1;
                }
                Component::Prefix(_) => {
                    return Err(StorageError::PathEscapes(relative.to_string()));
                }
            }
        }
        Ok(resolved)
    }
}

/// Copies a directory tree. Boxed because the future recurses.
fn copy_tree<'a>(src: &'a Path, dst: &'a Path) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        fs::create_dir_all(dst).await?;
        let mut entries = fs::read_dir(src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = dst.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                copy_tree(&entry.path(), &target).await?;
            } else {
                fs::copy(entry.path(), &target).await?;
            }
        }
        Ok(())
    })
}

/// File-or-directory copy between two local paths, no-op when they are the
/// same path.
async fn copy_path(src: &Path, dst: &Path) -> Result<()> {
    let src_abs = std::path::absolute(src)?;
    let dst_abs = std::path::absolute(dst)?;
    if src_abs == dst_abs {
        return Ok(());
    }
    if fs::metadata(&src_abs).await?.is_dir() {
        copy_tree(&src_abs, &dst_abs).await
    } else {
        if let Some(parent) = dst_abs.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&src_abs, &dst_abs).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for MountedStorage {
    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        self.join_checked(relative)
    }

    async fn exists(&self, relative: &str) -> Result<bool> {
        let path = self.join_checked(relative)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn mkdir(&self, relative: &str) -> Result<()> {
        let path = self.join_checked(relative)?;
        fs::create_dir_all(&path).await?;
        Ok(())
    }

    async fn list(&self, relative: &str) -> Result<Vec<String>> {
        let path = self.join_checked(relative)?;
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&path).await?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn copy_in(&self, local: &Path, relative_dest: &str) -> Result<PathBuf> {
        let dest = self.join_checked(relative_dest)?;
        copy_path(local, &dest).await?;
        Ok(dest)
    }

    async fn copy_out(&self, relative_src: &str, local: &Path) -> Result<()> {
        let src = self.join_checked(relative_src)?;
        copy_path(&src, local).await
    }

    async fn rename(&self, relative_from: &str, relative_to: &str) -> Result<()> {
        let from = self.join_checked(relative_from)?;
        let to = self.join_checked(relative_to)?;
        fs::rename(&from, &to).await?;
        Ok(())
    }

    async fn remove(&self, relative: &str, recursive: bool) -> Result<()> {
        let path = self.join_checked(relative)?;
        let meta = fs::metadata(&path).await?;
        if meta.is_dir() {
            if !recursive {
                return Err(StorageError::IsDirectory(path));
            }
            fs::remove_dir_all(&path).await?;
        } else {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn read_range(&self, relative: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let path = self.join_checked(relative)?;
        let mut file = fs::File::open(&path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buffer = Vec::new();
        file.take(length).read_to_end(&mut buffer).await?;
        Ok(buffer)
    }

    async fn append(&self, relative: &str, content: &[u8]) -> Result<()> {
        let path = self.join_checked(relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path).await?;
        file.write_all(content).await?;
        file.flush().await?;
        Ok(())
    }
}
