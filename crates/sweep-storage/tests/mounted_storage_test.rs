use std::path::Path;
use std::time::Duration;
use sweep_storage::{upload_with_retry, MountedStorage, StorageAdapter, StorageError};

async fn seeded_local_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("train.py"), "print('hi')").await.unwrap();
    tokio::fs::create_dir(dir.path().join("lib")).await.unwrap();
    tokio::fs::write(dir.path().join("lib/util.py"), "pass").await.unwrap();
    dir
}

#[tokio::test]
async fn directory_round_trip() {
    let local = seeded_local_dir().await;
    let mount = tempfile::tempdir().unwrap();
    let storage = MountedStorage::new(mount.path());

    let dest = storage.copy_in(local.path(), "trials/abc123/code").await.unwrap();
    assert!(dest.starts_with(mount.path()));
    assert!(storage.exists("trials/abc123/code/lib/util.py").await.unwrap());

    let out = tempfile::tempdir().unwrap();
    let restored = out.path().join("code");
    storage.copy_out("trials/abc123/code", &restored).await.unwrap();
    let content = tokio::fs::read_to_string(restored.join("train.py")).await.unwrap();
    assert_eq!(content, "print('hi')");
}

#[tokio::test]
async fn list_is_sorted() {
    let mount = tempfile::tempdir().unwrap();
    let storage = MountedStorage::new(mount.path());
    storage.mkdir("d/b").await.unwrap();
    storage.mkdir("d/a").await.unwrap();
    storage.append("d/c.txt", b"x").await.unwrap();

    assert_eq!(storage.list("d").await.unwrap(), vec!["a", "b", "c.txt"]);
}

#[tokio::test]
async fn read_range_honors_offset_and_length() {
    let mount = tempfile::tempdir().unwrap();
    let storage = MountedStorage::new(mount.path());
    storage.append("log.txt", b"0123456789").await.unwrap();
    storage.append("log.txt", b"abcdef").await.unwrap();

    assert_eq!(storage.read_range("log.txt", 8, 4).await.unwrap(), b"89ab");
    assert_eq!(storage.read_range("log.txt", 14, 100).await.unwrap(), b"ef");
}

#[tokio::test]
async fn rename_and_remove() {
    let mount = tempfile::tempdir().unwrap();
    let storage = MountedStorage::new(mount.path());
    storage.mkdir("old/dir").await.unwrap();
    storage.append("old/dir/f.txt", b"x").await.unwrap();

    storage.rename("old", "new").await.unwrap();
    assert!(storage.exists("new/dir/f.txt").await.unwrap());
    assert!(!storage.exists("old").await.unwrap());

    let denied = storage.remove("new", false).await;
    assert!(matches!(denied, Err(StorageError::IsDirectory(_))));

    storage.remove("new", true).await.unwrap();
    assert!(!storage.exists("new").await.unwrap());
}

#[tokio::test]
async fn exhausted_upload_returns_none_not_error() {
    let mount = tempfile::tempdir().unwrap();
    let storage = MountedStorage::new(mount.path());

    let missing = Path::new("/definitely/not/a/real/source");
    let outcome =
        upload_with_retry(&storage, missing, "trials/x/code", 3, Duration::from_millis(1)).await;
    assert!(outcome.is_none());
    assert!(!storage.exists("trials/x/code").await.unwrap());
}

#[tokio::test]
async fn successful_upload_returns_destination() {
    let local = seeded_local_dir().await;
    let mount = tempfile::tempdir().unwrap();
    let storage = MountedStorage::new(mount.path());

    let dest =
        upload_with_retry(&storage, local.path(), "trials/ok/code", 3, Duration::from_millis(1))
            .await
            .unwrap();
    assert_eq!(dest, mount.path().join("trials/ok/code"));
}
