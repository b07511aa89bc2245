// End-to-end tests: create a file system in a backend, mount it, drive
// the operation surface, unmount, and verify the backend namespace.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::Rng;

use vaultfs::backend::{list_all, SharedBackend};
use vaultfs::fs::RequestContext;
use vaultfs::mount::{is_dirty, mkfs, MkfsOptions, Mount, MountOptions};
use vaultfs::{Compression, FsError, MemBackend, CTRL_INODE, ROOT_INODE};

struct TempDir {
    path: PathBuf,
}

impl TempDir {
    fn new(tag: &str) -> Self {
        let suffix: u64 = rand::thread_rng().gen();
        let path = std::env::temp_dir().join(format!("vaultfs-it-{}-{:016x}", tag, suffix));
        std::fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

fn ctx() -> RequestContext {
    RequestContext { uid: 1000, gid: 1000 }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn small_fs_opts() -> MkfsOptions {
    MkfsOptions {
        blocksize: 500,
        uid: 1000,
        gid: 1000,
        ..MkfsOptions::default()
    }
}

async fn data_objects(backend: &SharedBackend) -> usize {
    list_all(backend.as_ref(), "data_").await.unwrap().len()
}

#[tokio::test]
async fn test_touch_survives_remount() {
    init_tracing();
    let dir = TempDir::new("touch");
    let raw: SharedBackend = Arc::new(MemBackend::new());
    mkfs(Arc::clone(&raw), small_fs_opts()).await.unwrap();

    let opts = MountOptions::new(dir.path(), "mem://touch");
    let mount = Mount::open(Arc::clone(&raw), opts.clone()).await.unwrap();
    let created = mount
        .fs
        .mknod(ROOT_INODE, b"a", 0o100_644, 0, &ctx())
        .await
        .unwrap();
    let created_mtime = created.mtime_ns;
    mount.unmount().await.unwrap();

    let mount = Mount::open(Arc::clone(&raw), opts).await.unwrap();
    let found = mount.fs.lookup(ROOT_INODE, b"a").await.unwrap();
    assert_eq!(found.size, 0);
    assert_eq!(found.uid, 1000);
    // The timestamp survives the dump/restore cycle to the nanosecond.
    assert_eq!(found.mtime_ns, created_mtime);

    // An empty file needs no data objects.
    assert_eq!(data_objects(&raw).await, 0);
    mount.unmount().await.unwrap();
}

#[tokio::test]
async fn test_clean_unmount_protocol() {
    let dir = TempDir::new("clean-unmount");
    let raw: SharedBackend = Arc::new(MemBackend::new());
    mkfs(Arc::clone(&raw), small_fs_opts()).await.unwrap();

    let opts = MountOptions::new(dir.path(), "mem://clean");
    let mount = Mount::open(Arc::clone(&raw), opts.clone()).await.unwrap();
    let seq_before = mount.seq_no();
    assert!(is_dirty(&raw).await.unwrap());

    let file = mount.fs.create(ROOT_INODE, b"big", 0o644, &ctx()).await.unwrap();
    let payload: Vec<u8> = (0..10_240).map(|i| (i % 251) as u8).collect();
    mount.fs.write(file.id, 0, &payload).await.unwrap();
    mount.fs.release(file.id).await.unwrap();
    mount.unmount().await.unwrap();

    // Clean unmount: dirty marker off, sequence bumped by exactly one.
    assert!(!is_dirty(&raw).await.unwrap());
    let seqs = list_all(raw.as_ref(), "seq_no_").await.unwrap();
    assert!(seqs.contains(&format!("seq_no_{}", seq_before + 1)));

    // A fresh mount reads everything back from the backend.
    let dir2 = TempDir::new("clean-unmount-2");
    let opts2 = MountOptions::new(dir2.path(), "mem://clean");
    let mount = Mount::open(Arc::clone(&raw), opts2).await.unwrap();
    assert_eq!(mount.seq_no(), seq_before + 1);
    let file = mount.fs.lookup(ROOT_INODE, b"big").await.unwrap();
    assert_eq!(file.size, 10_240);
    assert_eq!(mount.fs.read(file.id, 0, 20_000).await.unwrap(), payload);
    mount.unmount().await.unwrap();
}

#[tokio::test]
async fn test_corrupted_object_marks_fs_damaged() {
    init_tracing();
    let dir = TempDir::new("corruption");
    let raw = Arc::new(MemBackend::new());
    let shared: SharedBackend = raw.clone();
    mkfs(
        shared.clone(),
        MkfsOptions {
            passphrase: Some("secret".into()),
            ..small_fs_opts()
        },
    )
    .await
    .unwrap();

    let mut opts = MountOptions::new(dir.path(), "mem://corrupt");
    opts.passphrase = Some("secret".into());
    let mount = Mount::open(shared.clone(), opts).await.unwrap();
    let fs = &mount.fs;

    let file = fs.create(ROOT_INODE, b"victim", 0o644, &ctx()).await.unwrap();
    fs.write(file.id, 0, b"precious data").await.unwrap();
    fs.fsync(file.id, true).await.unwrap();

    // Drop the local copy, then flip one byte of the stored object.
    fs.setxattr(CTRL_INODE, b"s3ql_flushcache!", b"").await.unwrap();
    let keys = list_all(raw.as_ref(), "data_").await.unwrap();
    assert_eq!(keys.len(), 1);
    assert!(raw.corrupt(&keys[0], 40));

    let err = fs.read(file.id, 0, 64).await.unwrap_err();
    assert_eq!(err.errno(), 5, "corrupted read must surface EIO");
    assert!(fs.is_damaged());
    assert_eq!(
        fs.getxattr(CTRL_INODE, b"s3ql_errors?").await.unwrap(),
        b"errors encountered"
    );
    fs.release(file.id).await.unwrap();
}

#[tokio::test]
async fn test_rename_is_atomic_for_observers() {
    let dir = TempDir::new("rename-atomic");
    let raw: SharedBackend = Arc::new(MemBackend::new());
    mkfs(Arc::clone(&raw), small_fs_opts()).await.unwrap();

    let opts = MountOptions::new(dir.path(), "mem://rename");
    let mount = Mount::open(Arc::clone(&raw), opts).await.unwrap();
    let fs = Arc::clone(&mount.fs);

    fs.mknod(ROOT_INODE, b"old", 0o100_644, 0, &ctx()).await.unwrap();

    let observer = {
        let fs = Arc::clone(&fs);
        tokio::spawn(async move {
            for _ in 0..200 {
                // One readdir call is one database query, so it sees the
                // directory at a single instant.
                let names: Vec<Vec<u8>> = fs
                    .readdir(ROOT_INODE, 0, 100)
                    .await
                    .unwrap()
                    .into_iter()
                    .map(|e| e.name)
                    .collect();
                let old_there = names.contains(&b"old".to_vec());
                let new_there = names.contains(&b"new".to_vec());
                assert!(
                    old_there != new_there,
                    "observer saw old={} new={}",
                    old_there,
                    new_there
                );
                if new_there {
                    return;
                }
                tokio::task::yield_now().await;
            }
            panic!("rename never became visible");
        })
    };

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    fs.rename(ROOT_INODE, b"old", ROOT_INODE, b"new").await.unwrap();
    observer.await.unwrap();

    mount.unmount().await.unwrap();
}

#[tokio::test]
async fn test_stale_local_cache_is_discarded() {
    let dir_a = TempDir::new("stale-a");
    let dir_b = TempDir::new("stale-b");
    let raw: SharedBackend = Arc::new(MemBackend::new());
    mkfs(Arc::clone(&raw), small_fs_opts()).await.unwrap();

    // First host mounts and unmounts, leaving a cached database.
    let opts_a = MountOptions::new(dir_a.path(), "mem://stale");
    let mount = Mount::open(Arc::clone(&raw), opts_a.clone()).await.unwrap();
    mount.unmount().await.unwrap();

    // Second host advances the file system.
    let opts_b = MountOptions::new(dir_b.path(), "mem://stale");
    let mount = Mount::open(Arc::clone(&raw), opts_b).await.unwrap();
    mount
        .fs
        .mknod(ROOT_INODE, b"fresh", 0o100_644, 0, &ctx())
        .await
        .unwrap();
    mount.unmount().await.unwrap();

    // The first host's cache is now behind and must be replaced by the
    // downloaded metadata.
    let mount = Mount::open(Arc::clone(&raw), opts_a).await.unwrap();
    assert!(mount.fs.lookup(ROOT_INODE, b"fresh").await.is_ok());
    mount.unmount().await.unwrap();
}

#[tokio::test]
async fn test_mount_without_fs_fails_quietly() {
    let dir = TempDir::new("no-fs");
    let raw: SharedBackend = Arc::new(MemBackend::new());
    let err = Mount::open(raw, MountOptions::new(dir.path(), "mem://nofs"))
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::Quiet(_)));
}

#[tokio::test]
async fn test_encrypted_end_to_end() {
    let dir = TempDir::new("encrypted-e2e");
    let raw = Arc::new(MemBackend::new());
    let shared: SharedBackend = raw.clone();
    mkfs(
        shared.clone(),
        MkfsOptions {
            passphrase: Some("hunter2".into()),
            compression: Compression::Lz4,
            ..small_fs_opts()
        },
    )
    .await
    .unwrap();

    let mut opts = MountOptions::new(dir.path(), "mem://e2e");
    opts.passphrase = Some("hunter2".into());
    opts.compression = Compression::Lz4;
    let mount = Mount::open(shared.clone(), opts.clone()).await.unwrap();
    let file = mount.fs.create(ROOT_INODE, b"s", 0o600, &ctx()).await.unwrap();
    mount.fs.write(file.id, 0, b"confidential").await.unwrap();
    mount.fs.release(file.id).await.unwrap();
    mount.unmount().await.unwrap();

    // Nothing in the backend contains the plaintext.
    for key in list_all(raw.as_ref(), "").await.unwrap() {
        let payload = raw.raw_get(&key).unwrap();
        assert!(
            !payload
                .windows(b"confidential".len())
                .any(|w| w == b"confidential"),
            "plaintext leaked into {}",
            key
        );
    }

    let mount = Mount::open(shared, opts).await.unwrap();
    let file = mount.fs.lookup(ROOT_INODE, b"s").await.unwrap();
    assert_eq!(mount.fs.read(file.id, 0, 64).await.unwrap(), b"confidential");
    mount.unmount().await.unwrap();
}
