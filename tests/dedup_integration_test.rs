// Deduplication, tree copy and local-backend integration tests.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::Rng;

use vaultfs::backend::{list_all, SharedBackend};
use vaultfs::fs::RequestContext;
use vaultfs::mount::{mkfs, MkfsOptions, Mount, MountOptions};
use vaultfs::fs::ctrl::encode_copy_args;
use vaultfs::{LocalBackend, MemBackend, CTRL_INODE, ROOT_INODE};

struct TempDir {
    path: PathBuf,
}

impl TempDir {
    fn new(tag: &str) -> Self {
        let suffix: u64 = rand::thread_rng().gen();
        let path = std::env::temp_dir().join(format!("vaultfs-dd-{}-{:016x}", tag, suffix));
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

const BLOCKSIZE: u64 = 500;

fn small_fs_opts() -> MkfsOptions {
    MkfsOptions {
        blocksize: BLOCKSIZE,
        uid: 1000,
        gid: 1000,
        ..MkfsOptions::default()
    }
}

async fn data_objects(backend: &SharedBackend) -> Vec<String> {
    list_all(backend.as_ref(), "data_").await.unwrap()
}

/// Four distinct 500-byte blocks, 2000 bytes total.
fn four_block_payload() -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 * BLOCKSIZE as usize);
    for pattern in [0xA1u8, 0xB2, 0xC3, 0xD4] {
        payload.extend(std::iter::repeat(pattern).take(BLOCKSIZE as usize));
    }
    payload
}

#[tokio::test]
async fn test_dedup_across_files() {
    let dir = TempDir::new("dedup");
    let raw: SharedBackend = Arc::new(MemBackend::new());
    mkfs(Arc::clone(&raw), small_fs_opts()).await.unwrap();

    let mount = Mount::open(Arc::clone(&raw), MountOptions::new(dir.path(), "mem://dedup"))
        .await
        .unwrap();
    let fs = &mount.fs;
    let payload = four_block_payload();

    // Writing four distinct blocks creates four data objects.
    let a = fs.create(ROOT_INODE, b"a", 0o644, &ctx()).await.unwrap();
    fs.write(a.id, 0, &payload).await.unwrap();
    fs.release(a.id).await.unwrap();
    fs.sync_all().await.unwrap();
    assert_eq!(data_objects(&raw).await.len(), 4);

    // The identical content in a second file uploads nothing new.
    let b = fs.create(ROOT_INODE, b"b", 0o644, &ctx()).await.unwrap();
    fs.write(b.id, 0, &payload).await.unwrap();
    fs.release(b.id).await.unwrap();
    fs.sync_all().await.unwrap();
    assert_eq!(data_objects(&raw).await.len(), 4);

    // Removing one file leaves every object alive for the other.
    fs.unlink(ROOT_INODE, b"a").await.unwrap();
    assert_eq!(data_objects(&raw).await.len(), 4);
    let b = fs.lookup(ROOT_INODE, b"b").await.unwrap();
    assert_eq!(fs.read(b.id, 0, 4096).await.unwrap(), payload);

    // Removing the last reference deletes the objects.
    fs.unlink(ROOT_INODE, b"b").await.unwrap();
    assert_eq!(data_objects(&raw).await.len(), 0);

    mount.unmount().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_writers_same_file() {
    let dir = TempDir::new("concurrent");
    let raw: SharedBackend = Arc::new(MemBackend::new());
    mkfs(Arc::clone(&raw), small_fs_opts()).await.unwrap();

    let mount = Mount::open(
        Arc::clone(&raw),
        MountOptions::new(dir.path(), "mem://concurrent"),
    )
    .await
    .unwrap();
    let fs = Arc::clone(&mount.fs);

    let file = fs.create(ROOT_INODE, b"shared", 0o644, &ctx()).await.unwrap();
    let mut handles = Vec::new();
    for writer in 0..2u64 {
        let fs = Arc::clone(&fs);
        let id = file.id;
        handles.push(tokio::spawn(async move {
            // Writer 0 fills blocks 0..4, writer 1 fills blocks 4..8.
            for blockno in writer * 4..writer * 4 + 4 {
                let data = vec![(blockno + 1) as u8; BLOCKSIZE as usize];
                fs.write(id, blockno * BLOCKSIZE, &data).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // The final file is the union of both writers.
    assert_eq!(fs.getattr(file.id).await.unwrap().size, 8 * BLOCKSIZE);
    for blockno in 0..8u64 {
        assert_eq!(
            fs.read(file.id, blockno * BLOCKSIZE, BLOCKSIZE as usize).await.unwrap(),
            vec![(blockno + 1) as u8; BLOCKSIZE as usize]
        );
    }

    // Eight distinct blocks, each uploaded exactly once.
    fs.sync_all().await.unwrap();
    assert_eq!(data_objects(&raw).await.len(), 8);

    fs.release(file.id).await.unwrap();
    mount.unmount().await.unwrap();
}

#[tokio::test]
async fn test_tree_copy_uploads_nothing() {
    let dir = TempDir::new("treecopy");
    let raw: SharedBackend = Arc::new(MemBackend::new());
    mkfs(Arc::clone(&raw), small_fs_opts()).await.unwrap();

    let mount = Mount::open(
        Arc::clone(&raw),
        MountOptions::new(dir.path(), "mem://treecopy"),
    )
    .await
    .unwrap();
    let fs = &mount.fs;

    let src = fs.mkdir(ROOT_INODE, b"src", 0o755, &ctx()).await.unwrap();
    for i in 0..100 {
        let file = fs
            .create(src.id, format!("file{:03}", i).as_bytes(), 0o644, &ctx())
            .await
            .unwrap();
        fs.write(file.id, 0, format!("unique content {:03}", i).as_bytes())
            .await
            .unwrap();
        fs.release(file.id).await.unwrap();
    }
    fs.sync_all().await.unwrap();

    let objects_before: HashSet<String> = data_objects(&raw).await.into_iter().collect();
    let stats_before = fs.extstat().await.unwrap();

    let target = fs.mkdir(ROOT_INODE, b"copy", 0o755, &ctx()).await.unwrap();
    fs.setxattr(CTRL_INODE, b"copy", &encode_copy_args(src.id, target.id))
        .await
        .unwrap();

    // 100 new inodes, not a single new data object.
    let stats_after = fs.extstat().await.unwrap();
    assert_eq!(stats_after.inodes, stats_before.inodes + 101);
    let objects_after: HashSet<String> = data_objects(&raw).await.into_iter().collect();
    assert_eq!(objects_before, objects_after);

    // Every copied file reads back identically.
    for i in (0..100).step_by(17) {
        let name = format!("file{:03}", i);
        let copy = fs.lookup(target.id, name.as_bytes()).await.unwrap();
        assert_eq!(
            fs.read(copy.id, 0, 64).await.unwrap(),
            format!("unique content {:03}", i).as_bytes()
        );
    }

    mount.unmount().await.unwrap();
}

#[tokio::test]
async fn test_local_backend_end_to_end() {
    let store = TempDir::new("local-store");
    let cache = TempDir::new("local-cache");
    let raw: SharedBackend =
        Arc::new(LocalBackend::create(store.path().join("bucket")).unwrap());
    mkfs(
        Arc::clone(&raw),
        MkfsOptions {
            passphrase: Some("local secret".into()),
            ..small_fs_opts()
        },
    )
    .await
    .unwrap();

    let mut opts = MountOptions::new(cache.path(), "local://bucket");
    opts.passphrase = Some("local secret".into());
    let mount = Mount::open(Arc::clone(&raw), opts.clone()).await.unwrap();
    let file = mount
        .fs
        .create(ROOT_INODE, b"persistent", 0o644, &ctx())
        .await
        .unwrap();
    let payload = four_block_payload();
    mount.fs.write(file.id, 0, &payload).await.unwrap();
    mount.fs.release(file.id).await.unwrap();
    mount.unmount().await.unwrap();

    // Everything survives on disk across a fresh mount from an empty
    // cache directory.
    let cache2 = TempDir::new("local-cache-2");
    let mut opts = MountOptions::new(cache2.path(), "local://bucket");
    opts.passphrase = Some("local secret".into());
    let mount = Mount::open(Arc::clone(&raw), opts).await.unwrap();
    let file = mount.fs.lookup(ROOT_INODE, b"persistent").await.unwrap();
    assert_eq!(mount.fs.read(file.id, 0, 4096).await.unwrap(), payload);
    mount.unmount().await.unwrap();
}
