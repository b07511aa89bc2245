//! File-system lifecycle: creation, mount, unmount, administration.
//!
//! The metadata database lives in the backend as one object (`metadata`)
//! plus rotated backups, with an empty `seq_no_<N>` sentinel naming the
//! current generation. While mounted, the database is cached locally; on
//! clean unmount it is dumped, uploaded, and the sequence number bumped.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::backend::{
    list_all, Backend, BackendError, MetaValue, ObjectMeta, RetryBackend, SharedBackend,
};
use crate::cache::{BlockCache, CacheConfig};
use crate::codec::{self, CodecBackend, Compression, MasterKey};
use crate::common::{
    metadata_bak_key, seq_no_key, FORMAT_VERSION, DIRTY_KEY, METADATA_BAK_SLOTS, METADATA_KEY,
    SEQ_NO_PREFIX,
};
use crate::database::{self, dump, schema, MetaDb};
use crate::error::{FsError, FsResult};
use crate::fs::Fs;
use crate::inode::{self, InodeCache};

/// Parameters for creating a file system.
#[derive(Debug, Clone)]
pub struct MkfsOptions {
    /// Maximum object (block) size in bytes.
    pub blocksize: u64,
    /// Encrypt all payloads under this passphrase.
    pub passphrase: Option<String>,
    /// Compression for the initial metadata upload.
    pub compression: Compression,
    /// Owner of the root directory.
    pub uid: u32,
    pub gid: u32,
    /// Create even if the location already holds a file system.
    pub force: bool,
}

impl Default for MkfsOptions {
    fn default() -> Self {
        Self {
            blocksize: 10 * 1024 * 1024,
            passphrase: None,
            compression: Compression::Zlib,
            uid: 0,
            gid: 0,
            force: false,
        }
    }
}

/// Parameters for mounting.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Directory for the local metadata cache and block cache files.
    pub cachedir: PathBuf,
    /// Identifies the remote location; distinct URLs get distinct local
    /// cache files.
    pub storage_url: String,
    pub passphrase: Option<String>,
    pub compression: Compression,
    pub cache_size: u64,
    pub cache_entries: usize,
}

impl MountOptions {
    pub fn new(cachedir: impl Into<PathBuf>, storage_url: impl Into<String>) -> Self {
        Self {
            cachedir: cachedir.into(),
            storage_url: storage_url.into(),
            passphrase: None,
            compression: Compression::Zlib,
            cache_size: 512 * 1024 * 1024,
            cache_entries: 768,
        }
    }
}

/// A mounted file system.
pub struct Mount {
    pub fs: Arc<Fs>,
    backend: SharedBackend,
    raw: SharedBackend,
    db: MetaDb,
    seq_no: i64,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount").finish_non_exhaustive()
    }
}

/// Create a new file system at the location served by `raw`.
pub async fn mkfs(raw: SharedBackend, opts: MkfsOptions) -> FsResult<()> {
    let retry: SharedBackend = Arc::new(RetryBackend::new(raw));

    if !opts.force {
        let existing = retry.list_page(SEQ_NO_PREFIX, None, 1).await?;
        if !existing.is_empty() {
            return Err(FsError::quiet(
                "location already contains a file system (use force to overwrite)",
            ));
        }
    }

    let master = match &opts.passphrase {
        Some(passphrase) => Some(codec::store_master_key(&retry, passphrase).await?),
        None => None,
    };
    let backend: SharedBackend = Arc::new(CodecBackend::new(
        Arc::clone(&retry),
        opts.compression,
        master,
    ));

    // Build the initial database in memory-backed temporary storage and
    // upload its dump.
    let tmp = std::env::temp_dir().join(format!(
        "vaultfs-mkfs-{}-{:08x}.db",
        std::process::id(),
        rand::random::<u32>()
    ));
    drop_local_db(&tmp);
    let db = MetaDb::create(&tmp).await?;
    let mut conn = db.acquire().await?;
    schema::create_tables(&mut conn).await?;
    schema::create_indices(&mut conn).await?;
    schema::init_rows(&mut conn, opts.uid, opts.gid).await?;
    let dump = dump::dump_metadata(&mut conn).await?;
    drop(conn);
    db.close().await;
    drop_local_db(&tmp);

    backend
        .store(METADATA_KEY, &dump, Some(metadata_headers(1, opts.blocksize)))
        .await?;
    // The sequence sentinel and the mount-state marker are plain
    // objects: external tools read them without the codec.
    retry.store(&seq_no_key(1), b"", None).await?;
    retry.store(DIRTY_KEY, b"no", None).await?;
    info!(blocksize = opts.blocksize, "file system created");
    Ok(())
}

fn metadata_headers(seq_no: i64, blocksize: u64) -> ObjectMeta {
    let mut meta = ObjectMeta::new();
    meta.insert("seq_no", MetaValue::Int(seq_no));
    meta.insert("max_obj_size", MetaValue::Int(blocksize as i64));
    meta.insert("revision", MetaValue::Int(FORMAT_VERSION));
    meta
}

impl Mount {
    /// Mount the file system served by `raw`.
    pub async fn open(raw: SharedBackend, opts: MountOptions) -> FsResult<Self> {
        std::fs::create_dir_all(&opts.cachedir).map_err(FsError::Io)?;
        let retry: SharedBackend = Arc::new(RetryBackend::new(raw));

        let master = match &opts.passphrase {
            Some(passphrase) => Some(load_master_key_quiet(&retry, passphrase).await?),
            None => None,
        };
        let backend: SharedBackend = Arc::new(CodecBackend::new(
            Arc::clone(&retry),
            opts.compression,
            master,
        ));

        let seq_no = get_seq_no(&retry).await?;
        let db_path = local_db_path(&opts.cachedir, &opts.storage_url);

        let (db, blocksize) = if db_path.exists() {
            let db = MetaDb::open(&db_path).await?;
            let mut conn = db.acquire().await?;
            let local_seq = database::get_setting_int(&mut conn, "seq_no").await?.unwrap_or(0);
            let clean = database::get_setting_int(&mut conn, "clean").await?.unwrap_or(0) != 0;
            let blocksize = database::get_setting_int(&mut conn, "max_obj_size").await?;
            drop(conn);

            if local_seq > seq_no || (local_seq == seq_no && clean) {
                if local_seq > seq_no {
                    warn!(
                        local_seq,
                        remote_seq = seq_no,
                        "local metadata is newer than the backend copy, using it"
                    );
                }
                let blocksize = blocksize.ok_or_else(|| {
                    FsError::quiet("cached metadata is missing the object size parameter")
                })? as u64;
                (db, blocksize)
            } else if local_seq == seq_no {
                // Same generation, but the previous mount did not shut
                // down cleanly. The cache may hold uncommitted block
                // references that only a file-system check can reconcile.
                db.close().await;
                return Err(FsError::quiet(
                    "file system was not unmounted cleanly, run fsck first",
                ));
            } else {
                info!("local metadata cache is stale, downloading current metadata");
                db.close().await;
                drop_local_db(&db_path);
                download_db(&backend, &db_path, seq_no).await?
            }
        } else {
            download_db(&backend, &db_path, seq_no).await?
        };

        // From here on the local copy is the one that counts.
        let mut conn = db.acquire().await?;
        database::set_setting_int(&mut conn, "seq_no", seq_no).await?;
        database::set_setting_int(&mut conn, "clean", 0).await?;
        database::set_setting_int(&mut conn, "max_obj_size", blocksize as i64).await?;
        drop(conn);
        retry.store(DIRTY_KEY, b"yes", None).await?;

        let damaged = Arc::new(AtomicBool::new(false));
        let cache_config = CacheConfig {
            cachedir: opts.cachedir.join(format!(
                "{}-blocks",
                local_db_tag(&opts.storage_url)
            )),
            max_size: opts.cache_size,
            max_entries: opts.cache_entries,
            ..CacheConfig::default()
        };
        let cache = BlockCache::new(
            Arc::clone(&backend),
            db.clone(),
            cache_config,
            Arc::clone(&damaged),
        )
        .map_err(FsError::from)?;
        let inodes = InodeCache::new(db.clone(), inode::DEFAULT_CAPACITY).await?;
        let fs = Arc::new(Fs::new(db.clone(), inodes, cache, blocksize, damaged));

        Ok(Self {
            fs,
            backend,
            raw: retry,
            db,
            seq_no,
        })
    }

    /// Current metadata sequence number.
    pub fn seq_no(&self) -> i64 {
        self.seq_no
    }

    /// Clean unmount: flush everything, upload the metadata dump, rotate
    /// backups, bump the sequence number and clear the dirty marker.
    pub async fn unmount(self) -> FsResult<()> {
        info!("unmounting: flushing caches");
        self.fs.destroy().await?;

        let blocksize = self.fs.blocksize();
        let new_seq = self.seq_no + 1;

        cycle_metadata(&self.backend).await?;

        let mut conn = self.db.acquire().await?;
        let dump = dump::dump_metadata(&mut conn).await?;
        drop(conn);
        debug!(bytes = dump.len(), "uploading metadata dump");
        self.backend
            .store(METADATA_KEY, &dump, Some(metadata_headers(new_seq, blocksize)))
            .await?;

        self.raw.store(&seq_no_key(new_seq), b"", None).await?;
        delete_stale_seq_nos(&self.raw, new_seq).await?;

        let mut conn = self.db.acquire().await?;
        database::set_setting_int(&mut conn, "seq_no", new_seq).await?;
        database::set_setting_int(&mut conn, "clean", 1).await?;
        drop(conn);

        self.raw.store(DIRTY_KEY, b"no", None).await?;
        self.db.close().await;
        info!(seq_no = new_seq, "unmounted cleanly");
        Ok(())
    }
}

async fn load_master_key_quiet(
    backend: &SharedBackend,
    passphrase: &str,
) -> FsResult<MasterKey> {
    match codec::load_master_key(backend, passphrase).await {
        Ok(master) => Ok(master),
        Err(BackendError::NoSuchObject(_)) => Err(FsError::quiet(
            "file system is not encrypted, but a passphrase was supplied",
        )),
        Err(BackendError::CorruptedObject { .. }) => {
            Err(FsError::quiet("wrong file-system passphrase"))
        }
        Err(err) => Err(err.into()),
    }
}

/// Determine the current metadata sequence number from the backend,
/// tolerating stale listings, and prune sentinels far behind it.
pub async fn get_seq_no(backend: &SharedBackend) -> FsResult<i64> {
    let keys = list_all(backend.as_ref(), SEQ_NO_PREFIX).await?;
    let mut seq_nos: Vec<i64> = keys
        .iter()
        .filter_map(|key| key[SEQ_NO_PREFIX.len()..].parse().ok())
        .collect();
    if seq_nos.is_empty() {
        // The listing may lag behind object creation.
        seq_nos.push(1);
    }
    let mut seq_no = *seq_nos.iter().max().expect("non-empty");

    // Walk to an object that actually exists, then past any newer ones
    // the listing missed.
    while !backend.contains(&seq_no_key(seq_no)).await? {
        seq_no -= 1;
        if seq_no == 0 {
            return Err(FsError::quiet("no file system found at this location"));
        }
    }
    while backend.contains(&seq_no_key(seq_no + 1)).await? {
        seq_no += 1;
    }

    for stale in seq_nos.iter().filter(|&&n| n < seq_no - 10) {
        let _ = backend.delete(&seq_no_key(*stale), true).await;
    }
    Ok(seq_no)
}

/// Rotate `metadata` through the backup slots.
async fn cycle_metadata(backend: &SharedBackend) -> FsResult<()> {
    debug!("rotating metadata backups");
    for slot in (0..METADATA_BAK_SLOTS).rev() {
        match backend
            .copy(&metadata_bak_key(slot), &metadata_bak_key(slot + 1), None)
            .await
        {
            Ok(()) => {}
            Err(BackendError::NoSuchObject(_)) => {}
            Err(err) => return Err(err.into()),
        }
    }
    match backend.copy(METADATA_KEY, &metadata_bak_key(0), None).await {
        Ok(()) => Ok(()),
        Err(BackendError::NoSuchObject(_)) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn delete_stale_seq_nos(backend: &SharedBackend, current: i64) -> FsResult<()> {
    let keys = list_all(backend.as_ref(), SEQ_NO_PREFIX).await?;
    for key in keys {
        if let Ok(seq) = key[SEQ_NO_PREFIX.len()..].parse::<i64>() {
            if seq < current - 10 {
                let _ = backend.delete(&key, true).await;
            }
        }
    }
    Ok(())
}

async fn download_db(
    backend: &SharedBackend,
    db_path: &Path,
    seq_no: i64,
) -> FsResult<(MetaDb, u64)> {
    let (dump, meta) = match backend.fetch(METADATA_KEY).await {
        Ok(res) => res,
        Err(BackendError::NoSuchObject(_)) => {
            return Err(FsError::quiet("file system metadata is missing from the backend"))
        }
        Err(err) => return Err(err.into()),
    };
    let blocksize = meta
        .get_int("max_obj_size")
        .ok_or_else(|| FsError::quiet("metadata object is missing the object size parameter"))?
        as u64;

    drop_local_db(db_path);
    let db = MetaDb::create(db_path).await?;
    let mut conn = db.acquire().await?;
    schema::create_tables(&mut conn).await?;
    dump::restore_metadata(&mut conn, &dump).await?;
    schema::create_indices(&mut conn).await?;
    schema::refresh_refcounts(&mut conn).await?;
    database::set_setting_int(&mut conn, "seq_no", seq_no).await?;
    database::set_setting_int(&mut conn, "max_obj_size", blocksize as i64).await?;
    drop(conn);
    info!(seq_no, "metadata downloaded and restored");
    Ok((db, blocksize))
}

/// Download the current metadata dump to a file, for offline inspection.
pub async fn download_metadata(
    raw: SharedBackend,
    passphrase: Option<&str>,
    dest: &Path,
) -> FsResult<()> {
    let retry: SharedBackend = Arc::new(RetryBackend::new(raw));
    let master = match passphrase {
        Some(passphrase) => Some(load_master_key_quiet(&retry, passphrase).await?),
        None => None,
    };
    let backend = CodecBackend::new(retry, Compression::Zlib, master);
    let (dump, _) = backend.fetch(METADATA_KEY).await?;
    std::fs::write(dest, dump).map_err(FsError::Io)
}

/// Change the wrapping passphrase of the master key.
pub async fn change_passphrase(
    raw: SharedBackend,
    old_passphrase: &str,
    new_passphrase: &str,
) -> FsResult<()> {
    let retry: SharedBackend = Arc::new(RetryBackend::new(raw));
    codec::change_passphrase(&retry, old_passphrase, new_passphrase)
        .await
        .map_err(|err| match err {
            BackendError::CorruptedObject { .. } => {
                FsError::quiet("wrong file-system passphrase")
            }
            BackendError::NoSuchObject(_) => {
                FsError::quiet("file system is not encrypted")
            }
            err => err.into(),
        })
}

/// Delete every object at the location, including the file system itself.
pub async fn clear_backend(raw: SharedBackend) -> FsResult<()> {
    let retry: SharedBackend = Arc::new(RetryBackend::new(raw));
    retry.clear().await.map_err(FsError::from)
}

fn local_db_tag(storage_url: &str) -> String {
    let digest: [u8; 32] = Sha256::digest(storage_url.as_bytes()).into();
    hex::encode(&digest[..8])
}

fn local_db_path(cachedir: &Path, storage_url: &str) -> PathBuf {
    cachedir.join(format!("{}.db", local_db_tag(storage_url)))
}

fn drop_local_db(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut victim = path.as_os_str().to_owned();
        victim.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(victim));
    }
}

/// Read the `dirty` marker.
pub async fn is_dirty(backend: &SharedBackend) -> FsResult<bool> {
    match backend.fetch(DIRTY_KEY).await {
        Ok((data, _)) => Ok(data == b"yes"),
        Err(BackendError::NoSuchObject(_)) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::backend::MemBackend;
    use crate::test_util::TempDir;

    fn seen(keys: &[String]) -> HashSet<&str> {
        keys.iter().map(|s| s.as_str()).collect()
    }

    #[tokio::test]
    async fn test_mkfs_creates_namespace() {
        let raw: SharedBackend = Arc::new(MemBackend::new());
        mkfs(Arc::clone(&raw), MkfsOptions::default()).await.unwrap();

        let keys = list_all(raw.as_ref(), "").await.unwrap();
        let keys = seen(&keys);
        assert!(keys.contains("metadata"));
        assert!(keys.contains("seq_no_1"));
        assert!(keys.contains("dirty"));
        assert!(!keys.contains("passphrase"));
    }

    #[tokio::test]
    async fn test_mkfs_refuses_existing_fs() {
        let raw: SharedBackend = Arc::new(MemBackend::new());
        mkfs(Arc::clone(&raw), MkfsOptions::default()).await.unwrap();
        let err = mkfs(Arc::clone(&raw), MkfsOptions::default()).await.unwrap_err();
        assert!(matches!(err, FsError::Quiet(_)));
    }

    #[tokio::test]
    async fn test_get_seq_no_walks_to_existing() {
        let raw: SharedBackend = Arc::new(MemBackend::new());
        for seq in [1i64, 2, 3] {
            raw.store(&seq_no_key(seq), b"", None).await.unwrap();
        }
        assert_eq!(get_seq_no(&raw).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_mount_unmount_cycle() {
        let dir = TempDir::new("mount-cycle");
        let raw: SharedBackend = Arc::new(MemBackend::new());
        mkfs(
            Arc::clone(&raw),
            MkfsOptions {
                blocksize: 500,
                uid: 1000,
                gid: 1000,
                ..MkfsOptions::default()
            },
        )
        .await
        .unwrap();

        let opts = MountOptions::new(dir.path(), "mem://test");
        let mount = Mount::open(Arc::clone(&raw), opts.clone()).await.unwrap();
        assert_eq!(mount.seq_no(), 1);
        assert_eq!(mount.fs.blocksize(), 500);
        assert!(is_dirty(&Arc::clone(&raw)).await.unwrap());
        mount.unmount().await.unwrap();

        assert!(!is_dirty(&raw).await.unwrap());
        let keys = list_all(raw.as_ref(), SEQ_NO_PREFIX).await.unwrap();
        assert!(seen(&keys).contains("seq_no_2"));

        // Remount picks up the bumped sequence and the clean local cache.
        let mount = Mount::open(Arc::clone(&raw), opts).await.unwrap();
        assert_eq!(mount.seq_no(), 2);
        mount.unmount().await.unwrap();
    }

    #[tokio::test]
    async fn test_unclean_shutdown_requires_fsck() {
        let dir = TempDir::new("mount-unclean");
        let raw: SharedBackend = Arc::new(MemBackend::new());
        mkfs(Arc::clone(&raw), MkfsOptions::default()).await.unwrap();

        let opts = MountOptions::new(dir.path(), "mem://unclean");
        let mount = Mount::open(Arc::clone(&raw), opts.clone()).await.unwrap();
        // Simulate a crash: drop the mount without unmounting.
        mount.db.close().await;
        drop(mount);

        let err = Mount::open(Arc::clone(&raw), opts).await.unwrap_err();
        assert!(matches!(err, FsError::Quiet(_)));
    }

    #[tokio::test]
    async fn test_metadata_backup_rotation() {
        let dir = TempDir::new("mount-rotation");
        let raw: SharedBackend = Arc::new(MemBackend::new());
        mkfs(Arc::clone(&raw), MkfsOptions::default()).await.unwrap();

        let opts = MountOptions::new(dir.path(), "mem://rot");
        for _ in 0..3 {
            let mount = Mount::open(Arc::clone(&raw), opts.clone()).await.unwrap();
            mount.unmount().await.unwrap();
        }

        let keys = list_all(raw.as_ref(), "metadata").await.unwrap();
        let keys = seen(&keys);
        assert!(keys.contains("metadata"));
        assert!(keys.contains("metadata_bak_0"));
        assert!(keys.contains("metadata_bak_1"));
        assert!(keys.contains("metadata_bak_2"));
    }

    #[tokio::test]
    async fn test_encrypted_mount_requires_passphrase() {
        let dir = TempDir::new("mount-encrypted");
        let raw: SharedBackend = Arc::new(MemBackend::new());
        mkfs(
            Arc::clone(&raw),
            MkfsOptions {
                passphrase: Some("correct horse".into()),
                ..MkfsOptions::default()
            },
        )
        .await
        .unwrap();

        let mut opts = MountOptions::new(dir.path(), "mem://enc");
        opts.passphrase = Some("wrong".into());
        let err = Mount::open(Arc::clone(&raw), opts.clone()).await.unwrap_err();
        assert!(matches!(err, FsError::Quiet(_)));

        opts.passphrase = Some("correct horse".into());
        let mount = Mount::open(Arc::clone(&raw), opts).await.unwrap();
        mount.unmount().await.unwrap();
    }

    #[tokio::test]
    async fn test_change_passphrase_preserves_data_objects() {
        let dir = TempDir::new("mount-rewrap");
        let raw: SharedBackend = Arc::new(MemBackend::new());
        mkfs(
            Arc::clone(&raw),
            MkfsOptions {
                passphrase: Some("old".into()),
                ..MkfsOptions::default()
            },
        )
        .await
        .unwrap();

        change_passphrase(Arc::clone(&raw), "old", "new").await.unwrap();

        let mut opts = MountOptions::new(dir.path(), "mem://rewrap");
        opts.passphrase = Some("new".into());
        let mount = Mount::open(Arc::clone(&raw), opts).await.unwrap();
        mount.unmount().await.unwrap();
    }
}
