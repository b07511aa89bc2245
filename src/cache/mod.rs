//! # Block Cache
//!
//! Maps `(inode, blockno)` keys to file-backed cache entries holding the
//! plaintext of one block. The cache downloads blocks on miss, tracks
//! dirty state, deduplicates on content hash before upload, schedules
//! uploads and backend deletions, and enforces per-key mutual exclusion.
//!
//! Entry states per key:
//!
//! - *clean*: file matches the committed block
//! - *dirty*: written or truncated since the last commit
//! - *in transit*: picked up for upload; the key sits in the in-transit
//!   registry until the upload completes. A write during the upload
//!   leaves the entry dirty, and the next upload garbage-collects the
//!   superseded object through its refcount.
//! - removed: the owning inode went away and the entry was dropped
//!
//! Lock order is global file-system lock first, per-key lock second; the
//! global lock is never held while cache I/O runs. Eviction only touches
//! entries whose per-key lock is free.

use std::collections::HashSet;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

use crate::backend::{Backend, BackendError, SharedBackend};
use crate::common::{data_key, BlockId, InodeId, ObjectId};
use crate::database::{DatabaseError, MetaDb, Transaction};
use crate::error::FsError;

pub mod multilock;

pub use multilock::{CacheKey, MultiLock, MultiLockGuard};

/// Block cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding one file per cache entry.
    pub cachedir: PathBuf,

    /// Upper bound on cached bytes.
    pub max_size: u64,

    /// Upper bound on cache entries. Keeps the file-descriptor footprint
    /// bounded even for many tiny files.
    pub max_entries: usize,

    /// Concurrent upload limit.
    pub upload_workers: usize,

    /// Concurrent backend-delete limit.
    pub delete_workers: usize,

    /// How long a missing data object is re-polled before the miss is
    /// treated as data loss. Bridges eventual-consistency windows.
    pub download_retry: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cachedir: PathBuf::from("./cache"),
            max_size: 512 * 1024 * 1024,
            max_entries: 768,
            upload_workers: 25,
            delete_workers: 25,
            download_retry: Duration::from_secs(300),
        }
    }
}

/// Block cache errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A data object expected in the backend is missing or damaged. The
    /// file system has been marked damaged.
    #[error("lost block {blockno} of inode {inode}: {reason}")]
    LostBlock {
        inode: InodeId,
        blockno: u64,
        reason: String,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<CacheError> for FsError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::LostBlock {
                inode,
                blockno,
                reason,
            } => FsError::LostBlock {
                inode,
                blockno,
                reason,
            },
            CacheError::Backend(err) => FsError::Backend(err),
            CacheError::Database(err) => FsError::Database(err),
            CacheError::Io(err) => FsError::Io(err),
        }
    }
}

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// One file-backed cache entry. All access happens under the per-key
/// lock; the inner mutex only bridges the brief synchronous sections.
pub struct CacheEntry {
    inode: InodeId,
    blockno: u64,
    file: std::fs::File,
    path: PathBuf,
    size: u64,
    dirty: bool,
    /// Block row this entry was loaded from or last committed to.
    block_id: Option<BlockId>,
    /// Bumped on every mutation; lets an upload detect concurrent writes.
    seq: u64,
}

impl CacheEntry {
    /// Current length of the cached block.
    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Read at `offset`. Short reads occur at the end of the block.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read_at(buf, offset)
    }

    /// Write at `offset`, extending the block as needed.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        self.file.write_all_at(data, offset)?;
        self.size = self.size.max(offset + data.len() as u64);
        self.dirty = true;
        self.seq += 1;
        Ok(())
    }

    /// Truncate (or extend with zeros) to `len`.
    pub fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.file.set_len(len)?;
        self.size = len;
        self.dirty = true;
        self.seq += 1;
        Ok(())
    }

    fn read_all(&self) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; self.size as usize];
        let mut done = 0;
        while done < buf.len() {
            let n = self.file.read_at(&mut buf[done..], done as u64)?;
            if n == 0 {
                break;
            }
            done += n;
        }
        buf.truncate(done);
        Ok(buf)
    }
}

struct CacheMap {
    map: LruCache<CacheKey, Arc<Mutex<CacheEntry>>>,
    total_bytes: u64,
}

/// A dirty entry turned into work: the dedup transaction has committed,
/// the snapshot still has to reach the backend.
struct PreparedUpload {
    key: CacheKey,
    data: Vec<u8>,
    seq: u64,
    /// Object to upload, when the content was new.
    obj_id: Option<ObjectId>,
    /// Objects whose last reference went away in the dedup transaction;
    /// deleted from the backend after the upload commits.
    obsolete: Vec<ObjectId>,
}

/// The block cache.
pub struct BlockCache {
    backend: SharedBackend,
    db: MetaDb,
    config: CacheConfig,
    mlock: MultiLock,
    inner: Mutex<CacheMap>,
    in_transit: Mutex<HashSet<CacheKey>>,
    transit_done: Notify,
    upload_sem: Arc<Semaphore>,
    delete_sem: Arc<Semaphore>,
    expire_lock: tokio::sync::Mutex<()>,
    damaged: Arc<AtomicBool>,
}

impl BlockCache {
    pub fn new(
        backend: SharedBackend,
        db: MetaDb,
        config: CacheConfig,
        damaged: Arc<AtomicBool>,
    ) -> CacheResult<Self> {
        std::fs::create_dir_all(&config.cachedir)?;
        Ok(Self {
            backend,
            db,
            upload_sem: Arc::new(Semaphore::new(config.upload_workers.max(1))),
            delete_sem: Arc::new(Semaphore::new(config.delete_workers.max(1))),
            config,
            mlock: MultiLock::new(),
            inner: Mutex::new(CacheMap {
                map: LruCache::unbounded(),
                total_bytes: 0,
            }),
            in_transit: Mutex::new(HashSet::new()),
            transit_done: Notify::new(),
            expire_lock: tokio::sync::Mutex::new(()),
            damaged,
        })
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes held in cache files.
    pub fn cache_bytes(&self) -> u64 {
        self.inner.lock().total_bytes
    }

    /// Whether the key is currently being uploaded.
    pub fn is_in_transit(&self, key: CacheKey) -> bool {
        self.in_transit.lock().contains(&key)
    }

    fn mark_damaged(&self, why: &str) {
        if !self.damaged.swap(true, Ordering::SeqCst) {
            warn!("file system marked damaged: {}", why);
        }
    }

    fn entry_path(&self, key: CacheKey) -> PathBuf {
        self.config
            .cachedir
            .join(format!("inode_{}_block_{}", key.0, key.1))
    }

    /// Run `f` on the cache entry for `(inode, blockno)`, creating or
    /// downloading it first as needed.
    ///
    /// The caller must not hold the global file-system lock: this method
    /// performs backend I/O under the per-key lock only, so unrelated
    /// operations keep making progress.
    pub async fn with_entry<R, F>(&self, inode: InodeId, blockno: u64, f: F) -> CacheResult<R>
    where
        F: FnOnce(&mut CacheEntry) -> std::io::Result<R>,
    {
        let key = (inode, blockno);
        let guard = self.mlock.lock(key).await;
        let entry = self.lookup_or_fetch(key).await?;
        let result = {
            let mut locked = entry.lock();
            let before = locked.size;
            let result = f(&mut locked)?;
            let after = locked.size;
            drop(locked);
            let mut inner = self.inner.lock();
            inner.total_bytes = inner.total_bytes.saturating_sub(before) + after;
            result
        };
        drop(guard);
        self.ensure_capacity().await?;
        Ok(result)
    }

    /// Entry lookup with download on miss. Caller holds the per-key lock.
    async fn lookup_or_fetch(&self, key: CacheKey) -> CacheResult<Arc<Mutex<CacheEntry>>> {
        if let Some(entry) = self.inner.lock().map.get(&key) {
            return Ok(Arc::clone(entry));
        }

        let mut conn = self.db.acquire().await?;
        let row = sqlx::query(
            "SELECT blocks.id, blocks.obj_id FROM inode_blocks
             JOIN blocks ON blocks.id = inode_blocks.block_id
             WHERE inode_blocks.inode = ? AND inode_blocks.blockno = ?",
        )
        .bind(key.0)
        .bind(key.1 as i64)
        .fetch_optional(&mut *conn)
        .await
        .map_err(DatabaseError::from)?;
        drop(conn);

        let path = self.entry_path(key);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let (block_id, size) = match row {
            Some(row) => {
                let block_id: BlockId = row.get(0);
                let obj_id: ObjectId = row.get(1);
                let data = self.fetch_object(key, obj_id).await?;
                file.write_all_at(&data, 0)?;
                (Some(block_id), data.len() as u64)
            }
            None => (None, 0),
        };

        let entry = Arc::new(Mutex::new(CacheEntry {
            inode: key.0,
            blockno: key.1,
            file,
            path,
            size,
            dirty: false,
            block_id,
            seq: 0,
        }));
        let mut inner = self.inner.lock();
        inner.total_bytes += size;
        inner.map.put(key, Arc::clone(&entry));
        Ok(entry)
    }

    /// Download one data object, waiting out eventual-consistency windows.
    async fn fetch_object(&self, key: CacheKey, obj_id: ObjectId) -> CacheResult<Vec<u8>> {
        let started = Instant::now();
        let mut delay = Duration::from_millis(200);
        loop {
            match self.backend.fetch(&data_key(obj_id)).await {
                Ok((data, _)) => return Ok(data),
                Err(BackendError::NoSuchObject(_))
                    if started.elapsed() < self.config.download_retry =>
                {
                    debug!(
                        obj_id,
                        "data object not yet visible, retrying download"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(10));
                }
                Err(err @ BackendError::NoSuchObject(_)) => {
                    self.mark_damaged("data object missing from backend");
                    return Err(CacheError::LostBlock {
                        inode: key.0,
                        blockno: key.1,
                        reason: err.to_string(),
                    });
                }
                Err(
                    err @ (BackendError::CorruptedObject { .. } | BackendError::BadDigest(_)),
                ) => {
                    self.mark_damaged("data object failed integrity check");
                    return Err(CacheError::LostBlock {
                        inode: key.0,
                        blockno: key.1,
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Deduplicate a dirty entry and commit the metadata changes. Caller
    /// holds the per-key lock. Returns the remaining network work, or
    /// `None` if the entry was not dirty.
    async fn prepare_upload(
        &self,
        key: CacheKey,
        entry: &Arc<Mutex<CacheEntry>>,
    ) -> CacheResult<Option<PreparedUpload>> {
        let (data, seq) = {
            let locked = entry.lock();
            if !locked.dirty {
                return Ok(None);
            }
            (locked.read_all()?, locked.seq)
        };

        let hash: [u8; 32] = Sha256::digest(&data).into();
        let size = data.len() as u64;

        let mut tx = self.db.begin().await?;
        let outcome = Self::dedup_in_txn(&mut tx, key, &hash, size).await;
        let (block_id, obj_id, obsolete) = match outcome {
            Ok(outcome) => {
                tx.commit().await?;
                outcome
            }
            Err(err) => {
                let _ = tx.rollback().await;
                return Err(err);
            }
        };

        entry.lock().block_id = Some(block_id);
        if obj_id.is_some() {
            self.in_transit.lock().insert(key);
        }
        debug!(
            inode = key.0,
            blockno = key.1,
            block_id,
            need_upload = obj_id.is_some(),
            "block committed"
        );
        Ok(Some(PreparedUpload {
            key,
            data,
            seq,
            obj_id,
            obsolete,
        }))
    }

    /// The deduplication transaction: link the key's mapping to a block
    /// with this content hash, creating block and object rows when the
    /// hash is new, and unlink the previous block.
    async fn dedup_in_txn(
        tx: &mut Transaction,
        key: CacheKey,
        hash: &[u8; 32],
        size: u64,
    ) -> CacheResult<(BlockId, Option<ObjectId>, Vec<ObjectId>)> {
        let existing = sqlx::query("SELECT id FROM blocks WHERE hash = ?")
            .bind(hash.as_slice())
            .fetch_optional(tx.conn())
            .await
            .map_err(DatabaseError::from)?;

        let (block_id, obj_id) = match existing {
            Some(row) => {
                let block_id: BlockId = row.get(0);
                sqlx::query("UPDATE blocks SET refcount = refcount + 1 WHERE id = ?")
                    .bind(block_id)
                    .execute(tx.conn())
                    .await
                    .map_err(DatabaseError::from)?;
                (block_id, None)
            }
            None => {
                let res = sqlx::query(
                    "INSERT INTO objects (refcount, hash, size) VALUES (1, ?, ?)",
                )
                .bind(hash.as_slice())
                .bind(size as i64)
                .execute(tx.conn())
                .await
                .map_err(DatabaseError::from)?;
                let obj_id = res.last_insert_rowid();
                let res = sqlx::query(
                    "INSERT INTO blocks (hash, refcount, size, obj_id) VALUES (?, 1, ?, ?)",
                )
                .bind(hash.as_slice())
                .bind(size as i64)
                .bind(obj_id)
                .execute(tx.conn())
                .await
                .map_err(DatabaseError::from)?;
                (res.last_insert_rowid(), Some(obj_id))
            }
        };

        let old_row = sqlx::query(
            "SELECT block_id FROM inode_blocks WHERE inode = ? AND blockno = ?",
        )
        .bind(key.0)
        .bind(key.1 as i64)
        .fetch_optional(tx.conn())
        .await
        .map_err(DatabaseError::from)?;
        let old_block: Option<BlockId> = old_row.map(|row| row.get(0));

        match old_block {
            Some(_) => {
                sqlx::query(
                    "UPDATE inode_blocks SET block_id = ? WHERE inode = ? AND blockno = ?",
                )
                .bind(block_id)
                .bind(key.0)
                .bind(key.1 as i64)
                .execute(tx.conn())
                .await
                .map_err(DatabaseError::from)?;
            }
            None => {
                sqlx::query(
                    "INSERT INTO inode_blocks (inode, blockno, block_id) VALUES (?, ?, ?)",
                )
                .bind(key.0)
                .bind(key.1 as i64)
                .bind(block_id)
                .execute(tx.conn())
                .await
                .map_err(DatabaseError::from)?;
            }
        }

        let mut obsolete = Vec::new();
        if let Some(old_id) = old_block {
            Self::drop_block_ref(tx, old_id, &mut obsolete).await?;
        }
        Ok((block_id, obj_id, obsolete))
    }

    /// Decrement a block's refcount; on zero, drop the block and its
    /// object reference, remembering objects that need a backend delete.
    async fn drop_block_ref(
        tx: &mut Transaction,
        block_id: BlockId,
        obsolete: &mut Vec<ObjectId>,
    ) -> CacheResult<()> {
        let row = sqlx::query("SELECT refcount, obj_id FROM blocks WHERE id = ?")
            .bind(block_id)
            .fetch_one(tx.conn())
            .await
            .map_err(DatabaseError::from)?;
        let refcount: i64 = row.get(0);
        let obj_id: ObjectId = row.get(1);

        if refcount > 1 {
            sqlx::query("UPDATE blocks SET refcount = refcount - 1 WHERE id = ?")
                .bind(block_id)
                .execute(tx.conn())
                .await
                .map_err(DatabaseError::from)?;
            return Ok(());
        }

        sqlx::query("DELETE FROM blocks WHERE id = ?")
            .bind(block_id)
            .execute(tx.conn())
            .await
            .map_err(DatabaseError::from)?;

        let row = sqlx::query("SELECT refcount FROM objects WHERE id = ?")
            .bind(obj_id)
            .fetch_one(tx.conn())
            .await
            .map_err(DatabaseError::from)?;
        let obj_refcount: i64 = row.get(0);
        if obj_refcount > 1 {
            sqlx::query("UPDATE objects SET refcount = refcount - 1 WHERE id = ?")
                .bind(obj_id)
                .execute(tx.conn())
                .await
                .map_err(DatabaseError::from)?;
        } else {
            sqlx::query("DELETE FROM objects WHERE id = ?")
                .bind(obj_id)
                .execute(tx.conn())
                .await
                .map_err(DatabaseError::from)?;
            obsolete.push(obj_id);
        }
        Ok(())
    }

    /// Carry out the network side of a prepared upload: store the object
    /// (if the content was new), record its stored size, then delete
    /// objects orphaned by the dedup transaction. On success the entry is
    /// marked clean unless it was written in the meantime.
    async fn perform_upload(
        &self,
        prep: PreparedUpload,
        entry: Option<&Arc<Mutex<CacheEntry>>>,
    ) -> CacheResult<()> {
        let key = prep.key;
        let result = self.perform_upload_inner(&prep).await;

        if prep.obj_id.is_some() {
            self.in_transit.lock().remove(&key);
            self.transit_done.notify_waiters();
        }

        match result {
            Ok(()) => {
                if let Some(entry) = entry {
                    let mut locked = entry.lock();
                    if locked.seq == prep.seq {
                        locked.dirty = false;
                    }
                }
                Ok(())
            }
            Err(err) => {
                self.mark_damaged("block upload failed");
                Err(err)
            }
        }
    }

    async fn perform_upload_inner(&self, prep: &PreparedUpload) -> CacheResult<()> {
        if let Some(obj_id) = prep.obj_id {
            let _permit = self
                .upload_sem
                .acquire()
                .await
                .expect("upload semaphore never closes");
            let stored = self
                .backend
                .store(&data_key(obj_id), &prep.data, None)
                .await?;
            let mut conn = self.db.acquire().await?;
            sqlx::query("UPDATE objects SET compr_size = ? WHERE id = ?")
                .bind(stored as i64)
                .bind(obj_id)
                .execute(&mut *conn)
                .await
                .map_err(DatabaseError::from)?;
        }
        for obj_id in &prep.obsolete {
            let _permit = self
                .delete_sem
                .acquire()
                .await
                .expect("delete semaphore never closes");
            debug!(obj_id, "no references left, deleting data object");
            self.backend.delete(&data_key(*obj_id), true).await?;
        }
        Ok(())
    }

    /// Upload one key if its entry is dirty. The per-key lock is released
    /// during the network transfer, so writers are not blocked; a write
    /// racing the upload leaves the entry dirty.
    async fn flush_key(&self, key: CacheKey) -> CacheResult<()> {
        let (entry, prep) = {
            let _guard = self.mlock.lock(key).await;
            let entry = match self.inner.lock().map.get(&key) {
                Some(entry) => Arc::clone(entry),
                None => return Ok(()),
            };
            let prep = self.prepare_upload(key, &entry).await?;
            (entry, prep)
        };
        if let Some(prep) = prep {
            self.perform_upload(prep, Some(&entry)).await?;
        }
        Ok(())
    }

    /// Upload all dirty entries of one inode.
    pub async fn flush(&self, inode: InodeId) -> CacheResult<()> {
        let keys = self.collect_keys(|key, entry| key.0 == inode && entry.dirty);
        for key in keys {
            self.flush_key(key).await?;
        }
        Ok(())
    }

    /// Upload every dirty entry. Uploads run concurrently, bounded by the
    /// upload worker limit.
    pub async fn flush_all(&self) -> CacheResult<()> {
        let keys = self.collect_keys(|_, entry| entry.dirty);
        debug!(count = keys.len(), "flushing dirty blocks");
        let results = futures::future::join_all(keys.into_iter().map(|key| self.flush_key(key)))
            .await;
        for result in results {
            result?;
        }
        Ok(())
    }

    fn collect_keys<F>(&self, mut pred: F) -> Vec<CacheKey>
    where
        F: FnMut(CacheKey, &CacheEntry) -> bool,
    {
        self.inner
            .lock()
            .map
            .iter()
            .filter(|(key, entry)| pred(**key, &entry.lock()))
            .map(|(key, _)| *key)
            .collect()
    }

    fn over_limits(&self) -> bool {
        let inner = self.inner.lock();
        inner.total_bytes > self.config.max_size || inner.map.len() > self.config.max_entries
    }

    /// Evict least-recently-used entries until both bounds hold. Runs
    /// single-flight; concurrent callers wait for the running pass.
    pub async fn ensure_capacity(&self) -> CacheResult<()> {
        if !self.over_limits() {
            return Ok(());
        }
        let _flight = self.expire_lock.lock().await;
        while self.over_limits() {
            if !self.expire_round().await? {
                // Every candidate was locked; give the holders a moment.
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }
        Ok(())
    }

    /// One eviction round over up to 25 LRU candidates. Returns whether
    /// any entry was evicted.
    async fn expire_round(&self) -> CacheResult<bool> {
        let candidates: Vec<CacheKey> = {
            let inner = self.inner.lock();
            let len = inner.map.len();
            let take = len.min(25);
            // iter() walks most-recently-used first; the tail holds the
            // eviction candidates.
            inner
                .map
                .iter()
                .skip(len - take)
                .map(|(key, _)| *key)
                .collect()
        };
        if candidates.is_empty() {
            return Ok(false);
        }
        let results = futures::future::join_all(
            candidates.into_iter().map(|key| self.evict_one(key)),
        )
        .await;
        let mut progress = false;
        for result in results {
            progress |= result?;
        }
        Ok(progress)
    }

    /// Evict one entry if its lock is free, uploading it first when
    /// dirty. The per-key lock is held through the upload so that a miss
    /// cannot re-download an object that has not reached the backend yet.
    async fn evict_one(&self, key: CacheKey) -> CacheResult<bool> {
        let Some(_guard) = self.mlock.try_lock(key) else {
            return Ok(false);
        };
        let entry = match self.inner.lock().map.peek(&key) {
            Some(entry) => Arc::clone(entry),
            None => return Ok(false),
        };
        if let Some(prep) = self.prepare_upload(key, &entry).await? {
            self.perform_upload(prep, Some(&entry)).await?;
        }
        self.drop_entry(key);
        Ok(true)
    }

    /// Remove an entry from the map and delete its cache file. Caller
    /// holds the per-key lock.
    fn drop_entry(&self, key: CacheKey) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.map.pop(&key) {
            let locked = entry.lock();
            inner.total_bytes -= locked.size.min(inner.total_bytes);
            if let Err(err) = std::fs::remove_file(&locked.path) {
                warn!(
                    inode = locked.inode,
                    blockno = locked.blockno,
                    "failed to unlink cache file: {}",
                    err
                );
            }
        }
    }

    /// Drop all cache entries and block mappings of `inode` at or above
    /// `from_blockno`, decrementing refcounts and deleting orphaned
    /// backend objects with bounded parallelism.
    pub async fn remove(&self, inode: InodeId, from_blockno: u64) -> CacheResult<()> {
        debug!(inode, from_blockno, "removing blocks");

        let keys = self.collect_keys(|key, _| key.0 == inode && key.1 >= from_blockno);
        for key in keys {
            let _guard = self.mlock.lock(key).await;
            self.drop_entry(key);
        }

        let mut handles = Vec::new();
        loop {
            let mut tx = self.db.begin().await?;
            let row = sqlx::query(
                "SELECT blockno, block_id FROM inode_blocks
                 WHERE inode = ? AND blockno >= ? LIMIT 1",
            )
            .bind(inode)
            .bind(from_blockno as i64)
            .fetch_optional(tx.conn())
            .await
            .map_err(DatabaseError::from)?;
            let Some(row) = row else {
                tx.rollback().await?;
                break;
            };
            let blockno: i64 = row.get(0);
            let block_id: BlockId = row.get(1);

            sqlx::query("DELETE FROM inode_blocks WHERE inode = ? AND blockno = ?")
                .bind(inode)
                .bind(blockno)
                .execute(tx.conn())
                .await
                .map_err(DatabaseError::from)?;

            let mut obsolete = Vec::new();
            match Self::drop_block_ref(&mut tx, block_id, &mut obsolete).await {
                Ok(()) => tx.commit().await?,
                Err(err) => {
                    let _ = tx.rollback().await;
                    return Err(err);
                }
            }

            for obj_id in obsolete {
                let backend = Arc::clone(&self.backend);
                let sem = Arc::clone(&self.delete_sem);
                handles.push(tokio::spawn(async move {
                    let _permit = sem.acquire_owned().await.expect("semaphore never closes");
                    backend.delete(&data_key(obj_id), true).await
                }));
            }
        }

        for handle in handles {
            handle
                .await
                .map_err(|err| CacheError::Io(std::io::Error::other(err)))??;
        }
        Ok(())
    }

    /// Wait until none of `keys` is in transit any more.
    pub async fn wait_in_transit(&self, keys: &HashSet<CacheKey>) {
        loop {
            let pending = {
                let transit = self.in_transit.lock();
                keys.iter().any(|key| transit.contains(key))
            };
            if !pending {
                return;
            }
            self.transit_done.notified().await;
        }
    }

    /// Re-register cache files left behind by a crashed mount. They are
    /// conservatively treated as dirty and re-uploaded on the next flush.
    pub async fn recover(&self) -> CacheResult<()> {
        if !self.is_empty() {
            return Err(CacheError::Io(std::io::Error::other(
                "recover() called on a non-empty cache",
            )));
        }
        for dir_entry in std::fs::read_dir(&self.config.cachedir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            let name = name.to_string_lossy();
            let Some(key) = parse_entry_name(&name) else {
                return Err(CacheError::Io(std::io::Error::other(format!(
                    "unexpected file in cache directory: {}",
                    name
                ))));
            };

            let mut conn = self.db.acquire().await?;
            let row = sqlx::query(
                "SELECT block_id FROM inode_blocks WHERE inode = ? AND blockno = ?",
            )
            .bind(key.0)
            .bind(key.1 as i64)
            .fetch_optional(&mut *conn)
            .await
            .map_err(DatabaseError::from)?;
            let block_id: Option<BlockId> = row.map(|row| row.get(0));
            drop(conn);

            let path = dir_entry.path();
            let file = std::fs::OpenOptions::new().read(true).write(true).open(&path)?;
            let size = file.metadata()?.len();
            debug!(inode = key.0, blockno = key.1, size, "recovered cache file");

            let entry = Arc::new(Mutex::new(CacheEntry {
                inode: key.0,
                blockno: key.1,
                file,
                path,
                size,
                dirty: true,
                block_id,
                seq: 1,
            }));
            let mut inner = self.inner.lock();
            inner.total_bytes += size;
            inner.map.put(key, entry);
        }
        Ok(())
    }

    /// Upload all dirty data and empty the cache. Pending uploads and
    /// deletions are drained before returning.
    pub async fn clear(&self) -> CacheResult<()> {
        debug!("clearing block cache");
        self.flush_all().await?;
        loop {
            let keys = self.collect_keys(|_, _| true);
            if keys.is_empty() {
                break;
            }
            let mut progress = false;
            for key in keys {
                progress |= self.evict_one(key).await?;
            }
            if !progress {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }
        // All uploads were awaited by flush/evict; the registry must be
        // empty by now.
        debug_assert!(self.in_transit.lock().is_empty());
        Ok(())
    }
}

fn parse_entry_name(name: &str) -> Option<CacheKey> {
    let rest = name.strip_prefix("inode_")?;
    let (inode, rest) = rest.split_once("_block_")?;
    Some((inode.parse().ok()?, rest.parse().ok()?))
}

#[cfg(test)]
mod tests;
