//! Write-behind cache of inode attribute rows.
//!
//! Inode attributes are read on every request, so rows are cached in
//! memory and written back lazily: on eviction, on `flush_id` and on
//! `flush_all`. A single monotonic allocator hands out inode ids; ids are
//! never reused, so the 32-bit id space can run out, which surfaces as
//! `OutOfInodes` (ENOSPC to the caller).

use std::num::NonZeroUsize;

use lru::LruCache;
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::debug;

use crate::common::{InodeId, MAX_INODE};
use crate::database::{DbResult, MetaDb};
use crate::error::{FsError, FsResult};

/// Default number of cached inode rows.
pub const DEFAULT_CAPACITY: usize = 4096;

/// One inode attribute row.
#[derive(Debug, Clone, PartialEq)]
pub struct Inode {
    pub id: InodeId,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_ns: i64,
    pub atime_ns: i64,
    pub ctime_ns: i64,
    pub refcount: i64,
    pub size: u64,
    pub rdev: u64,
    pub locked: bool,
}

impl Inode {
    pub fn is_dir(&self) -> bool {
        self.mode & 0o170_000 == 0o040_000
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & 0o170_000 == 0o120_000
    }

    pub fn is_regular(&self) -> bool {
        self.mode & 0o170_000 == 0o100_000
    }
}

/// Attributes of an inode to be created.
#[derive(Debug, Clone)]
pub struct NewInode {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_ns: i64,
    pub atime_ns: i64,
    pub ctime_ns: i64,
    pub refcount: i64,
    pub size: u64,
    pub rdev: u64,
}

struct CachedInode {
    inode: Inode,
    dirty: bool,
}

struct CacheInner {
    map: LruCache<InodeId, CachedInode>,
    next_id: InodeId,
}

/// Bounded write-behind cache of inode rows.
pub struct InodeCache {
    db: MetaDb,
    inner: Mutex<CacheInner>,
}

impl InodeCache {
    /// Create the cache and position the id allocator after the highest
    /// existing inode.
    pub async fn new(db: MetaDb, capacity: usize) -> DbResult<Self> {
        let mut conn = db.acquire().await?;
        let row = sqlx::query("SELECT COALESCE(MAX(id), 0) FROM inodes")
            .fetch_one(&mut *conn)
            .await?;
        let next_id: InodeId = row.get::<i64, _>(0) + 1;
        drop(conn);
        Ok(Self {
            db,
            inner: Mutex::new(CacheInner {
                map: LruCache::new(
                    NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one"),
                ),
                next_id,
            }),
        })
    }

    /// Look up an inode, loading it from the database on a miss.
    pub async fn get(&self, id: InodeId) -> FsResult<Inode> {
        let mut inner = self.inner.lock().await;
        if let Some(cached) = inner.map.get(&id) {
            return Ok(cached.inode.clone());
        }
        let inode = self.load_row(id).await?.ok_or(FsError::NotFound)?;
        self.insert_locked(&mut *inner, inode.clone(), false).await?;
        Ok(inode)
    }

    /// Apply `f` to the cached inode and mark it dirty. Returns the
    /// updated attributes.
    pub async fn modify<F>(&self, id: InodeId, f: F) -> FsResult<Inode>
    where
        F: FnOnce(&mut Inode),
    {
        let mut inner = self.inner.lock().await;
        if inner.map.get(&id).is_none() {
            let inode = self.load_row(id).await?.ok_or(FsError::NotFound)?;
            self.insert_locked(&mut *inner, inode, false).await?;
        }
        let cached = inner.map.get_mut(&id).expect("just inserted");
        f(&mut cached.inode);
        cached.dirty = true;
        Ok(cached.inode.clone())
    }

    /// Allocate an id and insert a new inode row.
    pub async fn create(&self, attrs: NewInode) -> FsResult<Inode> {
        let mut inner = self.inner.lock().await;
        if inner.next_id > MAX_INODE {
            return Err(FsError::OutOfInodes);
        }
        let id = inner.next_id;
        inner.next_id += 1;

        let inode = Inode {
            id,
            mode: attrs.mode,
            uid: attrs.uid,
            gid: attrs.gid,
            mtime_ns: attrs.mtime_ns,
            atime_ns: attrs.atime_ns,
            ctime_ns: attrs.ctime_ns,
            refcount: attrs.refcount,
            size: attrs.size,
            rdev: attrs.rdev,
            locked: false,
        };

        let mut conn = self.db.acquire().await.map_err(FsError::from)?;
        sqlx::query(
            "INSERT INTO inodes
             (id, mode, uid, gid, mtime_ns, atime_ns, ctime_ns, refcount, size, rdev, locked)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(inode.id)
        .bind(inode.mode as i64)
        .bind(inode.uid as i64)
        .bind(inode.gid as i64)
        .bind(inode.mtime_ns)
        .bind(inode.atime_ns)
        .bind(inode.ctime_ns)
        .bind(inode.refcount)
        .bind(inode.size as i64)
        .bind(inode.rdev as i64)
        .execute(&mut *conn)
        .await?;
        drop(conn);

        self.insert_locked(&mut *inner, inode.clone(), false).await?;
        Ok(inode)
    }

    /// Drop the inode row and forget the cached copy.
    pub async fn delete(&self, id: InodeId) -> FsResult<()> {
        let mut inner = self.inner.lock().await;
        inner.map.pop(&id);
        let mut conn = self.db.acquire().await.map_err(FsError::from)?;
        sqlx::query("DELETE FROM inodes WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Write back the row of one inode if dirty.
    pub async fn flush_id(&self, id: InodeId) -> FsResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(cached) = inner.map.get_mut(&id) {
            if cached.dirty {
                let inode = cached.inode.clone();
                cached.dirty = false;
                self.write_row(&inode).await?;
            }
        }
        Ok(())
    }

    /// Write back every dirty row.
    pub async fn flush_all(&self) -> FsResult<()> {
        let mut inner = self.inner.lock().await;
        let dirty: Vec<Inode> = inner
            .map
            .iter_mut()
            .filter(|(_, cached)| cached.dirty)
            .map(|(_, cached)| {
                cached.dirty = false;
                cached.inode.clone()
            })
            .collect();
        debug!(count = dirty.len(), "flushing dirty inode rows");
        for inode in dirty {
            self.write_row(&inode).await?;
        }
        Ok(())
    }

    async fn insert_locked(
        &self,
        inner: &mut CacheInner,
        inode: Inode,
        dirty: bool,
    ) -> FsResult<()> {
        if inner.map.len() == inner.map.cap().get() {
            if let Some((_, evicted)) = inner.map.pop_lru() {
                if evicted.dirty {
                    self.write_row(&evicted.inode).await?;
                }
            }
        }
        inner.map.put(inode.id, CachedInode { inode, dirty });
        Ok(())
    }

    async fn load_row(&self, id: InodeId) -> FsResult<Option<Inode>> {
        let mut conn = self.db.acquire().await.map_err(FsError::from)?;
        let row = sqlx::query(
            "SELECT mode, uid, gid, mtime_ns, atime_ns, ctime_ns, refcount, size, rdev, locked
             FROM inodes WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.map(|row| Inode {
            id,
            mode: row.get::<i64, _>(0) as u32,
            uid: row.get::<i64, _>(1) as u32,
            gid: row.get::<i64, _>(2) as u32,
            mtime_ns: row.get(3),
            atime_ns: row.get(4),
            ctime_ns: row.get(5),
            refcount: row.get(6),
            size: row.get::<i64, _>(7) as u64,
            rdev: row.get::<i64, _>(8) as u64,
            locked: row.get::<i64, _>(9) != 0,
        }))
    }

    async fn write_row(&self, inode: &Inode) -> FsResult<()> {
        let mut conn = self.db.acquire().await.map_err(FsError::from)?;
        sqlx::query(
            "UPDATE inodes SET mode = ?, uid = ?, gid = ?, mtime_ns = ?, atime_ns = ?,
             ctime_ns = ?, refcount = ?, size = ?, rdev = ?, locked = ? WHERE id = ?",
        )
        .bind(inode.mode as i64)
        .bind(inode.uid as i64)
        .bind(inode.gid as i64)
        .bind(inode.mtime_ns)
        .bind(inode.atime_ns)
        .bind(inode.ctime_ns)
        .bind(inode.refcount)
        .bind(inode.size as i64)
        .bind(inode.rdev as i64)
        .bind(inode.locked as i64)
        .bind(inode.id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}
