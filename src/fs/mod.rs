//! # File-System Operations
//!
//! Translates inode-level operations into block-cache access and metadata
//! transactions. This is the layer a FUSE adapter calls into: every
//! operation takes and returns plain ids and attribute structs, never
//! kernel types.
//!
//! Operations enter holding the global file-system lock. Before any
//! backend or cache I/O the lock is dropped, so long-running transfers do
//! not stall unrelated requests; it is reacquired for the trailing
//! metadata updates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sqlx::Row;
use tracing::{debug, warn};

use crate::cache::BlockCache;
use crate::common::{now_ns, InodeId, NameId, CTRL_INODE, CTRL_NAME, ROOT_INODE};
use crate::database::{DatabaseError, MetaDb, Transaction};
use crate::error::{FsError, FsResult};
use crate::inode::{Inode, InodeCache, NewInode};

pub mod ctrl;
pub mod tree;

/// Caller identity for operations that create inodes.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub uid: u32,
    pub gid: u32,
}

/// One readdir result row.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: Vec<u8>,
    pub inode: Inode,
    /// Opaque cursor; pass to the next readdir call.
    pub cursor: i64,
}

/// Attribute changes for `setattr`. `None` fields stay untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime_ns: Option<i64>,
    pub mtime_ns: Option<i64>,
    pub ctime_ns: Option<i64>,
    pub rdev: Option<u64>,
}

/// statfs-style totals. Counts are doubled so that an unbounded store
/// shows up as a half-full file system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub f_bsize: u64,
    pub f_frsize: u64,
    pub f_blocks: u64,
    pub f_bfree: u64,
    pub f_bavail: u64,
    pub f_files: u64,
    pub f_ffree: u64,
    pub f_favail: u64,
}

/// The mounted file-system core.
pub struct Fs {
    pub(crate) db: MetaDb,
    pub(crate) inodes: InodeCache,
    pub(crate) cache: BlockCache,
    /// Global file-system lock; see the module documentation.
    pub(crate) lock: tokio::sync::Mutex<()>,
    open_inodes: Mutex<HashMap<InodeId, u64>>,
    damaged: Arc<AtomicBool>,
    blocksize: u64,
}

impl Fs {
    pub fn new(
        db: MetaDb,
        inodes: InodeCache,
        cache: BlockCache,
        blocksize: u64,
        damaged: Arc<AtomicBool>,
    ) -> Self {
        assert!(blocksize > 0, "block size must be positive");
        Self {
            db,
            inodes,
            cache,
            lock: tokio::sync::Mutex::new(()),
            open_inodes: Mutex::new(HashMap::new()),
            damaged,
            blocksize,
        }
    }

    /// Maximum object (block) size of this file system.
    pub fn blocksize(&self) -> u64 {
        self.blocksize
    }

    /// Whether an invariant break or unrecoverable I/O error was observed.
    pub fn is_damaged(&self) -> bool {
        self.damaged.load(Ordering::SeqCst)
    }

    /// Record that an invariant break or unrecoverable error was
    /// observed. Called by the adapter layer for unexpected failures;
    /// only a file-system check clears the state again.
    pub fn mark_damaged(&self, why: &str) {
        if !self.damaged.swap(true, Ordering::SeqCst) {
            warn!("file system marked damaged: {}", why);
        }
    }

    /// Flush all caches: every dirty block is committed and uploaded,
    /// every dirty inode row written back.
    pub async fn sync_all(&self) -> FsResult<()> {
        self.cache.flush_all().await.map_err(FsError::from)?;
        self.inodes.flush_all().await?;
        Ok(())
    }

    /// Upload all dirty state and empty the block cache. Used by unmount.
    pub async fn destroy(&self) -> FsResult<()> {
        self.cache.clear().await.map_err(FsError::from)?;
        self.inodes.flush_all().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookup and attributes
    // ------------------------------------------------------------------

    /// Look up `name` under the directory `parent`.
    pub async fn lookup(&self, parent: InodeId, name: &[u8]) -> FsResult<Inode> {
        let _guard = self.lock.lock().await;
        self.lookup_locked(parent, name).await
    }

    pub(crate) async fn lookup_locked(&self, parent: InodeId, name: &[u8]) -> FsResult<Inode> {
        if name == CTRL_NAME {
            return self.inodes.get(CTRL_INODE).await;
        }
        if name == b"." {
            return self.inodes.get(parent).await;
        }
        if name == b".." {
            let mut conn = self.db.acquire().await?;
            let row = sqlx::query("SELECT parent_inode FROM contents WHERE inode = ? LIMIT 1")
                .bind(parent)
                .fetch_optional(&mut *conn)
                .await
                .map_err(DatabaseError::from)?;
            let id = row.map(|r| r.get::<i64, _>(0)).unwrap_or(ROOT_INODE);
            return self.inodes.get(id).await;
        }
        let id = self.lookup_id(parent, name).await?.ok_or(FsError::NotFound)?;
        self.inodes.get(id).await
    }

    async fn lookup_id(&self, parent: InodeId, name: &[u8]) -> FsResult<Option<InodeId>> {
        let mut conn = self.db.acquire().await?;
        let row = sqlx::query(
            "SELECT contents.inode FROM contents
             JOIN names ON names.id = contents.name_id
             WHERE contents.parent_inode = ? AND names.name = ?",
        )
        .bind(parent)
        .bind(name)
        .fetch_optional(&mut *conn)
        .await
        .map_err(DatabaseError::from)?;
        Ok(row.map(|r| r.get(0)))
    }

    /// Read the attributes of `id`.
    pub async fn getattr(&self, id: InodeId) -> FsResult<Inode> {
        let _guard = self.lock.lock().await;
        self.inodes.get(id).await
    }

    /// Read a symlink target.
    pub async fn readlink(&self, id: InodeId) -> FsResult<Vec<u8>> {
        let _guard = self.lock.lock().await;
        let inode = self.inodes.get(id).await?;
        if inode.atime_ns < inode.ctime_ns || inode.atime_ns < inode.mtime_ns {
            self.inodes
                .modify(id, |inode| inode.atime_ns = now_ns())
                .await?;
        }
        let mut conn = self.db.acquire().await?;
        let row = sqlx::query("SELECT target FROM symlink_targets WHERE inode = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(DatabaseError::from)?;
        row.map(|r| r.get(0)).ok_or(FsError::InvalidArgument)
    }

    /// Apply attribute changes, including truncation.
    pub async fn setattr(&self, id: InodeId, attr: SetAttr) -> FsResult<Inode> {
        let guard = self.lock.lock().await;
        let inode = self.inodes.get(id).await?;
        if inode.locked {
            return Err(FsError::PermissionDenied);
        }

        if let Some(len) = attr.size {
            let old_size = inode.size;
            let bs = self.blocksize;
            drop(guard);
            if len == 0 {
                self.cache.remove(id, 0).await.map_err(FsError::from)?;
            } else {
                let last = (len - 1) / bs;
                self.cache.remove(id, last + 1).await.map_err(FsError::from)?;
                let within = len - last * bs;
                if len < old_size && within < bs {
                    self.cache
                        .with_entry(id, last, |entry| entry.truncate(within))
                        .await
                        .map_err(FsError::from)?;
                }
            }
            let _guard = self.lock.lock().await;
            self.apply_plain_attrs(id, &attr, Some(len)).await
        } else {
            let result = self.apply_plain_attrs(id, &attr, None).await;
            drop(guard);
            result
        }
    }

    async fn apply_plain_attrs(
        &self,
        id: InodeId,
        attr: &SetAttr,
        new_size: Option<u64>,
    ) -> FsResult<Inode> {
        let now = now_ns();
        self.inodes
            .modify(id, |inode| {
                if let Some(size) = new_size {
                    inode.size = size;
                    inode.mtime_ns = now;
                }
                if let Some(mode) = attr.mode {
                    inode.mode = mode;
                }
                if let Some(uid) = attr.uid {
                    inode.uid = uid;
                }
                if let Some(gid) = attr.gid {
                    inode.gid = gid;
                }
                if let Some(rdev) = attr.rdev {
                    inode.rdev = rdev;
                }
                if let Some(atime) = attr.atime_ns {
                    inode.atime_ns = atime;
                }
                if let Some(mtime) = attr.mtime_ns {
                    inode.mtime_ns = mtime;
                }
                inode.ctime_ns = attr.ctime_ns.unwrap_or(now);
            })
            .await
    }

    /// Permission pre-check hook. Permission enforcement is delegated to
    /// the kernel (`default_permissions`), so this always grants access.
    pub async fn access(&self, _id: InodeId, _mask: u32, _ctx: &RequestContext) -> FsResult<bool> {
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Entry creation and removal
    // ------------------------------------------------------------------

    /// Create a regular file, device node, fifo or socket.
    pub async fn mknod(
        &self,
        parent: InodeId,
        name: &[u8],
        mode: u32,
        rdev: u64,
        ctx: &RequestContext,
    ) -> FsResult<Inode> {
        let _guard = self.lock.lock().await;
        self.create_entry(parent, name, mode, ctx, rdev, None).await
    }

    /// Create a directory.
    pub async fn mkdir(
        &self,
        parent: InodeId,
        name: &[u8],
        mode: u32,
        ctx: &RequestContext,
    ) -> FsResult<Inode> {
        let _guard = self.lock.lock().await;
        self.create_entry(parent, name, (mode & !0o170_000) | 0o040_000, ctx, 0, None)
            .await
    }

    /// Create a symbolic link.
    pub async fn symlink(
        &self,
        parent: InodeId,
        name: &[u8],
        target: &[u8],
        ctx: &RequestContext,
    ) -> FsResult<Inode> {
        let _guard = self.lock.lock().await;
        self.create_entry(parent, name, 0o120_777, ctx, 0, Some(target))
            .await
    }

    /// Create and open a regular file.
    pub async fn create(
        &self,
        parent: InodeId,
        name: &[u8],
        mode: u32,
        ctx: &RequestContext,
    ) -> FsResult<Inode> {
        let _guard = self.lock.lock().await;
        let inode = self
            .create_entry(parent, name, (mode & !0o170_000) | 0o100_000, ctx, 0, None)
            .await?;
        *self.open_inodes.lock().entry(inode.id).or_insert(0) += 1;
        Ok(inode)
    }

    async fn create_entry(
        &self,
        parent: InodeId,
        name: &[u8],
        mode: u32,
        ctx: &RequestContext,
        rdev: u64,
        target: Option<&[u8]>,
    ) -> FsResult<Inode> {
        if name == CTRL_NAME {
            warn!("attempt to create an entry with the control file name");
            return Err(FsError::AccessDenied);
        }
        let parent_inode = self.inodes.get(parent).await?;
        if !parent_inode.is_dir() {
            return Err(FsError::NotDirectory);
        }
        if parent_inode.locked {
            return Err(FsError::PermissionDenied);
        }
        if parent_inode.refcount == 0 {
            warn!(parent, "attempt to create an entry under an unlinked directory");
            return Err(FsError::InvalidArgument);
        }
        if self.lookup_id(parent, name).await?.is_some() {
            return Err(FsError::Exists);
        }

        let now = now_ns();
        let inode = self
            .inodes
            .create(NewInode {
                mode,
                uid: ctx.uid,
                gid: ctx.gid,
                mtime_ns: now,
                atime_ns: now,
                ctime_ns: now,
                refcount: 1,
                size: 0,
                rdev,
            })
            .await?;

        let mut tx = self.db.begin().await?;
        let result = async {
            let name_id = intern_name(&mut tx, name).await?;
            sqlx::query("INSERT INTO contents (name_id, inode, parent_inode) VALUES (?, ?, ?)")
                .bind(name_id)
                .bind(inode.id)
                .bind(parent)
                .execute(tx.conn())
                .await
                .map_err(DatabaseError::from)?;
            if let Some(target) = target {
                sqlx::query("INSERT INTO symlink_targets (inode, target) VALUES (?, ?)")
                    .bind(inode.id)
                    .bind(target)
                    .execute(tx.conn())
                    .await
                    .map_err(DatabaseError::from)?;
            }
            Ok::<(), FsError>(())
        }
        .await;
        match result {
            Ok(()) => tx.commit().await?,
            Err(err) => {
                let _ = tx.rollback().await;
                self.inodes.delete(inode.id).await?;
                return Err(err);
            }
        }

        self.inodes
            .modify(parent, |p| {
                p.mtime_ns = now;
                p.ctime_ns = now;
                if mode & 0o170_000 == 0o040_000 {
                    p.refcount += 1;
                }
            })
            .await?;
        Ok(inode)
    }

    /// Create a hard link to `id` under `new_parent`.
    pub async fn link(&self, id: InodeId, new_parent: InodeId, new_name: &[u8]) -> FsResult<Inode> {
        let _guard = self.lock.lock().await;
        if new_name == CTRL_NAME || id == CTRL_INODE {
            return Err(FsError::AccessDenied);
        }
        let inode = self.inodes.get(id).await?;
        if inode.is_dir() {
            return Err(FsError::InvalidArgument);
        }
        let parent_inode = self.inodes.get(new_parent).await?;
        if parent_inode.locked {
            return Err(FsError::PermissionDenied);
        }
        if parent_inode.refcount == 0 {
            return Err(FsError::InvalidArgument);
        }
        if self.lookup_id(new_parent, new_name).await?.is_some() {
            return Err(FsError::Exists);
        }

        let mut tx = self.db.begin().await?;
        let result = async {
            let name_id = intern_name(&mut tx, new_name).await?;
            sqlx::query("INSERT INTO contents (name_id, inode, parent_inode) VALUES (?, ?, ?)")
                .bind(name_id)
                .bind(id)
                .bind(new_parent)
                .execute(tx.conn())
                .await
                .map_err(DatabaseError::from)?;
            Ok::<(), FsError>(())
        }
        .await;
        match result {
            Ok(()) => tx.commit().await?,
            Err(err) => {
                let _ = tx.rollback().await;
                return Err(err);
            }
        }

        let now = now_ns();
        self.inodes
            .modify(new_parent, |p| {
                p.mtime_ns = now;
                p.ctime_ns = now;
            })
            .await?;
        self.inodes
            .modify(id, |inode| {
                inode.refcount += 1;
                inode.ctime_ns = now;
            })
            .await
    }

    /// Remove a non-directory entry.
    pub async fn unlink(&self, parent: InodeId, name: &[u8]) -> FsResult<()> {
        let guard = self.lock.lock().await;
        let inode = self.lookup_locked(parent, name).await?;
        if inode.is_dir() {
            return Err(FsError::IsDirectory);
        }
        let destroy = self.remove_entry(parent, name, inode.id, false).await?;
        drop(guard);
        if let Some(id) = destroy {
            self.destroy_inode(id).await?;
        }
        Ok(())
    }

    /// Remove an empty directory.
    pub async fn rmdir(&self, parent: InodeId, name: &[u8]) -> FsResult<()> {
        let guard = self.lock.lock().await;
        let inode = self.lookup_locked(parent, name).await?;
        if !inode.is_dir() {
            return Err(FsError::NotDirectory);
        }
        let destroy = self.remove_entry(parent, name, inode.id, false).await?;
        drop(guard);
        if let Some(id) = destroy {
            self.destroy_inode(id).await?;
        }
        Ok(())
    }

    /// Remove the entry `(parent, name) -> id`. Returns the inode to
    /// destroy once the caller dropped the global lock, if its last
    /// reference just went away.
    pub(crate) async fn remove_entry(
        &self,
        parent: InodeId,
        name: &[u8],
        id: InodeId,
        force: bool,
    ) -> FsResult<Option<InodeId>> {
        let parent_inode = self.inodes.get(parent).await?;
        if parent_inode.locked && !force {
            return Err(FsError::PermissionDenied);
        }

        let mut tx = self.db.begin().await?;
        let result = async {
            let row = sqlx::query("SELECT 1 FROM contents WHERE parent_inode = ? LIMIT 1")
                .bind(id)
                .fetch_optional(tx.conn())
                .await
                .map_err(DatabaseError::from)?;
            if row.is_some() {
                return Err(FsError::NotEmpty);
            }
            let row = sqlx::query(
                "SELECT contents.id, contents.name_id FROM contents
                 JOIN names ON names.id = contents.name_id
                 WHERE contents.parent_inode = ? AND names.name = ?",
            )
            .bind(parent)
            .bind(name)
            .fetch_optional(tx.conn())
            .await
            .map_err(DatabaseError::from)?;
            let Some(row) = row else {
                return Err(FsError::NotFound);
            };
            let content_id: i64 = row.get(0);
            let name_id: NameId = row.get(1);
            sqlx::query("DELETE FROM contents WHERE id = ?")
                .bind(content_id)
                .execute(tx.conn())
                .await
                .map_err(DatabaseError::from)?;
            release_name(&mut tx, name_id).await?;
            Ok::<(), FsError>(())
        }
        .await;
        match result {
            Ok(()) => tx.commit().await?,
            Err(err) => {
                let _ = tx.rollback().await;
                return Err(err);
            }
        }

        let now = now_ns();
        let removed_dir = self.inodes.get(id).await?.is_dir();
        self.inodes
            .modify(parent, |p| {
                p.mtime_ns = now;
                p.ctime_ns = now;
                if removed_dir {
                    p.refcount -= 1;
                }
            })
            .await?;
        let inode = self
            .inodes
            .modify(id, |inode| {
                inode.refcount -= 1;
                inode.ctime_ns = now;
            })
            .await?;

        if inode.refcount == 0 && !self.is_open(id) {
            Ok(Some(id))
        } else {
            Ok(None)
        }
    }

    /// Drop an inode whose last reference and last open handle are gone:
    /// its blocks, xattrs, symlink target, and finally the row itself.
    pub(crate) async fn destroy_inode(&self, id: InodeId) -> FsResult<()> {
        debug!(id, "destroying inode");
        self.cache.remove(id, 0).await.map_err(FsError::from)?;

        let mut tx = self.db.begin().await?;
        let result = async {
            let rows = sqlx::query("SELECT name_id FROM ext_attributes WHERE inode = ?")
                .bind(id)
                .fetch_all(tx.conn())
                .await
                .map_err(DatabaseError::from)?;
            for row in rows {
                let name_id: NameId = row.get(0);
                release_name(&mut tx, name_id).await?;
            }
            sqlx::query("DELETE FROM ext_attributes WHERE inode = ?")
                .bind(id)
                .execute(tx.conn())
                .await
                .map_err(DatabaseError::from)?;
            sqlx::query("DELETE FROM symlink_targets WHERE inode = ?")
                .bind(id)
                .execute(tx.conn())
                .await
                .map_err(DatabaseError::from)?;
            Ok::<(), FsError>(())
        }
        .await;
        match result {
            Ok(()) => tx.commit().await?,
            Err(err) => {
                let _ = tx.rollback().await;
                return Err(err);
            }
        }
        self.inodes.delete(id).await
    }

    // ------------------------------------------------------------------
    // Rename
    // ------------------------------------------------------------------

    /// Rename `(old_parent, old_name)` to `(new_parent, new_name)`,
    /// replacing an existing target.
    pub async fn rename(
        &self,
        old_parent: InodeId,
        old_name: &[u8],
        new_parent: InodeId,
        new_name: &[u8],
    ) -> FsResult<()> {
        let guard = self.lock.lock().await;
        if old_name == CTRL_NAME || new_name == CTRL_NAME {
            return Err(FsError::AccessDenied);
        }
        if self.inodes.get(old_parent).await?.locked
            || self.inodes.get(new_parent).await?.locked
        {
            return Err(FsError::PermissionDenied);
        }

        let inode = self.lookup_locked(old_parent, old_name).await?;
        let target = match self.lookup_id(new_parent, new_name).await? {
            Some(target_id) => Some(self.inodes.get(target_id).await?),
            None => None,
        };

        let destroy = match target {
            None => {
                self.rename_plain(old_parent, old_name, new_parent, new_name, &inode)
                    .await?;
                None
            }
            Some(target) => {
                self.rename_replace(old_parent, old_name, new_parent, new_name, &inode, &target)
                    .await?
            }
        };
        drop(guard);
        if let Some(id) = destroy {
            self.destroy_inode(id).await?;
        }
        Ok(())
    }

    async fn rename_plain(
        &self,
        old_parent: InodeId,
        old_name: &[u8],
        new_parent: InodeId,
        new_name: &[u8],
        inode: &Inode,
    ) -> FsResult<()> {
        let mut tx = self.db.begin().await?;
        let result = async {
            let new_name_id = intern_name(&mut tx, new_name).await?;
            let row = sqlx::query(
                "SELECT contents.id, contents.name_id FROM contents
                 JOIN names ON names.id = contents.name_id
                 WHERE contents.parent_inode = ? AND names.name = ?",
            )
            .bind(old_parent)
            .bind(old_name)
            .fetch_optional(tx.conn())
            .await
            .map_err(DatabaseError::from)?;
            let Some(row) = row else {
                return Err(FsError::NotFound);
            };
            let content_id: i64 = row.get(0);
            let old_name_id: NameId = row.get(1);
            sqlx::query("UPDATE contents SET name_id = ?, parent_inode = ? WHERE id = ?")
                .bind(new_name_id)
                .bind(new_parent)
                .bind(content_id)
                .execute(tx.conn())
                .await
                .map_err(DatabaseError::from)?;
            release_name(&mut tx, old_name_id).await?;
            Ok::<(), FsError>(())
        }
        .await;
        match result {
            Ok(()) => tx.commit().await?,
            Err(err) => {
                let _ = tx.rollback().await;
                return Err(err);
            }
        }

        self.touch_rename_parents(old_parent, new_parent, inode.is_dir())
            .await
    }

    async fn rename_replace(
        &self,
        old_parent: InodeId,
        old_name: &[u8],
        new_parent: InodeId,
        new_name: &[u8],
        inode: &Inode,
        target: &Inode,
    ) -> FsResult<Option<InodeId>> {
        let mut tx = self.db.begin().await?;
        let result = async {
            let row = sqlx::query("SELECT 1 FROM contents WHERE parent_inode = ? LIMIT 1")
                .bind(target.id)
                .fetch_optional(tx.conn())
                .await
                .map_err(DatabaseError::from)?;
            if row.is_some() {
                return Err(FsError::NotEmpty);
            }

            // Point the target entry at the moved inode.
            sqlx::query(
                "UPDATE contents SET inode = ? WHERE parent_inode = ? AND name_id =
                 (SELECT id FROM names WHERE name = ?)",
            )
            .bind(inode.id)
            .bind(new_parent)
            .bind(new_name)
            .execute(tx.conn())
            .await
            .map_err(DatabaseError::from)?;

            // Drop the old entry.
            let row = sqlx::query(
                "SELECT contents.id, contents.name_id FROM contents
                 JOIN names ON names.id = contents.name_id
                 WHERE contents.parent_inode = ? AND names.name = ?",
            )
            .bind(old_parent)
            .bind(old_name)
            .fetch_optional(tx.conn())
            .await
            .map_err(DatabaseError::from)?;
            let Some(row) = row else {
                return Err(FsError::NotFound);
            };
            let content_id: i64 = row.get(0);
            let old_name_id: NameId = row.get(1);
            sqlx::query("DELETE FROM contents WHERE id = ?")
                .bind(content_id)
                .execute(tx.conn())
                .await
                .map_err(DatabaseError::from)?;
            release_name(&mut tx, old_name_id).await?;
            Ok::<(), FsError>(())
        }
        .await;
        match result {
            Ok(()) => tx.commit().await?,
            Err(err) => {
                let _ = tx.rollback().await;
                return Err(err);
            }
        }

        let now = now_ns();
        // The replaced inode lost its entry.
        let replaced = self
            .inodes
            .modify(target.id, |t| {
                t.refcount -= 1;
                t.ctime_ns = now;
            })
            .await?;
        if target.is_dir() {
            // The new parent lost the replaced child directory.
            self.inodes
                .modify(new_parent, |p| p.refcount -= 1)
                .await?;
        }
        self.touch_rename_parents(old_parent, new_parent, inode.is_dir())
            .await?;

        if replaced.refcount == 0 && !self.is_open(target.id) {
            Ok(Some(target.id))
        } else {
            Ok(None)
        }
    }

    async fn touch_rename_parents(
        &self,
        old_parent: InodeId,
        new_parent: InodeId,
        moved_dir: bool,
    ) -> FsResult<()> {
        let now = now_ns();
        let cross_parent = old_parent != new_parent;
        self.inodes
            .modify(old_parent, |p| {
                p.mtime_ns = now;
                p.ctime_ns = now;
                if moved_dir && cross_parent {
                    p.refcount -= 1;
                }
            })
            .await?;
        self.inodes
            .modify(new_parent, |p| {
                p.mtime_ns = now;
                p.ctime_ns = now;
                if moved_dir && cross_parent {
                    p.refcount += 1;
                }
            })
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Directory reading
    // ------------------------------------------------------------------

    /// Read directory entries after `cursor` (0 starts from the
    /// beginning), at most `limit` of them. Entries are ordered by their
    /// monotonic row id, so successive calls with the returned cursor see
    /// each entry exactly once.
    pub async fn readdir(
        &self,
        dir: InodeId,
        cursor: i64,
        limit: usize,
    ) -> FsResult<Vec<DirEntry>> {
        let _guard = self.lock.lock().await;
        let inode = self.inodes.get(dir).await?;
        if !inode.is_dir() {
            return Err(FsError::NotDirectory);
        }
        if inode.atime_ns < inode.ctime_ns || inode.atime_ns < inode.mtime_ns {
            self.inodes
                .modify(dir, |inode| inode.atime_ns = now_ns())
                .await?;
        }

        let mut conn = self.db.acquire().await?;
        let rows = sqlx::query(
            "SELECT contents.id, names.name, contents.inode FROM contents
             JOIN names ON names.id = contents.name_id
             WHERE contents.parent_inode = ? AND contents.id > ?
             ORDER BY contents.id LIMIT ?",
        )
        .bind(dir)
        .bind(cursor)
        .bind(limit as i64)
        .fetch_all(&mut *conn)
        .await
        .map_err(DatabaseError::from)?;
        drop(conn);

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let id: InodeId = row.get(2);
            entries.push(DirEntry {
                cursor: row.get(0),
                name: row.get(1),
                inode: self.inodes.get(id).await?,
            });
        }
        Ok(entries)
    }

    // ------------------------------------------------------------------
    // File I/O
    // ------------------------------------------------------------------

    /// Open `id`. Returns the file handle (the inode id itself).
    pub async fn open(&self, id: InodeId, write: bool) -> FsResult<InodeId> {
        let _guard = self.lock.lock().await;
        let inode = self.inodes.get(id).await?;
        if inode.locked && write {
            return Err(FsError::PermissionDenied);
        }
        *self.open_inodes.lock().entry(id).or_insert(0) += 1;
        Ok(id)
    }

    /// Read up to `length` bytes at `offset`. Regions never written
    /// return zeros; reads past the end of file are truncated.
    pub async fn read(&self, id: InodeId, offset: u64, length: usize) -> FsResult<Vec<u8>> {
        let guard = self.lock.lock().await;
        let inode = self.inodes.get(id).await?;
        let length = (inode.size.saturating_sub(offset) as usize).min(length);
        drop(guard);

        let mut buf = Vec::with_capacity(length);
        let mut offset = offset;
        while buf.len() < length {
            let chunk = self.read_chunk(id, offset, length - buf.len()).await?;
            offset += chunk.len() as u64;
            buf.extend_from_slice(&chunk);
        }

        let _guard = self.lock.lock().await;
        let inode = self.inodes.get(id).await?;
        if inode.atime_ns < inode.ctime_ns || inode.atime_ns < inode.mtime_ns {
            self.inodes
                .modify(id, |inode| inode.atime_ns = now_ns())
                .await?;
        }
        Ok(buf)
    }

    /// Read within one block, zero-filling up to the block boundary.
    async fn read_chunk(&self, id: InodeId, offset: u64, length: usize) -> FsResult<Vec<u8>> {
        let blockno = offset / self.blocksize;
        let offset_rel = offset - blockno * self.blocksize;
        let length = length.min((self.blocksize - offset_rel) as usize);

        let data = self
            .cache
            .with_entry(id, blockno, |entry| {
                let mut buf = vec![0u8; length];
                let mut done = 0;
                loop {
                    let n = entry.read_at(offset_rel + done as u64, &mut buf[done..])?;
                    if n == 0 {
                        break;
                    }
                    done += n;
                    if done == length {
                        break;
                    }
                }
                // Anything the cache file does not cover is a hole.
                Ok(buf)
            })
            .await
            .map_err(FsError::from)?;
        Ok(data)
    }

    /// Write `data` at `offset`. Returns the number of bytes written.
    pub async fn write(&self, id: InodeId, offset: u64, data: &[u8]) -> FsResult<usize> {
        let guard = self.lock.lock().await;
        if self.inodes.get(id).await?.locked {
            return Err(FsError::PermissionDenied);
        }
        drop(guard);

        let total = data.len();
        let end = offset + total as u64;
        let mut offset = offset;
        let mut data = data;
        while !data.is_empty() {
            let written = self.write_chunk(id, offset, data).await?;
            offset += written as u64;
            data = &data[written..];
        }

        let _guard = self.lock.lock().await;
        let now = now_ns();
        self.inodes
            .modify(id, |inode| {
                // Concurrent writers may already have extended the file.
                inode.size = inode.size.max(end);
                inode.mtime_ns = now;
                inode.ctime_ns = now;
            })
            .await?;
        Ok(total)
    }

    /// Write within one block.
    async fn write_chunk(&self, id: InodeId, offset: u64, data: &[u8]) -> FsResult<usize> {
        let blockno = offset / self.blocksize;
        let offset_rel = offset - blockno * self.blocksize;
        let len = data.len().min((self.blocksize - offset_rel) as usize);

        self.cache
            .with_entry(id, blockno, |entry| {
                entry.write_at(offset_rel, &data[..len])?;
                Ok(())
            })
            .await
            .map_err(FsError::from)?;
        Ok(len)
    }

    /// Flush dirty state belonging to `id`: its block-cache entries, and
    /// (unless `datasync`) its inode row.
    pub async fn fsync(&self, id: InodeId, datasync: bool) -> FsResult<()> {
        if !datasync {
            self.inodes.flush_id(id).await?;
        }
        self.cache.flush(id).await.map_err(FsError::from)
    }

    /// Close-time flush hook. Data is uploaded lazily, so nothing to do.
    pub async fn flush(&self, _id: InodeId) -> FsResult<()> {
        Ok(())
    }

    /// Release one open handle. On the last release of an unlinked inode
    /// the inode and its data are destroyed.
    pub async fn release(&self, id: InodeId) -> FsResult<()> {
        let guard = self.lock.lock().await;
        let destroy = {
            let mut open = self.open_inodes.lock();
            match open.get_mut(&id) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    open.remove(&id);
                    true
                }
                None => false,
            }
        };
        if !destroy {
            return Ok(());
        }
        let inode = self.inodes.get(id).await?;
        drop(guard);
        if inode.refcount == 0 {
            self.destroy_inode(id).await?;
        }
        Ok(())
    }

    pub(crate) fn is_open(&self, id: InodeId) -> bool {
        self.open_inodes.lock().contains_key(&id)
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    /// File-system totals for statfs.
    pub async fn statfs(&self) -> FsResult<StatFs> {
        let _guard = self.lock.lock().await;
        let mut conn = self.db.acquire().await?;
        let row = sqlx::query(
            "SELECT (SELECT COUNT(*) FROM objects),
                    (SELECT COUNT(*) FROM inodes),
                    (SELECT COALESCE(SUM(size), 0) FROM objects)",
        )
        .fetch_one(&mut *conn)
        .await
        .map_err(DatabaseError::from)?;
        let objects = row.get::<i64, _>(0) as u64;
        let inodes = row.get::<i64, _>(1) as u64;
        let size = row.get::<i64, _>(2) as u64;

        let f_bsize = if objects != 0 {
            (size / objects).max(1)
        } else {
            self.blocksize
        };

        // The backend is unbounded; report a half-full file system of at
        // least 50 GB so tools have something sensible to show.
        let total_blocks = (2 * objects).max(50 * 1024 * 1024 * 1024 / f_bsize);
        let total_inodes = (2 * inodes).max(50_000);

        Ok(StatFs {
            f_bsize,
            f_frsize: self.blocksize,
            f_blocks: total_blocks,
            f_bfree: total_blocks - objects,
            f_bavail: total_blocks - objects,
            f_files: total_inodes,
            f_ffree: total_inodes - inodes,
            f_favail: total_inodes - inodes,
        })
    }
}

/// Intern `name`, incrementing its refcount.
pub(crate) async fn intern_name(tx: &mut Transaction, name: &[u8]) -> FsResult<NameId> {
    let row = sqlx::query("SELECT id FROM names WHERE name = ?")
        .bind(name)
        .fetch_optional(tx.conn())
        .await
        .map_err(DatabaseError::from)?;
    match row {
        Some(row) => {
            let id: NameId = row.get(0);
            sqlx::query("UPDATE names SET refcount = refcount + 1 WHERE id = ?")
                .bind(id)
                .execute(tx.conn())
                .await
                .map_err(DatabaseError::from)?;
            Ok(id)
        }
        None => {
            let res = sqlx::query("INSERT INTO names (name, refcount) VALUES (?, 1)")
                .bind(name)
                .execute(tx.conn())
                .await
                .map_err(DatabaseError::from)?;
            Ok(res.last_insert_rowid())
        }
    }
}

/// Drop one reference to an interned name, deleting it on zero.
pub(crate) async fn release_name(tx: &mut Transaction, name_id: NameId) -> FsResult<()> {
    let row = sqlx::query("SELECT refcount FROM names WHERE id = ?")
        .bind(name_id)
        .fetch_one(tx.conn())
        .await
        .map_err(DatabaseError::from)?;
    let refcount: i64 = row.get(0);
    if refcount > 1 {
        sqlx::query("UPDATE names SET refcount = refcount - 1 WHERE id = ?")
            .bind(name_id)
            .execute(tx.conn())
            .await
            .map_err(DatabaseError::from)?;
    } else {
        sqlx::query("DELETE FROM names WHERE id = ?")
            .bind(name_id)
            .execute(tx.conn())
            .await
            .map_err(DatabaseError::from)?;
    }
    Ok(())
}
