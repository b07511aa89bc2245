//! Whole-subtree operations: lock, recursive remove, fast copy.
//!
//! All three walk the tree in bounded batches and let go of the global
//! lock between batches so that unrelated requests keep making progress.

use std::collections::{HashMap, HashSet};

use sqlx::Row;
use tracing::debug;

use crate::cache::CacheKey;
use crate::common::{now_ns, InodeId};
use crate::database::DatabaseError;
use crate::error::{FsError, FsResult};
use crate::inode::NewInode;

use super::Fs;

/// Entries processed per global-lock hold.
const BATCH: usize = 500;

impl Fs {
    /// Mark the subtree rooted at `id` immutable. Writes into a locked
    /// subtree fail with EPERM until fsck clears the flag.
    pub async fn lock_tree(&self, id: InodeId) -> FsResult<()> {
        debug!(id, "locking subtree");
        let mut queue = vec![id];
        {
            let _guard = self.lock.lock().await;
            self.inodes.modify(id, |inode| inode.locked = true).await?;
        }

        while !queue.is_empty() {
            let guard = self.lock.lock().await;
            let mut processed = 0;
            while let Some(dir) = queue.pop() {
                let mut conn = self.db.acquire().await?;
                let rows = sqlx::query("SELECT inode FROM contents WHERE parent_inode = ?")
                    .bind(dir)
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(DatabaseError::from)?;
                drop(conn);

                for row in rows {
                    let child: InodeId = row.get(0);
                    self.inodes
                        .modify(child, |inode| inode.locked = true)
                        .await?;
                    if self.has_children(child).await? {
                        queue.push(child);
                    }
                    processed += 1;
                }
                if processed > BATCH {
                    break;
                }
            }
            drop(guard);
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    /// Recursively remove the entry `name` under `parent`.
    pub async fn remove_tree(&self, parent: InodeId, name: &[u8]) -> FsResult<()> {
        debug!(parent, "removing subtree");
        let root = {
            let _guard = self.lock.lock().await;
            if self.inodes.get(parent).await?.locked {
                return Err(FsError::PermissionDenied);
            }
            self.lookup_locked(parent, name).await?
        };
        if !root.is_dir() {
            return Err(FsError::NotDirectory);
        }

        let mut queue = vec![root.id];
        while !queue.is_empty() {
            let guard = self.lock.lock().await;
            let mut destroy = Vec::new();
            let mut processed = 0;
            while let Some(dir) = queue.last().copied() {
                let mut conn = self.db.acquire().await?;
                let rows = sqlx::query(
                    "SELECT names.name, contents.inode FROM contents
                     JOIN names ON names.id = contents.name_id
                     WHERE contents.parent_inode = ? LIMIT 250",
                )
                .bind(dir)
                .fetch_all(&mut *conn)
                .await
                .map_err(DatabaseError::from)?;
                drop(conn);

                if rows.is_empty() {
                    queue.pop();
                    continue;
                }

                let mut found_subdir = false;
                for row in rows {
                    let child_name: Vec<u8> = row.get(0);
                    let child: InodeId = row.get(1);
                    if self.has_children(child).await? {
                        queue.push(child);
                        found_subdir = true;
                    } else {
                        if let Some(id) =
                            self.remove_entry(dir, &child_name, child, true).await?
                        {
                            destroy.push(id);
                        }
                        processed += 1;
                    }
                }
                if found_subdir || processed > BATCH {
                    break;
                }
            }
            drop(guard);

            for id in destroy {
                self.destroy_inode(id).await?;
            }
            tokio::task::yield_now().await;
        }

        // The subtree is empty now; drop its root entry.
        let guard = self.lock.lock().await;
        let destroy = self.remove_entry(parent, name, root.id, true).await?;
        drop(guard);
        if let Some(id) = destroy {
            self.destroy_inode(id).await?;
        }
        Ok(())
    }

    /// Fast tree copy: replicate the subtree under `src` into the empty
    /// directory `target` by inserting new inode and block-mapping rows
    /// that reference existing blocks. No data is copied or uploaded.
    pub async fn copy_tree(&self, src: InodeId, target: InodeId) -> FsResult<()> {
        debug!(src, target, "copying subtree");

        // Every dirty source block must have a committed block row before
        // its mapping can be replicated.
        self.cache.flush_all().await.map_err(FsError::from)?;

        let guard = self.lock.lock().await;
        let src_inode = self.inodes.get(src).await?;
        if !src_inode.is_dir() || !self.inodes.get(target).await?.is_dir() {
            return Err(FsError::NotDirectory);
        }
        self.inodes
            .modify(target, |t| {
                t.mode = src_inode.mode;
                t.uid = src_inode.uid;
                t.gid = src_inode.gid;
                t.mtime_ns = src_inode.mtime_ns;
                t.atime_ns = src_inode.atime_ns;
                t.ctime_ns = src_inode.ctime_ns;
            })
            .await?;

        // Replicate into a detached staging inode first, so readers never
        // observe a half-copied target.
        let now = now_ns();
        let staging = self
            .inodes
            .create(NewInode {
                mode: 0o040_700,
                uid: 0,
                gid: 0,
                mtime_ns: now,
                atime_ns: now,
                ctime_ns: now,
                refcount: 0,
                size: 0,
                rdev: 0,
            })
            .await?;
        drop(guard);

        let mut queue = vec![(src, staging.id)];
        let mut id_map: HashMap<InodeId, InodeId> = HashMap::new();
        let mut in_transit: HashSet<CacheKey> = HashSet::new();
        let mut new_child_dirs: i64 = 0;

        while !queue.is_empty() {
            let guard = self.lock.lock().await;
            let mut processed = 0;
            while let Some((cur_src, cur_dst)) = queue.pop() {
                processed += self
                    .copy_dir_entries(cur_src, cur_dst, &mut queue, &mut id_map, &mut in_transit)
                    .await?;
                if cur_src == src {
                    // Count the direct child directories for the target's
                    // refcount fixup at publish time.
                    new_child_dirs = self.count_child_dirs(cur_dst).await?;
                }
                if processed > BATCH / 2 {
                    break;
                }
            }
            drop(guard);
            tokio::task::yield_now().await;
        }

        // Blocks replicated while their object upload was still in flight
        // must reach the backend before the copy becomes visible.
        self.cache.wait_in_transit(&in_transit).await;

        let _guard = self.lock.lock().await;
        let mut tx = self.db.begin().await?;
        let result = sqlx::query("UPDATE contents SET parent_inode = ? WHERE parent_inode = ?")
            .bind(target)
            .bind(staging.id)
            .execute(tx.conn())
            .await
            .map_err(DatabaseError::from);
        match result {
            Ok(_) => tx.commit().await?,
            Err(err) => {
                let _ = tx.rollback().await;
                return Err(err.into());
            }
        }
        self.inodes
            .modify(target, |t| t.refcount += new_child_dirs)
            .await?;
        self.inodes.delete(staging.id).await?;
        Ok(())
    }

    async fn copy_dir_entries(
        &self,
        src: InodeId,
        dst: InodeId,
        queue: &mut Vec<(InodeId, InodeId)>,
        id_map: &mut HashMap<InodeId, InodeId>,
        in_transit: &mut HashSet<CacheKey>,
    ) -> FsResult<usize> {
        let mut conn = self.db.acquire().await?;
        let rows = sqlx::query(
            "SELECT contents.name_id, contents.inode FROM contents WHERE parent_inode = ?",
        )
        .bind(src)
        .fetch_all(&mut *conn)
        .await
        .map_err(DatabaseError::from)?;
        drop(conn);

        let mut processed = 0;
        for row in rows {
            let name_id: i64 = row.get(0);
            let child: InodeId = row.get(1);

            let new_id = match id_map.get(&child) {
                Some(&existing) => {
                    // A hard link to an inode copied earlier.
                    self.inodes
                        .modify(existing, |inode| inode.refcount += 1)
                        .await?;
                    existing
                }
                None => {
                    let inode = self.inodes.get(child).await?;
                    let copy = self
                        .inodes
                        .create(NewInode {
                            mode: inode.mode,
                            uid: inode.uid,
                            gid: inode.gid,
                            mtime_ns: inode.mtime_ns,
                            atime_ns: inode.atime_ns,
                            ctime_ns: inode.ctime_ns,
                            refcount: if inode.is_dir() { inode.refcount } else { 1 },
                            size: inode.size,
                            rdev: inode.rdev,
                        })
                        .await?;
                    if inode.refcount > 1 && !inode.is_dir() {
                        id_map.insert(child, copy.id);
                    }

                    self.copy_block_refs(child, copy.id, in_transit).await?;
                    self.copy_symlink_target(child, copy.id).await?;

                    if self.has_children(child).await? {
                        queue.push((child, copy.id));
                    }
                    copy.id
                }
            };

            let mut tx = self.db.begin().await?;
            let result = async {
                sqlx::query("UPDATE names SET refcount = refcount + 1 WHERE id = ?")
                    .bind(name_id)
                    .execute(tx.conn())
                    .await
                    .map_err(DatabaseError::from)?;
                sqlx::query(
                    "INSERT INTO contents (name_id, inode, parent_inode) VALUES (?, ?, ?)",
                )
                .bind(name_id)
                .bind(new_id)
                .bind(dst)
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
            processed += 1;
        }
        Ok(processed)
    }

    /// Replicate the block mappings of `src` onto `dst`, incrementing
    /// each block's refcount. Mappings whose object is still uploading
    /// are recorded so the caller can wait before publishing.
    async fn copy_block_refs(
        &self,
        src: InodeId,
        dst: InodeId,
        in_transit: &mut HashSet<CacheKey>,
    ) -> FsResult<()> {
        let mut tx = self.db.begin().await?;
        let result = async {
            let rows = sqlx::query(
                "SELECT blockno, block_id FROM inode_blocks WHERE inode = ?",
            )
            .bind(src)
            .fetch_all(tx.conn())
            .await
            .map_err(DatabaseError::from)?;
            for row in &rows {
                let blockno: i64 = row.get(0);
                let block_id: i64 = row.get(1);
                sqlx::query(
                    "INSERT INTO inode_blocks (inode, blockno, block_id) VALUES (?, ?, ?)",
                )
                .bind(dst)
                .bind(blockno)
                .bind(block_id)
                .execute(tx.conn())
                .await
                .map_err(DatabaseError::from)?;
                sqlx::query("UPDATE blocks SET refcount = refcount + 1 WHERE id = ?")
                    .bind(block_id)
                    .execute(tx.conn())
                    .await
                    .map_err(DatabaseError::from)?;
            }
            Ok::<Vec<sqlx::sqlite::SqliteRow>, FsError>(rows)
        }
        .await;
        let rows = match result {
            Ok(rows) => {
                tx.commit().await?;
                rows
            }
            Err(err) => {
                let _ = tx.rollback().await;
                return Err(err);
            }
        };

        for row in rows {
            let blockno: i64 = row.get(0);
            if self.cache.is_in_transit((src, blockno as u64)) {
                in_transit.insert((src, blockno as u64));
            }
        }
        Ok(())
    }

    async fn copy_symlink_target(&self, src: InodeId, dst: InodeId) -> FsResult<()> {
        let mut conn = self.db.acquire().await?;
        let row = sqlx::query("SELECT target FROM symlink_targets WHERE inode = ?")
            .bind(src)
            .fetch_optional(&mut *conn)
            .await
            .map_err(DatabaseError::from)?;
        if let Some(row) = row {
            let target: Vec<u8> = row.get(0);
            sqlx::query("INSERT INTO symlink_targets (inode, target) VALUES (?, ?)")
                .bind(dst)
                .bind(target)
                .execute(&mut *conn)
                .await
                .map_err(DatabaseError::from)?;
        }
        Ok(())
    }

    async fn count_child_dirs(&self, dir: InodeId) -> FsResult<i64> {
        let mut conn = self.db.acquire().await?;
        let row = sqlx::query(
            "SELECT COUNT(*) FROM contents
             JOIN inodes ON inodes.id = contents.inode
             WHERE contents.parent_inode = ? AND (inodes.mode & 61440) = 16384",
        )
        .bind(dir)
        .fetch_one(&mut *conn)
        .await
        .map_err(DatabaseError::from)?;
        Ok(row.get(0))
    }

    pub(crate) async fn has_children(&self, id: InodeId) -> FsResult<bool> {
        let mut conn = self.db.acquire().await?;
        let row = sqlx::query("SELECT 1 FROM contents WHERE parent_inode = ? LIMIT 1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(DatabaseError::from)?;
        Ok(row.is_some())
    }
}
