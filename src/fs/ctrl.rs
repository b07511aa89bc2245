//! Extended attributes and the control channel.
//!
//! Regular inodes carry ordinary xattrs. The reserved control inode
//! instead interprets xattr operations as commands: the xattr *name*
//! selects the command, the *value* encodes its arguments. Everything
//! else on the control inode is rejected.

use sqlx::Row;
use tracing::info;

use crate::common::{InodeId, NameId, CTRL_INODE};
use crate::database::DatabaseError;
use crate::error::{FsError, FsResult};

use super::{intern_name, release_name, Fs};

/// Extended file-system statistics, packed as seven little-endian u64:
/// entries, blocks, inodes, fs_size, dedup_size, compressed_size, db_size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtStats {
    pub entries: u64,
    pub blocks: u64,
    pub inodes: u64,
    pub fs_size: u64,
    pub dedup_size: u64,
    pub compressed_size: u64,
    pub db_size: u64,
}

impl ExtStats {
    pub fn pack(&self) -> [u8; 56] {
        let mut out = [0u8; 56];
        for (idx, value) in [
            self.entries,
            self.blocks,
            self.inodes,
            self.fs_size,
            self.dedup_size,
            self.compressed_size,
            self.db_size,
        ]
        .into_iter()
        .enumerate()
        {
            out[idx * 8..idx * 8 + 8].copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    pub fn unpack(data: &[u8]) -> FsResult<Self> {
        if data.len() != 56 {
            return Err(FsError::InvalidArgument);
        }
        let mut fields = [0u64; 7];
        for (idx, field) in fields.iter_mut().enumerate() {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&data[idx * 8..idx * 8 + 8]);
            *field = u64::from_le_bytes(buf);
        }
        Ok(Self {
            entries: fields[0],
            blocks: fields[1],
            inodes: fields[2],
            fs_size: fields[3],
            dedup_size: fields[4],
            compressed_size: fields[5],
            db_size: fields[6],
        })
    }
}

impl Fs {
    /// Read an extended attribute.
    pub async fn getxattr(&self, id: InodeId, name: &[u8]) -> FsResult<Vec<u8>> {
        if id == CTRL_INODE {
            return self.ctrl_getxattr(name).await;
        }
        let _guard = self.lock.lock().await;
        let mut conn = self.db.acquire().await?;
        let row = sqlx::query(
            "SELECT ext_attributes.value FROM ext_attributes
             JOIN names ON names.id = ext_attributes.name_id
             WHERE ext_attributes.inode = ? AND names.name = ?",
        )
        .bind(id)
        .bind(name)
        .fetch_optional(&mut *conn)
        .await
        .map_err(DatabaseError::from)?;
        row.map(|r| r.get(0)).ok_or(FsError::NoAttribute)
    }

    /// List extended attribute names.
    pub async fn listxattr(&self, id: InodeId) -> FsResult<Vec<Vec<u8>>> {
        let _guard = self.lock.lock().await;
        let mut conn = self.db.acquire().await?;
        let rows = sqlx::query(
            "SELECT names.name FROM ext_attributes
             JOIN names ON names.id = ext_attributes.name_id
             WHERE ext_attributes.inode = ?",
        )
        .bind(id)
        .fetch_all(&mut *conn)
        .await
        .map_err(DatabaseError::from)?;
        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }

    /// Set an extended attribute, or execute a control command when `id`
    /// is the control inode.
    pub async fn setxattr(&self, id: InodeId, name: &[u8], value: &[u8]) -> FsResult<()> {
        if id == CTRL_INODE {
            return self.ctrl_command(name, value).await;
        }

        let _guard = self.lock.lock().await;
        if self.inodes.get(id).await?.locked {
            return Err(FsError::PermissionDenied);
        }

        let mut tx = self.db.begin().await?;
        let result = async {
            let row = sqlx::query(
                "SELECT names.id FROM names
                 JOIN ext_attributes ON ext_attributes.name_id = names.id
                 WHERE ext_attributes.inode = ? AND names.name = ?",
            )
            .bind(id)
            .bind(name)
            .fetch_optional(tx.conn())
            .await
            .map_err(DatabaseError::from)?;
            match row {
                Some(row) => {
                    // Overwrite in place; the name keeps its reference.
                    let name_id: NameId = row.get(0);
                    sqlx::query(
                        "UPDATE ext_attributes SET value = ? WHERE inode = ? AND name_id = ?",
                    )
                    .bind(value)
                    .bind(id)
                    .bind(name_id)
                    .execute(tx.conn())
                    .await
                    .map_err(DatabaseError::from)?;
                }
                None => {
                    let name_id = intern_name(&mut tx, name).await?;
                    sqlx::query(
                        "INSERT INTO ext_attributes (inode, name_id, value) VALUES (?, ?, ?)",
                    )
                    .bind(id)
                    .bind(name_id)
                    .bind(value)
                    .execute(tx.conn())
                    .await
                    .map_err(DatabaseError::from)?;
                }
            }
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

        self.inodes
            .modify(id, |inode| inode.ctime_ns = crate::common::now_ns())
            .await?;
        Ok(())
    }

    /// Remove an extended attribute.
    pub async fn removexattr(&self, id: InodeId, name: &[u8]) -> FsResult<()> {
        if id == CTRL_INODE {
            return Err(FsError::InvalidArgument);
        }
        let _guard = self.lock.lock().await;
        if self.inodes.get(id).await?.locked {
            return Err(FsError::PermissionDenied);
        }

        let mut tx = self.db.begin().await?;
        let result = async {
            let row = sqlx::query(
                "SELECT names.id FROM names
                 JOIN ext_attributes ON ext_attributes.name_id = names.id
                 WHERE ext_attributes.inode = ? AND names.name = ?",
            )
            .bind(id)
            .bind(name)
            .fetch_optional(tx.conn())
            .await
            .map_err(DatabaseError::from)?;
            let Some(row) = row else {
                return Err(FsError::NoAttribute);
            };
            let name_id: NameId = row.get(0);
            sqlx::query("DELETE FROM ext_attributes WHERE inode = ? AND name_id = ?")
                .bind(id)
                .bind(name_id)
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

        self.inodes
            .modify(id, |inode| inode.ctime_ns = crate::common::now_ns())
            .await?;
        Ok(())
    }

    /// Control reads: error state, pid, statistics.
    async fn ctrl_getxattr(&self, name: &[u8]) -> FsResult<Vec<u8>> {
        match name {
            b"s3ql_errors?" => Ok(if self.is_damaged() {
                b"errors encountered".to_vec()
            } else {
                b"no errors".to_vec()
            }),
            b"s3ql_pid?" => Ok(std::process::id().to_string().into_bytes()),
            b"s3qlstat" => Ok(self.extstat().await?.pack().to_vec()),
            _ => Err(FsError::InvalidArgument),
        }
    }

    /// Control commands, dispatched on the xattr name.
    async fn ctrl_command(&self, name: &[u8], value: &[u8]) -> FsResult<()> {
        match name {
            b"s3ql_flushcache!" => {
                info!("control: flushing block cache");
                self.cache.clear().await.map_err(FsError::from)
            }
            b"copy" => {
                let (src, target) = decode_u64_pair(value)?;
                info!(src, target, "control: tree copy");
                self.copy_tree(src as InodeId, target as InodeId).await
            }
            b"lock" => {
                let id = decode_u64(value)?;
                info!(id, "control: locking tree");
                self.lock_tree(id as InodeId).await
            }
            b"rmtree" => {
                let (parent, name) = decode_u64_name(value)?;
                info!(parent, "control: removing tree");
                self.remove_tree(parent as InodeId, &name).await
            }
            _ => Err(FsError::InvalidArgument),
        }
    }

    /// Extended statistics over the whole file system.
    pub async fn extstat(&self) -> FsResult<ExtStats> {
        let _guard = self.lock.lock().await;
        let mut conn = self.db.acquire().await?;
        let row = sqlx::query(
            "SELECT (SELECT COUNT(*) FROM contents),
                    (SELECT COUNT(*) FROM objects),
                    (SELECT COUNT(*) FROM inodes),
                    (SELECT COALESCE(SUM(size), 0) FROM inodes),
                    (SELECT COALESCE(SUM(size), 0) FROM objects),
                    (SELECT COALESCE(SUM(compr_size), 0) FROM objects)",
        )
        .fetch_one(&mut *conn)
        .await
        .map_err(DatabaseError::from)?;
        Ok(ExtStats {
            entries: row.get::<i64, _>(0) as u64,
            blocks: row.get::<i64, _>(1) as u64,
            inodes: row.get::<i64, _>(2) as u64,
            fs_size: row.get::<i64, _>(3) as u64,
            dedup_size: row.get::<i64, _>(4) as u64,
            compressed_size: row.get::<i64, _>(5) as u64,
            db_size: self.db.file_size(),
        })
    }
}

fn decode_u64(value: &[u8]) -> FsResult<u64> {
    if value.len() != 8 {
        return Err(FsError::InvalidArgument);
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(value);
    Ok(u64::from_le_bytes(buf))
}

fn decode_u64_pair(value: &[u8]) -> FsResult<(u64, u64)> {
    if value.len() != 16 {
        return Err(FsError::InvalidArgument);
    }
    Ok((decode_u64(&value[..8])?, decode_u64(&value[8..])?))
}

fn decode_u64_name(value: &[u8]) -> FsResult<(u64, Vec<u8>)> {
    if value.len() < 9 {
        return Err(FsError::InvalidArgument);
    }
    Ok((decode_u64(&value[..8])?, value[8..].to_vec()))
}

/// Encode arguments for the `copy` control command.
pub fn encode_copy_args(src: InodeId, target: InodeId) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&(src as u64).to_le_bytes());
    out[8..].copy_from_slice(&(target as u64).to_le_bytes());
    out
}

/// Encode the argument for the `lock` control command.
pub fn encode_lock_args(id: InodeId) -> [u8; 8] {
    (id as u64).to_le_bytes()
}

/// Encode arguments for the `rmtree` control command.
pub fn encode_rmtree_args(parent: InodeId, name: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + name.len());
    out.extend_from_slice(&(parent as u64).to_le_bytes());
    out.extend_from_slice(name);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extstats_pack_unpack() {
        let stats = ExtStats {
            entries: 1,
            blocks: 2,
            inodes: 3,
            fs_size: 4,
            dedup_size: 5,
            compressed_size: 6,
            db_size: 7,
        };
        let packed = stats.pack();
        assert_eq!(packed.len(), 56);
        assert_eq!(ExtStats::unpack(&packed).unwrap(), stats);
    }

    #[test]
    fn test_command_arg_encodings() {
        let (src, target) = decode_u64_pair(&encode_copy_args(3, 9)).unwrap();
        assert_eq!((src, target), (3, 9));

        assert_eq!(decode_u64(&encode_lock_args(17)).unwrap(), 17);

        let (parent, name) = decode_u64_name(&encode_rmtree_args(2, b"doomed")).unwrap();
        assert_eq!(parent, 2);
        assert_eq!(name, b"doomed");

        assert!(decode_u64(b"short").is_err());
        assert!(decode_u64_name(&[0u8; 8]).is_err());
    }
}
