//! Schema of the metadata database.
//!
//! Created by `mkfs` and by metadata restore. Refcount columns are kept
//! redundantly for performance; [`refresh_refcounts`] re-derives them from
//! the referring tables after a restore.

use sqlx::SqliteConnection;

use crate::common::{now_ns, CTRL_INODE, ROOT_INODE};

use super::DbResult;

const TABLES: &[&str] = &[
    // Data objects in the backend. `hash` and `compr_size` are set when
    // the object is committed.
    "CREATE TABLE objects (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        refcount    INT NOT NULL,
        hash        BLOB(32) UNIQUE,
        size        INT NOT NULL,
        compr_size  INT
    )",
    // Content-addressed blocks. Several (inode, blockno) mappings may
    // share one block; several blocks may share one object.
    "CREATE TABLE blocks (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        hash        BLOB(32) UNIQUE NOT NULL,
        refcount    INT NOT NULL,
        size        INT NOT NULL,
        obj_id      INTEGER NOT NULL REFERENCES objects(id)
    )",
    // id is constrained to 32 bits so it fits ino_t everywhere. Ids are
    // not reused, so the id space can run out; allocation then fails.
    "CREATE TABLE inodes (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        mode        INT NOT NULL,
        uid         INT NOT NULL,
        gid         INT NOT NULL,
        mtime_ns    INT NOT NULL,
        atime_ns    INT NOT NULL,
        ctime_ns    INT NOT NULL,
        refcount    INT NOT NULL,
        size        INT NOT NULL DEFAULT 0,
        rdev        INT NOT NULL DEFAULT 0,
        locked      INT NOT NULL DEFAULT 0
    )",
    "CREATE TABLE inode_blocks (
        inode       INTEGER NOT NULL REFERENCES inodes(id),
        blockno     INT NOT NULL,
        block_id    INTEGER NOT NULL REFERENCES blocks(id),
        PRIMARY KEY (inode, blockno)
    )",
    "CREATE TABLE symlink_targets (
        inode       INTEGER PRIMARY KEY REFERENCES inodes(id),
        target      BLOB NOT NULL
    )",
    // Interned byte strings for directory entries and xattr names.
    "CREATE TABLE names (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        name        BLOB NOT NULL UNIQUE,
        refcount    INT NOT NULL
    )",
    // id doubles as the readdir cursor, so it must be monotonic.
    "CREATE TABLE contents (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        name_id     INTEGER NOT NULL REFERENCES names(id),
        inode       INTEGER NOT NULL REFERENCES inodes(id),
        parent_inode INTEGER NOT NULL REFERENCES inodes(id),
        UNIQUE (parent_inode, name_id)
    )",
    "CREATE TABLE ext_attributes (
        inode       INTEGER NOT NULL REFERENCES inodes(id),
        name_id     INTEGER NOT NULL REFERENCES names(id),
        value       BLOB NOT NULL,
        PRIMARY KEY (inode, name_id)
    )",
    // Local mount state; never part of the metadata dump.
    "CREATE TABLE settings (
        key         TEXT PRIMARY KEY,
        value       BLOB NOT NULL
    )",
];

const INDICES: &[&str] = &[
    "CREATE INDEX ix_contents_parent_inode ON contents(parent_inode)",
    "CREATE INDEX ix_contents_inode ON contents(inode)",
    "CREATE INDEX ix_ext_attributes_inode ON ext_attributes(inode)",
    "CREATE INDEX ix_blocks_obj_id ON blocks(obj_id)",
    "CREATE INDEX ix_inode_blocks_block_id ON inode_blocks(block_id)",
];

/// Create all tables.
pub async fn create_tables(conn: &mut SqliteConnection) -> DbResult<()> {
    for ddl in TABLES {
        sqlx::query(ddl).execute(&mut *conn).await?;
    }
    Ok(())
}

/// Create the secondary indices.
pub async fn create_indices(conn: &mut SqliteConnection) -> DbResult<()> {
    for ddl in INDICES {
        sqlx::query(ddl).execute(&mut *conn).await?;
    }
    Ok(())
}

/// Insert the reserved inodes and the `lost+found` directory.
pub async fn init_rows(conn: &mut SqliteConnection, uid: u32, gid: u32) -> DbResult<()> {
    let now = now_ns();

    // Root directory: rwxr-xr-x. Directory refcounts are one (the parent
    // link) plus the number of child directories.
    sqlx::query(
        "INSERT INTO inodes (id, mode, uid, gid, mtime_ns, atime_ns, ctime_ns, refcount)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(ROOT_INODE)
    .bind(0o040_755_i64)
    .bind(uid as i64)
    .bind(gid as i64)
    .bind(now)
    .bind(now)
    .bind(now)
    .bind(2_i64)
    .execute(&mut *conn)
    .await?;

    // Control inode: a FIFO only the mounting user can touch. The exact
    // attribute values are irrelevant; the inode only anchors the command
    // channel.
    sqlx::query(
        "INSERT INTO inodes (id, mode, uid, gid, mtime_ns, atime_ns, ctime_ns, refcount)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(CTRL_INODE)
    .bind(0o010_600_i64)
    .bind(uid as i64)
    .bind(gid as i64)
    .bind(now)
    .bind(now)
    .bind(now)
    .bind(42_i64)
    .execute(&mut *conn)
    .await?;

    // lost+found, where fsck moves orphaned data.
    let res = sqlx::query(
        "INSERT INTO inodes (mode, uid, gid, mtime_ns, atime_ns, ctime_ns, refcount)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(0o040_700_i64)
    .bind(uid as i64)
    .bind(gid as i64)
    .bind(now)
    .bind(now)
    .bind(now)
    .bind(1_i64)
    .execute(&mut *conn)
    .await?;
    let lf_inode = res.last_insert_rowid();

    let res = sqlx::query("INSERT INTO names (name, refcount) VALUES (?, 1)")
        .bind(b"lost+found".as_slice())
        .execute(&mut *conn)
        .await?;
    let name_id = res.last_insert_rowid();

    sqlx::query("INSERT INTO contents (name_id, inode, parent_inode) VALUES (?, ?, ?)")
        .bind(name_id)
        .bind(lf_inode)
        .bind(ROOT_INODE)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// Re-derive every refcount column from its referring table. Used after a
/// metadata restore, where refcounts are not trusted.
pub async fn refresh_refcounts(conn: &mut SqliteConnection) -> DbResult<()> {
    sqlx::query(
        "UPDATE objects SET refcount =
         (SELECT COUNT(*) FROM blocks WHERE blocks.obj_id = objects.id)",
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        "UPDATE blocks SET refcount =
         (SELECT COUNT(*) FROM inode_blocks WHERE inode_blocks.block_id = blocks.id)",
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        "UPDATE inodes SET refcount = CASE
         WHEN (inodes.mode & 61440) = 16384 THEN
             1 + (SELECT COUNT(*) FROM contents
                  JOIN inodes AS child ON child.id = contents.inode
                  WHERE contents.parent_inode = inodes.id
                  AND (child.mode & 61440) = 16384)
         ELSE
             (SELECT COUNT(*) FROM contents WHERE contents.inode = inodes.id)
         END",
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        "UPDATE names SET refcount =
         (SELECT COUNT(*) FROM contents WHERE contents.name_id = names.id)
         + (SELECT COUNT(*) FROM ext_attributes WHERE ext_attributes.name_id = names.id)",
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}
