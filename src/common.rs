//! Shared identifiers, reserved inodes and key-space helpers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Inode identifier (SQLite rowid).
pub type InodeId = i64;

/// Data object identifier.
pub type ObjectId = i64;

/// Block identifier.
pub type BlockId = i64;

/// Interned name identifier.
pub type NameId = i64;

/// The root directory inode.
pub const ROOT_INODE: InodeId = 1;

/// The control inode. Carries no data; xattr operations on it form the
/// command channel of the mounted file system.
pub const CTRL_INODE: InodeId = 2;

/// Well-known name under which the control inode is reachable in every
/// directory lookup.
pub const CTRL_NAME: &[u8] = b".__vaultfs_ctrl__";

/// Inode ids are constrained to 32 bits so that they fit into `ino_t`
/// on all supported platforms.
pub const MAX_INODE: InodeId = u32::MAX as InodeId;

/// Current on-wire revision of object payloads and metadata headers.
pub const FORMAT_VERSION: i64 = 1;

/// Backend key of a data object.
pub fn data_key(id: ObjectId) -> String {
    format!("data_{}", id)
}

/// Backend key of a metadata sequence sentinel.
pub fn seq_no_key(seq: i64) -> String {
    format!("seq_no_{}", seq)
}

/// Key prefix shared by all sequence sentinels.
pub const SEQ_NO_PREFIX: &str = "seq_no_";

/// Backend key of the current metadata dump.
pub const METADATA_KEY: &str = "metadata";

/// Backend key of a rotated metadata backup.
pub fn metadata_bak_key(slot: u32) -> String {
    format!("metadata_bak_{}", slot)
}

/// Number of rotated metadata backups kept in the backend.
pub const METADATA_BAK_SLOTS: u32 = 10;

/// Backend key of the wrapped master key.
pub const PASSPHRASE_KEY: &str = "passphrase";

/// Backend key of the mount-state marker.
pub const DIRTY_KEY: &str = "dirty";

/// Current time as integer nanoseconds since the epoch.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
