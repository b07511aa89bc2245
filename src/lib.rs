//! # VAULTFS - Deduplicating, Encrypting File System over Object Storage
//!
//! A content-addressed file system whose backing store is a remote object
//! store with eventual-consistency semantics. User data is split into
//! fixed-size blocks; each block is hashed, and only previously unseen
//! blocks are uploaded. Metadata lives in a single embedded SQLite
//! database, itself stored as one object in the backend and cached
//! locally while mounted.
//!
//! ## Architecture
//!
//! - `backend`: typed object I/O with retry on temporary failure
//! - `codec`: framed compression + authenticated encryption pipeline
//! - `database`: transactional metadata store, schema, dump format
//! - `inode`: write-behind cache of inode attribute rows
//! - `cache`: block cache with deduplication and upload coordination
//! - `fs`: file-system operations, control channel, tree operations
//! - `mount`: mkfs, mount/unmount lifecycle, metadata rotation
//!
//! The FUSE adaptation layer and the CLI front-ends live outside this
//! crate; they drive the operations exposed by [`fs::Fs`] and [`mount`].

#![warn(clippy::all)]

// Shared identifiers and constants
pub mod common;

// Error types and errno mapping
pub mod error;

// Backend abstraction
pub mod backend;

// Compression + encryption pipeline
pub mod codec;

// Metadata store
pub mod database;

// Inode attribute cache
pub mod inode;

// Block cache
pub mod cache;

// File-system operations
pub mod fs;

// Mount lifecycle
pub mod mount;

#[cfg(test)]
pub(crate) mod test_util;

// Re-export commonly used types
pub use backend::{Backend, BackendError, LocalBackend, MemBackend, RetryBackend};
pub use cache::{BlockCache, CacheConfig};
pub use codec::{CodecBackend, Compression, MasterKey};
pub use common::{InodeId, CTRL_INODE, CTRL_NAME, ROOT_INODE};
pub use database::MetaDb;
pub use error::{FsError, FsResult};
pub use fs::{Fs, RequestContext};
pub use inode::{Inode, InodeCache};
pub use mount::{mkfs, MkfsOptions, Mount, MountOptions};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
