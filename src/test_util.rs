//! Shared helpers for unit tests.

use std::path::{Path, PathBuf};

use rand::Rng;

/// Self-cleaning temporary directory.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new(tag: &str) -> Self {
        let suffix: u64 = rand::thread_rng().gen();
        let path = std::env::temp_dir().join(format!("vaultfs-{}-{:016x}", tag, suffix));
        std::fs::create_dir_all(&path).expect("create temp dir");
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}
