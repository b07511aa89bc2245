//! Local-directory backend.
//!
//! Stores each object as a pair of files under one directory: `<key>.dat`
//! with the payload and `<key>.meta` with the bincode-encoded metadata.
//! Keys are escaped so that arbitrary byte strings map onto portable file
//! names. Writes go through a temporary file and an atomic rename, so a
//! crash never leaves a half-written object visible.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{Backend, BackendError, BackendResult, ObjectMeta};

/// Backend storing objects in a local directory.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Open (or create) the backend rooted at `path`.
    pub fn open(path: impl Into<PathBuf>) -> BackendResult<Self> {
        let root: PathBuf = path.into();
        if !root.exists() {
            return Err(BackendError::DanglingStorageUrl(
                root.to_string_lossy().into_owned(),
            ));
        }
        Ok(Self { root })
    }

    /// Create the directory if needed and open the backend.
    pub fn create(path: impl Into<PathBuf>) -> BackendResult<Self> {
        let root: PathBuf = path.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.dat", escape(key)))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.meta", escape(key)))
    }

    fn read_meta(&self, key: &str) -> BackendResult<ObjectMeta> {
        let raw = match std::fs::read(self.meta_path(key)) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::NoSuchObject(key.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        bincode::deserialize(&raw)
            .map_err(|err| BackendError::InvalidMeta(format!("metadata sidecar: {}", err)))
    }

    fn write_meta(&self, key: &str, meta: &ObjectMeta) -> BackendResult<()> {
        let raw = bincode::serialize(meta)
            .map_err(|err| BackendError::InvalidMeta(format!("metadata sidecar: {}", err)))?;
        atomic_write(&self.meta_path(key), &raw)?;
        Ok(())
    }
}

/// Escape a key into a portable file name. Alphanumerics, `-`, `_` and `.`
/// pass through; every other byte becomes `=xx`.
fn escape(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for &b in key.as_bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => out.push(b as char),
            _ => out.push_str(&format!("={:02x}", b)),
        }
    }
    out
}

/// Invert [`escape`]. Returns `None` on malformed input.
fn unescape(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'=' {
            if i + 2 >= bytes.len() {
                return None;
            }
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut fh = std::fs::File::create(&tmp)?;
        fh.write_all(data)?;
        fh.sync_data()?;
    }
    std::fs::rename(&tmp, path)
}

#[async_trait]
impl Backend for LocalBackend {
    async fn fetch(&self, key: &str) -> BackendResult<(Vec<u8>, ObjectMeta)> {
        let meta = self.read_meta(key)?;
        let data = std::fs::read(self.data_path(key))?;
        Ok((data, meta))
    }

    async fn store(
        &self,
        key: &str,
        data: &[u8],
        metadata: Option<ObjectMeta>,
    ) -> BackendResult<u64> {
        atomic_write(&self.data_path(key), data)?;
        self.write_meta(key, &metadata.unwrap_or_default())?;
        Ok(data.len() as u64)
    }

    async fn lookup(&self, key: &str) -> BackendResult<ObjectMeta> {
        self.read_meta(key)
    }

    async fn get_size(&self, key: &str) -> BackendResult<u64> {
        match std::fs::metadata(self.data_path(key)) {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(BackendError::NoSuchObject(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> BackendResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(stem) = name.strip_suffix(".dat") else {
                continue;
            };
            let Some(key) = unescape(stem) else {
                continue;
            };
            if key.starts_with(prefix) && start_after.map_or(true, |s| key.as_str() > s) {
                keys.push(key);
            }
        }
        keys.sort();
        keys.truncate(limit);
        Ok(keys)
    }

    async fn delete(&self, key: &str, force: bool) -> BackendResult<()> {
        match std::fs::remove_file(self.data_path(key)) {
            Ok(()) => {
                let _ = std::fs::remove_file(self.meta_path(key));
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if force {
                    Ok(())
                } else {
                    Err(BackendError::NoSuchObject(key.to_string()))
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn copy(&self, src: &str, dst: &str, metadata: Option<ObjectMeta>) -> BackendResult<()> {
        let meta = match metadata {
            Some(meta) => meta,
            None => self.read_meta(src)?,
        };
        match std::fs::copy(self.data_path(src), self.data_path(dst)) {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::NoSuchObject(src.to_string()))
            }
            Err(err) => return Err(err.into()),
        }
        self.write_meta(dst, &meta)
    }

    async fn update_meta(&self, key: &str, metadata: ObjectMeta) -> BackendResult<()> {
        if !self.data_path(key).exists() {
            return Err(BackendError::NoSuchObject(key.to_string()));
        }
        self.write_meta(key, &metadata)
    }

    async fn rename(&self, src: &str, dst: &str, metadata: Option<ObjectMeta>) -> BackendResult<()> {
        let meta = match metadata {
            Some(meta) => Some(meta),
            None => None,
        };
        match std::fs::rename(self.data_path(src), self.data_path(dst)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::NoSuchObject(src.to_string()))
            }
            Err(err) => return Err(err.into()),
        }
        match std::fs::rename(self.meta_path(src), self.meta_path(dst)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        if let Some(meta) = meta {
            self.write_meta(dst, &meta)?;
        }
        Ok(())
    }

    fn has_native_rename(&self) -> bool {
        true
    }

    fn is_get_consistent(&self) -> bool {
        true
    }

    fn is_list_create_consistent(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::list_all;
    use crate::test_util::TempDir;

    #[test]
    fn test_escape_round_trip() {
        for key in ["data_1", "weird/key with spaces", "a=b", "..", "metadata"] {
            assert_eq!(unescape(&escape(key)).as_deref(), Some(key));
        }
    }

    #[tokio::test]
    async fn test_store_fetch_delete() {
        let dir = TempDir::new("local-backend");
        let backend = LocalBackend::create(dir.path()).unwrap();

        backend.store("data_1", b"abc", None).await.unwrap();
        let (data, _) = backend.fetch("data_1").await.unwrap();
        assert_eq!(data, b"abc");

        backend.delete("data_1", false).await.unwrap();
        assert!(matches!(
            backend.fetch("data_1").await,
            Err(BackendError::NoSuchObject(_))
        ));
    }

    #[tokio::test]
    async fn test_native_rename() {
        let dir = TempDir::new("local-backend-rename");
        let backend = LocalBackend::create(dir.path()).unwrap();
        assert!(backend.has_native_rename());

        backend.store("metadata", b"dump", None).await.unwrap();
        backend.rename("metadata", "metadata_bak_0", None).await.unwrap();

        assert!(!backend.contains("metadata").await.unwrap());
        assert_eq!(backend.fetch("metadata_bak_0").await.unwrap().0, b"dump");
    }

    #[tokio::test]
    async fn test_listing_skips_foreign_files() {
        let dir = TempDir::new("local-backend-list");
        let backend = LocalBackend::create(dir.path()).unwrap();
        backend.store("data_1", b"x", None).await.unwrap();
        std::fs::write(dir.path().join("stray.txt"), b"noise").unwrap();

        let keys = list_all(&backend, "").await.unwrap();
        assert_eq!(keys, vec!["data_1"]);
    }

    #[tokio::test]
    async fn test_open_missing_root_is_dangling() {
        let dir = TempDir::new("local-backend-missing");
        let missing = dir.path().join("nope");
        assert!(matches!(
            LocalBackend::open(&missing),
            Err(BackendError::DanglingStorageUrl(_))
        ));
    }
}
