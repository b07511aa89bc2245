//! # Backend Abstraction
//!
//! Typed object I/O against a remote store. A backend maps string keys to
//! blobs plus a small typed metadata mapping. Implementations only provide
//! the primitive operations; retry on temporary failure is layered on top
//! by [`retry::RetryBackend`], compression and encryption by
//! [`crate::codec::CodecBackend`].

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod local;
pub mod mem;
pub mod retry;

pub use local::LocalBackend;
pub use mem::MemBackend;
pub use retry::{RetryBackend, RetryPolicy, RetryingList};

/// Backend error taxonomy shared by all drivers.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The requested object does not exist.
    #[error("backend has nothing stored under key {0:?}")]
    NoSuchObject(String),

    /// The storage location itself (bucket, prefix, directory) is missing.
    #[error("storage location {0:?} does not exist")]
    DanglingStorageUrl(String),

    /// The supplied credentials are invalid.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The credentials do not grant access to the requested operation.
    #[error("access denied: {0}")]
    Authorization(String),

    /// Payload failed an integrity check (checksum, HMAC, framing).
    #[error("corrupted object {key:?}: {reason}")]
    CorruptedObject { key: String, reason: String },

    /// The metadata header digest does not match its contents.
    #[error("metadata digest mismatch for object {0:?}")]
    BadDigest(String),

    /// HTTP-level failure from a remote driver.
    #[error("HTTP error {status}")]
    Http {
        status: u16,
        retry_after: Option<Duration>,
    },

    /// Transient failure (network, throttling, expired token). The retry
    /// wrapper re-attempts these transparently.
    #[error("temporary failure: {reason}")]
    Temporary {
        reason: String,
        retry_after: Option<Duration>,
    },

    /// Local I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Metadata could not be encoded or decoded.
    #[error("invalid object metadata: {0}")]
    InvalidMeta(String),
}

impl BackendError {
    /// Server-provided hint for the next retry delay, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            BackendError::Http { retry_after, .. } => *retry_after,
            BackendError::Temporary { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Result alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// A single typed metadata value. Values survive a round trip through the
/// backend bit-exact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetaValue {
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    Bool(bool),
    Float(f64),
}

impl MetaValue {
    fn tag(&self) -> u8 {
        match self {
            MetaValue::Int(_) => 0,
            MetaValue::Str(_) => 1,
            MetaValue::Bytes(_) => 2,
            MetaValue::Bool(_) => 3,
            MetaValue::Float(_) => 4,
        }
    }
}

/// Object metadata: a mapping of ASCII identifiers to typed values.
///
/// The map is ordered so that the wire encoding (and therefore the header
/// digest computed over it) is canonical.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    entries: BTreeMap<String, MetaValue>,
}

impl ObjectMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: MetaValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<MetaValue> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.entries.get(key)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.entries.get(key) {
            Some(MetaValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(MetaValue::Str(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        match self.entries.get(key) {
            Some(MetaValue::Bytes(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetaValue)> {
        self.entries.iter()
    }

    /// Canonical length-prefixed wire encoding. Keys are sorted; each entry
    /// is `key_len u16 | key | tag u8 | value`, values length-prefixed
    /// where variable.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (key, value) in &self.entries {
            out.extend_from_slice(&(key.len() as u16).to_le_bytes());
            out.extend_from_slice(key.as_bytes());
            out.push(value.tag());
            match value {
                MetaValue::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
                MetaValue::Str(v) => {
                    out.extend_from_slice(&(v.len() as u32).to_le_bytes());
                    out.extend_from_slice(v.as_bytes());
                }
                MetaValue::Bytes(v) => {
                    out.extend_from_slice(&(v.len() as u32).to_le_bytes());
                    out.extend_from_slice(v);
                }
                MetaValue::Bool(v) => out.push(*v as u8),
                MetaValue::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
            }
        }
        out
    }

    /// Decode the wire encoding produced by [`ObjectMeta::to_wire`].
    pub fn from_wire(data: &[u8]) -> BackendResult<Self> {
        let mut cur = WireCursor::new(data);
        let count = cur.u32()?;
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let key_len = cur.u16()? as usize;
            let key = String::from_utf8(cur.take(key_len)?.to_vec())
                .map_err(|_| BackendError::InvalidMeta("non-UTF-8 metadata key".into()))?;
            let tag = cur.u8()?;
            let value = match tag {
                0 => MetaValue::Int(i64::from_le_bytes(cur.array()?)),
                1 => {
                    let len = cur.u32()? as usize;
                    MetaValue::Str(
                        String::from_utf8(cur.take(len)?.to_vec()).map_err(|_| {
                            BackendError::InvalidMeta("non-UTF-8 metadata string".into())
                        })?,
                    )
                }
                2 => {
                    let len = cur.u32()? as usize;
                    MetaValue::Bytes(cur.take(len)?.to_vec())
                }
                3 => MetaValue::Bool(cur.u8()? != 0),
                4 => MetaValue::Float(f64::from_le_bytes(cur.array()?)),
                other => {
                    return Err(BackendError::InvalidMeta(format!(
                        "unknown metadata value tag {}",
                        other
                    )))
                }
            };
            entries.insert(key, value);
        }
        if !cur.is_empty() {
            return Err(BackendError::InvalidMeta(
                "trailing bytes after metadata".into(),
            ));
        }
        Ok(Self { entries })
    }
}

struct WireCursor<'a> {
    data: &'a [u8],
}

impl<'a> WireCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn take(&mut self, n: usize) -> BackendResult<&'a [u8]> {
        if self.data.len() < n {
            return Err(BackendError::InvalidMeta("truncated metadata".into()));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> BackendResult<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn u8(&mut self) -> BackendResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> BackendResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> BackendResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Buffered reader over an object, carrying the object's metadata.
pub struct ObjectReader {
    metadata: ObjectMeta,
    cursor: std::io::Cursor<Vec<u8>>,
}

impl ObjectReader {
    pub fn new(data: Vec<u8>, metadata: ObjectMeta) -> Self {
        Self {
            metadata,
            cursor: std::io::Cursor::new(data),
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    /// Remaining payload as a slice.
    pub fn remaining(&self) -> &[u8] {
        &self.cursor.get_ref()[self.cursor.position() as usize..]
    }
}

impl Read for ObjectReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

/// Buffered writer for an object. Data is accumulated and stored on
/// [`ObjectWriter::close`]; nothing is visible in the backend before that.
pub struct ObjectWriter<'a> {
    backend: &'a dyn Backend,
    key: String,
    metadata: Option<ObjectMeta>,
    buf: Vec<u8>,
}

impl<'a> ObjectWriter<'a> {
    pub fn write(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Store the accumulated payload. Returns the stored (on-wire) size.
    pub async fn close(self) -> BackendResult<u64> {
        self.backend
            .store(&self.key, &self.buf, self.metadata)
            .await
    }
}

/// Typed object I/O against a remote store.
///
/// Implementations must be cheap to share (`Arc<dyn Backend>`); all methods
/// take `&self`.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Retrieve payload and metadata of `key`.
    async fn fetch(&self, key: &str) -> BackendResult<(Vec<u8>, ObjectMeta)>;

    /// Store `data` under `key`, replacing any previous object. Returns the
    /// stored (on-wire) size.
    async fn store(
        &self,
        key: &str,
        data: &[u8],
        metadata: Option<ObjectMeta>,
    ) -> BackendResult<u64>;

    /// Retrieve the metadata of `key` without its payload.
    async fn lookup(&self, key: &str) -> BackendResult<ObjectMeta>;

    /// Size of the object stored under `key`.
    async fn get_size(&self, key: &str) -> BackendResult<u64>;

    /// One page of keys starting with `prefix`, in lexicographic order,
    /// strictly after `start_after` when given. An empty page means the
    /// listing is exhausted. Callers wanting transparent restart on
    /// temporary failure use [`RetryingList`].
    async fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> BackendResult<Vec<String>>;

    /// Delete the object stored under `key`. With `force`, a missing
    /// object is not an error.
    async fn delete(&self, key: &str, force: bool) -> BackendResult<()>;

    /// Server-side copy of `src` to `dst`. With `metadata == None` the
    /// source metadata is preserved.
    async fn copy(&self, src: &str, dst: &str, metadata: Option<ObjectMeta>) -> BackendResult<()>;

    /// Replace the metadata of `key`.
    async fn update_meta(&self, key: &str, metadata: ObjectMeta) -> BackendResult<()>;

    /// Whether this backend implements `rename` natively and atomically.
    fn has_native_rename(&self) -> bool {
        false
    }

    /// Whether a successful `store` is immediately visible to `fetch`.
    fn is_get_consistent(&self) -> bool {
        false
    }

    /// Whether a successful `store` is immediately visible to listing.
    fn is_list_create_consistent(&self) -> bool {
        false
    }

    /// Whether `err` indicates a temporary condition worth retrying.
    fn is_temp_failure(&self, err: &BackendError) -> bool {
        match err {
            BackendError::Temporary { .. } => true,
            BackendError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Rename `src` to `dst`. Backends without a native rename fall back
    /// to copy + delete.
    async fn rename(&self, src: &str, dst: &str, metadata: Option<ObjectMeta>) -> BackendResult<()> {
        self.copy(src, dst, metadata).await?;
        self.delete(src, false).await
    }

    /// Delete the objects named in `keys`. Deleted keys are drained from
    /// the vector front, so on error the caller sees exactly which keys
    /// remain unprocessed.
    async fn delete_multi(&self, keys: &mut Vec<String>, force: bool) -> BackendResult<()> {
        while let Some(key) = keys.first().cloned() {
            self.delete(&key, force).await?;
            keys.remove(0);
        }
        Ok(())
    }

    /// Whether `key` exists.
    async fn contains(&self, key: &str) -> BackendResult<bool> {
        match self.lookup(key).await {
            Ok(_) => Ok(true),
            Err(BackendError::NoSuchObject(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Delete every object in the backend.
    async fn clear(&self) -> BackendResult<()> {
        loop {
            let page = self.list_page("", None, 1000).await?;
            if page.is_empty() {
                return Ok(());
            }
            for key in page {
                self.delete(&key, true).await?;
            }
        }
    }
}

/// Open `key` for buffered reading.
pub async fn open_read(backend: &dyn Backend, key: &str) -> BackendResult<ObjectReader> {
    let (data, metadata) = backend.fetch(key).await?;
    Ok(ObjectReader::new(data, metadata))
}

/// Open `key` for buffered writing. The object becomes visible on
/// [`ObjectWriter::close`].
pub fn open_write<'a>(
    backend: &'a dyn Backend,
    key: &str,
    metadata: Option<ObjectMeta>,
) -> ObjectWriter<'a> {
    ObjectWriter {
        backend,
        key: key.to_string(),
        metadata,
        buf: Vec::new(),
    }
}

/// Collect the full listing under `prefix`. Convenience for tests and
/// small namespaces; production paths use [`RetryingList`].
pub async fn list_all(backend: &dyn Backend, prefix: &str) -> BackendResult<Vec<String>> {
    let mut out = Vec::new();
    let mut start_after: Option<String> = None;
    loop {
        let page = backend
            .list_page(prefix, start_after.as_deref(), 1000)
            .await?;
        if page.is_empty() {
            return Ok(out);
        }
        start_after = page.last().cloned();
        out.extend(page);
    }
}

/// Shared handle to a backend.
pub type SharedBackend = Arc<dyn Backend>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_wire_round_trip() {
        let mut meta = ObjectMeta::new();
        meta.insert("compression", MetaValue::Str("zlib".into()));
        meta.insert("format_version", MetaValue::Int(1));
        meta.insert("digest", MetaValue::Bytes(vec![0, 1, 2, 254, 255]));
        meta.insert("encrypted", MetaValue::Bool(true));
        meta.insert("ratio", MetaValue::Float(0.3125));

        let wire = meta.to_wire();
        let back = ObjectMeta::from_wire(&wire).unwrap();
        assert_eq!(meta, back);
    }

    #[test]
    fn test_meta_wire_is_canonical() {
        let mut a = ObjectMeta::new();
        a.insert("x", MetaValue::Int(1));
        a.insert("a", MetaValue::Int(2));
        let mut b = ObjectMeta::new();
        b.insert("a", MetaValue::Int(2));
        b.insert("x", MetaValue::Int(1));
        assert_eq!(a.to_wire(), b.to_wire());
    }

    #[test]
    fn test_meta_wire_rejects_trailing_bytes() {
        let meta = ObjectMeta::new();
        let mut wire = meta.to_wire();
        wire.push(0);
        assert!(matches!(
            ObjectMeta::from_wire(&wire),
            Err(BackendError::InvalidMeta(_))
        ));
    }

    #[tokio::test]
    async fn test_open_read_write_round_trip() {
        let backend = MemBackend::new();
        let mut writer = open_write(&backend, "obj", None);
        writer.write(b"first half ");
        writer.write(b"second half");
        writer.close().await.unwrap();

        let mut reader = open_read(&backend, "obj").await.unwrap();
        assert!(reader.metadata().is_empty());
        let mut buf = String::new();
        reader.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "first half second half");
    }

    #[test]
    fn test_retry_after_hint() {
        let err = BackendError::Temporary {
            reason: "throttled".into(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(BackendError::NoSuchObject("x".into()).retry_after(), None);
    }
}
