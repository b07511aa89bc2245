//! In-memory backend.
//!
//! Holds all objects in a map. Besides serving as the reference
//! implementation for tests, it can simulate the failure modes of a real
//! remote store: injected temporary failures and delayed visibility of
//! newly stored objects (eventual consistency).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Backend, BackendError, BackendResult, ObjectMeta};

struct StoredObject {
    data: Vec<u8>,
    meta: ObjectMeta,
    /// Object is invisible to fetch/lookup/list before this instant.
    visible_at: Instant,
}

/// In-memory object store with fault injection.
pub struct MemBackend {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    /// Remaining operations that fail with a temporary error.
    fail_budget: AtomicU32,
    /// Visibility delay applied to newly stored objects.
    propagation_delay: Mutex<Duration>,
    get_consistent: bool,
}

impl MemBackend {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            fail_budget: AtomicU32::new(0),
            propagation_delay: Mutex::new(Duration::ZERO),
            get_consistent: true,
        }
    }

    /// An eventually-consistent variant: stored objects become visible
    /// only after `delay`.
    pub fn eventually_consistent(delay: Duration) -> Self {
        let backend = Self {
            get_consistent: false,
            ..Self::new()
        };
        *backend.propagation_delay.lock() = delay;
        backend
    }

    /// Make the next `n` operations fail with a temporary error.
    pub fn inject_failures(&self, n: u32) {
        self.fail_budget.store(n, Ordering::SeqCst);
    }

    /// Injected failures not yet consumed.
    pub fn failures_remaining(&self) -> u32 {
        self.fail_budget.load(Ordering::SeqCst)
    }

    /// Number of stored objects, including not-yet-visible ones.
    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    /// Total payload bytes, including not-yet-visible objects.
    pub fn total_size(&self) -> u64 {
        self.objects.lock().values().map(|o| o.data.len() as u64).sum()
    }

    /// Direct payload access for tests (ignores visibility).
    pub fn raw_get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(key).map(|o| o.data.clone())
    }

    /// Overwrite payload bytes in place, bypassing the API. Used by tests
    /// to simulate silent corruption in the remote store.
    pub fn corrupt(&self, key: &str, offset: usize) -> bool {
        let mut objects = self.objects.lock();
        match objects.get_mut(key) {
            Some(obj) if offset < obj.data.len() => {
                obj.data[offset] ^= 0x01;
                true
            }
            _ => false,
        }
    }

    fn check_fault(&self) -> BackendResult<()> {
        let mut current = self.fail_budget.load(Ordering::SeqCst);
        while current > 0 {
            match self.fail_budget.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Err(BackendError::Temporary {
                        reason: "injected failure".into(),
                        retry_after: None,
                    })
                }
                Err(actual) => current = actual,
            }
        }
        Ok(())
    }

    fn visible<'a>(
        objects: &'a BTreeMap<String, StoredObject>,
        key: &str,
    ) -> Option<&'a StoredObject> {
        objects
            .get(key)
            .filter(|obj| obj.visible_at <= Instant::now())
    }
}

impl Default for MemBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemBackend {
    async fn fetch(&self, key: &str) -> BackendResult<(Vec<u8>, ObjectMeta)> {
        self.check_fault()?;
        let objects = self.objects.lock();
        match Self::visible(&objects, key) {
            Some(obj) => Ok((obj.data.clone(), obj.meta.clone())),
            None => Err(BackendError::NoSuchObject(key.to_string())),
        }
    }

    async fn store(
        &self,
        key: &str,
        data: &[u8],
        metadata: Option<ObjectMeta>,
    ) -> BackendResult<u64> {
        self.check_fault()?;
        let visible_at = Instant::now() + *self.propagation_delay.lock();
        self.objects.lock().insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                meta: metadata.unwrap_or_default(),
                visible_at,
            },
        );
        Ok(data.len() as u64)
    }

    async fn lookup(&self, key: &str) -> BackendResult<ObjectMeta> {
        self.check_fault()?;
        let objects = self.objects.lock();
        match Self::visible(&objects, key) {
            Some(obj) => Ok(obj.meta.clone()),
            None => Err(BackendError::NoSuchObject(key.to_string())),
        }
    }

    async fn get_size(&self, key: &str) -> BackendResult<u64> {
        self.check_fault()?;
        let objects = self.objects.lock();
        match Self::visible(&objects, key) {
            Some(obj) => Ok(obj.data.len() as u64),
            None => Err(BackendError::NoSuchObject(key.to_string())),
        }
    }

    async fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> BackendResult<Vec<String>> {
        self.check_fault()?;
        let now = Instant::now();
        let objects = self.objects.lock();
        Ok(objects
            .iter()
            .filter(|(key, obj)| {
                key.starts_with(prefix)
                    && obj.visible_at <= now
                    && start_after.map_or(true, |s| key.as_str() > s)
            })
            .take(limit)
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn delete(&self, key: &str, force: bool) -> BackendResult<()> {
        self.check_fault()?;
        let removed = self.objects.lock().remove(key).is_some();
        if !removed && !force {
            return Err(BackendError::NoSuchObject(key.to_string()));
        }
        Ok(())
    }

    async fn copy(&self, src: &str, dst: &str, metadata: Option<ObjectMeta>) -> BackendResult<()> {
        self.check_fault()?;
        let mut objects = self.objects.lock();
        let (data, src_meta) = match Self::visible(&objects, src) {
            Some(obj) => (obj.data.clone(), obj.meta.clone()),
            None => return Err(BackendError::NoSuchObject(src.to_string())),
        };
        objects.insert(
            dst.to_string(),
            StoredObject {
                data,
                meta: metadata.unwrap_or(src_meta),
                visible_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn update_meta(&self, key: &str, metadata: ObjectMeta) -> BackendResult<()> {
        self.check_fault()?;
        let mut objects = self.objects.lock();
        match objects.get_mut(key) {
            Some(obj) => {
                obj.meta = metadata;
                Ok(())
            }
            None => Err(BackendError::NoSuchObject(key.to_string())),
        }
    }

    fn is_get_consistent(&self) -> bool {
        self.get_consistent
    }

    fn is_list_create_consistent(&self) -> bool {
        self.get_consistent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{list_all, MetaValue};

    #[tokio::test]
    async fn test_store_fetch_round_trip() {
        let backend = MemBackend::new();
        let mut meta = ObjectMeta::new();
        meta.insert("compression", MetaValue::Str("none".into()));
        backend.store("k1", b"hello", Some(meta.clone())).await.unwrap();

        let (data, got_meta) = backend.fetch("k1").await.unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(got_meta, meta);
        assert_eq!(backend.get_size("k1").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_delete_force_semantics() {
        let backend = MemBackend::new();
        assert!(matches!(
            backend.delete("nope", false).await,
            Err(BackendError::NoSuchObject(_))
        ));
        backend.delete("nope", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_multi_drains_processed_keys() {
        let backend = MemBackend::new();
        backend.store("a", b"1", None).await.unwrap();
        backend.store("c", b"3", None).await.unwrap();

        let mut keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let err = backend.delete_multi(&mut keys, false).await.unwrap_err();
        assert!(matches!(err, BackendError::NoSuchObject(_)));
        // "a" was deleted and drained; "b" (the failure) and "c" remain.
        assert_eq!(keys, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_listing_is_ordered_and_prefixed() {
        let backend = MemBackend::new();
        for key in ["data_2", "data_10", "seq_no_1", "data_1"] {
            backend.store(key, b"", None).await.unwrap();
        }
        let keys = list_all(&backend, "data_").await.unwrap();
        assert_eq!(keys, vec!["data_1", "data_10", "data_2"]);
    }

    #[tokio::test]
    async fn test_eventual_consistency_delay() {
        let backend = MemBackend::eventually_consistent(Duration::from_millis(40));
        backend.store("slow", b"v", None).await.unwrap();
        assert!(matches!(
            backend.fetch("slow").await,
            Err(BackendError::NoSuchObject(_))
        ));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(backend.fetch("slow").await.unwrap().0, b"v");
    }

    #[tokio::test]
    async fn test_copy_preserves_metadata_by_default() {
        let backend = MemBackend::new();
        let mut meta = ObjectMeta::new();
        meta.insert("md5", MetaValue::Bytes(vec![1, 2, 3]));
        backend.store("src", b"v", Some(meta.clone())).await.unwrap();
        backend.copy("src", "dst", None).await.unwrap();
        assert_eq!(backend.lookup("dst").await.unwrap(), meta);
    }
}
