//! Retry decorator for backends.
//!
//! Wraps every backend operation such that temporary failures (as judged by
//! the inner backend's `is_temp_failure`) are re-attempted at increasing
//! intervals: initial 20 ms, doubled per attempt, capped at 5 minutes, with
//! a `retry_after` hint overriding the next delay. The wrapper gives up
//! after a total wall-clock budget (24 hours by default) and re-raises the
//! last error.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Backend, BackendError, BackendResult, ObjectMeta, SharedBackend};

/// Retry timing parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,

    /// Total wall-clock budget across all attempts.
    pub budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(5 * 60),
            budget: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Backend decorator adding automatic retry to every operation.
pub struct RetryBackend {
    inner: SharedBackend,
    policy: RetryPolicy,
}

impl RetryBackend {
    pub fn new(inner: SharedBackend) -> Self {
        Self::with_policy(inner, RetryPolicy::default())
    }

    pub fn with_policy(inner: SharedBackend, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn run<T, F, Fut>(&self, op: &'static str, mut f: F) -> BackendResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        let started = Instant::now();
        let mut delay = self.policy.initial_delay;
        let mut attempt = 0u32;
        loop {
            match f().await {
                Ok(val) => return Ok(val),
                Err(err) if self.inner.is_temp_failure(&err) => {
                    if started.elapsed() > self.policy.budget {
                        warn!(op, attempt, "retry budget exceeded, giving up: {}", err);
                        return Err(err);
                    }
                    attempt += 1;
                    if attempt <= 2 {
                        debug!(op, attempt, "temporary backend failure, retrying: {}", err);
                    } else {
                        warn!(op, attempt, "temporary backend failure, retrying: {}", err);
                    }
                    if let Some(hint) = err.retry_after() {
                        delay = hint;
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.policy.max_delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl Backend for RetryBackend {
    async fn fetch(&self, key: &str) -> BackendResult<(Vec<u8>, ObjectMeta)> {
        self.run("fetch", || self.inner.fetch(key)).await
    }

    async fn store(
        &self,
        key: &str,
        data: &[u8],
        metadata: Option<ObjectMeta>,
    ) -> BackendResult<u64> {
        self.run("store", || self.inner.store(key, data, metadata.clone()))
            .await
    }

    async fn lookup(&self, key: &str) -> BackendResult<ObjectMeta> {
        self.run("lookup", || self.inner.lookup(key)).await
    }

    async fn get_size(&self, key: &str) -> BackendResult<u64> {
        self.run("get_size", || self.inner.get_size(key)).await
    }

    async fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> BackendResult<Vec<String>> {
        self.run("list_page", || self.inner.list_page(prefix, start_after, limit))
            .await
    }

    async fn delete(&self, key: &str, force: bool) -> BackendResult<()> {
        self.run("delete", || self.inner.delete(key, force)).await
    }

    async fn copy(&self, src: &str, dst: &str, metadata: Option<ObjectMeta>) -> BackendResult<()> {
        self.run("copy", || self.inner.copy(src, dst, metadata.clone()))
            .await
    }

    async fn update_meta(&self, key: &str, metadata: ObjectMeta) -> BackendResult<()> {
        self.run("update_meta", || self.inner.update_meta(key, metadata.clone()))
            .await
    }

    async fn rename(&self, src: &str, dst: &str, metadata: Option<ObjectMeta>) -> BackendResult<()> {
        self.run("rename", || self.inner.rename(src, dst, metadata.clone()))
            .await
    }

    fn has_native_rename(&self) -> bool {
        self.inner.has_native_rename()
    }

    fn is_get_consistent(&self) -> bool {
        self.inner.is_get_consistent()
    }

    fn is_list_create_consistent(&self) -> bool {
        self.inner.is_list_create_consistent()
    }

    fn is_temp_failure(&self, err: &BackendError) -> bool {
        self.inner.is_temp_failure(err)
    }
}

/// Restartable listing.
///
/// Iterates the keys under `prefix` in order. When retrieving a page fails
/// temporarily, the listing is restarted from `start_after = last yielded
/// key`, so the caller sees one continuous sequence.
pub struct RetryingList {
    backend: SharedBackend,
    prefix: String,
    last: Option<String>,
    page: std::collections::VecDeque<String>,
    exhausted: bool,
    policy: RetryPolicy,
    page_size: usize,
}

impl RetryingList {
    pub fn new(backend: SharedBackend, prefix: &str) -> Self {
        Self::with_policy(backend, prefix, RetryPolicy::default())
    }

    pub fn with_policy(backend: SharedBackend, prefix: &str, policy: RetryPolicy) -> Self {
        Self {
            backend,
            prefix: prefix.to_string(),
            last: None,
            page: std::collections::VecDeque::new(),
            exhausted: false,
            policy,
            page_size: 1000,
        }
    }

    /// Next key, or `None` when the listing is exhausted.
    pub async fn next(&mut self) -> BackendResult<Option<String>> {
        loop {
            if let Some(key) = self.page.pop_front() {
                self.last = Some(key.clone());
                return Ok(Some(key));
            }
            if self.exhausted {
                return Ok(None);
            }
            let page = self.fetch_page().await?;
            if page.is_empty() {
                self.exhausted = true;
                return Ok(None);
            }
            self.page = page.into();
        }
    }

    /// Drain the rest of the listing into a vector.
    pub async fn collect_remaining(&mut self) -> BackendResult<Vec<String>> {
        let mut out = Vec::new();
        while let Some(key) = self.next().await? {
            out.push(key);
        }
        Ok(out)
    }

    async fn fetch_page(&mut self) -> BackendResult<Vec<String>> {
        let started = Instant::now();
        let mut delay = self.policy.initial_delay;
        loop {
            match self
                .backend
                .list_page(&self.prefix, self.last.as_deref(), self.page_size)
                .await
            {
                Ok(page) => return Ok(page),
                Err(err) if self.backend.is_temp_failure(&err) => {
                    if started.elapsed() > self.policy.budget {
                        return Err(err);
                    }
                    debug!(
                        prefix = %self.prefix,
                        "listing failed temporarily, restarting after {:?}: {}",
                        self.last,
                        err
                    );
                    if let Some(hint) = err.retry_after() {
                        delay = hint;
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.policy.max_delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}
