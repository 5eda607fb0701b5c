use async_trait::async_trait;
use bytes::Bytes;

use super::{ObjectMetadata, ObjectVersionStore, VersionToken};
use crate::resilience::{RetryConfig, RetryExecutor};
use crate::Result;

/// Wraps a store and retries transient (`BackendUnavailable`) failures.
///
/// Every store call is idempotent from the caller's point of view except
/// `put`, which only ever adds a version, so a retried put at worst leaves
/// an extra identical version behind.
pub struct RetryingStore<S> {
    inner: S,
    retry: RetryExecutor,
}

impl<S: ObjectVersionStore> RetryingStore<S> {
    /// Wrap `inner` with `config`
    pub fn new(inner: S, config: RetryConfig) -> Self {
        Self {
            inner,
            retry: RetryExecutor::new(config),
        }
    }

    /// Wrapped store
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: ObjectVersionStore> ObjectVersionStore for RetryingStore<S> {
    fn namespace(&self) -> &str {
        self.inner.namespace()
    }

    async fn put(&self, key: &str, bytes: Bytes) -> Result<VersionToken> {
        self.retry
            .execute("store.put", || self.inner.put(key, bytes.clone()))
            .await
    }

    async fn get(&self, key: &str, version: Option<&VersionToken>) -> Result<Bytes> {
        self.retry.execute("store.get", || self.inner.get(key, version)).await
    }

    async fn list_versions(&self, key: &str) -> Result<Vec<VersionToken>> {
        self.retry
            .execute("store.list_versions", || self.inner.list_versions(key))
            .await
    }

    async fn head(&self, key: &str, version: Option<&VersionToken>) -> Result<ObjectMetadata> {
        self.retry.execute("store.head", || self.inner.head(key, version)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryObjectStore;
    use crate::VaultError;
    use std::time::Duration;

    fn fast_retry(max_attempts: usize) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_retries_through_short_outage() {
        let memory = MemoryObjectStore::new("state");
        let store = RetryingStore::new(memory.clone(), fast_retry(3));
        memory.inject_unavailable(2);

        let token = store.put("k", Bytes::from("data")).await.unwrap();
        assert_eq!(token.as_str(), "v1");
    }

    #[tokio::test]
    async fn test_gives_up_after_bounded_attempts() {
        let memory = MemoryObjectStore::new("state");
        let store = RetryingStore::new(memory.clone(), fast_retry(2));
        memory.inject_unavailable(5);

        let result = store.head("k", None).await;
        assert!(matches!(result, Err(VaultError::BackendUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_version_not_found_is_not_retried() {
        let memory = MemoryObjectStore::new("state");
        let store = RetryingStore::new(memory, fast_retry(3));

        let result = store.get("missing", None).await;
        assert!(matches!(result, Err(VaultError::VersionNotFound { .. })));
    }
}
