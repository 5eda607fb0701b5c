use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{content_hash, ObjectMetadata, ObjectVersionStore, VersionToken};
use crate::{Result, VaultError};

#[derive(Debug, Clone)]
struct StoredVersion {
    token: VersionToken,
    bytes: Bytes,
    content_hash: String,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct VersionedObject {
    /// Oldest first; the last entry is current
    versions: Vec<StoredVersion>,
    next_version: u64,
}

/// In-memory versioned object store.
///
/// Version tokens are `v1`, `v2`, ... per key, so histories read the same
/// way in tests and demos as they do in an operator's notes.
#[derive(Clone)]
pub struct MemoryObjectStore {
    namespace: String,
    objects: Arc<DashMap<String, VersionedObject>>,
    failures_to_inject: Arc<AtomicUsize>,
}

impl MemoryObjectStore {
    /// Empty store reporting `namespace`
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            objects: Arc::new(DashMap::new()),
            failures_to_inject: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make the next `count` calls fail with `BackendUnavailable`
    pub fn inject_unavailable(&self, count: usize) {
        self.failures_to_inject.store(count, Ordering::SeqCst);
    }

    /// Drop one version, the way an external lifecycle rule would
    pub fn expire_version(&self, key: &str, version: &VersionToken) -> bool {
        match self.objects.get_mut(key) {
            Some(mut object) => {
                let before = object.versions.len();
                object.versions.retain(|v| &v.token != version);
                object.versions.len() != before
            }
            None => false,
        }
    }

    fn check_available(&self) -> Result<()> {
        let injected = self
            .failures_to_inject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(VaultError::unavailable(
                format!("memory:{}", self.namespace),
                "injected outage",
            )),
            Err(_) => Ok(()),
        }
    }

    fn find(&self, key: &str, version: Option<&VersionToken>) -> Result<StoredVersion> {
        let not_found = || VaultError::VersionNotFound {
            key: key.to_string(),
            version: version.map(|v| v.to_string()),
        };

        let object = self.objects.get(key).ok_or_else(not_found)?;
        let found = match version {
            Some(token) => object.versions.iter().find(|v| &v.token == token),
            None => object.versions.last(),
        };
        found.cloned().ok_or_else(not_found)
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl ObjectVersionStore for MemoryObjectStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn put(&self, key: &str, bytes: Bytes) -> Result<VersionToken> {
        self.check_available()?;

        let mut object = self.objects.entry(key.to_string()).or_default();
        object.next_version += 1;
        let token = VersionToken::new(format!("v{}", object.next_version));
        object.versions.push(StoredVersion {
            token: token.clone(),
            content_hash: content_hash(&bytes),
            bytes,
            last_modified: Utc::now(),
        });

        Ok(token)
    }

    async fn get(&self, key: &str, version: Option<&VersionToken>) -> Result<Bytes> {
        self.check_available()?;
        Ok(self.find(key, version)?.bytes)
    }

    async fn list_versions(&self, key: &str) -> Result<Vec<VersionToken>> {
        self.check_available()?;
        Ok(self
            .objects
            .get(key)
            .map(|object| object.versions.iter().rev().map(|v| v.token.clone()).collect())
            .unwrap_or_default())
    }

    async fn head(&self, key: &str, version: Option<&VersionToken>) -> Result<ObjectMetadata> {
        self.check_available()?;
        let stored = self.find(key, version)?;
        Ok(ObjectMetadata {
            key: key.to_string(),
            version: stored.token,
            size_bytes: stored.bytes.len() as u64,
            content_hash: stored.content_hash,
            last_modified: stored.last_modified,
        })
    }
}
