//! Object version store adapter.
//!
//! Wraps a versioned key/object store. Writing a key never removes older
//! versions; deleting versions is lifecycle policy outside this crate.

mod memory;
mod retrying;
/// S3 object store
#[cfg(feature = "s3")]
pub mod s3;

pub use memory::MemoryObjectStore;
pub use retrying::RetryingStore;
#[cfg(feature = "s3")]
pub use s3::{S3ObjectStore, S3StoreConfig};

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::Result;

/// Opaque token naming one version of an object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(String);

impl VersionToken {
    /// Token from its string form
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// String form of the token
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VersionToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Metadata of one object version, as returned by `head`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Object key
    pub key: String,
    /// Version described
    pub version: VersionToken,
    /// Size in bytes
    pub size_bytes: u64,
    /// Lowercase hex SHA-256 of the object bytes
    pub content_hash: String,
    /// Last-modified time
    pub last_modified: DateTime<Utc>,
}

/// Versioned key/object store
#[async_trait]
pub trait ObjectVersionStore: Send + Sync {
    /// Bucket or namespace the keys live in
    fn namespace(&self) -> &str;

    /// Write a new current version of `key`
    async fn put(&self, key: &str, bytes: Bytes) -> Result<VersionToken>;

    /// Read a version of `key`; `None` reads the current version
    async fn get(&self, key: &str, version: Option<&VersionToken>) -> Result<Bytes>;

    /// All retained versions of `key`, newest first
    async fn list_versions(&self, key: &str) -> Result<Vec<VersionToken>>;

    /// Metadata of a version of `key`; `None` describes the current version
    async fn head(&self, key: &str, version: Option<&VersionToken>) -> Result<ObjectMetadata>;
}

#[async_trait]
impl<T: ObjectVersionStore + ?Sized> ObjectVersionStore for std::sync::Arc<T> {
    fn namespace(&self) -> &str {
        (**self).namespace()
    }

    async fn put(&self, key: &str, bytes: Bytes) -> Result<VersionToken> {
        (**self).put(key, bytes).await
    }

    async fn get(&self, key: &str, version: Option<&VersionToken>) -> Result<Bytes> {
        (**self).get(key, version).await
    }

    async fn list_versions(&self, key: &str) -> Result<Vec<VersionToken>> {
        (**self).list_versions(key).await
    }

    async fn head(&self, key: &str, version: Option<&VersionToken>) -> Result<ObjectMetadata> {
        (**self).head(key, version).await
    }
}

/// Lowercase hex SHA-256 of `bytes`
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
