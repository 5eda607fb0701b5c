// S3 object version store
// Requires a bucket with versioning enabled; works against S3-compatible services
// (LocalStack/MinIO) through `endpoint_url` + `force_path_style`.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{content_hash, ObjectMetadata, ObjectVersionStore, VersionToken};
use crate::{Result, VaultError};

/// User metadata key holding the SHA-256 of the object body
const HASH_METADATA_KEY: &str = "sha256";

/// S3 store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3StoreConfig {
    /// Versioned bucket
    pub bucket_name: String,
    /// AWS region
    pub region: String,
    /// Custom endpoint for S3-compatible services
    pub endpoint_url: Option<String>,
    /// Path-style addressing, needed by most S3-compatible services
    pub force_path_style: bool,
}

impl Default for S3StoreConfig {
    fn default() -> Self {
        Self {
            bucket_name: "configvault-state".to_string(),
            region: "us-east-1".to_string(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

/// Versioned object store backed by an S3 bucket
pub struct S3ObjectStore {
    client: Client,
    config: S3StoreConfig,
}

impl S3ObjectStore {
    /// Build a client from the default AWS credential chain
    pub async fn new(config: S3StoreConfig) -> Result<Self> {
        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let Some(ref endpoint) = config.endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = aws_config_builder.load().await;
        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(s3_config_builder.build()),
            config,
        })
    }

    /// Create the bucket if it does not exist
    pub async fn ensure_bucket_exists(&self) -> Result<()> {
        if self
            .client
            .head_bucket()
            .bucket(&self.config.bucket_name)
            .send()
            .await
            .is_ok()
        {
            return Ok(());
        }

        let mut create_bucket = self.client.create_bucket().bucket(&self.config.bucket_name);
        if self.config.region != "us-east-1" {
            use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
            let location = BucketLocationConstraint::from(self.config.region.as_str());
            create_bucket = create_bucket.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(location)
                    .build(),
            );
        }

        create_bucket.send().await.map_err(|e| self.map_error(e, "", None))?;
        Ok(())
    }

    /// Turn on bucket versioning; history is what makes state restores possible
    pub async fn enable_bucket_versioning(&self) -> Result<()> {
        use aws_sdk_s3::types::{BucketVersioningStatus, VersioningConfiguration};

        self.client
            .put_bucket_versioning()
            .bucket(&self.config.bucket_name)
            .versioning_configuration(
                VersioningConfiguration::builder()
                    .status(BucketVersioningStatus::Enabled)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| self.map_error(e, "", None))?;
        Ok(())
    }

    fn backend_name(&self) -> String {
        format!("s3://{}", self.config.bucket_name)
    }

    fn map_error<E, R>(&self, error: SdkError<E, R>, key: &str, version: Option<&VersionToken>) -> VaultError
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
        R: std::fmt::Debug,
    {
        match error {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
                VaultError::unavailable(self.backend_name(), format!("{:?}", error))
            }
            SdkError::ServiceError(context) => {
                let service_error = context.into_err();
                match service_error.code() {
                    Some("NoSuchKey") | Some("NoSuchVersion") | Some("NotFound") | Some("InvalidArgument")
                        if !key.is_empty() =>
                    {
                        VaultError::VersionNotFound {
                            key: key.to_string(),
                            version: version.map(|v| v.to_string()),
                        }
                    }
                    Some("SlowDown") | Some("ServiceUnavailable") | Some("InternalError") => {
                        VaultError::unavailable(self.backend_name(), service_error.to_string())
                    }
                    _ => VaultError::Validation(format!(
                        "{} rejected request for '{}': {}",
                        self.backend_name(),
                        key,
                        service_error
                    )),
                }
            }
            other => VaultError::unavailable(self.backend_name(), format!("{:?}", other)),
        }
    }
}

fn to_chrono(value: Option<&aws_sdk_s3::primitives::DateTime>) -> DateTime<Utc> {
    value
        .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
        .unwrap_or_else(Utc::now)
}

#[async_trait]
impl ObjectVersionStore for S3ObjectStore {
    fn namespace(&self) -> &str {
        &self.config.bucket_name
    }

    #[instrument(skip(self, bytes), fields(bucket = %self.config.bucket_name))]
    async fn put(&self, key: &str, bytes: Bytes) -> Result<VersionToken> {
        let hash = content_hash(&bytes);
        let response = self
            .client
            .put_object()
            .bucket(&self.config.bucket_name)
            .key(key)
            .metadata(HASH_METADATA_KEY, hash)
            .body(ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .map_err(|e| self.map_error(e, key, None))?;

        let version = response.version_id().ok_or_else(|| {
            VaultError::Validation(format!(
                "bucket '{}' returned no version id; versioning must be enabled",
                self.config.bucket_name
            ))
        })?;
        debug!(key, version, "Stored object version");
        Ok(VersionToken::new(version))
    }

    async fn get(&self, key: &str, version: Option<&VersionToken>) -> Result<Bytes> {
        let response = self
            .client
            .get_object()
            .bucket(&self.config.bucket_name)
            .key(key)
            .set_version_id(version.map(|v| v.to_string()))
            .send()
            .await
            .map_err(|e| self.map_error(e, key, version))?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| VaultError::unavailable(self.backend_name(), e))?;
        Ok(body.into_bytes())
    }

    async fn list_versions(&self, key: &str) -> Result<Vec<VersionToken>> {
        let mut versions: Vec<(DateTime<Utc>, VersionToken)> = Vec::new();
        let mut key_marker: Option<String> = None;
        let mut version_marker: Option<String> = None;

        loop {
            let response = self
                .client
                .list_object_versions()
                .bucket(&self.config.bucket_name)
                .prefix(key)
                .set_key_marker(key_marker.take())
                .set_version_id_marker(version_marker.take())
                .send()
                .await
                .map_err(|e| self.map_error(e, key, None))?;

            // Prefix listing also returns longer keys sharing the prefix
            for version in response.versions().iter().filter(|v| v.key() == Some(key)) {
                if let Some(id) = version.version_id() {
                    versions.push((to_chrono(version.last_modified()), VersionToken::new(id)));
                }
            }

            if response.is_truncated() == Some(true) {
                key_marker = response.next_key_marker().map(str::to_string);
                version_marker = response.next_version_id_marker().map(str::to_string);
            } else {
                break;
            }
        }

        versions.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(versions.into_iter().map(|(_, token)| token).collect())
    }

    async fn head(&self, key: &str, version: Option<&VersionToken>) -> Result<ObjectMetadata> {
        let response = self
            .client
            .head_object()
            .bucket(&self.config.bucket_name)
            .key(key)
            .set_version_id(version.map(|v| v.to_string()))
            .send()
            .await
            .map_err(|e| self.map_error(e, key, version))?;

        let version_token = response
            .version_id()
            .map(VersionToken::new)
            .or_else(|| version.cloned())
            .ok_or_else(|| VaultError::VersionNotFound {
                key: key.to_string(),
                version: None,
            })?;

        let content_hash = match response.metadata().and_then(|m| m.get(HASH_METADATA_KEY)) {
            Some(hash) => hash.clone(),
            // Written by something other than this store: hash the body once
            None => content_hash(&self.get(key, Some(&version_token)).await?),
        };

        Ok(ObjectMetadata {
            key: key.to_string(),
            version: version_token,
            size_bytes: response.content_length().unwrap_or(0).max(0) as u64,
            content_hash,
            last_modified: to_chrono(response.last_modified()),
        })
    }
}
