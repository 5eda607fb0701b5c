//! Configuration: a TOML file plus `VAULT_*` environment overrides.
//!
//! ```toml
//! holder_id = "ci-runner-7"
//! catalog_dir = "/var/lib/configvault"
//!
//! [lock]
//! lease_seconds = 300
//!
//! [resource]
//! format = "yaml"
//!
//! [retention]
//! resource_max_snapshots = 30
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{CategoryDefinition, CategoryTable};
use crate::backup::{BackendKind, ExportFormat, RetentionPolicy};
use crate::lock::{LockConfig, RedisLockConfig};
use crate::resilience::RetryConfig;
#[cfg(feature = "s3")]
use crate::store::S3StoreConfig;

/// Errors loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("cannot read config file {path}: {source}")]
    Io {
        /// File that was read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Environment override could not be parsed
    #[error("invalid value for {name}: {value}")]
    Env {
        /// Variable name
        name: &'static str,
        /// Rejected value
        value: String,
    },

    /// Values are inconsistent
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Resource backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Payload format for new exports
    pub format: ExportFormat,
    /// Category dependency table; the standard table when omitted
    pub categories: Vec<CategoryDefinition>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            format: ExportFormat::Json,
            categories: CategoryTable::standard().definitions().to_vec(),
        }
    }
}

impl ResourceConfig {
    /// Validated dependency table
    pub fn category_table(&self) -> Result<CategoryTable, ConfigError> {
        CategoryTable::new(self.categories.clone()).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

/// State backend settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Keep a copy of the state bytes next to each state manifest
    pub download: bool,
}

/// Default retention per backend kind (0 keeps everything)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Resource snapshots to keep
    pub resource_max_snapshots: usize,
    /// State snapshots to keep
    pub state_max_snapshots: usize,
}

impl RetentionConfig {
    /// Policy for one backend kind
    pub fn policy(&self, backend_kind: BackendKind) -> RetentionPolicy {
        match backend_kind {
            BackendKind::Resource => RetentionPolicy::keep(self.resource_max_snapshots),
            BackendKind::State => RetentionPolicy::keep(self.state_max_snapshots),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Identifies this process in lock records
    pub holder_id: String,
    /// Recorded as `created_by` on manifests
    pub operator: String,
    /// Root of the file catalog
    pub catalog_dir: PathBuf,
    /// Lease and acquisition settings
    pub lock: LockConfig,
    /// Transient store failures
    pub retry: RetryConfig,
    /// Resource backend settings
    pub resource: ResourceConfig,
    /// State backend settings
    pub state: StateConfig,
    /// Default retention per backend
    pub retention: RetentionConfig,
    /// Redis lock store; connected by `BackupManagerBuilder::connect_configured`
    pub redis: Option<RedisLockConfig>,
    /// S3 object store; connected by `BackupManagerBuilder::connect_configured`
    #[cfg(feature = "s3")]
    pub s3: Option<S3StoreConfig>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            holder_id: format!("configvault-{}", std::process::id()),
            operator: default_operator(),
            catalog_dir: PathBuf::from(".configvault"),
            lock: LockConfig::default(),
            retry: RetryConfig::default(),
            resource: ResourceConfig::default(),
            state: StateConfig::default(),
            retention: RetentionConfig::default(),
            redis: None,
            #[cfg(feature = "s3")]
            s3: None,
        }
    }
}

fn default_operator() -> String {
    ["GITHUB_ACTOR", "USER"]
        .iter()
        .find_map(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "unknown".to_string())
}

impl VaultConfig {
    /// Read a TOML file, apply environment overrides, validate
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML; missing keys take their defaults
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `VAULT_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(value) = lookup("VAULT_HOLDER_ID") {
            self.holder_id = value;
        }
        if let Some(value) = lookup("VAULT_OPERATOR") {
            self.operator = value;
        }
        if let Some(value) = lookup("VAULT_CATALOG_DIR") {
            self.catalog_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("VAULT_LEASE_SECONDS") {
            self.lock.lease_seconds = parse_env("VAULT_LEASE_SECONDS", value)?;
        }
        if let Some(value) = lookup("VAULT_LOCK_ATTEMPTS") {
            self.lock.acquire_retry.max_attempts = parse_env("VAULT_LOCK_ATTEMPTS", value)?;
        }
        if let Some(value) = lookup("VAULT_REDIS_URL") {
            self.redis.get_or_insert_with(RedisLockConfig::default).redis_url = value;
        }
        #[cfg(feature = "s3")]
        {
            if let Some(value) = lookup("VAULT_S3_BUCKET") {
                self.s3.get_or_insert_with(S3StoreConfig::default).bucket_name = value;
            }
            if let Some(value) = lookup("AWS_REGION") {
                if let Some(s3) = self.s3.as_mut() {
                    s3.region = value;
                }
            }
        }
        Ok(())
    }

    /// Reject settings no operation could run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.holder_id.trim().is_empty() {
            return Err(ConfigError::Invalid("holder_id must not be empty".to_string()));
        }
        if self.lock.lease_seconds == 0 {
            return Err(ConfigError::Invalid("lock.lease_seconds must be positive".to_string()));
        }
        if self.lock.acquire_retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "lock.acquire_retry.max_attempts must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be positive".to_string()));
        }
        self.resource.category_table()?;
        Ok(())
    }

    /// Default retention for `backend_kind`
    pub fn retention_for(&self, backend_kind: BackendKind) -> RetentionPolicy {
        self.retention.policy(backend_kind)
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env { name, value })
}
