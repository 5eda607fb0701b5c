//! # configvault
//!
//! Backup, versioning and restore control plane for declaratively managed
//! tenant configuration.
//!
//! An *environment* is an independently managed unit of configuration. Its
//! live entities are owned by an external reconciliation engine, and its
//! engine state lives as a versioned object in an object store. configvault
//! snapshots that configuration, catalogs the snapshots, detects drift and
//! restores an environment to a prior point, serializing every mutating
//! operation through a lease-based distributed lock.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use configvault::backup::{BackendKind, BackupManager, MemoryCatalog, RetentionPolicy, ScheduleTag};
//! use configvault::engine::InMemoryEngine;
//! use configvault::lock::MemoryLockStore;
//! use configvault::restore::RestoreRequest;
//! use configvault::store::MemoryObjectStore;
//! use configvault::VaultConfig;
//!
//! # async fn example() -> configvault::Result<()> {
//! let store = Arc::new(MemoryObjectStore::new("state"));
//! let engine = Arc::new(InMemoryEngine::new(store.clone()));
//! let manager = BackupManager::builder(VaultConfig::default())
//!     .object_store(store)
//!     .lock_store(Arc::new(MemoryLockStore::new()))
//!     .catalog(Arc::new(MemoryCatalog::new()))
//!     .engine(engine)
//!     .build()?;
//!
//! let manifest = manager
//!     .backup("acme", BackendKind::Resource, ScheduleTag::Manual, RetentionPolicy::unlimited())
//!     .await?;
//!
//! let plan = manager
//!     .restore(RestoreRequest::latest("acme", BackendKind::Resource).dry_run(true))
//!     .await?;
//! # let _ = (manifest, plan);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`store`]: object version store adapter
//! - [`lock`]: distributed lease lock
//! - [`engine`]: reconciliation engine collaborator interface
//! - [`backend`]: resource and state snapshot backends
//! - [`backup`]: manifests, snapshot catalog and the backup manager
//! - [`restore`]: restore orchestrator and drift reconciler
//! - [`metrics`]: Prometheus counters for backups, restores and lock contention

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for configvault operations
pub type Result<T> = std::result::Result<T, VaultError>;

/// Main error type for configvault operations
#[derive(Error, Debug)]
pub enum VaultError {
    /// The environment lock stayed held by someone else through every retry
    #[error("lock contention on environment '{environment}' after {attempts} attempts")]
    LockContention {
        /// Environment whose lock was contended
        environment: String,
        /// Number of acquisition attempts made
        attempts: usize,
    },

    /// A held lease expired or was taken over before the operation finished
    #[error("lease for environment '{environment}' held by '{holder_id}' was lost")]
    LeaseLost {
        /// Environment whose lease was lost
        environment: String,
        /// Holder that owned the lease
        holder_id: String,
    },

    /// The requested object version does not exist (or has been expired)
    #[error("version {} of object '{key}' not found", version.as_deref().unwrap_or("<current>"))]
    VersionNotFound {
        /// Object key
        key: String,
        /// Requested version token, `None` for the current version
        version: Option<String>,
    },

    /// Some records were restored, some did not converge
    #[error(
        "partial apply failure restoring snapshot '{snapshot_id}' in '{environment}': {} record(s) failed (recorded as '{recorded_snapshot_id}')",
        failures.len()
    )]
    PartialApplyFailure {
        /// Environment being restored
        environment: String,
        /// Snapshot that was the restore target
        snapshot_id: String,
        /// Manifest recorded for the post-restore state
        recorded_snapshot_id: String,
        /// Records that failed to converge
        failures: Vec<engine::RecordFailure>,
    },

    /// Bad request: unknown snapshot, unknown category, invalid mode...
    #[error("validation error: {0}")]
    Validation(String),

    /// Store or catalog transiently unreachable
    #[error("backend '{backend}' unavailable: {message}")]
    BackendUnavailable {
        /// Backend name
        backend: String,
        /// Underlying failure
        message: String,
    },

    /// Attempt to overwrite an append-only record
    #[error("conflict: {0}")]
    Conflict(String),

    /// Reconciliation engine failure that is not attributable to one record
    #[error("reconciliation engine error: {0}")]
    Engine(String),

    /// A restore failed after its lock was acquired
    #[error("restore of snapshot '{snapshot_id}' in '{environment}' failed during {phase}: {source}")]
    RestoreFailed {
        /// Environment being restored
        environment: String,
        /// Snapshot that was the restore target
        snapshot_id: String,
        /// Phase the orchestrator had reached
        phase: restore::RestorePhase,
        /// Underlying error
        #[source]
        source: Box<VaultError>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML export payload could not be written or read
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Local filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics could not be registered or encoded
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl VaultError {
    /// Whether retrying the same call may succeed without any other change
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VaultError::LockContention { .. } | VaultError::BackendUnavailable { .. }
        )
    }

    /// Shorthand for a [`VaultError::BackendUnavailable`]
    pub fn unavailable(backend: impl Into<String>, message: impl ToString) -> Self {
        VaultError::BackendUnavailable {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    /// The innermost error, looking through [`VaultError::RestoreFailed`]
    pub fn root(&self) -> &VaultError {
        match self {
            VaultError::RestoreFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Audit trail of backup and restore requests
pub mod audit;

/// Snapshot backends (resource export/import, state capture/replay)
pub mod backend;

/// Manifests, snapshot catalog and the backup manager
pub mod backup;

/// Configuration loading
pub mod config;

/// Reconciliation engine collaborator interface
pub mod engine;

/// Distributed lease lock
pub mod lock;

/// Prometheus metrics
pub mod metrics;

/// Retry with exponential backoff
pub mod resilience;

/// Restore orchestration and drift detection
pub mod restore;

/// Object version store adapter
pub mod store;

/// Logging setup
pub mod telemetry;

pub use backup::BackupManager;
pub use config::VaultConfig;
