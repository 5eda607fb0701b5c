// Backup Manager - takes snapshots under the environment lock and routes restores

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use tracing::{info, instrument, warn};

use super::catalog::{FileCatalog, SnapshotCatalog};
use super::types::{
    generate_snapshot_id, validate_name, ArtifactRef, BackendKind, Manifest, RetentionPolicy, ScheduleTag,
    SnapshotEvent, SnapshotPayload, StateSnapshot,
};
use crate::audit::{AuditAction, AuditEvent, AuditLog, AuditOutcome};
use crate::backend::{ResourceBackend, StateBackend};
use crate::config::VaultConfig;
use crate::engine::ReconciliationEngine;
use crate::lock::{DistributedLock, LockGuard, LockStore, RedisLockStore};
use crate::metrics::VaultMetrics;
use crate::restore::{DriftReconciler, DriftReport, RestoreOrchestrator, RestoreRequest, RestoreResult};
use crate::store::{content_hash, ObjectMetadata, ObjectVersionStore, RetryingStore};
#[cfg(feature = "s3")]
use crate::store::S3ObjectStore;
use crate::{Result, VaultError};

/// Name of the downloaded state copy kept next to a state manifest
pub const STATE_ARTIFACT: &str = "state.snapshot";

/// Entry point for backups, restores and catalog queries.
///
/// Backups and real restores for one environment are serialized through the
/// distributed lock; dry runs, listings and drift checks are read-only and
/// never take it.
pub struct BackupManager {
    config: VaultConfig,
    catalog: Arc<dyn SnapshotCatalog>,
    lock: DistributedLock,
    resource: Arc<ResourceBackend>,
    state: Arc<StateBackend>,
    orchestrator: RestoreOrchestrator,
    drift: DriftReconciler,
    audit: AuditLog,
    metrics: VaultMetrics,
}

/// Wires a [`BackupManager`] from its collaborators.
///
/// The object store, lock store and engine are required. The stores can be
/// given directly or connected from `config.redis` / `config.s3` with
/// [`BackupManagerBuilder::connect_configured`]. The catalog defaults to a
/// [`FileCatalog`] rooted at `config.catalog_dir`.
pub struct BackupManagerBuilder {
    config: VaultConfig,
    object_store: Option<Arc<dyn ObjectVersionStore>>,
    lock_store: Option<Arc<dyn LockStore>>,
    catalog: Option<Arc<dyn SnapshotCatalog>>,
    engine: Option<Arc<dyn ReconciliationEngine>>,
    audit: Option<AuditLog>,
    metrics: Option<VaultMetrics>,
}

impl BackupManagerBuilder {
    /// Object version store for resource payloads and state objects
    pub fn object_store(mut self, store: Arc<dyn ObjectVersionStore>) -> Self {
        self.object_store = Some(store);
        self
    }

    /// Lock store backing the per-environment lock
    pub fn lock_store(mut self, store: Arc<dyn LockStore>) -> Self {
        self.lock_store = Some(store);
        self
    }

    /// Catalog for manifests
    pub fn catalog(mut self, catalog: Arc<dyn SnapshotCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Engine whose configuration is backed up
    pub fn engine(mut self, engine: Arc<dyn ReconciliationEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Share an audit log with the caller instead of starting an empty one
    pub fn audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Count into caller-owned metrics, e.g. ones registered on an exporter's registry
    pub fn metrics(mut self, metrics: VaultMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Connect the stores named in the config for any slot still empty.
    /// Stores set explicitly are kept and their config sections ignored.
    pub async fn connect_configured(mut self) -> Result<Self> {
        if self.lock_store.is_none() {
            if let Some(redis) = self.config.redis.clone() {
                info!(key_prefix = %redis.key_prefix, "Connecting Redis lock store");
                self.lock_store = Some(Arc::new(RedisLockStore::new(redis).await?));
            }
        }
        #[cfg(feature = "s3")]
        {
            if self.object_store.is_none() {
                if let Some(s3) = self.config.s3.clone() {
                    info!(bucket = %s3.bucket_name, region = %s3.region, "Connecting S3 object store");
                    self.object_store = Some(Arc::new(S3ObjectStore::new(s3).await?));
                }
            }
        }
        Ok(self)
    }

    /// Validate the config and wire the manager
    pub fn build(self) -> Result<BackupManager> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| VaultError::Validation(e.to_string()))?;
        let categories = config
            .resource
            .category_table()
            .map_err(|e| VaultError::Validation(e.to_string()))?;

        let object_store = self.object_store.ok_or_else(|| missing("object store"))?;
        let lock_store = self.lock_store.ok_or_else(|| missing("lock store"))?;
        let engine = self.engine.ok_or_else(|| missing("reconciliation engine"))?;
        let catalog = self
            .catalog
            .unwrap_or_else(|| Arc::new(FileCatalog::new(config.catalog_dir.clone())));
        let audit = self.audit.unwrap_or_default();
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => VaultMetrics::new()?,
        };

        let store: Arc<dyn ObjectVersionStore> = Arc::new(RetryingStore::new(object_store, config.retry.clone()));
        let lock = DistributedLock::new(lock_store, config.lock.clone());
        let resource = Arc::new(ResourceBackend::new(
            engine.clone(),
            store.clone(),
            categories,
            config.resource.format,
        ));
        let state = Arc::new(StateBackend::new(engine, store));

        let orchestrator = RestoreOrchestrator::new(
            catalog.clone(),
            lock.clone(),
            resource.clone(),
            state.clone(),
            audit.clone(),
            config.holder_id.clone(),
            config.operator.clone(),
        );
        let drift = DriftReconciler::new(catalog.clone(), resource.clone(), state.clone());

        info!(holder_id = %config.holder_id, operator = %config.operator, "Backup manager ready");
        Ok(BackupManager {
            config,
            catalog,
            lock,
            resource,
            state,
            orchestrator,
            drift,
            audit,
            metrics,
        })
    }
}

fn missing(what: &str) -> VaultError {
    VaultError::Validation(format!("backup manager needs a {}", what))
}

impl BackupManager {
    /// Start building a manager for `config`
    pub fn builder(config: VaultConfig) -> BackupManagerBuilder {
        BackupManagerBuilder {
            config,
            object_store: None,
            lock_store: None,
            catalog: None,
            engine: None,
            audit: None,
            metrics: None,
        }
    }

    /// Effective configuration
    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// Snapshot catalog
    pub fn catalog(&self) -> &Arc<dyn SnapshotCatalog> {
        &self.catalog
    }

    /// Per-environment distributed lock
    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    /// Audit trail of backup and restore requests
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Backup, restore and lock-contention counters
    pub fn metrics(&self) -> &VaultMetrics {
        &self.metrics
    }

    /// Snapshot `environment` through one backend and record the manifest.
    ///
    /// Capture, append and prune all happen under the environment lock. A
    /// failed prune is logged and does not fail the backup.
    #[instrument(skip(self, retention), fields(backend_kind = %backend_kind, schedule_tag = %schedule_tag))]
    pub async fn backup(
        &self,
        environment: &str,
        backend_kind: BackendKind,
        schedule_tag: ScheduleTag,
        retention: RetentionPolicy,
    ) -> Result<Manifest> {
        let started = Instant::now();
        let result = self.locked_backup(environment, backend_kind, schedule_tag, &retention).await;
        self.metrics.record_backup(backend_kind, &result, started.elapsed());

        let outcome = if result.is_ok() { AuditOutcome::Succeeded } else { AuditOutcome::Failed };
        let mut event = AuditEvent::new(
            AuditAction::Backup,
            outcome,
            environment,
            backend_kind,
            &self.config.operator,
        )
        .detail("schedule_tag", schedule_tag)
        .detail("holder_id", &self.config.holder_id);
        match &result {
            Ok(manifest) => event = event.snapshot(&manifest.snapshot_id),
            Err(error) => event = event.detail("error", error),
        }
        self.audit.record(event).await;

        result
    }

    /// [`BackupManager::backup`] with the retention configured for `backend_kind`
    pub async fn backup_with_default_retention(
        &self,
        environment: &str,
        backend_kind: BackendKind,
        schedule_tag: ScheduleTag,
    ) -> Result<Manifest> {
        let retention = self.config.retention_for(backend_kind);
        self.backup(environment, backend_kind, schedule_tag, retention).await
    }

    async fn locked_backup(
        &self,
        environment: &str,
        backend_kind: BackendKind,
        schedule_tag: ScheduleTag,
        retention: &RetentionPolicy,
    ) -> Result<Manifest> {
        validate_name("environment", environment)?;
        let guard = self.lock.acquire_guard(environment, &self.config.holder_id).await?;

        let result = self
            .capture_and_record(environment, backend_kind, schedule_tag, retention, &guard)
            .await;
        if let Err(error) = guard.release().await {
            warn!(environment, error = %error, "Releasing the backup lock failed; the lease will expire");
        }
        result
    }

    async fn capture_and_record(
        &self,
        environment: &str,
        backend_kind: BackendKind,
        schedule_tag: ScheduleTag,
        retention: &RetentionPolicy,
        guard: &LockGuard,
    ) -> Result<Manifest> {
        let created_at = Utc::now();
        let snapshot_id = generate_snapshot_id(created_at);

        let mut local_copy: Option<(ArtifactRef, Bytes)> = None;
        let payload = match backend_kind {
            BackendKind::Resource => SnapshotPayload::Resource(self.resource.capture(environment, &snapshot_id).await?),
            BackendKind::State => {
                let state_pointer = self.state.capture(environment).await?;
                if self.config.state.download {
                    let bytes = self.state.download(&state_pointer).await?;
                    let artifact = ArtifactRef {
                        name: STATE_ARTIFACT.to_string(),
                        content_hash: content_hash(&bytes),
                        size_bytes: bytes.len() as u64,
                    };
                    local_copy = Some((artifact, bytes));
                }
                SnapshotPayload::State(StateSnapshot {
                    state_pointer,
                    local_copy: local_copy.as_ref().map(|(artifact, _)| artifact.clone()),
                })
            }
        };

        guard.ensure_held()?;
        if let Some((artifact, bytes)) = local_copy {
            self.catalog
                .put_artifact(environment, backend_kind, &snapshot_id, &artifact.name, bytes)
                .await?;
        }

        let manifest = Manifest::new(
            snapshot_id,
            created_at,
            environment,
            &self.config.operator,
            schedule_tag,
            SnapshotEvent::Backup,
            payload,
        );
        self.catalog.append(&manifest).await?;
        info!(environment, snapshot_id = %manifest.snapshot_id, "Snapshot recorded");

        match self.catalog.prune(environment, backend_kind, retention).await {
            Ok(pruned) if !pruned.deleted.is_empty() => {
                info!(environment, deleted = pruned.deleted.len(), retained = pruned.retained, "Pruned old snapshots");
            }
            Ok(_) => {}
            Err(error) => warn!(environment, error = %error, "Pruning old snapshots failed"),
        }

        Ok(manifest)
    }

    /// Restore or dry-run a snapshot. See [`RestoreOrchestrator`].
    pub async fn restore(&self, request: RestoreRequest) -> Result<RestoreResult> {
        let (backend_kind, dry_run) = (request.backend_kind, request.dry_run);
        let started = Instant::now();
        let result = self.orchestrator.restore(request).await;
        self.metrics.record_restore(backend_kind, dry_run, &result, started.elapsed());
        result
    }

    /// Manifests newest first, optionally for one backend kind
    pub async fn list_snapshots(&self, environment: &str, backend_kind: Option<BackendKind>) -> Result<Vec<Manifest>> {
        validate_name("environment", environment)?;
        self.catalog.list(environment, backend_kind).await
    }

    /// One manifest by id
    pub async fn get_snapshot(&self, environment: &str, snapshot_id: &str) -> Result<Option<Manifest>> {
        validate_name("environment", environment)?;
        validate_name("snapshot", snapshot_id)?;
        self.catalog.get(environment, snapshot_id).await
    }

    /// Newest manifest of `backend_kind`
    pub async fn latest_snapshot(&self, environment: &str, backend_kind: BackendKind) -> Result<Option<Manifest>> {
        validate_name("environment", environment)?;
        self.catalog.get_latest(environment, backend_kind).await
    }

    /// Bytes of the state copy kept with a state snapshot taken with downloads enabled
    pub async fn state_copy(&self, environment: &str, snapshot_id: &str) -> Result<Bytes> {
        let manifest = self.get_snapshot(environment, snapshot_id).await?.ok_or_else(|| {
            VaultError::Validation(format!("unknown snapshot '{}' in '{}'", snapshot_id, environment))
        })?;
        let SnapshotPayload::State(StateSnapshot {
            local_copy: Some(artifact),
            ..
        }) = &manifest.payload
        else {
            return Err(VaultError::Validation(format!(
                "snapshot '{}' has no local state copy",
                snapshot_id
            )));
        };

        let bytes = self
            .catalog
            .get_artifact(environment, BackendKind::State, snapshot_id, &artifact.name)
            .await?;
        if content_hash(&bytes) != artifact.content_hash {
            return Err(VaultError::Validation(format!(
                "local state copy of '{}' does not match its recorded hash",
                snapshot_id
            )));
        }
        Ok(bytes)
    }

    /// Compare the live environment with its latest snapshots
    pub async fn check_drift(&self, environment: &str) -> Result<DriftReport> {
        self.drift.check(environment).await
    }

    /// Retained versions of the environment's state object, newest first
    pub async fn list_state_versions(&self, environment: &str, limit: usize) -> Result<Vec<ObjectMetadata>> {
        validate_name("environment", environment)?;
        self.state.list_state_versions(environment, limit).await
    }
}
