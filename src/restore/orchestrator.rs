use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use super::{
    RestoreMode, RestorePhase, RestorePlan, RestoreReport, RestoreRequest, RestoreResult, SnapshotSelector,
};
use crate::audit::{AuditAction, AuditEvent, AuditLog, AuditOutcome};
use crate::backend::{ResourceBackend, StateBackend};
use crate::backup::{
    generate_snapshot_id, validate_name, BackendKind, Manifest, RestoreOutcome, ScheduleTag, SnapshotCatalog,
    SnapshotEvent, SnapshotPayload, StateSnapshot,
};
use crate::lock::{DistributedLock, LockGuard};
use crate::{Result, VaultError};

/// A request that passed validation, with `latest` resolved
struct ValidatedRestore {
    manifest: Manifest,
    mode: Option<RestoreMode>,
}

/// Drives one restore request through its phases.
///
/// Validation failures are returned before the lock is touched. Once the
/// lock is held, every exit path releases it; failures are wrapped in
/// [`VaultError::RestoreFailed`] naming the targeted snapshot, except
/// [`VaultError::PartialApplyFailure`], which is returned as is after the
/// post-restore manifest has been recorded.
pub struct RestoreOrchestrator {
    catalog: Arc<dyn SnapshotCatalog>,
    lock: DistributedLock,
    resource: Arc<ResourceBackend>,
    state: Arc<StateBackend>,
    audit: AuditLog,
    holder_id: String,
    operator: String,
}

impl RestoreOrchestrator {
    /// Orchestrator recording as `operator` and locking as `holder_id`
    pub fn new(
        catalog: Arc<dyn SnapshotCatalog>,
        lock: DistributedLock,
        resource: Arc<ResourceBackend>,
        state: Arc<StateBackend>,
        audit: AuditLog,
        holder_id: impl Into<String>,
        operator: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            lock,
            resource,
            state,
            audit,
            holder_id: holder_id.into(),
            operator: operator.into(),
        }
    }

    #[instrument(
        skip(self, request),
        fields(
            environment = %request.environment,
            backend_kind = %request.backend_kind,
            snapshot = %request.snapshot,
            dry_run = request.dry_run
        )
    )]
    /// Validate, then either report a plan or apply the restore under the lock
    pub async fn restore(&self, request: RestoreRequest) -> Result<RestoreResult> {
        let action = if request.dry_run { AuditAction::DryRun } else { AuditAction::Restore };

        let validated = match self.validate(&request).await {
            Ok(validated) => validated,
            Err(error) => {
                self.audit_request(&request, action, AuditOutcome::Failed, None, Some(&error)).await;
                return Err(error);
            }
        };
        let snapshot_id = validated.manifest.snapshot_id.clone();
        let mut phases = vec![RestorePhase::Validated];
        info!(phase = %RestorePhase::Validated, snapshot_id = %snapshot_id, "Restore request validated");

        if request.dry_run {
            let plan = match self.plan(&request, &validated).await {
                Ok(plan) => plan,
                Err(error) => {
                    self.audit_request(&request, action, AuditOutcome::Failed, Some(&snapshot_id), Some(&error))
                        .await;
                    return Err(error);
                }
            };
            phases.push(RestorePhase::DryRunReported);
            phases.push(RestorePhase::Completed);
            info!(phase = %RestorePhase::DryRunReported, snapshot_id = %snapshot_id, "Dry run reported");
            self.audit_request(&request, action, AuditOutcome::Succeeded, Some(&snapshot_id), None)
                .await;

            return Ok(RestoreResult::Report(RestoreReport {
                environment: request.environment.clone(),
                snapshot_id,
                backend_kind: request.backend_kind,
                phases,
                plan,
            }));
        }

        let guard = match self.lock.acquire_guard(&request.environment, &self.holder_id).await {
            Ok(guard) => guard,
            Err(error) => {
                self.audit_request(&request, action, AuditOutcome::Failed, Some(&snapshot_id), Some(&error))
                    .await;
                return Err(error);
            }
        };
        info!(phase = %RestorePhase::Locked, snapshot_id = %snapshot_id, lease_id = %guard.token().lease_id(), "Lock acquired");

        let outcome = self.apply(&request, &validated, &guard).await;
        if let Err(release_error) = guard.release().await {
            warn!(error = %release_error, "Releasing the restore lock failed; the lease will expire");
        }

        match outcome {
            Ok(manifest) => {
                info!(
                    phase = %RestorePhase::Completed,
                    snapshot_id = %snapshot_id,
                    recorded_snapshot_id = %manifest.snapshot_id,
                    "Restore completed"
                );
                self.audit_request(&request, action, AuditOutcome::Succeeded, Some(&snapshot_id), None)
                    .await;
                Ok(RestoreResult::Manifest(Box::new(manifest)))
            }
            Err(partial @ VaultError::PartialApplyFailure { .. }) => {
                warn!(phase = %RestorePhase::Completed, error = %partial, "Restore completed with failures");
                self.audit_request(&request, action, AuditOutcome::PartiallyApplied, Some(&snapshot_id), Some(&partial))
                    .await;
                Err(partial)
            }
            Err(source) => {
                error!(phase = %RestorePhase::Failed, error = %source, "Restore failed");
                self.audit_request(&request, action, AuditOutcome::Failed, Some(&snapshot_id), Some(&source))
                    .await;
                Err(VaultError::RestoreFailed {
                    environment: request.environment.clone(),
                    snapshot_id,
                    phase: RestorePhase::Applying,
                    source: Box::new(source),
                })
            }
        }
    }

    async fn validate(&self, request: &RestoreRequest) -> Result<ValidatedRestore> {
        let environment = &request.environment;
        validate_name("environment", environment)?;

        let manifest = match &request.snapshot {
            SnapshotSelector::Latest => self
                .catalog
                .get_latest(environment, request.backend_kind)
                .await?
                .ok_or_else(|| {
                    VaultError::Validation(format!(
                        "no {} snapshots recorded for '{}'",
                        request.backend_kind, environment
                    ))
                })?,
            SnapshotSelector::Id(id) => {
                validate_name("snapshot", id)?;
                self.catalog.get(environment, id).await?.ok_or_else(|| {
                    VaultError::Validation(format!("unknown snapshot '{}' in '{}'", id, environment))
                })?
            }
        };

        if manifest.backend_kind() != request.backend_kind {
            return Err(VaultError::Validation(format!(
                "snapshot '{}' is a {} snapshot, not {}",
                manifest.snapshot_id,
                manifest.backend_kind(),
                request.backend_kind
            )));
        }

        let mode = match request.backend_kind {
            BackendKind::Resource => {
                if request.mode.is_some() {
                    return Err(VaultError::Validation(
                        "restore mode applies to the state backend only".to_string(),
                    ));
                }
                self.resource.categories().validate_filter(&request.resource_filter)?;
                None
            }
            BackendKind::State => {
                if !request.resource_filter.is_empty() {
                    return Err(VaultError::Validation(
                        "resource filter applies to the resource backend only".to_string(),
                    ));
                }
                Some(request.mode.unwrap_or(RestoreMode::StateOnly))
            }
        };

        Ok(ValidatedRestore { manifest, mode })
    }

    async fn plan(&self, request: &RestoreRequest, validated: &ValidatedRestore) -> Result<RestorePlan> {
        match &validated.manifest.payload {
            SnapshotPayload::Resource(snapshot) => Ok(RestorePlan::Resource(
                self.resource
                    .plan(&request.environment, snapshot, &request.resource_filter)
                    .await?,
            )),
            SnapshotPayload::State(snapshot) => Ok(RestorePlan::State(
                self.state
                    .plan(&snapshot.state_pointer, validated.mode.unwrap_or(RestoreMode::StateOnly))
                    .await?,
            )),
        }
    }

    async fn apply(
        &self,
        request: &RestoreRequest,
        validated: &ValidatedRestore,
        guard: &LockGuard,
    ) -> Result<Manifest> {
        let environment = request.environment.as_str();
        let source = &validated.manifest;
        info!(phase = %RestorePhase::Applying, snapshot_id = %source.snapshot_id, "Applying restore");

        let created_at = Utc::now();
        let snapshot_id = generate_snapshot_id(created_at);

        let (payload, outcome, failures) = match &source.payload {
            SnapshotPayload::Resource(snapshot) => {
                guard.ensure_held()?;
                let result = self
                    .resource
                    .import(environment, snapshot, &request.resource_filter, || guard.ensure_held())
                    .await?;

                guard.ensure_held()?;
                let post_restore = self.resource.capture(environment, &snapshot_id).await?;
                let outcome = if result.is_complete() { RestoreOutcome::Applied } else { RestoreOutcome::Partial };
                (SnapshotPayload::Resource(post_restore), outcome, result.failures)
            }
            SnapshotPayload::State(snapshot) => {
                guard.ensure_held()?;
                let restored = self.state.restore_state(environment, &snapshot.state_pointer).await?;

                // Live entities may have drifted even when the state object has not
                let full_restore = validated.mode == Some(RestoreMode::FullRestore);
                let mut failures = Vec::new();
                if full_restore {
                    guard.ensure_held()?;
                    failures = self.state.reconcile(environment, &restored.current).await?.failures;
                }

                let outcome = if restored.already_current && !full_restore {
                    RestoreOutcome::AlreadyCurrent
                } else if failures.is_empty() {
                    RestoreOutcome::Applied
                } else {
                    RestoreOutcome::Partial
                };
                let payload = SnapshotPayload::State(StateSnapshot {
                    state_pointer: restored.current,
                    local_copy: None,
                });
                (payload, outcome, failures)
            }
        };

        guard.ensure_held()?;
        let manifest = Manifest::new(
            snapshot_id,
            created_at,
            environment,
            &self.operator,
            ScheduleTag::Manual,
            SnapshotEvent::Restore {
                source_snapshot_id: source.snapshot_id.clone(),
                mode: validated.mode,
                resource_filter: request.resource_filter.clone(),
                outcome,
                failures: failures.clone(),
            },
            payload,
        );
        self.catalog.append(&manifest).await?;

        if !failures.is_empty() {
            return Err(VaultError::PartialApplyFailure {
                environment: environment.to_string(),
                snapshot_id: source.snapshot_id.clone(),
                recorded_snapshot_id: manifest.snapshot_id,
                failures,
            });
        }
        Ok(manifest)
    }

    async fn audit_request(
        &self,
        request: &RestoreRequest,
        action: AuditAction,
        outcome: AuditOutcome,
        snapshot_id: Option<&str>,
        error: Option<&VaultError>,
    ) {
        let mut event = AuditEvent::new(
            action,
            outcome,
            &request.environment,
            request.backend_kind,
            &self.operator,
        )
        .detail("requested", &request.snapshot)
        .detail("holder_id", &self.holder_id);

        if let Some(id) = snapshot_id {
            event = event.snapshot(id);
        }
        if !request.resource_filter.is_empty() {
            event = event.detail("resource_filter", request.resource_filter.join(","));
        }
        if let Some(mode) = request.mode {
            event = event.detail("mode", mode);
        }
        if let Some(error) = error {
            event = event.detail("error", error);
        }
        self.audit.record(event).await;
    }
}
