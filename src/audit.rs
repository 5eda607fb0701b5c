//! Audit trail for backup and restore requests

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::backup::BackendKind;

/// Kind of request being audited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Backup request
    Backup,
    /// Restore that applied changes
    Restore,
    /// Restore that only reported a plan
    DryRun,
}

/// How an audited request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Finished without errors
    Succeeded,
    /// Applied with per-record failures
    PartiallyApplied,
    /// Rejected or aborted
    Failed,
}

impl AuditOutcome {
    /// Snake-case name, as serialized
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Succeeded => "succeeded",
            AuditOutcome::PartiallyApplied => "partially_applied",
            AuditOutcome::Failed => "failed",
        }
    }
}

/// Audit event record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// What was requested
    pub action: AuditAction,
    /// How it ended
    pub outcome: AuditOutcome,
    /// Environment the request targeted
    pub environment: String,
    /// Backend the request targeted
    pub backend_kind: BackendKind,
    /// Holder or operator that issued the request
    pub actor: String,
    /// Targeted snapshot (restores) or created snapshot (backups)
    pub snapshot_id: Option<String>,
    /// When the event was recorded
    pub timestamp: DateTime<Utc>,
    /// Extra context such as the filter, mode or error message
    pub details: BTreeMap<String, String>,
}

impl AuditEvent {
    /// Event stamped with the current time
    pub fn new(
        action: AuditAction,
        outcome: AuditOutcome,
        environment: impl Into<String>,
        backend_kind: BackendKind,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            action,
            outcome,
            environment: environment.into(),
            backend_kind,
            actor: actor.into(),
            snapshot_id: None,
            timestamp: Utc::now(),
            details: BTreeMap::new(),
        }
    }

    /// Attach the snapshot id
    pub fn snapshot(mut self, snapshot_id: impl Into<String>) -> Self {
        self.snapshot_id = Some(snapshot_id.into());
        self
    }

    /// Attach one detail entry
    pub fn detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.insert(key.into(), value.to_string());
        self
    }
}

/// In-process audit log; every event is also emitted on the `audit` tracing target
#[derive(Clone, Default)]
pub struct AuditLog {
    events: Arc<RwLock<Vec<AuditEvent>>>,
}

impl AuditLog {
    /// Empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event and emit it on the `audit` target
    pub async fn record(&self, event: AuditEvent) {
        info!(
            target: "audit",
            action = ?event.action,
            outcome = ?event.outcome,
            environment = %event.environment,
            backend_kind = %event.backend_kind,
            actor = %event.actor,
            snapshot_id = event.snapshot_id.as_deref().unwrap_or("-"),
            "Audit event"
        );
        self.events.write().await.push(event);
    }

    /// All events, oldest first
    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }

    /// Events for one environment, oldest first
    pub async fn events_for(&self, environment: &str) -> Vec<AuditEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.environment == environment)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_are_kept_per_environment() {
        let log = AuditLog::new();
        log.record(
            AuditEvent::new(AuditAction::DryRun, AuditOutcome::Succeeded, "acme", BackendKind::Resource, "ci")
                .snapshot("snap-1")
                .detail("filter", "memberships"),
        )
        .await;
        log.record(AuditEvent::new(AuditAction::Backup, AuditOutcome::Failed, "globex", BackendKind::State, "ci"))
            .await;

        let acme = log.events_for("acme").await;
        assert_eq!(acme.len(), 1);
        assert_eq!(acme[0].snapshot_id.as_deref(), Some("snap-1"));
        assert_eq!(acme[0].details["filter"], "memberships");
        assert_eq!(log.events().await.len(), 2);
    }
}
