//! Restore orchestration and drift detection.
//!
//! A restore request moves through
//! `Validated -> Locked -> (DryRunReported | Applying) -> Completed | Failed`.
//! Dry runs stop after validation and never take the lock.

mod drift;
mod orchestrator;

pub use drift::{CategoryDrift, DriftReconciler, DriftReport, DriftStatus, ResourceDrift, StateDrift};
pub use orchestrator::RestoreOrchestrator;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::backend::{ResourcePlan, StatePlan};
use crate::backup::{BackendKind, Manifest};
use crate::{Result, VaultError};

/// Which snapshot to restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSelector {
    /// Newest snapshot of the requested backend
    Latest,
    /// Snapshot with this id
    Id(String),
}

impl fmt::Display for SnapshotSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotSelector::Latest => f.write_str("latest"),
            SnapshotSelector::Id(id) => f.write_str(id),
        }
    }
}

/// State-backend restore mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestoreMode {
    /// Make the snapshot's bytes the current state version
    StateOnly,
    /// State-only restore, then have the engine reconcile live entities
    FullRestore,
}

impl fmt::Display for RestoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RestoreMode::StateOnly => "state-only",
            RestoreMode::FullRestore => "full-restore",
        })
    }
}

impl FromStr for RestoreMode {
    type Err = VaultError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "state-only" => Ok(RestoreMode::StateOnly),
            "full-restore" => Ok(RestoreMode::FullRestore),
            other => Err(VaultError::Validation(format!(
                "invalid restore mode '{}' (expected state-only or full-restore)",
                other
            ))),
        }
    }
}

/// A restore request; transient apart from its audit entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
    /// Environment to restore
    pub environment: String,
    /// Backend the snapshot belongs to
    pub backend_kind: BackendKind,
    /// Snapshot to restore
    pub snapshot: SnapshotSelector,
    /// Resource categories to restore; empty means all
    #[serde(default)]
    pub resource_filter: Vec<String>,
    /// State backend only; defaults to state-only
    #[serde(default)]
    pub mode: Option<RestoreMode>,
    /// Report a plan without taking the lock or writing
    #[serde(default)]
    pub dry_run: bool,
}

impl RestoreRequest {
    /// Restore the newest snapshot
    pub fn latest(environment: impl Into<String>, backend_kind: BackendKind) -> Self {
        Self {
            environment: environment.into(),
            backend_kind,
            snapshot: SnapshotSelector::Latest,
            resource_filter: Vec::new(),
            mode: None,
            dry_run: false,
        }
    }

    /// Restore a specific snapshot
    pub fn snapshot(
        environment: impl Into<String>,
        backend_kind: BackendKind,
        snapshot_id: impl Into<String>,
    ) -> Self {
        Self {
            snapshot: SnapshotSelector::Id(snapshot_id.into()),
            ..Self::latest(environment, backend_kind)
        }
    }

    /// Only report what would change
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Limit a resource restore to these categories
    pub fn filter<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resource_filter = categories.into_iter().map(Into::into).collect();
        self
    }

    /// State restore mode
    pub fn mode(mut self, mode: RestoreMode) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// Phases of a restore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestorePhase {
    /// Request checked and snapshot resolved
    Validated,
    /// Environment lock held
    Locked,
    /// Plan reported for a dry run
    DryRunReported,
    /// Backend restore running
    Applying,
    /// Finished
    Completed,
    /// Aborted
    Failed,
}

impl fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RestorePhase::Validated => "validated",
            RestorePhase::Locked => "locked",
            RestorePhase::DryRunReported => "dry_run_reported",
            RestorePhase::Applying => "applying",
            RestorePhase::Completed => "completed",
            RestorePhase::Failed => "failed",
        })
    }
}

/// What a restore would do, per backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend_kind", rename_all = "lowercase")]
pub enum RestorePlan {
    /// Resource restore plan
    Resource(ResourcePlan),
    /// State restore plan
    State(StatePlan),
}

/// Dry-run result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Environment checked
    pub environment: String,
    /// Concrete snapshot id ("latest" already resolved)
    pub snapshot_id: String,
    /// Backend of the snapshot
    pub backend_kind: BackendKind,
    /// Phases passed through
    pub phases: Vec<RestorePhase>,
    /// Backend-specific plan
    pub plan: RestorePlan,
}

impl RestoreReport {
    /// Plan of a resource restore
    pub fn resource_plan(&self) -> Option<&ResourcePlan> {
        match &self.plan {
            RestorePlan::Resource(plan) => Some(plan),
            RestorePlan::State(_) => None,
        }
    }

    /// Plan of a state restore
    pub fn state_plan(&self) -> Option<&StatePlan> {
        match &self.plan {
            RestorePlan::State(plan) => Some(plan),
            RestorePlan::Resource(_) => None,
        }
    }
}

/// Dry runs return a report, real restores the manifest they recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreResult {
    /// Dry-run report
    Report(RestoreReport),
    /// Manifest recorded by the restore
    Manifest(Box<Manifest>),
}

impl RestoreResult {
    /// Report, for dry runs
    pub fn report(&self) -> Option<&RestoreReport> {
        match self {
            RestoreResult::Report(report) => Some(report),
            RestoreResult::Manifest(_) => None,
        }
    }

    /// Recorded manifest, for real restores
    pub fn manifest(&self) -> Option<&Manifest> {
        match self {
            RestoreResult::Manifest(manifest) => Some(manifest),
            RestoreResult::Report(_) => None,
        }
    }
}
