use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::backend::{ResourceBackend, StateBackend};
use crate::backup::{validate_name, BackendKind, Manifest, SnapshotCatalog, SnapshotPayload};
use crate::store::{content_hash, VersionToken};
use crate::{Result, VaultError};

/// Drift of one category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    /// Counts and payload hash match
    Unchanged,
    /// Live records in a category the snapshot has none of
    Added,
    /// Snapshot records in a category that is now empty
    Removed,
    /// Counts or content differ
    Changed,
}

/// Category compared between snapshot and live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryDrift {
    /// Category name
    pub category: String,
    /// Comparison result
    pub status: DriftStatus,
    /// Records in the snapshot
    pub snapshot_count: usize,
    /// Records live now
    pub live_count: usize,
}

/// Resource snapshot compared against live records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDrift {
    /// Latest resource snapshot compared against
    pub snapshot_id: String,
    /// Every category present in the snapshot or live
    pub categories: Vec<CategoryDrift>,
}

impl ResourceDrift {
    /// Whether any category drifted
    pub fn has_drift(&self) -> bool {
        self.categories.iter().any(|c| c.status != DriftStatus::Unchanged)
    }

    /// Categories that drifted
    pub fn drifted(&self) -> impl Iterator<Item = &CategoryDrift> {
        self.categories.iter().filter(|c| c.status != DriftStatus::Unchanged)
    }
}

/// State snapshot compared against the current state object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDrift {
    /// Latest state snapshot compared against
    pub snapshot_id: String,
    /// Version the snapshot points at
    pub snapshot_version: VersionToken,
    /// Hash of that version
    pub snapshot_hash: String,
    /// Current version
    pub current_version: VersionToken,
    /// Hash of the current version
    pub current_hash: String,
    /// Current bytes differ from the snapshot's
    pub drifted: bool,
}

/// Live environment compared against its latest snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReport {
    /// Environment checked
    pub environment: String,
    /// When the check ran
    pub checked_at: DateTime<Utc>,
    /// `None` when no resource snapshot exists yet
    pub resource: Option<ResourceDrift>,
    /// `None` when no state snapshot exists yet
    pub state: Option<StateDrift>,
}

impl DriftReport {
    /// Whether any backend drifted
    pub fn has_drift(&self) -> bool {
        self.resource.as_ref().is_some_and(ResourceDrift::has_drift)
            || self.state.as_ref().is_some_and(|s| s.drifted)
    }
}

/// Read-only drift detection. Never takes the lock and never writes.
pub struct DriftReconciler {
    catalog: Arc<dyn SnapshotCatalog>,
    resource: Arc<ResourceBackend>,
    state: Arc<StateBackend>,
}

impl DriftReconciler {
    /// Reconciler reading from `catalog` and the two backends
    pub fn new(catalog: Arc<dyn SnapshotCatalog>, resource: Arc<ResourceBackend>, state: Arc<StateBackend>) -> Self {
        Self {
            catalog,
            resource,
            state,
        }
    }

    /// Compare the latest snapshots of `environment` with live state
    #[instrument(skip(self))]
    pub async fn check(&self, environment: &str) -> Result<DriftReport> {
        validate_name("environment", environment)?;

        let resource = match self.catalog.get_latest(environment, BackendKind::Resource).await? {
            Some(manifest) => Some(self.resource_drift(environment, &manifest).await?),
            None => None,
        };
        let state = match self.catalog.get_latest(environment, BackendKind::State).await? {
            Some(manifest) => Some(self.state_drift(environment, &manifest).await?),
            None => None,
        };

        let report = DriftReport {
            environment: environment.to_string(),
            checked_at: Utc::now(),
            resource,
            state,
        };
        info!(environment, drifted = report.has_drift(), "Drift check finished");
        Ok(report)
    }

    async fn resource_drift(&self, environment: &str, manifest: &Manifest) -> Result<ResourceDrift> {
        let SnapshotPayload::Resource(snapshot) = &manifest.payload else {
            return Err(mismatched(manifest));
        };

        let live = self.resource.export_as(environment, snapshot.format).await?;
        let names: BTreeSet<&str> = snapshot
            .resource_summary
            .keys()
            .map(String::as_str)
            .chain(live.values().filter(|e| e.record_count > 0).map(|e| e.category.as_str()))
            .collect();

        let mut categories = Vec::new();
        for name in names {
            let recorded = snapshot.file(name);
            let current = live.get(name).filter(|e| e.record_count > 0);
            let status = match (recorded, current) {
                (None, None) => continue,
                (None, Some(_)) => DriftStatus::Added,
                (Some(_), None) => DriftStatus::Removed,
                (Some(file), Some(export)) => {
                    if file.record_count == export.record_count && file.content_hash == content_hash(&export.bytes) {
                        DriftStatus::Unchanged
                    } else {
                        DriftStatus::Changed
                    }
                }
            };
            categories.push(CategoryDrift {
                category: name.to_string(),
                status,
                snapshot_count: recorded.map_or(0, |f| f.record_count),
                live_count: current.map_or(0, |e| e.record_count),
            });
        }

        Ok(ResourceDrift {
            snapshot_id: manifest.snapshot_id.clone(),
            categories,
        })
    }

    async fn state_drift(&self, environment: &str, manifest: &Manifest) -> Result<StateDrift> {
        let SnapshotPayload::State(snapshot) = &manifest.payload else {
            return Err(mismatched(manifest));
        };
        let recorded = &snapshot.state_pointer;
        let current = self.state.capture(environment).await?;

        Ok(StateDrift {
            snapshot_id: manifest.snapshot_id.clone(),
            snapshot_version: recorded.version.clone(),
            snapshot_hash: recorded.content_hash.clone(),
            drifted: current.content_hash != recorded.content_hash,
            current_version: current.version,
            current_hash: current.content_hash,
        })
    }
}

fn mismatched(manifest: &Manifest) -> VaultError {
    VaultError::Validation(format!(
        "snapshot '{}' is filed under the wrong backend",
        manifest.snapshot_id
    ))
}
