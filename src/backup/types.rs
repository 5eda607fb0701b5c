// Backup System Types - manifests, pointers and retention

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::RecordFailure;
use crate::restore::RestoreMode;
use crate::store::{ObjectMetadata, VersionToken};
use crate::{Result, VaultError};

/// Manifest schema version written by this crate
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

const NAME_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$";

lazy_static::lazy_static! {
    static ref NAME_REGEX: std::result::Result<Regex, regex::Error> = Regex::new(NAME_PATTERN);
}

/// Which backend a snapshot belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Exported resource records
    Resource,
    /// Engine state object version
    State,
}

impl BackendKind {
    /// Every backend kind
    pub const ALL: [BackendKind; 2] = [BackendKind::Resource, BackendKind::State];

    /// Lowercase name used in paths
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Resource => "resource",
            BackendKind::State => "state",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = VaultError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "resource" => Ok(BackendKind::Resource),
            "state" => Ok(BackendKind::State),
            other => Err(VaultError::Validation(format!(
                "unknown backend kind '{}' (expected resource or state)",
                other
            ))),
        }
    }
}

/// Informational schedule label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleTag {
    /// Requested by an operator
    Manual,
    /// Daily schedule
    Daily,
    /// Weekly schedule
    Weekly,
}

impl fmt::Display for ScheduleTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScheduleTag::Manual => "manual",
            ScheduleTag::Daily => "daily",
            ScheduleTag::Weekly => "weekly",
        })
    }
}

/// Reference to one version of the engine's persisted state object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVersionPointer {
    /// Bucket or namespace of the object store
    pub namespace: String,
    /// Object key of the state object
    pub key: String,
    /// Version token at capture time
    pub version: VersionToken,
    /// Lowercase hex SHA-256 of that version
    pub content_hash: String,
    /// Size of that version in bytes
    pub size_bytes: u64,
    /// Last-modified time reported by the store
    pub last_modified: DateTime<Utc>,
}

impl StateVersionPointer {
    /// Pointer for a `head` result
    pub fn from_metadata(namespace: impl Into<String>, metadata: ObjectMetadata) -> Self {
        Self {
            namespace: namespace.into(),
            key: metadata.key,
            version: metadata.version,
            content_hash: metadata.content_hash,
            size_bytes: metadata.size_bytes,
            last_modified: metadata.last_modified,
        }
    }
}

/// Textual format of exported resource payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Pretty-printed JSON
    #[default]
    Json,
    /// YAML
    Yaml,
}

impl ExportFormat {
    /// File extension for payload keys
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Yaml => "yaml",
        }
    }
}

/// One exported category payload, stored in the object store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedFile {
    /// Category name
    pub category: String,
    /// Object key of the payload
    pub key: String,
    /// Version written for this snapshot
    pub version: VersionToken,
    /// Payload format
    pub format: ExportFormat,
    /// Records in the payload
    pub record_count: usize,
    /// Lowercase hex SHA-256 of the payload
    pub content_hash: String,
    /// Payload size in bytes
    pub size_bytes: u64,
}

/// Resource-backend snapshot contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Record count per category; empty categories are omitted
    pub resource_summary: BTreeMap<String, usize>,
    /// Payload files, in apply order
    pub files: Vec<ExportedFile>,
    /// Number of files
    pub total_files: usize,
    /// Records across all files
    pub total_resources: usize,
    /// Format of every file
    pub format: ExportFormat,
}

impl ResourceSnapshot {
    /// File for one category
    pub fn file(&self, category: &str) -> Option<&ExportedFile> {
        self.files.iter().find(|f| f.category == category)
    }
}

/// Local copy of a state object kept next to the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Artifact name within the snapshot's directory
    pub name: String,
    /// Lowercase hex SHA-256 of the copy
    pub content_hash: String,
    /// Size of the copy in bytes
    pub size_bytes: u64,
}

/// State-backend snapshot contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Version of the state object
    pub state_pointer: StateVersionPointer,
    /// Downloaded copy, when enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_copy: Option<ArtifactRef>,
}

/// Backend-specific part of a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend_kind", rename_all = "lowercase")]
pub enum SnapshotPayload {
    /// Resource export
    Resource(ResourceSnapshot),
    /// State pointer
    State(StateSnapshot),
}

impl SnapshotPayload {
    /// Backend kind of the payload
    pub fn backend_kind(&self) -> BackendKind {
        match self {
            SnapshotPayload::Resource(_) => BackendKind::Resource,
            SnapshotPayload::State(_) => BackendKind::State,
        }
    }
}

/// Result of a restore, as recorded in its manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreOutcome {
    /// Changes were written
    Applied,
    /// Target already matched the current state; nothing was written
    AlreadyCurrent,
    /// Some records did not converge
    Partial,
}

/// What produced a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SnapshotEvent {
    /// Scheduled or manual backup
    Backup,
    /// Restore of an earlier snapshot
    Restore {
        /// Snapshot that was restored
        source_snapshot_id: String,
        /// State restore mode
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<RestoreMode>,
        /// Categories restored; empty means all
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        resource_filter: Vec<String>,
        /// How the restore ended
        outcome: RestoreOutcome,
        /// Records that did not converge
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        failures: Vec<RecordFailure>,
    },
}

/// Immutable snapshot record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Manifest schema version
    pub format_version: u32,
    /// Unique id, sortable by time
    pub snapshot_id: String,
    /// Environment captured
    pub environment: String,
    /// Capture time
    pub created_at: DateTime<Utc>,
    /// Operator that created the snapshot
    pub created_by: String,
    /// Schedule that triggered it
    pub schedule_tag: ScheduleTag,
    /// Backup or restore
    pub event: SnapshotEvent,
    /// Backend-specific contents
    pub payload: SnapshotPayload,
    /// Commands an operator can run to restore this snapshot
    #[serde(default)]
    pub restore_instructions: BTreeMap<String, String>,
}

impl Manifest {
    /// Manifest with restore instructions derived from its payload
    pub fn new(
        snapshot_id: String,
        created_at: DateTime<Utc>,
        environment: &str,
        created_by: &str,
        schedule_tag: ScheduleTag,
        event: SnapshotEvent,
        payload: SnapshotPayload,
    ) -> Self {
        let restore_instructions = restore_instructions(environment, payload.backend_kind(), &snapshot_id);
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            snapshot_id,
            environment: environment.to_string(),
            created_at,
            created_by: created_by.to_string(),
            schedule_tag,
            event,
            payload,
            restore_instructions,
        }
    }

    /// Backend kind of the payload
    pub fn backend_kind(&self) -> BackendKind {
        self.payload.backend_kind()
    }

    /// Record counts, for resource snapshots
    pub fn resource_summary(&self) -> Option<&BTreeMap<String, usize>> {
        match &self.payload {
            SnapshotPayload::Resource(snapshot) => Some(&snapshot.resource_summary),
            SnapshotPayload::State(_) => None,
        }
    }

    /// State pointer, for state snapshots
    pub fn state_pointer(&self) -> Option<&StateVersionPointer> {
        match &self.payload {
            SnapshotPayload::State(snapshot) => Some(&snapshot.state_pointer),
            SnapshotPayload::Resource(_) => None,
        }
    }

    /// Whether this manifest records a restore
    pub fn is_restore(&self) -> bool {
        matches!(self.event, SnapshotEvent::Restore { .. })
    }
}

/// Per-environment, per-kind retention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// 0 keeps everything
    pub max_snapshots: usize,
}

impl RetentionPolicy {
    /// Keep everything
    pub fn unlimited() -> Self {
        Self { max_snapshots: 0 }
    }

    /// Keep the newest `max_snapshots`; 0 keeps everything
    pub fn keep(max_snapshots: usize) -> Self {
        Self { max_snapshots }
    }

    /// Whether nothing is ever pruned
    pub fn is_unlimited(&self) -> bool {
        self.max_snapshots == 0
    }
}

/// Outcome of a prune
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneResult {
    /// Snapshot ids removed
    pub deleted: Vec<String>,
    /// Manifests left in the catalog
    pub retained: usize,
}

/// Sortable, timestamp-derived id; the random suffix keeps ids unique when
/// two snapshots land in the same millisecond.
pub fn generate_snapshot_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.format("%Y-%m-%dT%H-%M-%S-%3f"), &suffix[..6])
}

fn restore_instructions(environment: &str, kind: BackendKind, snapshot_id: &str) -> BTreeMap<String, String> {
    let base = format!(
        "restore --environment {} --backend {} --snapshot {}",
        environment, kind, snapshot_id
    );
    let mut instructions = BTreeMap::new();
    instructions.insert("dry_run".to_string(), format!("{} --dry-run", base));
    match kind {
        BackendKind::Resource => {
            instructions.insert("apply".to_string(), base.clone());
            instructions.insert(
                "selective".to_string(),
                format!("{} --categories <category>[,<category>...]", base),
            );
        }
        BackendKind::State => {
            instructions.insert("apply".to_string(), format!("{} --mode state-only", base));
            instructions.insert("reconcile".to_string(), format!("{} --mode full-restore", base));
        }
    }
    instructions
}

/// Validate an environment or category name; names end up in object keys
/// and catalog paths.
pub fn validate_name(what: &str, value: &str) -> Result<()> {
    let pattern = NAME_REGEX
        .as_ref()
        .map_err(|e| VaultError::Validation(format!("invalid name pattern: {}", e)))?;
    if pattern.is_match(value) {
        Ok(())
    } else {
        Err(VaultError::Validation(format!(
            "invalid {} name '{}': use letters, digits, '.', '_' or '-'",
            what, value
        )))
    }
}

/// Newest first: `created_at` descending, ties broken by id descending
pub fn sort_newest_first(manifests: &mut [Manifest]) {
    manifests.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.snapshot_id.cmp(&a.snapshot_id))
    });
}

/// Ids to delete from a newest-first list. The snapshot named by `latest`
/// is never selected.
pub fn select_for_pruning(
    newest_first: &[Manifest],
    latest: Option<&str>,
    policy: &RetentionPolicy,
) -> Vec<String> {
    if policy.is_unlimited() {
        return Vec::new();
    }
    newest_first
        .iter()
        .skip(policy.max_snapshots)
        .filter(|m| Some(m.snapshot_id.as_str()) != latest)
        .map(|m| m.snapshot_id.clone())
        .collect()
}
