//! Snapshot manifests, the catalog that stores them, and the manager
//! that takes backups and routes restores.

/// Snapshot catalogs
pub mod catalog;
/// Backup manager facade
pub mod manager;
/// Manifest and retention types
pub mod types;

pub use catalog::{FileCatalog, MemoryCatalog, SnapshotCatalog};
pub use manager::{BackupManager, BackupManagerBuilder};
pub use types::{
    generate_snapshot_id, select_for_pruning, sort_newest_first, validate_name, ArtifactRef, BackendKind,
    ExportFormat, ExportedFile, Manifest, PruneResult, ResourceSnapshot, RestoreOutcome, RetentionPolicy,
    ScheduleTag, SnapshotEvent, SnapshotPayload, StateSnapshot, StateVersionPointer, MANIFEST_FORMAT_VERSION,
};
