// Snapshot Catalog - file system and in-memory manifest stores

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{select_for_pruning, sort_newest_first, BackendKind, Manifest, PruneResult, RetentionPolicy};
use crate::{Result, VaultError};

/// Durable registry of snapshot manifests.
///
/// Appends are the only writes to manifests. `prune` is the only deletion
/// path, it removes manifests (and catalog-local artifacts) but never the
/// backend data they reference, and it never removes the `latest` one.
#[async_trait]
pub trait SnapshotCatalog: Send + Sync {
    /// Store a new manifest and point `latest` for its (environment, kind) at it.
    /// Fails with [`VaultError::Conflict`] if the snapshot id already exists.
    async fn append(&self, manifest: &Manifest) -> Result<()>;

    /// Manifests ordered by `created_at` descending
    async fn list(&self, environment: &str, backend_kind: Option<BackendKind>) -> Result<Vec<Manifest>>;

    /// One manifest by id
    async fn get(&self, environment: &str, snapshot_id: &str) -> Result<Option<Manifest>>;

    /// Manifest named by the `latest` pointer
    async fn get_latest(&self, environment: &str, backend_kind: BackendKind) -> Result<Option<Manifest>>;

    /// Delete manifests beyond the policy, never the `latest` one
    async fn prune(
        &self,
        environment: &str,
        backend_kind: BackendKind,
        policy: &RetentionPolicy,
    ) -> Result<PruneResult>;

    /// Store a file next to a manifest (e.g. a downloaded state copy)
    async fn put_artifact(
        &self,
        environment: &str,
        backend_kind: BackendKind,
        snapshot_id: &str,
        name: &str,
        bytes: Bytes,
    ) -> Result<()>;

    /// Read back an artifact written with `put_artifact`
    async fn get_artifact(
        &self,
        environment: &str,
        backend_kind: BackendKind,
        snapshot_id: &str,
        name: &str,
    ) -> Result<Bytes>;
}

/// Contents of the per-(environment, kind) `latest.json` file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LatestPointer {
    snapshot_id: String,
    updated_at: DateTime<Utc>,
}

const LATEST_FILE: &str = "latest.json";

/// Catalog laid out as `{root}/{environment}/{kind}/{snapshot_id}.json`
pub struct FileCatalog {
    root: PathBuf,
}

impl FileCatalog {
    /// Catalog rooted at `root`; directories are created on first write
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Catalog root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn kind_dir(&self, environment: &str, backend_kind: BackendKind) -> PathBuf {
        self.root.join(environment).join(backend_kind.as_str())
    }

    fn manifest_path(&self, environment: &str, backend_kind: BackendKind, snapshot_id: &str) -> PathBuf {
        self.kind_dir(environment, backend_kind)
            .join(format!("{}.json", snapshot_id))
    }

    fn artifact_dir(&self, environment: &str, backend_kind: BackendKind, snapshot_id: &str) -> PathBuf {
        self.kind_dir(environment, backend_kind).join(snapshot_id)
    }

    async fn latest_id(&self, environment: &str, backend_kind: BackendKind) -> Result<Option<String>> {
        let path = self.kind_dir(environment, backend_kind).join(LATEST_FILE);
        match fs::read(&path).await {
            Ok(bytes) => {
                let pointer: LatestPointer = serde_json::from_slice(&bytes)?;
                Ok(Some(pointer.snapshot_id))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_manifest(path: &Path) -> Result<Option<Manifest>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_kind(&self, environment: &str, backend_kind: BackendKind) -> Result<Vec<Manifest>> {
        let dir = self.kind_dir(environment, backend_kind);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut manifests = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_manifest = path.extension().and_then(|s| s.to_str()) == Some("json")
                && path.file_name().and_then(|s| s.to_str()) != Some(LATEST_FILE);
            if !is_manifest {
                continue;
            }

            let bytes = fs::read(&path).await?;
            match serde_json::from_slice::<Manifest>(&bytes) {
                Ok(manifest) => manifests.push(manifest),
                Err(error) => warn!(path = %path.display(), error = %error, "Skipping unreadable manifest"),
            }
        }
        Ok(manifests)
    }
}

/// Write via a temp file in the same directory, then rename over `path`
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| VaultError::Validation(format!("no parent directory for {}", path.display())))?;
    fs::create_dir_all(dir).await?;

    let tmp = dir.join(format!(".tmp-{}", Uuid::new_v4().simple()));
    fs::write(&tmp, bytes).await?;
    if let Err(error) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(error.into());
    }
    Ok(())
}

/// Like [`write_atomic`], but fails with `AlreadyExists` instead of replacing
/// `path`. Linking the finished temp file claims the name in one step.
async fn write_new(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).await?;

    let tmp = dir.join(format!(".tmp-{}", Uuid::new_v4().simple()));
    fs::write(&tmp, bytes).await?;
    let linked = fs::hard_link(&tmp, path).await;
    let _ = fs::remove_file(&tmp).await;
    linked
}

#[async_trait]
impl SnapshotCatalog for FileCatalog {
    async fn append(&self, manifest: &Manifest) -> Result<()> {
        let kind = manifest.backend_kind();
        let path = self.manifest_path(&manifest.environment, kind, &manifest.snapshot_id);
        match write_new(&path, &serde_json::to_vec_pretty(manifest)?).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(VaultError::Conflict(format!(
                    "snapshot '{}' already exists in '{}'",
                    manifest.snapshot_id, manifest.environment
                )));
            }
            Err(e) => return Err(e.into()),
        }

        let pointer = LatestPointer {
            snapshot_id: manifest.snapshot_id.clone(),
            updated_at: Utc::now(),
        };
        write_atomic(
            &self.kind_dir(&manifest.environment, kind).join(LATEST_FILE),
            &serde_json::to_vec_pretty(&pointer)?,
        )
        .await?;

        debug!(
            environment = %manifest.environment,
            snapshot_id = %manifest.snapshot_id,
            backend_kind = %kind,
            "Manifest appended"
        );
        Ok(())
    }

    async fn list(&self, environment: &str, backend_kind: Option<BackendKind>) -> Result<Vec<Manifest>> {
        let kinds = match backend_kind {
            Some(kind) => vec![kind],
            None => BackendKind::ALL.to_vec(),
        };

        let mut manifests = Vec::new();
        for kind in kinds {
            manifests.extend(self.list_kind(environment, kind).await?);
        }
        sort_newest_first(&mut manifests);
        Ok(manifests)
    }

    async fn get(&self, environment: &str, snapshot_id: &str) -> Result<Option<Manifest>> {
        for kind in BackendKind::ALL {
            if let Some(manifest) = Self::read_manifest(&self.manifest_path(environment, kind, snapshot_id)).await? {
                return Ok(Some(manifest));
            }
        }
        Ok(None)
    }

    async fn get_latest(&self, environment: &str, backend_kind: BackendKind) -> Result<Option<Manifest>> {
        match self.latest_id(environment, backend_kind).await? {
            Some(id) => Self::read_manifest(&self.manifest_path(environment, backend_kind, &id)).await,
            None => Ok(None),
        }
    }

    async fn prune(
        &self,
        environment: &str,
        backend_kind: BackendKind,
        policy: &RetentionPolicy,
    ) -> Result<PruneResult> {
        let mut manifests = self.list_kind(environment, backend_kind).await?;
        sort_newest_first(&mut manifests);
        let latest = self.latest_id(environment, backend_kind).await?;

        let deleted = select_for_pruning(&manifests, latest.as_deref(), policy);
        for snapshot_id in &deleted {
            fs::remove_file(self.manifest_path(environment, backend_kind, snapshot_id)).await?;
            let artifacts = self.artifact_dir(environment, backend_kind, snapshot_id);
            if fs::try_exists(&artifacts).await? {
                fs::remove_dir_all(&artifacts).await?;
            }
        }

        if !deleted.is_empty() {
            info!(environment, backend_kind = %backend_kind, deleted = deleted.len(), "Pruned manifests");
        }
        Ok(PruneResult {
            retained: manifests.len() - deleted.len(),
            deleted,
        })
    }

    async fn put_artifact(
        &self,
        environment: &str,
        backend_kind: BackendKind,
        snapshot_id: &str,
        name: &str,
        bytes: Bytes,
    ) -> Result<()> {
        let path = self.artifact_dir(environment, backend_kind, snapshot_id).join(name);
        write_atomic(&path, &bytes).await
    }

    async fn get_artifact(
        &self,
        environment: &str,
        backend_kind: BackendKind,
        snapshot_id: &str,
        name: &str,
    ) -> Result<Bytes> {
        let path = self.artifact_dir(environment, backend_kind, snapshot_id).join(name);
        Ok(Bytes::from(fs::read(&path).await?))
    }
}

type CatalogKey = (String, BackendKind);

/// In-memory catalog for tests and embedding
#[derive(Default)]
pub struct MemoryCatalog {
    manifests: DashMap<CatalogKey, HashMap<String, Manifest>>,
    latest: DashMap<CatalogKey, String>,
    artifacts: DashMap<(CatalogKey, String, String), Bytes>,
}

impl MemoryCatalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    fn key(environment: &str, backend_kind: BackendKind) -> CatalogKey {
        (environment.to_string(), backend_kind)
    }

    fn kind_manifests(&self, environment: &str, backend_kind: BackendKind) -> Vec<Manifest> {
        self.manifests
            .get(&Self::key(environment, backend_kind))
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SnapshotCatalog for MemoryCatalog {
    async fn append(&self, manifest: &Manifest) -> Result<()> {
        let key = Self::key(&manifest.environment, manifest.backend_kind());
        {
            let mut manifests = self.manifests.entry(key.clone()).or_default();
            if manifests.contains_key(&manifest.snapshot_id) {
                return Err(VaultError::Conflict(format!(
                    "snapshot '{}' already exists in '{}'",
                    manifest.snapshot_id, manifest.environment
                )));
            }
            manifests.insert(manifest.snapshot_id.clone(), manifest.clone());
        }
        self.latest.insert(key, manifest.snapshot_id.clone());
        Ok(())
    }

    async fn list(&self, environment: &str, backend_kind: Option<BackendKind>) -> Result<Vec<Manifest>> {
        let mut manifests: Vec<Manifest> = match backend_kind {
            Some(kind) => self.kind_manifests(environment, kind),
            None => BackendKind::ALL
                .iter()
                .flat_map(|kind| self.kind_manifests(environment, *kind))
                .collect(),
        };
        sort_newest_first(&mut manifests);
        Ok(manifests)
    }

    async fn get(&self, environment: &str, snapshot_id: &str) -> Result<Option<Manifest>> {
        Ok(BackendKind::ALL.iter().find_map(|kind| {
            self.manifests
                .get(&Self::key(environment, *kind))
                .and_then(|m| m.get(snapshot_id).cloned())
        }))
    }

    async fn get_latest(&self, environment: &str, backend_kind: BackendKind) -> Result<Option<Manifest>> {
        let key = Self::key(environment, backend_kind);
        let Some(id) = self.latest.get(&key).map(|id| id.value().clone()) else {
            return Ok(None);
        };
        Ok(self.manifests.get(&key).and_then(|m| m.get(&id).cloned()))
    }

    async fn prune(
        &self,
        environment: &str,
        backend_kind: BackendKind,
        policy: &RetentionPolicy,
    ) -> Result<PruneResult> {
        let key = Self::key(environment, backend_kind);
        let mut manifests = self.kind_manifests(environment, backend_kind);
        sort_newest_first(&mut manifests);
        let latest = self.latest.get(&key).map(|id| id.value().clone());

        let deleted = select_for_pruning(&manifests, latest.as_deref(), policy);
        if let Some(mut stored) = self.manifests.get_mut(&key) {
            for snapshot_id in &deleted {
                stored.remove(snapshot_id);
            }
        }
        self.artifacts
            .retain(|(artifact_key, snapshot_id, _), _| !(artifact_key == &key && deleted.contains(snapshot_id)));

        Ok(PruneResult {
            retained: manifests.len() - deleted.len(),
            deleted,
        })
    }

    async fn put_artifact(
        &self,
        environment: &str,
        backend_kind: BackendKind,
        snapshot_id: &str,
        name: &str,
        bytes: Bytes,
    ) -> Result<()> {
        self.artifacts.insert(
            (Self::key(environment, backend_kind), snapshot_id.to_string(), name.to_string()),
            bytes,
        );
        Ok(())
    }

    async fn get_artifact(
        &self,
        environment: &str,
        backend_kind: BackendKind,
        snapshot_id: &str,
        name: &str,
    ) -> Result<Bytes> {
        self.artifacts
            .get(&(Self::key(environment, backend_kind), snapshot_id.to_string(), name.to_string()))
            .map(|b| b.value().clone())
            .ok_or_else(|| {
                VaultError::Validation(format!("no artifact '{}' for snapshot '{}'", name, snapshot_id))
            })
    }
}
