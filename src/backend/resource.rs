use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::CategoryTable;
use crate::backup::{ExportFormat, ExportedFile, ResourceSnapshot};
use crate::engine::{ApplyResult, ReconciliationEngine, RecordFailure, ResourceRecord};
use crate::store::{content_hash, ObjectVersionStore};
use crate::{Result, VaultError};

/// Serialized live records of one category
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryExport {
    /// Category name
    pub category: String,
    /// Serialization format of `bytes`
    pub format: ExportFormat,
    /// Records in the payload
    pub record_count: usize,
    /// Serialized records
    pub bytes: Bytes,
}

/// What importing one category would do
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryPlan {
    /// Category name
    pub category: String,
    /// Records in the snapshot, all of which would be written
    pub records: usize,
    /// Records absent live
    pub create: usize,
    /// Records present live with different attributes
    pub update: usize,
    /// Records already identical live
    pub unchanged: usize,
}

/// Dry-run report of a resource restore, in apply order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePlan {
    /// Per-category plans
    pub categories: Vec<CategoryPlan>,
}

impl ResourcePlan {
    /// Records across all categories
    pub fn total_records(&self) -> usize {
        self.categories.iter().map(|c| c.records).sum()
    }

    /// Plan for one category, if it is part of the restore
    pub fn category(&self, name: &str) -> Option<&CategoryPlan> {
        self.categories.iter().find(|c| c.category == name)
    }
}

/// Resource export/import backend.
///
/// Export pulls every configured category from the engine and writes one
/// payload per non-empty category to the object store. Import upserts the
/// snapshot's records in dependency order. It is additive: live records
/// missing from the snapshot are left alone.
pub struct ResourceBackend {
    engine: Arc<dyn ReconciliationEngine>,
    store: Arc<dyn ObjectVersionStore>,
    categories: CategoryTable,
    format: ExportFormat,
}

impl ResourceBackend {
    /// Backend exporting with `format` and ordering imports by `categories`
    pub fn new(
        engine: Arc<dyn ReconciliationEngine>,
        store: Arc<dyn ObjectVersionStore>,
        categories: CategoryTable,
        format: ExportFormat,
    ) -> Self {
        Self {
            engine,
            store,
            categories,
            format,
        }
    }

    /// The category dependency table
    pub fn categories(&self) -> &CategoryTable {
        &self.categories
    }

    /// Pull and serialize all configured categories in the configured format
    pub async fn export(&self, environment: &str) -> Result<BTreeMap<String, CategoryExport>> {
        self.export_as(environment, self.format).await
    }

    /// Export every configured category in the given format
    pub async fn export_as(
        &self,
        environment: &str,
        format: ExportFormat,
    ) -> Result<BTreeMap<String, CategoryExport>> {
        let mut exports = BTreeMap::new();
        for category in self.categories.apply_order(&[])? {
            let mut records = self.engine.export_category(environment, &category).await?;
            let record_count = records.len();
            let bytes = serialize_records(&mut records, format)?;
            exports.insert(
                category.clone(),
                CategoryExport {
                    category,
                    format,
                    record_count,
                    bytes,
                },
            );
        }
        Ok(exports)
    }

    /// Export and persist payloads under `{environment}/resource/{snapshot_id}/`
    #[instrument(skip(self))]
    pub async fn capture(&self, environment: &str, snapshot_id: &str) -> Result<ResourceSnapshot> {
        let exports = self.export(environment).await?;

        let mut files = Vec::new();
        let mut resource_summary = BTreeMap::new();
        for export in exports.into_values().filter(|e| e.record_count > 0) {
            let key = payload_key(environment, snapshot_id, &export.category, export.format);
            let hash = content_hash(&export.bytes);
            let size_bytes = export.bytes.len() as u64;
            let version = self.store.put(&key, export.bytes).await?;

            resource_summary.insert(export.category.clone(), export.record_count);
            files.push(ExportedFile {
                category: export.category,
                key,
                version,
                format: export.format,
                record_count: export.record_count,
                content_hash: hash,
                size_bytes,
            });
        }

        let total_resources: usize = resource_summary.values().sum();
        info!(
            environment,
            snapshot_id,
            files = files.len(),
            total_resources,
            "Exported resources"
        );

        Ok(ResourceSnapshot {
            resource_summary,
            total_files: files.len(),
            files,
            total_resources,
            format: self.format,
        })
    }

    /// Read back a snapshot's records, verifying payload hashes.
    /// Result is in apply order, restricted to `filter` when non-empty.
    pub async fn load(
        &self,
        snapshot: &ResourceSnapshot,
        filter: &[String],
    ) -> Result<Vec<(String, Vec<ResourceRecord>)>> {
        for file in &snapshot.files {
            if !self.categories.contains(&file.category) {
                warn!(category = %file.category, "Snapshot category no longer configured; skipping");
            }
        }

        let mut loaded = Vec::new();
        for category in self.categories.apply_order(filter)? {
            let Some(file) = snapshot.file(&category) else {
                continue;
            };

            let bytes = self.store.get(&file.key, Some(&file.version)).await?;
            if content_hash(&bytes) != file.content_hash {
                return Err(VaultError::Validation(format!(
                    "payload '{}' version {} does not match its recorded hash",
                    file.key, file.version
                )));
            }

            let records = deserialize_records(&bytes, file.format)?;
            if let Some(stray) = records.iter().find(|r| r.category != category) {
                return Err(VaultError::Validation(format!(
                    "payload '{}' contains record '{}' of category '{}'",
                    file.key, stray.id, stray.category
                )));
            }
            loaded.push((category, records));
        }
        Ok(loaded)
    }

    /// Compare snapshot records with live ones without writing anything
    pub async fn plan(
        &self,
        environment: &str,
        snapshot: &ResourceSnapshot,
        filter: &[String],
    ) -> Result<ResourcePlan> {
        let mut plan = ResourcePlan::default();
        for (category, records) in self.load(snapshot, filter).await? {
            let live: HashMap<String, ResourceRecord> = self
                .engine
                .export_category(environment, &category)
                .await?
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect();

            let mut entry = CategoryPlan {
                category,
                records: records.len(),
                ..Default::default()
            };
            for record in &records {
                match live.get(&record.id) {
                    None => entry.create += 1,
                    Some(current) if current.attributes != record.attributes => entry.update += 1,
                    Some(_) => entry.unchanged += 1,
                }
            }
            plan.categories.push(entry);
        }
        Ok(plan)
    }

    /// Upsert the snapshot's records in dependency order.
    ///
    /// Every record is attempted; the ones the engine rejects come back as
    /// failures instead of aborting the import.
    #[instrument(skip(self, snapshot, before_category))]
    pub async fn import<F>(
        &self,
        environment: &str,
        snapshot: &ResourceSnapshot,
        filter: &[String],
        before_category: F,
    ) -> Result<ApplyResult>
    where
        F: Fn() -> Result<()> + Send + Sync,
    {
        let mut result = ApplyResult::default();
        for (category, records) in self.load(snapshot, filter).await? {
            before_category()?;

            let mut applied = 0;
            for record in &records {
                match self.engine.create_or_update(environment, record).await {
                    Ok(()) => applied += 1,
                    Err(error) => {
                        warn!(environment, category = %category, record_id = %record.id, error = %error, "Record did not converge");
                        result.failures.push(RecordFailure {
                            category: category.clone(),
                            record_id: record.id.clone(),
                            message: error.to_string(),
                        });
                    }
                }
            }
            debug!(environment, category = %category, applied, total = records.len(), "Imported category");
            result.applied += applied;
        }
        Ok(result)
    }
}

fn payload_key(environment: &str, snapshot_id: &str, category: &str, format: ExportFormat) -> String {
    format!(
        "{}/resource/{}/{}.{}",
        environment,
        snapshot_id,
        category,
        format.extension()
    )
}

/// Stable textual form: records sorted by id
pub(crate) fn serialize_records(records: &mut [ResourceRecord], format: ExportFormat) -> Result<Bytes> {
    records.sort_by(|a, b| a.id.cmp(&b.id));
    let bytes = match format {
        ExportFormat::Json => serde_json::to_vec_pretty(&*records)?,
        ExportFormat::Yaml => serde_yaml::to_string(&*records)?.into_bytes(),
    };
    Ok(Bytes::from(bytes))
}

pub(crate) fn deserialize_records(bytes: &[u8], format: ExportFormat) -> Result<Vec<ResourceRecord>> {
    Ok(match format {
        ExportFormat::Json => serde_json::from_slice(bytes)?,
        ExportFormat::Yaml => serde_yaml::from_slice(bytes)?,
    })
}
