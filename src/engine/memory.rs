use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::debug;

use super::{ApplyResult, ReconciliationEngine, RecordFailure, ResourceRecord};
use crate::backup::StateVersionPointer;
use crate::store::ObjectVersionStore;
use crate::{Result, VaultError};

type LiveSet = BTreeMap<(String, String), ResourceRecord>;

/// Engine simulator: live entities in memory, state documents in an
/// [`ObjectVersionStore`].
///
/// A state document is JSON of the form
/// `{"serial": n, "resources": [ResourceRecord, ...]}`. Applying it upserts
/// every listed resource; resources not listed are left alone.
pub struct InMemoryEngine {
    store: Arc<dyn ObjectVersionStore>,
    live: DashMap<String, LiveSet>,
    failing: Mutex<HashSet<(String, String)>>,
    apply_latency: Mutex<Duration>,
    upserts: AtomicUsize,
    applies: AtomicUsize,
}

impl InMemoryEngine {
    /// Engine persisting state documents in `store`
    pub fn new(store: Arc<dyn ObjectVersionStore>) -> Self {
        Self {
            store,
            live: DashMap::new(),
            failing: Mutex::new(HashSet::new()),
            apply_latency: Mutex::new(Duration::ZERO),
            upserts: AtomicUsize::new(0),
            applies: AtomicUsize::new(0),
        }
    }

    /// Key of the persisted state object for `environment`
    pub fn state_key(environment: &str) -> String {
        format!("{}/engine/state.json", environment)
    }

    /// Put records straight into the live set, bypassing counters and failures
    pub fn seed(&self, environment: &str, records: impl IntoIterator<Item = ResourceRecord>) {
        let mut live = self.live.entry(environment.to_string()).or_default();
        for record in records {
            live.insert((record.category.clone(), record.id.clone()), record);
        }
    }

    /// Delete a live record
    pub fn remove(&self, environment: &str, category: &str, id: &str) -> Option<ResourceRecord> {
        self.live
            .get_mut(environment)
            .and_then(|mut live| live.remove(&(category.to_string(), id.to_string())))
    }

    /// One live record
    pub fn record(&self, environment: &str, category: &str, id: &str) -> Option<ResourceRecord> {
        self.live
            .get(environment)
            .and_then(|live| live.get(&(category.to_string(), id.to_string())).cloned())
    }

    /// Live records in a category
    pub fn count(&self, environment: &str, category: &str) -> usize {
        self.live
            .get(environment)
            .map(|live| live.keys().filter(|(c, _)| c == category).count())
            .unwrap_or(0)
    }

    /// Make every upsert of this record fail until [`InMemoryEngine::heal_record`]
    pub fn fail_record(&self, category: &str, id: &str) {
        self.failing.lock().insert((category.to_string(), id.to_string()));
    }

    /// Let upserts of this record succeed again
    pub fn heal_record(&self, category: &str, id: &str) {
        self.failing.lock().remove(&(category.to_string(), id.to_string()));
    }

    /// Delay every `apply` call
    pub fn set_apply_latency(&self, latency: Duration) {
        *self.apply_latency.lock() = latency;
    }

    /// Upserts performed so far, through `create_or_update` or `apply`
    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Calls to `apply` so far
    pub fn applies(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    /// An ordinary configuration apply: write `resources` as the new state
    /// document and reconcile live entities to it.
    pub async fn apply_configuration(
        &self,
        environment: &str,
        serial: u64,
        resources: Vec<ResourceRecord>,
    ) -> Result<StateVersionPointer> {
        let document = json!({ "serial": serial, "resources": resources });
        let bytes = Bytes::from(serde_json::to_vec_pretty(&document)?);
        let key = Self::state_key(environment);
        let version = self.store.put(&key, bytes).await?;

        for record in resources {
            self.upsert(environment, &record)?;
        }

        let metadata = self.store.head(&key, Some(&version)).await?;
        Ok(StateVersionPointer::from_metadata(self.store.namespace(), metadata))
    }

    fn upsert(&self, environment: &str, record: &ResourceRecord) -> Result<()> {
        let target = (record.category.clone(), record.id.clone());
        if self.failing.lock().contains(&target) {
            return Err(VaultError::Engine(format!(
                "upstream API rejected {}/{}",
                record.category, record.id
            )));
        }

        self.live
            .entry(environment.to_string())
            .or_default()
            .insert(target, record.clone());
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ReconciliationEngine for InMemoryEngine {
    async fn apply(&self, environment: &str, desired: &StateVersionPointer) -> Result<ApplyResult> {
        let latency = *self.apply_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.applies.fetch_add(1, Ordering::SeqCst);

        let bytes = self.store.get(&desired.key, Some(&desired.version)).await?;
        let document: Value = serde_json::from_slice(&bytes)?;
        let resources: Vec<ResourceRecord> = match document.get("resources") {
            Some(resources) => serde_json::from_value(resources.clone())?,
            None => Vec::new(),
        };

        let mut result = ApplyResult::default();
        for record in &resources {
            match self.upsert(environment, record) {
                Ok(()) => result.applied += 1,
                Err(error) => result.failures.push(RecordFailure {
                    category: record.category.clone(),
                    record_id: record.id.clone(),
                    message: error.to_string(),
                }),
            }
        }

        debug!(
            environment,
            version = %desired.version,
            applied = result.applied,
            failed = result.failures.len(),
            "Applied state"
        );
        Ok(result)
    }

    async fn export_category(&self, environment: &str, category: &str) -> Result<Vec<ResourceRecord>> {
        Ok(self
            .live
            .get(environment)
            .map(|live| {
                live.values()
                    .filter(|record| record.category == category)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_or_update(&self, environment: &str, record: &ResourceRecord) -> Result<()> {
        self.upsert(environment, record)
    }

    async fn current_state_handle(&self, environment: &str) -> Result<StateVersionPointer> {
        let metadata = self.store.head(&Self::state_key(environment), None).await?;
        Ok(StateVersionPointer::from_metadata(self.store.namespace(), metadata))
    }
}
