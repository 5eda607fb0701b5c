//! Reconciliation engine collaborator.
//!
//! The engine owns live entities and its own persisted state object. This
//! crate only drives it through the narrow [`ReconciliationEngine`] trait:
//! apply a state, export a category, upsert one record, and report where its
//! state object lives.

mod memory;

pub use memory::InMemoryEngine;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backup::StateVersionPointer;
use crate::Result;

/// One typed entity of a category (a principal, a membership edge, a policy...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Category the record belongs to
    pub category: String,
    /// Id unique within the category
    pub id: String,
    /// Engine-specific attributes
    #[serde(default)]
    pub attributes: Value,
}

impl ResourceRecord {
    /// Record from its parts
    pub fn new(category: impl Into<String>, id: impl Into<String>, attributes: Value) -> Self {
        Self {
            category: category.into(),
            id: id.into(),
            attributes,
        }
    }
}

/// A record that did not converge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    /// Category of the failed record
    pub category: String,
    /// Id of the failed record
    pub record_id: String,
    /// Error reported for it
    pub message: String,
}

/// Outcome of reconciling a set of records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyResult {
    /// Records applied successfully
    pub applied: usize,
    /// Records that failed
    pub failures: Vec<RecordFailure>,
}

impl ApplyResult {
    /// No record failed
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Declarative reconciliation engine for one or more environments
#[async_trait]
pub trait ReconciliationEngine: Send + Sync {
    /// Reconcile live entities toward the state stored at `desired`.
    /// Per-record failures are reported in the result, not as an error.
    async fn apply(&self, environment: &str, desired: &StateVersionPointer) -> Result<ApplyResult>;

    /// Live entities of one category
    async fn export_category(&self, environment: &str, category: &str) -> Result<Vec<ResourceRecord>>;

    /// Idempotent upsert of a single entity
    async fn create_or_update(&self, environment: &str, record: &ResourceRecord) -> Result<()>;

    /// Where the engine's persisted state object for `environment` lives now
    async fn current_state_handle(&self, environment: &str) -> Result<StateVersionPointer>;
}
