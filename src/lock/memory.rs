use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{LockRecord, LockStore};
use crate::Result;

/// Process-local lock store; the mutex makes compare-and-set atomic
#[derive(Clone, Default)]
pub struct MemoryLockStore {
    records: Arc<Mutex<HashMap<String, LockRecord>>>,
}

impl MemoryLockStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn get(&self, environment: &str) -> Result<Option<LockRecord>> {
        Ok(self.records.lock().get(environment).cloned())
    }

    async fn compare_and_set(
        &self,
        environment: &str,
        expected_lease: Option<Uuid>,
        new: Option<&LockRecord>,
    ) -> Result<bool> {
        let mut records = self.records.lock();
        let current = records.get(environment).map(|r| r.lease_id);
        if current != expected_lease {
            return Ok(false);
        }

        match new {
            Some(record) => {
                records.insert(environment.to_string(), record.clone());
            }
            None => {
                records.remove(environment);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(holder: &str) -> LockRecord {
        let now = Utc::now();
        LockRecord {
            environment: "acme".to_string(),
            holder_id: holder.to_string(),
            lease_id: Uuid::new_v4(),
            acquired_at: now,
            lease_expiry: now + chrono::Duration::seconds(30),
        }
    }

    #[tokio::test]
    async fn test_compare_and_set_requires_expected_lease() {
        let store = MemoryLockStore::new();
        let first = record("a");
        let second = record("b");

        assert!(store.compare_and_set("acme", None, Some(&first)).await.unwrap());
        assert!(!store.compare_and_set("acme", None, Some(&second)).await.unwrap());
        assert!(!store
            .compare_and_set("acme", Some(second.lease_id), None)
            .await
            .unwrap());
        assert!(store
            .compare_and_set("acme", Some(first.lease_id), None)
            .await
            .unwrap());
        assert!(store.get("acme").await.unwrap().is_none());
    }
}
