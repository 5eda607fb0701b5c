use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::backup::StateVersionPointer;
use crate::engine::{ApplyResult, ReconciliationEngine};
use crate::restore::RestoreMode;
use crate::store::{content_hash, ObjectMetadata, ObjectVersionStore, VersionToken};
use crate::{Result, VaultError};

/// Dry-run report of a state restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePlan {
    /// Requested restore mode
    pub mode: RestoreMode,
    /// Current head of the state object
    pub current: StateVersionPointer,
    /// Version being restored
    pub target: StateVersionPointer,
    /// Nothing would be written
    pub already_current: bool,
}

/// Result of swapping the current state version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRestore {
    /// Current version before the restore
    pub previous: StateVersionPointer,
    /// Current version after the restore
    pub current: StateVersionPointer,
    /// The target already matched; nothing was written
    pub already_current: bool,
}

/// State snapshot backend.
///
/// A snapshot is just a pointer to one version of the engine's state
/// object. Restoring copies that version's bytes into a new current
/// version, so history only ever grows.
pub struct StateBackend {
    engine: Arc<dyn ReconciliationEngine>,
    store: Arc<dyn ObjectVersionStore>,
}

impl StateBackend {
    /// Backend over the engine's state object in `store`
    pub fn new(engine: Arc<dyn ReconciliationEngine>, store: Arc<dyn ObjectVersionStore>) -> Self {
        Self { engine, store }
    }

    /// Pointer to the current version of the engine's state object
    #[instrument(skip(self))]
    pub async fn capture(&self, environment: &str) -> Result<StateVersionPointer> {
        let handle = self.engine.current_state_handle(environment).await?;
        if handle.namespace != self.store.namespace() {
            return Err(VaultError::Validation(format!(
                "engine state for '{}' lives in '{}', not in the configured store '{}'",
                environment,
                handle.namespace,
                self.store.namespace()
            )));
        }
        self.head(&handle.key, None).await
    }

    /// Bytes of the pointed-to version, checked against the pointer's hash
    pub async fn download(&self, pointer: &StateVersionPointer) -> Result<Bytes> {
        let bytes = self.store.get(&pointer.key, Some(&pointer.version)).await?;
        if content_hash(&bytes) != pointer.content_hash {
            return Err(VaultError::Validation(format!(
                "state '{}' version {} does not match its recorded hash",
                pointer.key, pointer.version
            )));
        }
        Ok(bytes)
    }

    /// Compare the target with the current head without writing anything
    pub async fn plan(&self, target: &StateVersionPointer, mode: RestoreMode) -> Result<StatePlan> {
        // Fails with VersionNotFound if the target has been expired
        self.head(&target.key, Some(&target.version)).await?;
        let current = self.head(&target.key, None).await?;

        Ok(StatePlan {
            mode,
            already_current: is_same_state(&current, target),
            current,
            target: target.clone(),
        })
    }

    /// Make `target`'s bytes the current version by writing them again.
    /// A target that already matches the current version writes nothing.
    #[instrument(skip(self, target), fields(key = %target.key, version = %target.version))]
    pub async fn restore_state(&self, environment: &str, target: &StateVersionPointer) -> Result<StateRestore> {
        let previous = self.head(&target.key, None).await?;
        if is_same_state(&previous, target) {
            info!(environment, current = %previous.version, "State already at target");
            return Ok(StateRestore {
                current: previous.clone(),
                previous,
                already_current: true,
            });
        }

        let bytes = self.download(target).await?;
        let version = self.store.put(&target.key, bytes).await?;
        let current = self.head(&target.key, Some(&version)).await?;

        info!(
            environment,
            from = %previous.version,
            restored = %target.version,
            new_version = %current.version,
            "State version restored"
        );
        Ok(StateRestore {
            previous,
            current,
            already_current: false,
        })
    }

    /// Ask the engine to reconcile live entities to `pointer`
    pub async fn reconcile(&self, environment: &str, pointer: &StateVersionPointer) -> Result<ApplyResult> {
        self.engine.apply(environment, pointer).await
    }

    /// Retained versions of the environment's state object, newest first
    pub async fn list_state_versions(&self, environment: &str, limit: usize) -> Result<Vec<ObjectMetadata>> {
        let handle = self.engine.current_state_handle(environment).await?;
        let mut versions = Vec::new();
        for token in self.store.list_versions(&handle.key).await?.into_iter().take(limit) {
            versions.push(self.store.head(&handle.key, Some(&token)).await?);
        }
        Ok(versions)
    }

    async fn head(&self, key: &str, version: Option<&VersionToken>) -> Result<StateVersionPointer> {
        let metadata = self.store.head(key, version).await?;
        Ok(StateVersionPointer::from_metadata(self.store.namespace(), metadata))
    }
}

fn is_same_state(current: &StateVersionPointer, target: &StateVersionPointer) -> bool {
    current.version == target.version || current.content_hash == target.content_hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{InMemoryEngine, ResourceRecord};
    use crate::store::MemoryObjectStore;
    use serde_json::json;

    async fn engine_at_v3() -> (Arc<MemoryObjectStore>, Arc<InMemoryEngine>, StateBackend) {
        let store = Arc::new(MemoryObjectStore::new("state"));
        let engine = Arc::new(InMemoryEngine::new(store.clone()));
        for serial in 1..=3 {
            let record = ResourceRecord::new("principals", format!("u{}", serial), json!({}));
            engine.apply_configuration("acme", serial, vec![record]).await.unwrap();
        }
        let backend = StateBackend::new(engine.clone(), store.clone());
        (store, engine, backend)
    }

    #[tokio::test]
    async fn test_capture_points_at_current_version() {
        let (_, _, backend) = engine_at_v3().await;
        let pointer = backend.capture("acme").await.unwrap();
        assert_eq!(pointer.version.as_str(), "v3");
        assert_eq!(pointer.namespace, "state");
        assert_eq!(pointer.key, InMemoryEngine::state_key("acme"));
    }

    #[tokio::test]
    async fn test_restore_writes_a_new_version_with_old_bytes() {
        let (store, _, backend) = engine_at_v3().await;
        let key = InMemoryEngine::state_key("acme");
        let v1 = StateVersionPointer::from_metadata("state", store.head(&key, Some(&"v1".into())).await.unwrap());

        let restored = backend.restore_state("acme", &v1).await.unwrap();

        assert!(!restored.already_current);
        assert_eq!(restored.previous.version.as_str(), "v3");
        assert_eq!(restored.current.version.as_str(), "v4");
        assert_eq!(restored.current.content_hash, v1.content_hash);
        assert_eq!(store.list_versions(&key).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_restoring_current_version_is_a_no_op() {
        let (store, _, backend) = engine_at_v3().await;
        let current = backend.capture("acme").await.unwrap();

        let plan = backend.plan(&current, RestoreMode::StateOnly).await.unwrap();
        assert!(plan.already_current);

        let restored = backend.restore_state("acme", &current).await.unwrap();
        assert!(restored.already_current);
        assert_eq!(store.list_versions(&current.key).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_expired_target_is_version_not_found() {
        let (store, _, backend) = engine_at_v3().await;
        let key = InMemoryEngine::state_key("acme");
        let v1 = StateVersionPointer::from_metadata("state", store.head(&key, Some(&"v1".into())).await.unwrap());
        store.expire_version(&key, &v1.version);

        let err = backend.plan(&v1, RestoreMode::StateOnly).await.unwrap_err();
        assert!(matches!(err, VaultError::VersionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_list_state_versions_is_newest_first() {
        let (_, _, backend) = engine_at_v3().await;
        let versions = backend.list_state_versions("acme", 2).await.unwrap();
        let tokens: Vec<&str> = versions.iter().map(|v| v.version.as_str()).collect();
        assert_eq!(tokens, vec!["v3", "v2"]);
    }
}
