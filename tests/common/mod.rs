//! Shared fixtures for configvault integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use configvault::backup::{BackupManager, MemoryCatalog, SnapshotCatalog};
use configvault::engine::{InMemoryEngine, ResourceRecord};
use configvault::lock::MemoryLockStore;
use configvault::resilience::RetryConfig;
use configvault::store::MemoryObjectStore;
use configvault::VaultConfig;
use serde_json::json;

pub struct Harness {
    pub store: Arc<MemoryObjectStore>,
    pub engine: Arc<InMemoryEngine>,
    pub catalog: Arc<dyn SnapshotCatalog>,
    pub manager: BackupManager,
}

/// Config with short lock retries so contention surfaces quickly
pub fn test_config() -> VaultConfig {
    let _ = configvault::telemetry::init_tracing();

    let mut config = VaultConfig::default();
    config.holder_id = "test-runner".to_string();
    config.operator = "tester".to_string();
    config.lock.acquire_retry = RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(50),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    config
}

pub fn harness() -> Harness {
    harness_with(test_config(), Arc::new(MemoryCatalog::new()))
}

pub fn harness_with(config: VaultConfig, catalog: Arc<dyn SnapshotCatalog>) -> Harness {
    let store = Arc::new(MemoryObjectStore::new("vault-state"));
    let engine = Arc::new(InMemoryEngine::new(store.clone()));
    let manager = BackupManager::builder(config)
        .object_store(store.clone())
        .lock_store(Arc::new(MemoryLockStore::new()))
        .catalog(catalog.clone())
        .engine(engine.clone())
        .build()
        .expect("manager should build");

    Harness {
        store,
        engine,
        catalog,
        manager,
    }
}

pub fn principal(id: &str, name: &str) -> ResourceRecord {
    ResourceRecord::new("principals", id, json!({ "display_name": name, "active": true }))
}

pub fn membership(principal_id: &str, group_id: &str) -> ResourceRecord {
    ResourceRecord::new(
        "memberships",
        format!("{}:{}", group_id, principal_id),
        json!({ "principal": principal_id, "group": group_id }),
    )
}

/// `principals` principals and `memberships` membership edges
pub fn seed_directory(engine: &InMemoryEngine, environment: &str, principals: usize, memberships: usize) {
    engine.seed(
        environment,
        (0..principals).map(|i| principal(&format!("user-{:03}", i), &format!("User {}", i))),
    );
    engine.seed(
        environment,
        (0..memberships).map(|i| membership(&format!("user-{:03}", i), "engineering")),
    );
}
