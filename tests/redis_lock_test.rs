// Integration tests for the Redis lock store
// Requires a live Redis instance: REDIS_URL=redis://localhost:6379/0 cargo test -- --ignored

use std::env;
use std::sync::Arc;
use std::time::Duration;

use configvault::lock::{
    AcquireOutcome, DistributedLock, LockConfig, LockStore, RedisLockConfig, RedisLockStore,
};
use configvault::backup::{BackendKind, BackupManager, MemoryCatalog, RetentionPolicy, ScheduleTag};
use configvault::engine::{InMemoryEngine, ResourceRecord};
use configvault::resilience::RetryConfig;
use configvault::store::MemoryObjectStore;
use configvault::{VaultConfig, VaultError};
use serde_json::json;
use uuid::Uuid;

/// Get Redis connection URL from environment or use default
fn get_redis_url() -> String {
    env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379/0".to_string())
}

async fn redis_lock() -> (DistributedLock, String) {
    let store = RedisLockStore::new(RedisLockConfig {
        redis_url: get_redis_url(),
        key_prefix: format!("configvault-test-{}:", Uuid::new_v4().simple()),
    })
    .await
    .expect("Failed to connect to Redis");

    let lock = DistributedLock::new(
        Arc::new(store),
        LockConfig {
            acquire_retry: RetryConfig::no_retry(),
            ..LockConfig::default()
        },
    );
    (lock, format!("env-{}", Uuid::new_v4().simple()))
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn test_redis_acquire_is_exclusive() {
    let (lock, environment) = redis_lock().await;

    let token = lock.acquire(&environment, "runner-a", Duration::from_secs(30)).await.unwrap();
    match lock.try_acquire(&environment, "runner-b", Duration::from_secs(30)).await.unwrap() {
        AcquireOutcome::Busy(holder) => assert_eq!(holder.holder_id, "runner-a"),
        AcquireOutcome::Acquired(_) => panic!("lock acquired twice"),
    }

    lock.release(&token).await.unwrap();
    assert!(lock.holder(&environment).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn test_redis_renew_and_fencing() {
    let (lock, environment) = redis_lock().await;

    let token = lock.acquire(&environment, "runner-a", Duration::from_secs(2)).await.unwrap();
    let renewed = lock.renew(&token).await.unwrap();
    assert!(renewed.lease_expiry() >= token.lease_expiry());
    assert_eq!(renewed.lease_id(), token.lease_id());

    lock.release(&renewed).await.unwrap();
    assert!(matches!(lock.renew(&renewed).await, Err(VaultError::LeaseLost { .. })));
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn test_redis_expired_key_is_reclaimable() {
    let (lock, environment) = redis_lock().await;

    lock.acquire(&environment, "crashed", Duration::from_millis(300)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let token = lock.acquire(&environment, "runner-b", Duration::from_secs(5)).await.unwrap();
    assert_eq!(token.holder_id(), "runner-b");
    lock.release(&token).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn test_redis_compare_and_set_rejects_stale_lease() {
    let store = RedisLockStore::new(RedisLockConfig {
        redis_url: get_redis_url(),
        key_prefix: format!("configvault-test-{}:", Uuid::new_v4().simple()),
    })
    .await
    .unwrap();

    // Nothing stored yet, so an expected lease cannot match
    assert!(!store.compare_and_set("acme", Some(Uuid::new_v4()), None).await.unwrap());
    assert!(store.get("acme").await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn test_manager_connects_lock_store_from_config() {
    let mut config = VaultConfig::default();
    config.operator = "tester".to_string();
    config.redis = Some(RedisLockConfig {
        redis_url: get_redis_url(),
        key_prefix: format!("configvault-test-{}:", Uuid::new_v4().simple()),
    });
    let store = Arc::new(MemoryObjectStore::new("vault-state"));
    let engine = Arc::new(InMemoryEngine::new(store.clone()));
    engine.seed("acme", vec![ResourceRecord::new("principals", "u1", json!({}))]);

    let manager = BackupManager::builder(config)
        .object_store(store)
        .catalog(Arc::new(MemoryCatalog::new()))
        .engine(engine)
        .connect_configured()
        .await
        .unwrap()
        .build()
        .unwrap();

    manager
        .backup("acme", BackendKind::Resource, ScheduleTag::Manual, RetentionPolicy::unlimited())
        .await
        .unwrap();
    assert!(manager.lock().holder("acme").await.unwrap().is_none());
}
