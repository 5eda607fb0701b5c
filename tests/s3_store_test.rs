// Integration tests for the S3 object version store
// Requires a versioning-capable S3 endpoint (e.g. MinIO):
// S3_ENDPOINT=http://localhost:9000 cargo test --features s3 -- --ignored

#![cfg(feature = "s3")]

use std::env;

use bytes::Bytes;
use configvault::store::{content_hash, ObjectVersionStore, S3ObjectStore, S3StoreConfig, VersionToken};
use configvault::VaultError;
use uuid::Uuid;

async fn s3_store() -> S3ObjectStore {
    let config = S3StoreConfig {
        bucket_name: env::var("S3_BUCKET").unwrap_or_else(|_| "configvault-test".to_string()),
        region: env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
        endpoint_url: Some(env::var("S3_ENDPOINT").unwrap_or_else(|_| "http://localhost:9000".to_string())),
        force_path_style: true,
    };
    let store = S3ObjectStore::new(config).await.expect("Failed to build S3 client");
    store.ensure_bucket_exists().await.expect("Failed to create bucket");
    store.enable_bucket_versioning().await.expect("Failed to enable versioning");
    store
}

#[tokio::test]
#[ignore = "requires a versioned S3 endpoint"]
async fn test_s3_versions_are_kept() {
    let store = s3_store().await;
    let key = format!("acme-{}/engine/state.json", Uuid::new_v4().simple());

    let first = store.put(&key, Bytes::from_static(b"{\"serial\":1}")).await.unwrap();
    let second = store.put(&key, Bytes::from_static(b"{\"serial\":2}")).await.unwrap();
    assert_ne!(first, second);

    let versions = store.list_versions(&key).await.unwrap();
    assert_eq!(versions, vec![second.clone(), first.clone()]);

    let old = store.get(&key, Some(&first)).await.unwrap();
    assert_eq!(old, Bytes::from_static(b"{\"serial\":1}"));

    let head = store.head(&key, None).await.unwrap();
    assert_eq!(head.version, second);
    assert_eq!(head.content_hash, content_hash(b"{\"serial\":2}"));
}

#[tokio::test]
#[ignore = "requires a versioned S3 endpoint"]
async fn test_s3_unknown_version_is_not_found() {
    let store = s3_store().await;
    let key = format!("acme-{}/engine/state.json", Uuid::new_v4().simple());
    store.put(&key, Bytes::from_static(b"{}")).await.unwrap();

    let err = store
        .get(&key, Some(&VersionToken::new("no-such-version")))
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::VersionNotFound { .. }));
}
