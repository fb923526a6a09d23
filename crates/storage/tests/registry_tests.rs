// Store-number routing through the registry.

mod common;

use bitstore_core::SYNCHRONIZED_STORE_NUMBER;
use bitstore_core::config::SyncConfig;
use bitstore_storage::{BitStore, StorageError, StoreRegistry, base};
use common::InstrumentedBackend;
use std::sync::Arc;

fn registry() -> (StoreRegistry, Arc<InstrumentedBackend>, Arc<InstrumentedBackend>) {
    let a = Arc::new(InstrumentedBackend::new());
    let b = Arc::new(InstrumentedBackend::new());
    let registry = StoreRegistry::new()
        .with_store(0, a.clone())
        .with_store(1, b.clone())
        .with_sync(SyncConfig {
            primary: 1,
            secondary: 0,
        });
    (registry, a, b)
}

#[tokio::test]
async fn test_synchronized_reads_go_to_primary() {
    let (registry, a, b) = registry();
    registry.init_all().await.unwrap();
    a.insert("1234", bytes::Bytes::from_static(b"from a"));
    b.insert("1234", bytes::Bytes::from_static(b"from b"));

    let reader = registry.reader(SYNCHRONIZED_STORE_NUMBER).unwrap();
    let data = base::collect(reader.get("1234").await.unwrap()).await.unwrap();
    assert_eq!(&data[..], b"from b");
    assert_eq!(InstrumentedBackend::count(&a.gets), 0);
    assert_eq!(InstrumentedBackend::count(&b.gets), 1);
}

#[tokio::test]
async fn test_legacy_store_number_reads_store_zero() {
    let (registry, a, _b) = registry();
    a.insert("5678", bytes::Bytes::from_static(b"legacy"));

    let reader = registry.reader(-1).unwrap();
    let data = base::collect(reader.get("5678").await.unwrap()).await.unwrap();
    assert_eq!(&data[..], b"legacy");
}

#[tokio::test]
async fn test_backend_disabled_after_init_refuses_use() {
    let registry = StoreRegistry::new().with_store(3, Arc::new(InstrumentedBackend::disabled()));
    registry.init_all().await.unwrap();

    assert!(!registry.is_enabled(3));
    assert!(matches!(registry.store(3), Err(StorageError::Disabled(_))));
    assert!(matches!(registry.reader(3), Err(StorageError::Disabled(_))));
}

#[tokio::test]
async fn test_init_all_initializes_every_store() {
    let (registry, a, b) = registry();
    assert!(!a.is_initialized());
    registry.init_all().await.unwrap();
    assert!(a.is_initialized());
    assert!(b.is_initialized());
}
