pub mod mocks;

#[allow(unused_imports)]
pub use mocks::DeletingBackend;

use bitstore_core::ContentAddress;
use bitstore_core::config::{CleanupConfig, SyncConfig};
use bitstore_metadata::{BitstreamRow, MetadataStore, SqliteStore};
use bitstore_service::BitstreamStorageService;
use bitstore_storage::{BitStore, ByteStream, FilesystemBackend, StorageError, StoreRegistry, base};
use bytes::Bytes;
use md5::{Digest, Md5};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

/// A service over `store_count` filesystem stores and a SQLite metadata file.
#[allow(dead_code)]
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub stores: Vec<Arc<FilesystemBackend>>,
    pub metadata: Arc<dyn MetadataStore>,
    pub service: BitstreamStorageService,
}

#[allow(dead_code)]
pub struct EnvBuilder {
    store_count: i32,
    sync: Option<SyncConfig>,
    cleanup: CleanupConfig,
}

#[allow(dead_code)]
impl EnvBuilder {
    pub fn new() -> Self {
        Self {
            store_count: 2,
            sync: None,
            cleanup: CleanupConfig::default(),
        }
    }

    pub fn stores(mut self, count: i32) -> Self {
        self.store_count = count;
        self
    }

    pub fn sync(mut self, primary: i32, secondary: i32) -> Self {
        self.sync = Some(SyncConfig { primary, secondary });
        self
    }

    pub fn grace_period_secs(mut self, secs: u64) -> Self {
        self.cleanup.grace_period_secs = secs;
        self
    }

    pub fn commit_interval(mut self, interval: u32) -> Self {
        self.cleanup.commit_interval = interval;
        self
    }

    pub fn page_size(mut self, size: u32) -> Self {
        self.cleanup.page_size = size;
        self
    }

    pub async fn build(self) -> TestEnv {
        let temp_dir = TempDir::new().unwrap();

        let mut registry = StoreRegistry::new();
        let mut stores = Vec::new();
        for index in 0..self.store_count {
            let backend = Arc::new(FilesystemBackend::new(
                temp_dir.path().join(format!("store{index}")),
            ));
            registry = registry.with_store(index, backend.clone() as Arc<dyn BitStore>);
            stores.push(backend);
        }
        if let Some(sync) = self.sync {
            registry = registry.with_sync(sync);
        }
        registry.init_all().await.unwrap();

        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(temp_dir.path().join("metadata.db"))
                .await
                .unwrap(),
        );
        let service = BitstreamStorageService::new(Arc::new(registry), metadata.clone(), 0)
            .with_cleanup_config(self.cleanup);

        TestEnv {
            temp_dir,
            stores,
            metadata,
            service,
        }
    }
}

#[allow(dead_code)]
impl TestEnv {
    pub async fn new() -> Self {
        EnvBuilder::new().build().await
    }

    /// On-disk location of an object in store `index`.
    pub fn object_path(&self, index: usize, internal_id: &str) -> PathBuf {
        self.stores[index].object_path(&ContentAddress::of(internal_id))
    }

    pub fn exists(&self, index: usize, internal_id: &str) -> bool {
        self.object_path(index, internal_id).is_file()
    }

    /// Push an object's modification time into the past.
    pub fn age(&self, index: usize, internal_id: &str, by: Duration) {
        let file = std::fs::File::options()
            .write(true)
            .open(self.object_path(index, internal_id))
            .unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    /// Write a file straight into a store, bypassing the service.
    pub fn place_file(&self, index: usize, relative: &str, data: &[u8]) -> PathBuf {
        let path = self.stores[index].root().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, data).unwrap();
        path
    }

    /// A service over the same stores and metadata with store `index`
    /// replaced by `store`.
    pub fn service_with(
        &self,
        index: usize,
        store: Arc<dyn BitStore>,
        sync: Option<SyncConfig>,
    ) -> BitstreamStorageService {
        let mut registry = StoreRegistry::new();
        for (i, backend) in self.stores.iter().enumerate() {
            let backend = if i == index {
                store.clone()
            } else {
                backend.clone() as Arc<dyn BitStore>
            };
            registry = registry.with_store(i as i32, backend);
        }
        if let Some(sync) = sync {
            registry = registry.with_sync(sync);
        }
        BitstreamStorageService::new(Arc::new(registry), self.metadata.clone(), 0)
    }

    pub async fn store_bytes(&self, data: &[u8]) -> BitstreamRow {
        self.service
            .store(base::once(Bytes::copy_from_slice(data)))
            .await
            .unwrap()
    }

    pub async fn read(&self, row: &BitstreamRow) -> Bytes {
        base::collect(self.service.retrieve(row).await.unwrap())
            .await
            .unwrap()
    }
}

#[allow(dead_code)]
pub const TWO_HOURS: Duration = Duration::from_secs(2 * 60 * 60);

#[allow(dead_code)]
pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[allow(dead_code)]
pub fn seeded_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

/// A stream that yields `prefix` and then fails.
#[allow(dead_code)]
pub fn failing_stream(prefix: &'static [u8]) -> ByteStream {
    Box::pin(futures::stream::iter(vec![
        Ok(Bytes::from_static(prefix)),
        Err(StorageError::Io(std::io::Error::other("client went away"))),
    ]))
}
