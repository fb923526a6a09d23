use async_trait::async_trait;
use bitstore_storage::base;
use bitstore_storage::error::{StorageError, StorageResult};
use bitstore_storage::traits::{AboutKey, BitStore, ByteStream, ContentInfo, ObjectAbout};
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use time::OffsetDateTime;

/// In-memory store that counts calls and can be told to fail.
#[allow(dead_code)]
#[derive(Default)]
pub struct InstrumentedBackend {
    objects: Mutex<HashMap<String, (Bytes, OffsetDateTime)>>,
    pub gets: AtomicUsize,
    pub puts: AtomicUsize,
    pub removes: AtomicUsize,
    initialized: AtomicBool,
    disabled: AtomicBool,
    /// Fail puts once this many bytes have been consumed.
    pub fail_after_bytes: Mutex<Option<u64>>,
}

#[allow(dead_code)]
impl InstrumentedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disabled() -> Self {
        let backend = Self::default();
        backend.disabled.store(true, Ordering::Release);
        backend
    }

    pub fn contains(&self, internal_id: &str) -> bool {
        self.objects
            .lock()
            .unwrap()
            .contains_key(internal_id)
    }

    pub fn insert(&self, internal_id: &str, data: Bytes) {
        self.objects
            .lock()
            .unwrap()
            .insert(internal_id.to_string(), (data, OffsetDateTime::now_utc()));
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BitStore for InstrumentedBackend {
    async fn init(&self) -> StorageResult<()> {
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn is_enabled(&self) -> bool {
        !self.disabled.load(Ordering::Acquire)
    }

    async fn get(&self, internal_id: &str) -> StorageResult<ByteStream> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.lock().unwrap();
        let (data, _) = objects
            .get(internal_id)
            .ok_or_else(|| StorageError::NotFound(internal_id.to_string()))?;
        Ok(base::once(data.clone()))
    }

    async fn put(&self, internal_id: &str, mut input: ByteStream) -> StorageResult<ContentInfo> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let limit = *self.fail_after_bytes.lock().unwrap();
        let mut buf = Vec::new();
        while let Some(chunk) = input.next().await {
            buf.extend_from_slice(&chunk?);
            if let Some(limit) = limit
                && buf.len() as u64 >= limit
            {
                return Err(StorageError::Io(std::io::Error::other("injected failure")));
            }
        }
        let data = Bytes::from(buf);
        let info = base::digest(base::once(data.clone())).await?;
        self.insert(internal_id, data);
        Ok(info)
    }

    async fn about(
        &self,
        internal_id: &str,
        keys: &[AboutKey],
    ) -> StorageResult<Option<ObjectAbout>> {
        let entry = self.objects.lock().unwrap().get(internal_id).cloned();
        let Some((data, modified)) = entry else {
            return Ok(None);
        };
        let checksum = if base::needs_checksum(keys) {
            Some(base::digest(base::once(data.clone())).await?.checksum)
        } else {
            None
        };
        Ok(Some(base::select(
            keys,
            data.len() as u64,
            Some(modified),
            checksum,
        )))
    }

    async fn remove(&self, internal_id: &str) -> StorageResult<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.objects.lock().unwrap().remove(internal_id);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "instrumented"
    }
}
