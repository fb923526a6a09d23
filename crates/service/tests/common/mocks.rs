use async_trait::async_trait;
use bitstore_metadata::{BitstreamRepo, MetadataStore};
use bitstore_storage::{
    AboutKey, BitStore, ByteStream, ContentInfo, FilesystemBackend, ObjectAbout, StorageResult,
};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Filesystem store that soft deletes a chosen row once a write into it
/// has finished, standing in for a user deleting content mid-copy.
#[allow(dead_code)]
pub struct DeletingBackend {
    inner: Arc<FilesystemBackend>,
    metadata: Arc<dyn MetadataStore>,
    target: Mutex<Option<Uuid>>,
}

#[allow(dead_code)]
impl DeletingBackend {
    pub fn new(inner: Arc<FilesystemBackend>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            inner,
            metadata,
            target: Mutex::new(None),
        }
    }

    /// Delete `bitstream_id` during the next write.
    pub fn delete_on_put(&self, bitstream_id: Uuid) {
        *self.target.lock().unwrap() = Some(bitstream_id);
    }
}

#[async_trait]
impl BitStore for DeletingBackend {
    async fn init(&self) -> StorageResult<()> {
        self.inner.init().await
    }

    fn is_initialized(&self) -> bool {
        self.inner.is_initialized()
    }

    async fn get(&self, internal_id: &str) -> StorageResult<ByteStream> {
        self.inner.get(internal_id).await
    }

    async fn put(&self, internal_id: &str, input: ByteStream) -> StorageResult<ContentInfo> {
        let info = self.inner.put(internal_id, input).await?;
        let target = self.target.lock().unwrap().take();
        if let Some(bitstream_id) = target {
            self.metadata.mark_deleted(bitstream_id).await.unwrap();
        }
        Ok(info)
    }

    async fn about(
        &self,
        internal_id: &str,
        keys: &[AboutKey],
    ) -> StorageResult<Option<ObjectAbout>> {
        self.inner.about(internal_id, keys).await
    }

    async fn remove(&self, internal_id: &str) -> StorageResult<()> {
        self.inner.remove(internal_id).await
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}
