//! Cloud object stores (Azure Blob, Google Cloud Storage, URL-addressed
//! providers) through the `object_store` crate.

use crate::base::{self, ContentDigest};
use crate::error::{StorageError, StorageResult};
use crate::traits::{AboutKey, BitStore, ByteStream, ContentInfo, ObjectAbout};
use async_trait::async_trait;
use futures::StreamExt;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload, WriteMultipart};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use time::OffsetDateTime;
use tracing::instrument;

/// Upload parts kept in flight per object.
const MAX_CONCURRENT_PARTS: usize = 4;
const PROBE_KEY: &str = ".bitstore-probe";

fn map_error(err: object_store::Error, internal_id: &str) -> StorageError {
    match err {
        object_store::Error::NotFound { .. } => StorageError::NotFound(internal_id.to_string()),
        other => StorageError::transport(other),
    }
}

/// Parsed `Key=Value;...` Azure connection string.
#[derive(Debug, Default, PartialEq, Eq)]
struct AzureConnection {
    account: Option<String>,
    key: Option<String>,
    blob_endpoint: Option<String>,
    emulator: bool,
}

impl AzureConnection {
    fn parse(raw: &str) -> Self {
        let mut parsed = Self::default();
        for pair in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            match name.trim() {
                "AccountName" => parsed.account = Some(value.to_string()),
                "AccountKey" => parsed.key = Some(value.to_string()),
                "BlobEndpoint" => parsed.blob_endpoint = Some(value.to_string()),
                "UseDevelopmentStorage" => parsed.emulator = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }
        parsed
    }
}

/// Bitstream store over any [`ObjectStore`] implementation.
pub struct ObjectStoreBackend {
    name: &'static str,
    location: String,
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
    initialized: AtomicBool,
    enabled: AtomicBool,
}

impl std::fmt::Debug for ObjectStoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreBackend")
            .field("name", &self.name)
            .field("location", &self.location)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl ObjectStoreBackend {
    /// Wrap an already built store.
    pub fn new(
        name: &'static str,
        location: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        prefix: Option<String>,
    ) -> Self {
        Self {
            name,
            location: location.into(),
            store,
            prefix: base::normalize_prefix(prefix),
            initialized: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
        }
    }

    /// Azure Blob container, configured by account and key or by connection string.
    pub fn azure(
        account: Option<&str>,
        container: &str,
        access_key: Option<&str>,
        connection_string: Option<&str>,
        prefix: Option<String>,
        endpoint: Option<&str>,
    ) -> StorageResult<Self> {
        let connection = connection_string
            .map(AzureConnection::parse)
            .unwrap_or_default();

        let mut builder = MicrosoftAzureBuilder::new().with_container_name(container);
        if let Some(account) = account.map(str::to_string).or(connection.account) {
            builder = builder.with_account(account);
        }
        if let Some(key) = access_key.map(str::to_string).or(connection.key) {
            builder = builder.with_access_key(key);
        }
        if let Some(endpoint) = endpoint.map(str::to_string).or(connection.blob_endpoint) {
            builder = builder.with_endpoint(endpoint).with_allow_http(true);
        }
        if connection.emulator {
            builder = builder.with_use_emulator(true);
        }

        let store = builder
            .build()
            .map_err(|e| StorageError::Config(format!("azure store {container}: {e}")))?;
        Ok(Self::new(
            "azure",
            format!("az://{container}"),
            Arc::new(store),
            prefix,
        ))
    }

    /// GCS bucket. Ambient credentials are used unless a key file is given.
    pub fn gcs(
        bucket: &str,
        service_account_path: Option<&Path>,
        prefix: Option<String>,
    ) -> StorageResult<Self> {
        let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(bucket);
        if let Some(path) = service_account_path {
            builder = builder.with_service_account_path(path.to_string_lossy());
        }
        let store = builder
            .build()
            .map_err(|e| StorageError::Config(format!("gcs store {bucket}: {e}")))?;
        Ok(Self::new(
            "gcs",
            format!("gs://{bucket}"),
            Arc::new(store),
            prefix,
        ))
    }

    /// Any provider `object_store` can address by URL. The URL path becomes
    /// the key prefix.
    pub fn from_url(url: &str, options: &BTreeMap<String, String>) -> StorageResult<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|e| StorageError::Config(format!("invalid store url '{url}': {e}")))?;
        let (store, path) = object_store::parse_url_opts(&parsed, options.iter())
            .map_err(|e| StorageError::Config(format!("store url '{url}': {e}")))?;
        let prefix = Some(path.to_string());
        Ok(Self::new("generic", url, Arc::from(store), prefix))
    }

    fn object_path(&self, internal_id: &str) -> StorageResult<ObjectPath> {
        let address = base::resolve(internal_id)?;
        let key = base::prefixed_key(self.prefix.as_deref(), &address.to_key());
        ObjectPath::parse(&key).map_err(|e| StorageError::InvalidKey(e.to_string()))
    }

    fn ensure_usable(&self) -> StorageResult<()> {
        if !self.is_enabled() {
            return Err(StorageError::Disabled(self.location.clone()));
        }
        if !self.is_initialized() {
            return Err(StorageError::Config(format!(
                "{} store {} used before init",
                self.name, self.location
            )));
        }
        Ok(())
    }

    async fn upload(
        &self,
        path: &ObjectPath,
        mut input: ByteStream,
        writer: &mut Option<WriteMultipart>,
    ) -> StorageResult<ContentDigest> {
        let mut digest = ContentDigest::new();
        while let Some(chunk) = input.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            digest.update(&chunk);
            if writer.is_none() {
                let upload = self
                    .store
                    .put_multipart(path)
                    .await
                    .map_err(StorageError::transport)?;
                *writer = Some(WriteMultipart::new(upload));
            }
            if let Some(writer) = writer.as_mut() {
                writer
                    .wait_for_capacity(MAX_CONCURRENT_PARTS)
                    .await
                    .map_err(StorageError::transport)?;
                writer.write(&chunk);
            }
        }
        Ok(digest)
    }
}

#[async_trait]
impl BitStore for ObjectStoreBackend {
    #[instrument(skip(self), fields(backend = self.name, location = %self.location))]
    async fn init(&self) -> StorageResult<()> {
        if self.is_initialized() {
            return Ok(());
        }
        // Containers are provisioned out of band; a missing probe object
        // still proves the container answers.
        let probe = ObjectPath::from(base::prefixed_key(self.prefix.as_deref(), PROBE_KEY));
        match self.store.head(&probe).await {
            Ok(_) | Err(object_store::Error::NotFound { .. }) => {
                self.initialized.store(true, Ordering::Release);
                self.enabled.store(true, Ordering::Release);
                tracing::info!("object store ready");
            }
            Err(e) => {
                self.enabled.store(false, Ordering::Release);
                tracing::error!(error = %e, "object store failed to initialize, disabling it");
            }
        }
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    #[instrument(skip(self), fields(backend = self.name))]
    async fn get(&self, internal_id: &str) -> StorageResult<ByteStream> {
        self.ensure_usable()?;
        let path = self.object_path(internal_id)?;
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|e| map_error(e, internal_id))?;
        let id = internal_id.to_string();
        Ok(Box::pin(
            result
                .into_stream()
                .map(move |chunk| chunk.map_err(|e| map_error(e, &id))),
        ))
    }

    #[instrument(skip(self, input), fields(backend = self.name))]
    async fn put(&self, internal_id: &str, input: ByteStream) -> StorageResult<ContentInfo> {
        self.ensure_usable()?;
        let path = self.object_path(internal_id)?;

        let mut writer = None;
        let digest = match self.upload(&path, input, &mut writer).await {
            Ok(digest) => digest,
            Err(e) => {
                if let Some(writer) = writer
                    && let Err(abort_err) = writer.abort().await
                {
                    tracing::warn!(error = %abort_err, "failed to abort multipart upload");
                }
                return Err(e);
            }
        };

        match writer {
            Some(writer) => {
                writer.finish().await.map_err(StorageError::transport)?;
            }
            // Nothing was written; multipart uploads cannot be empty.
            None => {
                self.store
                    .put(&path, PutPayload::default())
                    .await
                    .map_err(StorageError::transport)?;
            }
        }

        let info = digest.finish();
        tracing::debug!(size = info.size_bytes, "stored object");
        Ok(info)
    }

    #[instrument(skip(self), fields(backend = self.name))]
    async fn about(
        &self,
        internal_id: &str,
        keys: &[AboutKey],
    ) -> StorageResult<Option<ObjectAbout>> {
        self.ensure_usable()?;
        let path = self.object_path(internal_id)?;
        let meta = match self.store.head(&path).await {
            Ok(meta) => meta,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(StorageError::transport(e)),
        };

        let modified = OffsetDateTime::from_unix_timestamp(meta.last_modified.timestamp()).ok();
        let checksum = if base::needs_checksum(keys) {
            match self.get(internal_id).await {
                Ok(stream) => Some(base::digest(stream).await?.checksum),
                Err(StorageError::NotFound(_)) => return Ok(None),
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        Ok(Some(base::select(keys, meta.size as u64, modified, checksum)))
    }

    #[instrument(skip(self), fields(backend = self.name))]
    async fn remove(&self, internal_id: &str) -> StorageResult<()> {
        self.ensure_usable()?;
        let path = self.object_path(internal_id)?;
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(StorageError::transport(e)),
        }
    }

    fn backend_name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    async fn memory_backend(prefix: Option<&str>) -> (ObjectStoreBackend, Arc<InMemory>) {
        let memory = Arc::new(InMemory::new());
        let backend = ObjectStoreBackend::new(
            "memory",
            "memory://test",
            memory.clone(),
            prefix.map(str::to_string),
        );
        backend.init().await.unwrap();
        (backend, memory)
    }

    #[test]
    fn test_parse_azure_connection_string() {
        let parsed = AzureConnection::parse(
            "DefaultEndpointsProtocol=https;AccountName=acct;AccountKey=a2V5==;BlobEndpoint=http://127.0.0.1:10000/acct;",
        );
        assert_eq!(parsed.account.as_deref(), Some("acct"));
        assert_eq!(parsed.key.as_deref(), Some("a2V5=="));
        assert_eq!(
            parsed.blob_endpoint.as_deref(),
            Some("http://127.0.0.1:10000/acct")
        );
        assert!(!parsed.emulator);

        assert!(AzureConnection::parse("UseDevelopmentStorage=true").emulator);
    }

    #[tokio::test]
    async fn test_put_places_object_under_prefix() {
        let (backend, memory) = memory_backend(Some("assets")).await;
        let info = backend
            .put("1234567890", base::once("hello world"))
            .await
            .unwrap();
        assert_eq!(info.size_bytes, 11);
        assert_eq!(info.checksum.value, "5eb63bbbe01eeed093cb22bb8f5acdc3");

        let raw = memory
            .head(&ObjectPath::from("assets/12/34/56/7890"))
            .await
            .unwrap();
        assert_eq!(raw.size, 11);
    }

    #[tokio::test]
    async fn test_empty_put_creates_empty_object() {
        let (backend, _) = memory_backend(None).await;
        let info = backend
            .put("1234567890", Box::pin(futures::stream::empty()))
            .await
            .unwrap();
        assert_eq!(info.size_bytes, 0);

        let about = backend
            .about("1234567890", &[AboutKey::Size])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(about.size_bytes, Some(0));
    }

    #[tokio::test]
    async fn test_missing_object_semantics() {
        let (backend, _) = memory_backend(None).await;
        assert!(backend.about("99887766", &AboutKey::ALL).await.unwrap().is_none());
        assert!(backend.get("99887766").await.err().expect("get should fail").is_not_found());
        backend.remove("99887766").await.unwrap();
    }

    #[tokio::test]
    async fn test_about_reports_requested_keys() {
        let (backend, _) = memory_backend(None).await;
        backend.put("1234567890", base::once("abc")).await.unwrap();

        let about = backend
            .about("1234567890", &AboutKey::ALL)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(about.size_bytes, Some(3));
        assert_eq!(
            about.checksum.as_deref(),
            Some("900150983cd24fb0d6963f7d28e17f72")
        );
        assert!(about.modified.is_some());

        let about = backend
            .about("1234567890", &[AboutKey::Modified])
            .await
            .unwrap()
            .unwrap();
        assert!(about.size_bytes.is_none());
        assert!(about.checksum.is_none());
    }

    #[tokio::test]
    async fn test_use_before_init_is_rejected() {
        let backend =
            ObjectStoreBackend::new("memory", "memory://", Arc::new(InMemory::new()), None);
        assert!(matches!(
            backend.get("1234567890").await.err().expect("get should fail"),
            StorageError::Config(_)
        ));
    }

    #[test]
    fn test_from_url_uses_path_as_prefix() {
        let backend = ObjectStoreBackend::from_url("memory:///bitstreams", &BTreeMap::new())
            .unwrap();
        assert_eq!(backend.prefix.as_deref(), Some("bitstreams"));
    }
}
