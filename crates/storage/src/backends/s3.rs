//! S3-compatible storage backend using AWS SDK.

use crate::base::{self, ContentDigest};
use crate::error::{StorageError, StorageResult};
use crate::traits::{AboutKey, BitStore, ByteStream, ContentInfo, ObjectAbout};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
};
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::OnceCell;
use tracing::instrument;

const DEFAULT_REGION: &str = "us-east-1";
const INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings for an S3 store.
#[derive(Clone, Default)]
pub struct S3Options {
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub prefix: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
    pub part_size_bytes: u64,
}

impl std::fmt::Debug for S3Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Options")
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("prefix", &self.prefix)
            .field("force_path_style", &self.force_path_style)
            .field("part_size_bytes", &self.part_size_bytes)
            .finish_non_exhaustive()
    }
}

/// Handle 404 from any S3 operation.
fn is_not_found<E>(err: &SdkError<E>) -> bool {
    matches!(err, SdkError::ServiceError(service_err) if service_err.raw().status().as_u16() == 404)
}

fn map_sdk_error<E>(err: SdkError<E>, internal_id: &str) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    if is_not_found(&err) {
        return StorageError::NotFound(internal_id.to_string());
    }
    StorageError::transport(err)
}

/// S3-compatible bitstream store.
///
/// The client is built during `init`, where the ambient credential chain is
/// resolved when no explicit keys are configured. A store that fails to
/// initialize disables itself instead of aborting startup.
pub struct S3Backend {
    options: S3Options,
    region: String,
    part_size: usize,
    client: OnceCell<Client>,
    enabled: AtomicBool,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("options", &self.options)
            .field("initialized", &self.is_initialized())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl S3Backend {
    /// Create a new S3 backend. No network access happens until `init`.
    pub fn new(mut options: S3Options) -> StorageResult<Self> {
        if options.access_key_id.is_some() != options.secret_access_key.is_some() {
            return Err(StorageError::Config(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ));
        }
        if options.bucket.trim().is_empty() {
            return Err(StorageError::Config("s3 store requires a bucket".to_string()));
        }
        let part_size = usize::try_from(options.part_size_bytes)
            .ok()
            .filter(|size| *size as u64 >= bitstore_core::config::MIN_S3_PART_SIZE)
            .ok_or_else(|| {
                StorageError::Config(format!(
                    "s3 part size {} must be at least {} bytes",
                    options.part_size_bytes,
                    bitstore_core::config::MIN_S3_PART_SIZE
                ))
            })?;

        // Bare host:port endpoints (e.g. "minio:9000") default to plain HTTP.
        options.endpoint = options.endpoint.take().map(|endpoint| {
            let lower = endpoint.to_ascii_lowercase();
            if lower.starts_with("http://") || lower.starts_with("https://") {
                endpoint
            } else {
                format!("http://{endpoint}")
            }
        });
        options.prefix = base::normalize_prefix(options.prefix.take());

        Ok(Self {
            region: options
                .region
                .clone()
                .unwrap_or_else(|| DEFAULT_REGION.to_string()),
            options,
            part_size,
            client: OnceCell::new(),
            enabled: AtomicBool::new(true),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.options.bucket
    }

    /// Full object key for an internal id (applies prefix if configured).
    fn object_key(&self, internal_id: &str) -> StorageResult<String> {
        let address = base::resolve(internal_id)?;
        Ok(base::prefixed_key(
            self.options.prefix.as_deref(),
            &address.to_key(),
        ))
    }

    fn client(&self) -> StorageResult<&Client> {
        if !self.is_enabled() {
            return Err(StorageError::Disabled(format!("s3://{}", self.bucket())));
        }
        self.client.get().ok_or_else(|| {
            StorageError::Config(format!("s3 store {} used before init", self.bucket()))
        })
    }

    async fn build_client(&self) -> Client {
        let region = aws_config::Region::new(self.region.clone());
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(region.clone());

        if let (Some(key_id), Some(secret)) = (
            self.options.access_key_id.clone(),
            self.options.secret_access_key.clone(),
        ) {
            builder = builder.credentials_provider(aws_sdk_s3::config::Credentials::new(
                key_id,
                secret,
                None,
                None,
                "bitstore-config",
            ));
        } else {
            let chain = aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                .region(region)
                .build()
                .await;
            builder = builder.credentials_provider(chain);
        }

        if let Some(endpoint) = &self.options.endpoint {
            builder = builder.endpoint_url(endpoint);
            // Plain HTTP endpoints (local MinIO) do not need native trust roots.
            if endpoint.to_ascii_lowercase().starts_with("http://") {
                builder = builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }
        }

        if self.options.force_path_style {
            builder = builder.force_path_style(true);
        }

        Client::from_conf(builder.build())
    }

    /// Make sure the bucket exists, creating it when the provider says it does not.
    async fn ensure_bucket(&self, client: &Client) -> StorageResult<()> {
        let bucket = self.bucket();
        match client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => {
                tracing::info!(bucket, "bucket missing, creating it");
                let mut request = client.create_bucket().bucket(bucket);
                if self.region != DEFAULT_REGION {
                    request = request.create_bucket_configuration(
                        CreateBucketConfiguration::builder()
                            .location_constraint(BucketLocationConstraint::from(
                                self.region.as_str(),
                            ))
                            .build(),
                    );
                }
                request.send().await.map_err(StorageError::transport)?;
                Ok(())
            }
            Err(err) => Err(StorageError::transport(err)),
        }
    }

    /// Stream `input` into the object, switching to multipart once a full
    /// part has accumulated.
    async fn upload(
        &self,
        client: &Client,
        key: &str,
        mut input: ByteStream,
        multipart: &mut Option<Multipart>,
    ) -> StorageResult<ContentInfo> {
        let mut digest = ContentDigest::new();
        let mut buffer = BytesMut::with_capacity(self.part_size);

        while let Some(chunk) = input.next().await {
            let chunk = chunk?;
            digest.update(&chunk);
            buffer.extend_from_slice(&chunk);

            while buffer.len() >= self.part_size {
                let part = buffer.split_to(self.part_size).freeze();
                if multipart.is_none() {
                    *multipart = Some(Multipart::start(client, self.bucket(), key).await?);
                }
                if let Some(upload) = multipart.as_mut() {
                    upload.send_part(client, self.bucket(), key, part).await?;
                }
            }
        }

        match multipart.as_mut() {
            // Small objects (including empty ones) go up in a single request.
            None => {
                client
                    .put_object()
                    .bucket(self.bucket())
                    .key(key)
                    .body(buffer.freeze().into())
                    .send()
                    .await
                    .map_err(StorageError::transport)?;
            }
            Some(upload) => {
                if !buffer.is_empty() {
                    upload
                        .send_part(client, self.bucket(), key, buffer.freeze())
                        .await?;
                }
                upload.complete(client, self.bucket(), key).await?;
            }
        }

        Ok(digest.finish())
    }
}

/// An in-flight multipart upload.
struct Multipart {
    upload_id: String,
    parts: Vec<CompletedPart>,
}

impl Multipart {
    async fn start(client: &Client, bucket: &str, key: &str) -> StorageResult<Self> {
        let output = client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(StorageError::transport)?;
        let upload_id = output
            .upload_id()
            .ok_or_else(|| StorageError::Config("S3 did not return upload_id".to_string()))?
            .to_string();
        Ok(Self {
            upload_id,
            parts: Vec::new(),
        })
    }

    async fn send_part(
        &mut self,
        client: &Client,
        bucket: &str,
        key: &str,
        data: Bytes,
    ) -> StorageResult<()> {
        let part_number = i32::try_from(self.parts.len() + 1)
            .map_err(|_| StorageError::Config("too many multipart parts".to_string()))?;
        let output = client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(&self.upload_id)
            .part_number(part_number)
            .body(data.into())
            .send()
            .await
            .map_err(StorageError::transport)?;

        self.parts.push(
            CompletedPart::builder()
                .e_tag(output.e_tag().unwrap_or_default())
                .part_number(part_number)
                .build(),
        );
        Ok(())
    }

    async fn complete(&mut self, client: &Client, bucket: &str, key: &str) -> StorageResult<()> {
        client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&self.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(std::mem::take(&mut self.parts)))
                    .build(),
            )
            .send()
            .await
            .map_err(StorageError::transport)?;
        Ok(())
    }

    /// Best effort; orphaned parts are reclaimed by bucket lifecycle rules.
    async fn abort(self, client: &Client, bucket: &str, key: &str) {
        if let Err(e) = client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&self.upload_id)
            .send()
            .await
        {
            tracing::warn!(
                key,
                upload_id = %self.upload_id,
                error = %e,
                "failed to abort multipart upload, orphaned parts may remain"
            );
        }
    }
}

#[async_trait]
impl BitStore for S3Backend {
    #[instrument(skip(self), fields(backend = "s3", bucket = %self.options.bucket))]
    async fn init(&self) -> StorageResult<()> {
        if self.is_initialized() {
            return Ok(());
        }

        let client = self.build_client().await;
        let outcome = tokio::time::timeout(INIT_TIMEOUT, self.ensure_bucket(&client))
            .await
            .unwrap_or_else(|_| {
                Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "S3 bucket check timed out",
                )))
            });

        match outcome {
            Ok(()) => {
                let _ = self.client.set(client);
                self.enabled.store(true, Ordering::Release);
                tracing::info!("s3 store ready");
            }
            Err(e) => {
                self.enabled.store(false, Ordering::Release);
                tracing::error!(error = %e, "s3 store failed to initialize, disabling it");
            }
        }
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.client.initialized()
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get(&self, internal_id: &str) -> StorageResult<ByteStream> {
        let client = self.client()?;
        let output = client
            .get_object()
            .bucket(self.bucket())
            .key(self.object_key(internal_id)?)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, internal_id))?;
        Ok(base::reader_stream(output.body.into_async_read()))
    }

    #[instrument(skip(self, input), fields(backend = "s3"))]
    async fn put(&self, internal_id: &str, input: ByteStream) -> StorageResult<ContentInfo> {
        let client = self.client()?;
        let key = self.object_key(internal_id)?;

        let mut multipart = None;
        let result = self.upload(client, &key, input, &mut multipart).await;
        if result.is_err()
            && let Some(upload) = multipart
        {
            upload.abort(client, self.bucket(), &key).await;
        }

        let info = result?;
        tracing::debug!(size = info.size_bytes, "stored object");
        Ok(info)
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn about(
        &self,
        internal_id: &str,
        keys: &[AboutKey],
    ) -> StorageResult<Option<ObjectAbout>> {
        let client = self.client()?;
        let output = match client
            .head_object()
            .bucket(self.bucket())
            .key(self.object_key(internal_id)?)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(StorageError::transport(err)),
        };

        let modified = output.last_modified().and_then(|dt| {
            OffsetDateTime::from_unix_timestamp(dt.secs())
                .inspect_err(|e| {
                    tracing::warn!(
                        timestamp = dt.secs(),
                        error = %e,
                        "unreadable S3 timestamp, object will be treated as recent"
                    );
                })
                .ok()
        });
        let size = u64::try_from(output.content_length().unwrap_or(0)).unwrap_or(0);

        // ETags of multipart objects are not content digests; read the bytes.
        let checksum = if base::needs_checksum(keys) {
            match self.get(internal_id).await {
                Ok(stream) => Some(base::digest(stream).await?.checksum),
                Err(StorageError::NotFound(_)) => return Ok(None),
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        Ok(Some(base::select(keys, size, modified, checksum)))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn remove(&self, internal_id: &str) -> StorageResult<()> {
        let client = self.client()?;
        // delete_object succeeds for missing keys.
        client
            .delete_object()
            .bucket(self.bucket())
            .key(self.object_key(internal_id)?)
            .send()
            .await
            .map_err(StorageError::transport)?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}
