//! Helpers shared by every backend: key resolution, about-attribute
//! filtering and streaming digests.

use crate::error::{StorageError, StorageResult};
use crate::traits::{AboutKey, ByteStream, ContentInfo, ObjectAbout};
use bitstore_core::{Checksum, ChecksumAlgorithm, ChecksumHasher, ContentAddress};
use bytes::Bytes;
use futures::StreamExt;
use std::path::{Component, Path};
use time::OffsetDateTime;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

/// Default chunk size for streaming reads (64 KiB).
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Algorithm every backend digests with.
pub const CHECKSUM_ALGORITHM: ChecksumAlgorithm = ChecksumAlgorithm::Md5;

/// Resolve an internal id to its address, rejecting unusable ids.
///
/// Registered paths come from operators and must stay relative to the
/// store root.
pub fn resolve(internal_id: &str) -> StorageResult<ContentAddress> {
    let address = ContentAddress::of(internal_id);
    let key = address.to_key();
    if key.is_empty() {
        return Err(StorageError::InvalidKey(format!(
            "internal id '{internal_id}' addresses nothing"
        )));
    }
    if address.is_registered() && (key.starts_with('/') || key.starts_with('\\')) {
        return Err(StorageError::InvalidKey(format!(
            "registered path must be relative: {key}"
        )));
    }
    let safe = Path::new(&key)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !safe {
        return Err(StorageError::InvalidKey(format!(
            "path contains unsafe component: {key}"
        )));
    }
    Ok(address)
}

/// Join an optional prefix (subfolder) and a relative key.
pub fn prefixed_key(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}/{key}"),
        _ => key.to_string(),
    }
}

/// Normalize a configured prefix: drop surrounding slashes, empty becomes `None`.
pub fn normalize_prefix(prefix: Option<String>) -> Option<String> {
    prefix
        .map(|p| p.trim_matches('/').to_string())
        .filter(|p| !p.is_empty())
}

pub fn wants(keys: &[AboutKey], key: AboutKey) -> bool {
    keys.contains(&key)
}

/// Whether answering `keys` requires reading the full object.
pub fn needs_checksum(keys: &[AboutKey]) -> bool {
    wants(keys, AboutKey::Checksum)
}

/// Build an [`ObjectAbout`] holding only the requested attributes.
pub fn select(
    keys: &[AboutKey],
    size_bytes: u64,
    modified: Option<OffsetDateTime>,
    checksum: Option<Checksum>,
) -> ObjectAbout {
    let mut about = ObjectAbout::default();
    if wants(keys, AboutKey::Size) {
        about.size_bytes = Some(size_bytes);
    }
    if wants(keys, AboutKey::Modified) {
        about.modified = modified;
    }
    if wants(keys, AboutKey::ChecksumAlgorithm) {
        about.checksum_algorithm = Some(
            checksum
                .as_ref()
                .map(|c| c.algorithm)
                .unwrap_or(CHECKSUM_ALGORITHM),
        );
    }
    if wants(keys, AboutKey::Checksum) {
        about.checksum = checksum.map(|c| c.value);
    }
    about
}

/// Running size and digest of content passing through a backend.
#[derive(Debug)]
pub struct ContentDigest {
    hasher: ChecksumHasher,
    size_bytes: u64,
}

impl ContentDigest {
    pub fn new() -> Self {
        Self {
            hasher: CHECKSUM_ALGORITHM.hasher(),
            size_bytes: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.size_bytes += data.len() as u64;
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn finish(self) -> ContentInfo {
        ContentInfo {
            size_bytes: self.size_bytes,
            checksum: self.hasher.finalize(),
        }
    }
}

impl Default for ContentDigest {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain a stream, returning its size and checksum.
pub async fn digest(mut stream: ByteStream) -> StorageResult<ContentInfo> {
    let mut digest = ContentDigest::new();
    while let Some(chunk) = stream.next().await {
        digest.update(&chunk?);
    }
    Ok(digest.finish())
}

/// Wrap an async reader as a [`ByteStream`].
pub fn reader_stream<R>(reader: R) -> ByteStream
where
    R: AsyncRead + Send + 'static,
{
    Box::pin(
        ReaderStream::with_capacity(reader, STREAM_CHUNK_SIZE)
            .map(|result| result.map_err(StorageError::Io)),
    )
}

/// A single-chunk stream over in-memory content.
pub fn once(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// Drain a stream into memory. Intended for small objects and tests.
pub async fn collect(mut stream: ByteStream) -> StorageResult<Bytes> {
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(Bytes::from(buf))
}
