//! Store trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bitstore_core::{Checksum, ChecksumAlgorithm};
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use time::OffsetDateTime;

/// A boxed stream of bytes for streaming reads and writes.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Attributes that [`BitStore::about`] can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AboutKey {
    Size,
    Checksum,
    ChecksumAlgorithm,
    Modified,
}

impl AboutKey {
    pub const ALL: [AboutKey; 4] = [
        AboutKey::Size,
        AboutKey::Checksum,
        AboutKey::ChecksumAlgorithm,
        AboutKey::Modified,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Size => "size_bytes",
            Self::Checksum => "checksum",
            Self::ChecksumAlgorithm => "checksum_algorithm",
            Self::Modified => "modified",
        }
    }
}

/// Requested subset of an object's attributes.
///
/// Fields not asked for are `None` even when the backend knows them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectAbout {
    pub size_bytes: Option<u64>,
    pub checksum: Option<String>,
    pub checksum_algorithm: Option<ChecksumAlgorithm>,
    pub modified: Option<OffsetDateTime>,
}

/// What a successful [`BitStore::put`] wrote.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentInfo {
    pub size_bytes: u64,
    pub checksum: Checksum,
}

/// Uniform contract every bitstream backend implements.
///
/// Objects are addressed by internal id; each backend maps the id to its own
/// key space through [`bitstore_core::ContentAddress`]. Ids are write-once,
/// so concurrent callers never target the same object.
#[async_trait]
pub trait BitStore: Send + Sync + 'static {
    /// Prepare the backend for use.
    ///
    /// Idempotent. Backends that cannot reach their provider either fail
    /// (local stores) or log and disable themselves (remote stores).
    async fn init(&self) -> StorageResult<()>;

    /// Whether `init` has completed successfully.
    fn is_initialized(&self) -> bool;

    /// Whether the backend accepts operations.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Produce a fresh internal id for new content.
    fn generate_id(&self) -> String {
        bitstore_core::generate_id()
    }

    /// Open the stored content for reading.
    ///
    /// Fails with `NotFound` if the object is absent.
    async fn get(&self, internal_id: &str) -> StorageResult<ByteStream>;

    /// Consume `input` into the object, hashing while streaming.
    ///
    /// On failure nothing is reported, so callers never mark a record live
    /// with partial content.
    async fn put(&self, internal_id: &str, input: ByteStream) -> StorageResult<ContentInfo>;

    /// Report the requested attributes, or `None` if the object is absent.
    ///
    /// Asking for the checksum reads the whole object.
    async fn about(
        &self,
        internal_id: &str,
        keys: &[AboutKey],
    ) -> StorageResult<Option<ObjectAbout>>;

    /// Delete the object. Removing an absent object succeeds.
    async fn remove(&self, internal_id: &str) -> StorageResult<()>;

    /// Static backend identifier used in logs ("filesystem", "s3", ...).
    fn backend_name(&self) -> &'static str;
}
