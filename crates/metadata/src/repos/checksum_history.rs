//! Checksum history repository.

use crate::error::MetadataResult;
use crate::models::ChecksumHistoryRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for checksum verification results.
#[async_trait]
pub trait ChecksumHistoryRepo: Send + Sync {
    async fn add_check(&self, check: &ChecksumHistoryRow) -> MetadataResult<()>;

    /// Checks for one bitstream, oldest first.
    async fn list_checks(&self, bitstream_id: Uuid) -> MetadataResult<Vec<ChecksumHistoryRow>>;

    /// Delete all checks for one bitstream. Returns the number removed.
    async fn delete_checks(&self, bitstream_id: Uuid) -> MetadataResult<u64>;
}
