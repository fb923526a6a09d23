//! Bitstream repository.

use crate::error::MetadataResult;
use crate::models::BitstreamRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for bitstream rows.
#[async_trait]
pub trait BitstreamRepo: Send + Sync {
    /// Insert a new row. Fails with `AlreadyExists` on a duplicate id.
    async fn create_bitstream(&self, row: &BitstreamRow) -> MetadataResult<()>;

    /// Overwrite every mutable column of an existing row.
    async fn update_bitstream(&self, row: &BitstreamRow) -> MetadataResult<()>;

    /// Get a row regardless of its deleted flag.
    async fn get_bitstream(&self, bitstream_id: Uuid) -> MetadataResult<Option<BitstreamRow>>;

    /// Get a row only if it is live.
    async fn get_live_bitstream(&self, bitstream_id: Uuid)
    -> MetadataResult<Option<BitstreamRow>>;

    /// Soft delete: flag the row deleted without touching its content.
    async fn mark_deleted(&self, bitstream_id: Uuid) -> MetadataResult<()>;

    /// Deleted rows in a stable order, for cleanup sweeps.
    async fn find_deleted_bitstreams(
        &self,
        limit: u32,
        offset: u64,
    ) -> MetadataResult<Vec<BitstreamRow>>;

    /// Live rows other than `exclude` sharing `internal_id`.
    async fn find_duplicate_internal_ids(
        &self,
        internal_id: &str,
        exclude: Uuid,
    ) -> MetadataResult<Vec<BitstreamRow>>;

    /// Live rows held by a store number, in a stable order.
    async fn find_bitstreams_by_store(
        &self,
        store_number: i32,
        limit: u32,
        offset: u64,
    ) -> MetadataResult<Vec<BitstreamRow>>;

    /// Number of live rows held by a store number.
    async fn count_bitstreams_by_store(&self, store_number: i32) -> MetadataResult<u64>;

    /// Hard delete a row and its checksum history.
    async fn expunge_bitstream(&self, bitstream_id: Uuid) -> MetadataResult<()>;
}
