//! Transactional unit of work for long-running sweeps.

use crate::error::MetadataResult;
use crate::models::BitstreamRow;
use async_trait::async_trait;
use uuid::Uuid;

/// A database transaction exposing the operations cleanup and migration
/// batch together.
///
/// Dropping a unit of work without committing rolls it back. Callers must
/// not issue pool queries on the same store while a unit of work is open:
/// the SQLite store runs on a single connection.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Re-read a row inside the transaction.
    async fn get_bitstream(&mut self, bitstream_id: Uuid) -> MetadataResult<Option<BitstreamRow>>;

    async fn update_bitstream(&mut self, row: &BitstreamRow) -> MetadataResult<()>;

    /// Hard delete a row and its checksum history.
    async fn expunge_bitstream(&mut self, bitstream_id: Uuid) -> MetadataResult<()>;

    /// Live rows other than `exclude` sharing `internal_id`.
    async fn count_live_duplicates(&mut self, internal_id: &str, exclude: Uuid)
    -> MetadataResult<u64>;

    async fn commit(self: Box<Self>) -> MetadataResult<()>;

    async fn rollback(self: Box<Self>) -> MetadataResult<()>;
}
