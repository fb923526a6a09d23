//! Bitstream storage service: ingest, registration, reads and verification.

use crate::error::{ServiceError, ServiceResult};
use bitstore_core::config::{CleanupConfig, MigrationConfig};
use bitstore_core::{Checksum, registered_id, sanitize};
use bitstore_metadata::{
    BitstreamRepo, BitstreamRow, CheckResult, ChecksumHistoryRepo, ChecksumHistoryRow,
    MetadataStore,
};
use bitstore_storage::{AboutKey, ByteStream, ObjectAbout, StoreRegistry};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Coordinates metadata rows with the bytes held by configured stores.
///
/// Every write follows the same order: the row is persisted as deleted,
/// the bytes are written, and only then is the row flipped live with its
/// measured size and checksum.
#[derive(Clone)]
pub struct BitstreamStorageService {
    stores: Arc<StoreRegistry>,
    metadata: Arc<dyn MetadataStore>,
    incoming: i32,
    pub(crate) cleanup: CleanupConfig,
    pub(crate) migration: MigrationConfig,
}

impl std::fmt::Debug for BitstreamStorageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitstreamStorageService")
            .field("stores", &self.stores)
            .field("incoming", &self.incoming)
            .field("cleanup", &self.cleanup)
            .field("migration", &self.migration)
            .finish_non_exhaustive()
    }
}

impl BitstreamStorageService {
    pub fn new(stores: Arc<StoreRegistry>, metadata: Arc<dyn MetadataStore>, incoming: i32) -> Self {
        Self {
            stores,
            metadata,
            incoming,
            cleanup: CleanupConfig::default(),
            migration: MigrationConfig::default(),
        }
    }

    pub fn with_cleanup_config(mut self, cleanup: CleanupConfig) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn with_migration_config(mut self, migration: MigrationConfig) -> Self {
        self.migration = migration;
        self
    }

    pub fn stores(&self) -> &StoreRegistry {
        &self.stores
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    /// Store index new content is written to.
    pub fn incoming(&self) -> i32 {
        self.incoming
    }

    pub fn migration_config(&self) -> &MigrationConfig {
        &self.migration
    }

    /// Ingest new content into the incoming store.
    ///
    /// If the write fails the row stays deleted and a later cleanup sweep
    /// reclaims whatever partial bytes exist.
    #[instrument(skip(self, input), fields(store_number = self.incoming))]
    pub async fn store(&self, input: ByteStream) -> ServiceResult<BitstreamRow> {
        let store = self.stores.store(self.incoming)?;
        let mut row = BitstreamRow::pending(store.generate_id(), self.incoming);
        self.metadata.create_bitstream(&row).await?;

        let info = match store.put(&row.internal_id, input).await {
            Ok(info) => info,
            Err(e) => {
                warn!(
                    bitstream_id = %row.bitstream_id,
                    internal_id = %row.internal_id,
                    error = %e,
                    "write failed, record left deleted"
                );
                return Err(e.into());
            }
        };

        row.record_content(info.size_bytes, &info.checksum);
        row.deleted = false;
        self.metadata.update_bitstream(&row).await?;

        debug!(
            bitstream_id = %row.bitstream_id,
            internal_id = %row.internal_id,
            size_bytes = info.size_bytes,
            "stored bitstream"
        );
        Ok(row)
    }

    /// Adopt a file that already exists in a store without copying it.
    ///
    /// `path` is relative to the store root. The row is written first and
    /// flipped live only once the store confirms the file.
    #[instrument(skip(self))]
    pub async fn register(&self, store_number: i32, path: &str) -> ServiceResult<BitstreamRow> {
        let path = path.trim_start_matches('/');
        if path.is_empty() || sanitize(path).is_empty() {
            return Err(ServiceError::InvalidOperation(
                "registration requires a file path".to_string(),
            ));
        }

        let store = self.stores.store(store_number)?;
        let internal_id = registered_id(path);
        // A row whose key every store rejects could never be swept.
        bitstore_storage::base::resolve(&internal_id)?;
        let mut row = BitstreamRow::pending(internal_id, store_number);
        self.metadata.create_bitstream(&row).await?;

        let about = store
            .about(
                &row.internal_id,
                &[AboutKey::Size, AboutKey::Checksum, AboutKey::ChecksumAlgorithm],
            )
            .await?;
        let Some(ObjectAbout {
            size_bytes: Some(size_bytes),
            checksum: Some(value),
            checksum_algorithm: Some(algorithm),
            ..
        }) = about
        else {
            return Err(ServiceError::RegistrationFailed {
                store_number,
                path: path.to_string(),
            });
        };

        row.record_content(size_bytes, &Checksum { algorithm, value });
        row.deleted = false;
        self.metadata.update_bitstream(&row).await?;

        info!(
            bitstream_id = %row.bitstream_id,
            internal_id = %row.internal_id,
            size_bytes,
            "registered bitstream"
        );
        Ok(row)
    }

    /// Open the bytes behind a row.
    pub async fn retrieve(&self, row: &BitstreamRow) -> ServiceResult<ByteStream> {
        let store = self.stores.reader(row.store_number)?;
        Ok(store.get(&row.internal_id).await?)
    }

    /// Live row by id.
    pub async fn find_live(&self, bitstream_id: Uuid) -> ServiceResult<BitstreamRow> {
        self.metadata
            .get_live_bitstream(bitstream_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(bitstream_id.to_string()))
    }

    /// Open the bytes of a live row. Deleted rows are treated as absent.
    pub async fn retrieve_by_id(&self, bitstream_id: Uuid) -> ServiceResult<ByteStream> {
        let row = self.find_live(bitstream_id).await?;
        self.retrieve(&row).await
    }

    /// Ask the holding store about a row's object.
    pub async fn about(
        &self,
        row: &BitstreamRow,
        keys: &[AboutKey],
    ) -> ServiceResult<Option<ObjectAbout>> {
        let store = self.stores.reader(row.store_number)?;
        Ok(store.about(&row.internal_id, keys).await?)
    }

    /// Soft delete a row. Bytes stay until a cleanup sweep reclaims them.
    pub async fn delete(&self, bitstream_id: Uuid) -> ServiceResult<()> {
        self.metadata.mark_deleted(bitstream_id).await?;
        Ok(())
    }

    /// Recompute a row's checksum from the stored bytes and record the outcome.
    #[instrument(skip(self, row), fields(bitstream_id = %row.bitstream_id))]
    pub async fn verify(&self, row: &BitstreamRow) -> ServiceResult<ChecksumHistoryRow> {
        let about = self.about(row, &[AboutKey::Checksum]).await?;
        let computed = about.and_then(|about| about.checksum);

        let result = match (&row.checksum, &computed) {
            (_, None) => CheckResult::Missing,
            (Some(expected), Some(computed)) if expected.eq_ignore_ascii_case(computed) => {
                CheckResult::Match
            }
            _ => CheckResult::Mismatch,
        };
        if result != CheckResult::Match {
            warn!(internal_id = %row.internal_id, %result, "checksum verification failed");
        }

        let check = ChecksumHistoryRow::new(row.bitstream_id, row.checksum.clone(), computed, result);
        self.metadata.add_check(&check).await?;
        Ok(check)
    }

    /// A second live row sharing the source's bytes.
    ///
    /// Cleanup leaves shared bytes in place while any live row still
    /// references them.
    pub async fn clone_bitstream(&self, source: &BitstreamRow) -> ServiceResult<BitstreamRow> {
        if source.deleted {
            return Err(ServiceError::InvalidOperation(format!(
                "cannot clone deleted bitstream {}",
                source.bitstream_id
            )));
        }

        let mut row = BitstreamRow::pending(source.internal_id.clone(), source.store_number);
        row.size_bytes = source.size_bytes;
        row.checksum = source.checksum.clone();
        row.checksum_algorithm = source.checksum_algorithm.clone();
        row.deleted = false;
        self.metadata.create_bitstream(&row).await?;

        debug!(
            source = %source.bitstream_id,
            clone = %row.bitstream_id,
            internal_id = %row.internal_id,
            "cloned bitstream"
        );
        Ok(row)
    }
}
