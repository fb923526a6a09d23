//! Moving live bitstreams between stores.

use crate::error::{ServiceError, ServiceResult};
use crate::service::BitstreamStorageService;
use bitstore_metadata::{BitstreamRepo, BitstreamRow, UnitOfWork};
use bitstore_storage::ContentInfo;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Counters reported by a migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationStats {
    /// Live rows examined in the source store.
    pub items_processed: u64,
    /// Rows repointed at the destination.
    pub items_migrated: u64,
    /// Bytes copied into the destination.
    pub bytes_copied: u64,
    /// Source copies removed after commit.
    pub sources_removed: u64,
    /// Registered files, which stay where they were registered.
    pub skipped_registered: u64,
    /// Per-record failures logged in best-effort mode.
    pub errors: u64,
}

/// A row repointed at a new store number, not yet committed.
pub(crate) struct Moved {
    /// The row as it should read after the move.
    pub(crate) row: BitstreamRow,
    /// Store number the row named when it was copied.
    pub(crate) from: i32,
    /// Whether bytes were written for this move.
    pub(crate) copied: bool,
    /// Stores that still hold the previous copy.
    pub(crate) stale_holders: Vec<i32>,
}

/// Compare a copy against the checksum recorded on its row.
pub(crate) fn check_copy(row: &BitstreamRow, info: &ContentInfo) -> ServiceResult<()> {
    match &row.checksum {
        Some(expected) if !expected.eq_ignore_ascii_case(&info.checksum.value) => {
            Err(ServiceError::ChecksumMismatch {
                internal_id: row.internal_id.clone(),
                expected: expected.clone(),
                computed: info.checksum.value.clone(),
            })
        }
        _ => Ok(()),
    }
}

impl BitstreamStorageService {
    /// Copy every live row of `source` into `destination` and repoint it.
    ///
    /// Rows are committed in batches of `batch_size`. Source copies are only
    /// removed (with `delete_old`) after the batch that repointed them has
    /// committed, so a row always names a store holding its bytes. A row
    /// deleted or moved while its bytes are being copied keeps its current
    /// state and the new copy is dropped.
    pub async fn migrate(
        &self,
        source: i32,
        destination: i32,
        delete_old: bool,
        batch_size: u32,
        verbose: bool,
    ) -> ServiceResult<MigrationStats> {
        if source == destination {
            return Err(ServiceError::InvalidOperation(format!(
                "source and destination are both store {source}"
            )));
        }
        // Fail before touching any row if either end is unusable.
        self.stores().store(destination)?;
        self.stores().placement(source)?;

        let batch_size = batch_size.max(1);
        let mut stats = MigrationStats::default();
        // Rows left behind in the source shift the next batch down.
        let mut left_behind: u64 = 0;

        info!(source, destination, delete_old, "starting migration");

        loop {
            let batch = self
                .metadata()
                .find_bitstreams_by_store(source, batch_size, left_behind)
                .await?;
            if batch.is_empty() {
                break;
            }
            let batch_len = batch.len();

            let mut moved = Vec::with_capacity(batch_len);
            for row in batch {
                stats.items_processed += 1;
                if row.is_registered() {
                    stats.skipped_registered += 1;
                    left_behind += 1;
                    continue;
                }

                match self.copy_row(&row, destination).await {
                    Ok((entry, copied)) => {
                        stats.bytes_copied += copied;
                        moved.push(entry);
                    }
                    Err(e) if verbose && e.is_per_record() => {
                        warn!(
                            bitstream_id = %row.bitstream_id,
                            internal_id = %row.internal_id,
                            error = %e,
                            "migration failed for record, continuing"
                        );
                        stats.errors += 1;
                        left_behind += 1;
                    }
                    Err(e) => return Err(e),
                }
            }

            let (committed, abandoned) = self.commit_moves(moved).await?;
            stats.items_migrated += committed.len() as u64;
            for entry in &abandoned {
                self.discard_copy(entry, destination).await;
            }

            if delete_old {
                for entry in &committed {
                    self.remove_stale(entry, verbose, &mut stats).await?;
                }
            }

            if batch_len < batch_size as usize {
                break;
            }
        }

        info!(
            items_processed = stats.items_processed,
            items_migrated = stats.items_migrated,
            bytes_copied = stats.bytes_copied,
            errors = stats.errors,
            "migration finished"
        );
        Ok(stats)
    }

    /// Copy one row's bytes into `destination`, returning the repointed row
    /// and the number of bytes written.
    async fn copy_row(&self, row: &BitstreamRow, destination: i32) -> ServiceResult<(Moved, u64)> {
        let placement = self.stores().placement(row.store_number)?;
        let holders = placement.holders();
        let mut updated = row.clone();
        let mut copied = 0;
        let mut wrote = false;

        // A synchronized row already has bytes in both halves of the pair.
        if !holders.contains(&destination) {
            let source = self.stores().store(placement.reader())?;
            let target = self.stores().store(destination)?;

            let input = source.get(&row.internal_id).await?;
            let info = target.put(&row.internal_id, input).await?;
            if let Err(e) = check_copy(row, &info) {
                if let Err(cleanup) = target.remove(&row.internal_id).await {
                    warn!(internal_id = %row.internal_id, error = %cleanup, "failed to remove bad copy");
                }
                return Err(e);
            }
            updated.record_content(info.size_bytes, &info.checksum);
            copied = info.size_bytes;
            wrote = true;
        }

        updated.store_number = destination;
        debug!(
            internal_id = %row.internal_id,
            from = row.store_number,
            to = destination,
            "copied bitstream"
        );
        let stale_holders = holders.into_iter().filter(|h| *h != destination).collect();
        Ok((
            Moved {
                row: updated,
                from: row.store_number,
                copied: wrote,
                stale_holders,
            },
            copied,
        ))
    }

    /// Write repointed rows in one unit of work.
    ///
    /// Each row is re-read first. A row deleted, expunged or moved by
    /// someone else while its bytes were being copied is left as it now
    /// stands and returned in the second list.
    pub(crate) async fn commit_moves(
        &self,
        moved: Vec<Moved>,
    ) -> ServiceResult<(Vec<Moved>, Vec<Moved>)> {
        let mut uow = self.metadata().begin().await?;
        let mut committed = Vec::with_capacity(moved.len());
        let mut abandoned = Vec::new();
        for entry in moved {
            match repoint(uow.as_mut(), &entry).await {
                Ok(true) => committed.push(entry),
                Ok(false) => abandoned.push(entry),
                Err(e) => {
                    if let Err(rollback) = uow.rollback().await {
                        warn!(error = %rollback, "rollback after repoint failure failed");
                    }
                    return Err(e);
                }
            }
        }
        uow.commit().await?;
        Ok((committed, abandoned))
    }

    /// Whether a live row other than `exclude` reads `internal_id` from `store`.
    pub(crate) async fn still_referenced(
        &self,
        internal_id: &str,
        exclude: Uuid,
        store: i32,
    ) -> ServiceResult<bool> {
        let others = self
            .metadata()
            .find_duplicate_internal_ids(internal_id, exclude)
            .await?;
        Ok(others.iter().any(|other| {
            match self.stores().placement(other.store_number) {
                Ok(placement) => placement.holders().contains(&store),
                // Unknown placement: assume it may need the copy.
                Err(_) => true,
            }
        }))
    }

    /// Best-effort removal of a copy written for a move that did not commit.
    pub(crate) async fn discard_copy(&self, entry: &Moved, store: i32) {
        if !entry.copied {
            return;
        }
        let internal_id = &entry.row.internal_id;
        match self
            .still_referenced(internal_id, entry.row.bitstream_id, store)
            .await
        {
            Ok(false) => {}
            Ok(true) => return,
            Err(e) => {
                warn!(%internal_id, store, error = %e, "cannot check references, keeping copy");
                return;
            }
        }
        let result = match self.stores().store(store) {
            Ok(target) => target.remove(internal_id).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => debug!(%internal_id, store, "removed copy of changed row"),
            Err(e) => warn!(%internal_id, store, error = %e, "failed to remove copy of changed row"),
        }
    }

    async fn remove_stale(
        &self,
        entry: &Moved,
        verbose: bool,
        stats: &mut MigrationStats,
    ) -> ServiceResult<()> {
        for holder in &entry.stale_holders {
            // Another live row may still read the old copy.
            if self
                .still_referenced(&entry.row.internal_id, entry.row.bitstream_id, *holder)
                .await?
            {
                debug!(internal_id = %entry.row.internal_id, store = holder, "old copy still referenced, keeping it");
                continue;
            }

            let result = match self.stores().store(*holder) {
                Ok(store) => store.remove(&entry.row.internal_id).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => stats.sources_removed += 1,
                Err(e) if verbose => {
                    warn!(
                        internal_id = %entry.row.internal_id,
                        store = holder,
                        error = %e,
                        "failed to remove old copy, continuing"
                    );
                    stats.errors += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Apply a move's placement and content onto the row as it stands now.
async fn repoint(uow: &mut dyn UnitOfWork, entry: &Moved) -> ServiceResult<bool> {
    let current = uow.get_bitstream(entry.row.bitstream_id).await?;
    let Some(mut current) = current.filter(|c| !c.deleted && c.store_number == entry.from) else {
        info!(
            bitstream_id = %entry.row.bitstream_id,
            internal_id = %entry.row.internal_id,
            "row changed while its bytes were copied, leaving it"
        );
        return Ok(false);
    };
    current.store_number = entry.row.store_number;
    current.size_bytes = entry.row.size_bytes;
    current.checksum = entry.row.checksum.clone();
    current.checksum_algorithm = entry.row.checksum_algorithm.clone();
    uow.update_bitstream(&current).await?;
    Ok(true)
}
