//! Reclaiming storage held by deleted bitstream rows.

use crate::error::ServiceResult;
use crate::service::BitstreamStorageService;
use bitstore_core::RecordState;
use bitstore_metadata::{BitstreamRepo, BitstreamRow, UnitOfWork};
use bitstore_storage::AboutKey;
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

/// Counters reported by a cleanup sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    /// Deleted rows examined.
    pub items_processed: u64,
    /// Objects removed from their stores.
    pub objects_removed: u64,
    /// Rows hard deleted from metadata.
    pub rows_expunged: u64,
    /// Bytes freed by removed objects, as recorded on their rows.
    pub bytes_reclaimed: u64,
    /// Objects inside the grace period.
    pub skipped_recent: u64,
    /// Registered files, which are never removed from their store.
    pub skipped_registered: u64,
    /// Objects still referenced by a live row.
    pub skipped_shared: u64,
    /// Rows whose object was already gone.
    pub already_absent: u64,
    /// Per-record failures logged in best-effort mode.
    pub errors: u64,
}

/// What happened to one row within the sweep's unit of work.
enum Sweep {
    /// The row no longer appears among deleted rows.
    Left,
    /// The row stays deleted and is seen again by later pages.
    Kept,
}

/// Unknown or future modification times count as recent.
pub(crate) fn is_recent(
    modified: Option<OffsetDateTime>,
    now: OffsetDateTime,
    grace: Duration,
) -> bool {
    match modified {
        None => true,
        Some(modified) => modified >= now || now - modified < grace,
    }
}

impl BitstreamStorageService {
    /// Sweep every deleted row, removing unreferenced bytes.
    ///
    /// With `delete_db_records` the swept rows (and their checksum history)
    /// are hard deleted as well; otherwise they stay deleted and only their
    /// bytes go. Changes are committed every `commit_interval` rows. In
    /// `verbose` mode a per-record storage failure is logged and skipped;
    /// otherwise the open batch is rolled back and the error returned.
    ///
    /// Each unit of work stays open while its rows' objects are examined and
    /// removed. On SQLite that holds the only pooled connection, so concurrent
    /// ingest waits (up to the pool's acquire timeout) until the next commit;
    /// a small `commit_interval` keeps that window short.
    pub async fn cleanup(
        &self,
        delete_db_records: bool,
        verbose: bool,
    ) -> ServiceResult<CleanupStats> {
        let page_size = self.cleanup.page_size.max(1);
        let commit_interval = self.cleanup.commit_interval.max(1);
        let grace = self.cleanup.grace_period();
        let now = OffsetDateTime::now_utc();

        let mut stats = CleanupStats::default();
        // Rows that stay deleted shift the next page down.
        let mut retained: u64 = 0;

        info!(delete_db_records, "starting cleanup sweep");

        loop {
            let page = self
                .metadata()
                .find_deleted_bitstreams(page_size, retained)
                .await?;
            if page.is_empty() {
                break;
            }
            let page_len = page.len();

            let mut uow = self.metadata().begin().await?;
            let mut uncommitted: u32 = 0;

            for row in &page {
                stats.items_processed += 1;
                let outcome = self
                    .sweep_row(uow.as_mut(), row, delete_db_records, now, grace, &mut stats)
                    .await;

                match outcome {
                    Ok(Sweep::Left) => {}
                    Ok(Sweep::Kept) => retained += 1,
                    Err(e) if verbose && e.is_per_record() => {
                        warn!(
                            bitstream_id = %row.bitstream_id,
                            internal_id = %row.internal_id,
                            error = %e,
                            "cleanup failed for record, continuing"
                        );
                        stats.errors += 1;
                        retained += 1;
                    }
                    Err(e) => {
                        if let Err(rollback) = uow.rollback().await {
                            warn!(error = %rollback, "rollback after cleanup failure failed");
                        }
                        return Err(e);
                    }
                }

                uncommitted += 1;
                if uncommitted >= commit_interval {
                    uow.commit().await?;
                    uow = self.metadata().begin().await?;
                    uncommitted = 0;
                }
            }
            uow.commit().await?;

            if page_len < page_size as usize {
                break;
            }
        }

        info!(
            items_processed = stats.items_processed,
            objects_removed = stats.objects_removed,
            rows_expunged = stats.rows_expunged,
            errors = stats.errors,
            "cleanup sweep finished"
        );
        Ok(stats)
    }

    async fn sweep_row(
        &self,
        uow: &mut dyn UnitOfWork,
        candidate: &BitstreamRow,
        delete_db_records: bool,
        now: OffsetDateTime,
        grace: Duration,
        stats: &mut CleanupStats,
    ) -> ServiceResult<Sweep> {
        // Re-read under the unit of work; the row may have been revived or
        // expunged since the page was fetched.
        let Some(row) = uow.get_bitstream(candidate.bitstream_id).await? else {
            return Ok(Sweep::Left);
        };
        if !row.deleted {
            return Ok(Sweep::Left);
        }

        // Either half of a synchronized pair may hold the only remaining copy.
        let placement = self.stores().placement(row.store_number)?;
        let holders = placement.holders();
        let mut present = false;
        let mut recent = false;
        for holder in &holders {
            let about = self
                .stores()
                .store(*holder)?
                .about(&row.internal_id, &[AboutKey::Modified])
                .await?;
            if let Some(about) = about {
                present = true;
                recent |= is_recent(about.modified, now, grace);
            }
        }

        if !present {
            // A pending row may belong to a write that has not produced bytes yet.
            if row.state() == RecordState::Pending && is_recent(Some(row.created_at), now, grace) {
                stats.skipped_recent += 1;
                return Ok(Sweep::Kept);
            }
            stats.already_absent += 1;
            if delete_db_records {
                uow.expunge_bitstream(row.bitstream_id).await?;
                stats.rows_expunged += 1;
                return Ok(Sweep::Left);
            }
            return Ok(Sweep::Kept);
        }

        if recent {
            debug!(internal_id = %row.internal_id, "object inside grace period");
            stats.skipped_recent += 1;
            return Ok(Sweep::Kept);
        }

        if row.is_registered() {
            stats.skipped_registered += 1;
        } else if uow
            .count_live_duplicates(&row.internal_id, row.bitstream_id)
            .await?
            > 0
        {
            debug!(internal_id = %row.internal_id, "object still referenced by a live row");
            stats.skipped_shared += 1;
        } else {
            for holder in holders {
                self.stores()
                    .store(holder)?
                    .remove(&row.internal_id)
                    .await?;
            }
            stats.objects_removed += 1;
            stats.bytes_reclaimed += u64::try_from(row.size_bytes).unwrap_or(0);
            debug!(internal_id = %row.internal_id, "removed object");
        }

        if delete_db_records {
            uow.expunge_bitstream(row.bitstream_id).await?;
            stats.rows_expunged += 1;
            return Ok(Sweep::Left);
        }
        Ok(Sweep::Kept)
    }
}
