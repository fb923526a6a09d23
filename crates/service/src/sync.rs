//! Synchronized store pairs.
//!
//! New content is written to the incoming store as usual. `synchronize`
//! then backfills the secondary store from the primary and marks each row
//! with [`SYNCHRONIZED_STORE_NUMBER`], after which reads go to the primary
//! and cleanup removes the bytes from both stores.

use crate::error::{ServiceError, ServiceResult};
use crate::migrate::{Moved, check_copy};
use crate::service::BitstreamStorageService;
use bitstore_core::SYNCHRONIZED_STORE_NUMBER;
use bitstore_core::config::SyncConfig;
use bitstore_metadata::{BitstreamRepo, BitstreamRow};
use bitstore_storage::AboutKey;
use serde::Serialize;
use std::ops::Deref;
use tracing::{debug, info, warn};

/// Counters reported by a synchronization run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Live rows examined in the primary store.
    pub items_processed: u64,
    /// Rows now marked synchronized.
    pub items_synchronized: u64,
    /// Objects copied into the secondary store.
    pub objects_copied: u64,
    /// Bytes copied into the secondary store.
    pub bytes_copied: u64,
    /// Objects the secondary already held at the right size.
    pub already_present: u64,
    /// Registered files, which stay single-homed.
    pub skipped_registered: u64,
    /// Per-record failures logged in best-effort mode.
    pub errors: u64,
}

/// Storage service for deployments with a synchronized store pair.
#[derive(Debug, Clone)]
pub struct SyncBitstreamStorageService {
    inner: BitstreamStorageService,
    sync: SyncConfig,
}

impl SyncBitstreamStorageService {
    /// Wrap a service whose registry carries a sync pair.
    pub fn new(inner: BitstreamStorageService) -> ServiceResult<Self> {
        let sync = inner.stores().sync().ok_or_else(|| {
            ServiceError::Config("no synchronized store pair is configured".to_string())
        })?;
        Ok(Self { inner, sync })
    }

    pub fn sync_config(&self) -> SyncConfig {
        self.sync
    }

    pub fn into_inner(self) -> BitstreamStorageService {
        self.inner
    }

    /// Bring every live primary row into the secondary store and mark it
    /// synchronized, committing once per batch. A row deleted while its
    /// bytes are being copied stays deleted and its new copy is dropped.
    pub async fn synchronize(&self, batch_size: u32, verbose: bool) -> ServiceResult<SyncStats> {
        let SyncConfig { primary, secondary } = self.sync;
        self.stores().store(primary)?;
        self.stores().store(secondary)?;

        let batch_size = batch_size.max(1);
        let mut stats = SyncStats::default();
        let mut left_behind: u64 = 0;

        info!(primary, secondary, "starting synchronization");

        loop {
            let batch = self
                .metadata()
                .find_bitstreams_by_store(primary, batch_size, left_behind)
                .await?;
            if batch.is_empty() {
                break;
            }
            let batch_len = batch.len();

            let mut synced = Vec::with_capacity(batch_len);
            for row in batch {
                stats.items_processed += 1;
                if row.is_registered() {
                    stats.skipped_registered += 1;
                    left_behind += 1;
                    continue;
                }
                match self.backfill(&row, &mut stats).await {
                    Ok(entry) => synced.push(entry),
                    Err(e) if verbose && e.is_per_record() => {
                        warn!(
                            bitstream_id = %row.bitstream_id,
                            internal_id = %row.internal_id,
                            error = %e,
                            "synchronization failed for record, continuing"
                        );
                        stats.errors += 1;
                        left_behind += 1;
                    }
                    Err(e) => return Err(e),
                }
            }

            let (committed, abandoned) = self.commit_moves(synced).await?;
            stats.items_synchronized += committed.len() as u64;
            for entry in &abandoned {
                self.discard_copy(entry, secondary).await;
            }

            if batch_len < batch_size as usize {
                break;
            }
        }

        info!(
            items_processed = stats.items_processed,
            items_synchronized = stats.items_synchronized,
            objects_copied = stats.objects_copied,
            errors = stats.errors,
            "synchronization finished"
        );
        Ok(stats)
    }

    async fn backfill(&self, row: &BitstreamRow, stats: &mut SyncStats) -> ServiceResult<Moved> {
        let SyncConfig { primary, secondary } = self.sync;
        let target = self.stores().store(secondary)?;

        let present = target
            .about(&row.internal_id, &[AboutKey::Size])
            .await?
            .and_then(|about| about.size_bytes)
            .is_some_and(|size| i64::try_from(size).ok() == Some(row.size_bytes));

        if present {
            stats.already_present += 1;
        } else {
            let input = self.stores().store(primary)?.get(&row.internal_id).await?;
            let info = target.put(&row.internal_id, input).await?;
            if let Err(e) = check_copy(row, &info) {
                if let Err(cleanup) = target.remove(&row.internal_id).await {
                    warn!(internal_id = %row.internal_id, error = %cleanup, "failed to remove bad copy");
                }
                return Err(e);
            }
            stats.objects_copied += 1;
            stats.bytes_copied += info.size_bytes;
            debug!(internal_id = %row.internal_id, "copied to secondary store");
        }

        let mut updated = row.clone();
        updated.store_number = SYNCHRONIZED_STORE_NUMBER;
        Ok(Moved {
            row: updated,
            from: primary,
            copied: !present,
            stale_holders: Vec::new(),
        })
    }
}

impl Deref for SyncBitstreamStorageService {
    type Target = BitstreamStorageService;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
