//! Bitstream storage orchestration.
//!
//! Ties the configured stores to the metadata store:
//! - Ingest and registration with the deleted-until-written lifecycle
//! - Cleanup sweeps reclaiming bytes of deleted rows
//! - Migration between stores
//! - Synchronized store pairs

pub mod bootstrap;
pub mod cleanup;
pub mod error;
pub mod migrate;
pub mod service;
pub mod sync;

pub use bootstrap::{build_service, build_sync_service};
pub use cleanup::CleanupStats;
pub use error::{ServiceError, ServiceResult};
pub use migrate::MigrationStats;
pub use service::BitstreamStorageService;
pub use sync::{SyncBitstreamStorageService, SyncStats};
