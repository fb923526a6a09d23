//! Repository traits for metadata operations.

pub mod bitstreams;
pub mod checksum_history;
pub mod unit_of_work;

pub use bitstreams::BitstreamRepo;
pub use checksum_history::ChecksumHistoryRepo;
pub use unit_of_work::UnitOfWork;
