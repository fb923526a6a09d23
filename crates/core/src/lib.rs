//! Core domain types and shared logic for bitstream storage.
//!
//! This crate defines the pieces every other crate agrees on:
//! - Content addressing (scatter paths, registered references)
//! - Checksum algorithm and incremental hashing
//! - Internal id generation
//! - Record lifecycle states and store numbering
//! - Configuration

pub mod address;
pub mod checksum;
pub mod config;
pub mod error;
pub mod id;
pub mod record;

pub use address::{ContentAddress, ScatterPath, is_registered, registered_id, sanitize};
pub use checksum::{Checksum, ChecksumAlgorithm, ChecksumHasher};
pub use error::{Error, Result};
pub use id::generate_id;
pub use record::{RecordState, SYNCHRONIZED_STORE_NUMBER, StoreNumber};
