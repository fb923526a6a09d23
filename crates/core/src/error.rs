//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid internal id: {0}")]
    InvalidInternalId(String),

    #[error("checksum algorithm unavailable: {0}")]
    ChecksumAlgorithmUnavailable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
