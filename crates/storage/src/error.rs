//! Storage error types.

use thiserror::Error;

/// Store operation errors.
///
/// Provider-specific failures are wrapped into [`StorageError::Transport`]
/// before they leave a backend, keeping the original error as the source.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("checksum algorithm unavailable: {0}")]
    ChecksumAlgorithmUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown store {0}")]
    UnknownStore(i32),

    #[error("store {0} is disabled")]
    Disabled(String),
}

impl StorageError {
    /// Wrap any provider error as a transport failure.
    pub fn transport<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport(Box::new(err))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<bitstore_core::Error> for StorageError {
    fn from(err: bitstore_core::Error) -> Self {
        match err {
            bitstore_core::Error::ChecksumAlgorithmUnavailable(name) => {
                Self::ChecksumAlgorithmUnavailable(name)
            }
            bitstore_core::Error::InvalidInternalId(id) => Self::InvalidKey(id),
            bitstore_core::Error::InvalidConfiguration(msg) => Self::Config(msg),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
