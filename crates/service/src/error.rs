//! Service error types.

use bitstore_metadata::MetadataError;
use bitstore_storage::StorageError;
use thiserror::Error;

/// Errors surfaced by the storage service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("bitstream not found: {0}")]
    NotFound(String),

    /// The store reported nothing for a registered file.
    #[error("registration failed: store {store_number} holds no file at '{path}'")]
    RegistrationFailed { store_number: i32, path: String },

    #[error("checksum mismatch for {internal_id}: expected {expected}, computed {computed}")]
    ChecksumMismatch {
        internal_id: String,
        expected: String,
        computed: String,
    },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ServiceError {
    /// Failures confined to one record's bytes. Best-effort sweeps log these
    /// and move on; anything else aborts the sweep.
    pub fn is_per_record(&self) -> bool {
        match self {
            Self::Storage(e) => !matches!(
                e,
                StorageError::Config(_)
                    | StorageError::UnknownStore(_)
                    | StorageError::ChecksumAlgorithmUnavailable(_)
            ),
            Self::ChecksumMismatch { .. } => true,
            _ => false,
        }
    }
}

impl From<bitstore_core::Error> for ServiceError {
    fn from(err: bitstore_core::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type for service operations.
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_record_classification() {
        let transient = ServiceError::from(StorageError::Io(std::io::Error::other("reset")));
        assert!(transient.is_per_record());

        let mismatch = ServiceError::ChecksumMismatch {
            internal_id: "1".into(),
            expected: "a".into(),
            computed: "b".into(),
        };
        assert!(mismatch.is_per_record());

        assert!(!ServiceError::from(StorageError::UnknownStore(9)).is_per_record());
        assert!(!ServiceError::from(MetadataError::Internal("x".into())).is_per_record());
    }

    #[test]
    fn test_registration_failure_message() {
        let err = ServiceError::RegistrationFailed {
            store_number: 1,
            path: "imports/a.pdf".into(),
        };
        assert_eq!(
            err.to_string(),
            "registration failed: store 1 holds no file at 'imports/a.pdf'"
        );
    }
}
