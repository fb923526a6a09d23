//! Database models mapping to the metadata schema.

use bitstore_core::{Checksum, RecordState, is_registered};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Bitstreams
// =============================================================================

/// One bitstream metadata row.
///
/// `deleted` is set before any bytes are written and cleared only once size
/// and checksum are recorded, so a live row never describes unverified content.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct BitstreamRow {
    pub bitstream_id: Uuid,
    /// Backend-facing key; `-R` prefixed for registered files.
    pub internal_id: String,
    pub store_number: i32,
    pub size_bytes: i64,
    pub checksum: Option<String>,
    pub checksum_algorithm: Option<String>,
    pub deleted: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl BitstreamRow {
    /// A placeholder row for content that has not been written yet.
    pub fn pending(internal_id: impl Into<String>, store_number: i32) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            bitstream_id: Uuid::new_v4(),
            internal_id: internal_id.into(),
            store_number,
            size_bytes: 0,
            checksum: None,
            checksum_algorithm: None,
            deleted: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn state(&self) -> RecordState {
        RecordState::of(self.deleted, self.checksum.is_some())
    }

    pub fn is_registered(&self) -> bool {
        is_registered(&self.internal_id)
    }

    /// Copy measured content attributes onto the row.
    pub fn record_content(&mut self, size_bytes: u64, checksum: &Checksum) {
        self.size_bytes = i64::try_from(size_bytes).unwrap_or(i64::MAX);
        self.checksum = Some(checksum.value.clone());
        self.checksum_algorithm = Some(checksum.algorithm.as_str().to_string());
    }
}

// =============================================================================
// Checksum history
// =============================================================================

/// Outcome of one checksum verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    Match,
    Mismatch,
    /// The backend no longer holds the object.
    Missing,
}

impl CheckResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Match => "match",
            Self::Mismatch => "mismatch",
            Self::Missing => "missing",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "match" => Some(Self::Match),
            "mismatch" => Some(Self::Mismatch),
            "missing" => Some(Self::Missing),
            _ => None,
        }
    }
}

impl std::fmt::Display for CheckResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded checksum verification.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ChecksumHistoryRow {
    pub check_id: Uuid,
    pub bitstream_id: Uuid,
    pub checked_at: OffsetDateTime,
    pub expected_checksum: Option<String>,
    pub computed_checksum: Option<String>,
    pub result: String,
}

impl ChecksumHistoryRow {
    pub fn new(
        bitstream_id: Uuid,
        expected_checksum: Option<String>,
        computed_checksum: Option<String>,
        result: CheckResult,
    ) -> Self {
        Self {
            check_id: Uuid::new_v4(),
            bitstream_id,
            checked_at: OffsetDateTime::now_utc(),
            expected_checksum,
            computed_checksum,
            result: result.as_str().to_string(),
        }
    }

    pub fn check_result(&self) -> Option<CheckResult> {
        CheckResult::parse(&self.result)
    }
}
