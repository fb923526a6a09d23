//! Bitstream record lifecycle and store numbering.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Store number reserved for bitstreams whose bytes live in both stores of
/// a synchronized pair.
pub const SYNCHRONIZED_STORE_NUMBER: i32 = 77;

/// Store number written by old ingest paths that predate multiple stores.
pub const LEGACY_STORE_NUMBER: i32 = -1;

/// Lifecycle state of a bitstream record.
///
/// ```text
/// Pending ──put ok──▶ Live ──soft delete──▶ SoftDeleted ──cleanup──▶ Reclaimed
///    │                                                                 ▲
///    └──────────────── put failed / caller aborted ────────────────────┘
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    /// Placeholder row written before any bytes; never served.
    Pending,
    /// Content written and verified; visible to readers.
    Live,
    /// Flagged for removal; awaiting a cleanup sweep.
    SoftDeleted,
    /// Metadata row gone; only reported by cleanup.
    Reclaimed,
}

impl RecordState {
    /// Derive the state of a persisted row.
    ///
    /// Rows that never received a checksum were abandoned before their write
    /// finished and stay pending even though they share the deleted flag with
    /// soft-deleted rows.
    pub fn of(deleted: bool, has_checksum: bool) -> Self {
        match (deleted, has_checksum) {
            (false, _) => Self::Live,
            (true, false) => Self::Pending,
            (true, true) => Self::SoftDeleted,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Live => "live",
            Self::SoftDeleted => "soft_deleted",
            Self::Reclaimed => "reclaimed",
        }
    }

    /// Whether normal read paths may serve this record.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded store number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreNumber {
    /// Bytes owned by one concrete store.
    Single(i32),
    /// Bytes present in both stores of the synchronized pair.
    Synchronized,
}

impl StoreNumber {
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Single(index) => *index,
            Self::Synchronized => SYNCHRONIZED_STORE_NUMBER,
        }
    }
}

impl From<i32> for StoreNumber {
    fn from(value: i32) -> Self {
        match value {
            SYNCHRONIZED_STORE_NUMBER => Self::Synchronized,
            LEGACY_STORE_NUMBER => Self::Single(0),
            index => Self::Single(index),
        }
    }
}

impl fmt::Display for StoreNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(index) => write!(f, "{index}"),
            Self::Synchronized => write!(f, "synchronized({SYNCHRONIZED_STORE_NUMBER})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_state_from_row_flags() {
        assert_eq!(RecordState::of(true, false), RecordState::Pending);
        assert_eq!(RecordState::of(false, true), RecordState::Live);
        assert_eq!(RecordState::of(true, true), RecordState::SoftDeleted);
        assert!(!RecordState::Pending.is_live());
        assert!(RecordState::Live.is_live());
    }

    #[test]
    fn test_store_number_decoding() {
        assert_eq!(StoreNumber::from(0), StoreNumber::Single(0));
        assert_eq!(StoreNumber::from(3), StoreNumber::Single(3));
        assert_eq!(StoreNumber::from(77), StoreNumber::Synchronized);
        assert_eq!(StoreNumber::from(-1), StoreNumber::Single(0));
        assert_eq!(StoreNumber::Synchronized.as_i32(), SYNCHRONIZED_STORE_NUMBER);
    }
}
