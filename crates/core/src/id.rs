//! Internal id generation.

use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Width of generated ids in decimal digits.
pub const ID_DIGITS: usize = 38;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Generate a fresh internal id.
///
/// The id is a fixed-width decimal rendering of a SHA-256 digest over random
/// bytes, the process id, the wall clock and a per-process sequence number.
/// Fixed width keeps every id at full scatter depth.
pub fn generate_id() -> String {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(nanos.to_le_bytes());
    hasher.update(SEQUENCE.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    let digest = hasher.finalize();

    let mut high = [0u8; 16];
    high.copy_from_slice(&digest[..16]);
    // 10^38 < 2^127, so 126 bits always fit in ID_DIGITS digits.
    let value = u128::from_be_bytes(high) >> 2;
    format!("{value:0width$}", width = ID_DIGITS)
}
