//! Checksum algorithm and incremental hashing.
//!
//! Every store reports content digests with the same algorithm so that a
//! recorded checksum can be recomputed by any backend later.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported checksum algorithms.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    #[default]
    #[serde(rename = "MD5")]
    Md5,
}

impl ChecksumAlgorithm {
    /// Name persisted alongside checksums.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
        }
    }

    /// Start an incremental hasher for this algorithm.
    pub fn hasher(&self) -> ChecksumHasher {
        match self {
            Self::Md5 => ChecksumHasher {
                algorithm: *self,
                inner: Md5::new(),
            },
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        if s.eq_ignore_ascii_case("MD5") {
            Ok(Self::Md5)
        } else {
            Err(crate::Error::ChecksumAlgorithmUnavailable(s.to_string()))
        }
    }
}

/// A finished digest: algorithm plus lowercase hex value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub value: String,
}

impl Checksum {
    /// Digest a complete buffer.
    pub fn compute(algorithm: ChecksumAlgorithm, data: &[u8]) -> Self {
        let mut hasher = algorithm.hasher();
        hasher.update(data);
        hasher.finalize()
    }

    pub fn as_hex(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.value)
    }
}

/// Incremental checksum hasher.
pub struct ChecksumHasher {
    algorithm: ChecksumAlgorithm,
    inner: Md5,
}

impl ChecksumHasher {
    /// Update the hasher with data.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finalize and return the checksum.
    pub fn finalize(self) -> Checksum {
        Checksum {
            algorithm: self.algorithm,
            value: self
                .inner
                .finalize()
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect(),
        }
    }
}

impl fmt::Debug for ChecksumHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChecksumHasher")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_known_vectors() {
        let empty = Checksum::compute(ChecksumAlgorithm::Md5, b"");
        assert_eq!(empty.as_hex(), "d41d8cd98f00b204e9800998ecf8427e");

        let hello = Checksum::compute(ChecksumAlgorithm::Md5, b"hello world");
        assert_eq!(hello.as_hex(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut hasher = ChecksumAlgorithm::Md5.hasher();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(
            hasher.finalize(),
            Checksum::compute(ChecksumAlgorithm::Md5, b"hello world")
        );
    }

    #[test]
    fn test_algorithm_parse() {
        assert_eq!(
            "MD5".parse::<ChecksumAlgorithm>().unwrap(),
            ChecksumAlgorithm::Md5
        );
        assert_eq!(
            "md5".parse::<ChecksumAlgorithm>().unwrap(),
            ChecksumAlgorithm::Md5
        );
        let err = "SHA-512".parse::<ChecksumAlgorithm>().unwrap_err();
        assert!(matches!(err, crate::Error::ChecksumAlgorithmUnavailable(_)));
    }

    #[test]
    fn test_algorithm_serializes_as_persisted_name() {
        let json = serde_json::to_string(&ChecksumAlgorithm::Md5).unwrap();
        assert_eq!(json, "\"MD5\"");
    }
}
