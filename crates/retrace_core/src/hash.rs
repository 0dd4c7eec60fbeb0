//! Digests for crash-safe trace records.
//!
//! Uses BLAKE3 for all hashing. On-disk records store a 4-byte truncation
//! of the digest, which is enough to tell a torn write from a complete one.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A BLAKE3 digest (256 bits / 32 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Compute BLAKE3 digest of data
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First four bytes as a little-endian word
    #[must_use]
    pub fn truncated(&self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Shorthand for `compute(data).truncated()`
    #[must_use]
    pub fn short(data: &[u8]) -> u32 {
        Self::compute(data).truncated()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_deterministic() {
        assert_eq!(Digest::compute(b"abc"), Digest::compute(b"abc"));
        assert_ne!(Digest::compute(b"abc"), Digest::compute(b"abd"));
    }

    #[test]
    fn test_digest_truncated_matches_short() {
        let d = Digest::compute(b"payload");
        assert_eq!(d.truncated(), Digest::short(b"payload"));
        assert_eq!(d.truncated().to_le_bytes(), d.as_bytes()[..4]);
    }

    #[test]
    fn test_digest_display_is_hex() {
        let d = Digest::compute(b"x");
        let text = d.to_string();
        assert_eq!(text.len(), 64);
        assert!(text.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
