//! Session State Checksums
//!
//! Rolling digest over the sequence of accepted actions, used to let clients
//! detect divergence from the authoritative state. This is a best-effort
//! corruption detector, not an integrity or security guarantee: a client
//! whose checksum disagrees with the server's should request a full resync.

use sha2::{Digest, Sha256};

/// Checksum output type (256 bits / 32 bytes).
pub type Checksum = [u8; 32];

/// The all-zero checksum of a freshly initialized session.
pub const EMPTY_CHECKSUM: Checksum = [0u8; 32];

/// Incremental hasher for session state digests.
///
/// Wraps SHA-256 with helpers for the primitive types the sync layer hashes.
/// Order of updates is significant: two sessions share a checksum only if
/// they accepted the same actions in the same order.
pub struct ChecksumBuilder {
    hasher: Sha256,
}

impl ChecksumBuilder {
    /// Create a new builder with a domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Create a builder for the per-session rolling digest.
    pub fn for_session_state() -> Self {
        Self::new(b"TABLETOP_SYNC_STATE_V1")
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Update with a u64 value (little-endian).
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a length-prefixed string.
    ///
    /// The prefix prevents ambiguity between adjacent fields
    /// (`"ab" + "c"` must not hash like `"a" + "bc"`).
    #[inline]
    pub fn update_str(&mut self, value: &str) {
        self.update_u64(value.len() as u64);
        self.hasher.update(value.as_bytes());
    }

    /// Update with a prior checksum (for chaining).
    #[inline]
    pub fn update_checksum(&mut self, value: &Checksum) {
        self.hasher.update(value);
    }

    /// Finalize and return the checksum.
    pub fn finalize(self) -> Checksum {
        self.hasher.finalize().into()
    }
}

/// Render a checksum as lowercase hex for the wire and for logs.
pub fn encode_checksum(checksum: &Checksum) -> String {
    hex::encode(checksum)
}
