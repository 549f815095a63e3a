//! Time-ordered 128-bit identifiers (op_id, bundle_id, device_id).
//!
//! The top 6 bytes carry milliseconds since the Unix epoch (big-endian, so
//! lexicographic byte order equals chronological order); the remaining 10
//! bytes are CSPRNG output. This gives k-sortable, globally unique ids
//! without coordinating a counter across devices.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A 128-bit, time-ordered, globally unique identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id128(pub [u8; 16]);

impl Id128 {
    /// Generate a fresh id using the current wall-clock time.
    pub fn new() -> Self {
        Self::at(now_millis())
    }

    /// Generate an id with an explicit millisecond timestamp (used in tests
    /// to construct deterministic, reproducible id sequences).
    pub fn at(millis: u64) -> Self {
        let mut bytes = [0u8; 16];
        let millis_bytes = millis.to_be_bytes();
        // Top 6 bytes: millisecond timestamp, big-endian, truncated to 48 bits.
        bytes[0..6].copy_from_slice(&millis_bytes[2..8]);
        rand::rngs::OsRng.fill_bytes(&mut bytes[6..16]);
        Self(bytes)
    }

    /// The all-zero id, used as a sentinel (never produced by [`Id128::new`]).
    pub const NIL: Id128 = Id128([0u8; 16]);

    /// Millisecond timestamp encoded in the leading bytes.
    pub fn timestamp_millis(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf[2..8].copy_from_slice(&self.0[0..6]);
        u64::from_be_bytes(buf)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl Default for Id128 {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Id128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id128({})", self.to_hex())
    }
}

impl fmt::Display for Id128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn k_sortable_by_timestamp() {
        let a = Id128::at(1_000);
        let b = Id128::at(2_000);
        assert!(a < b);
    }

    #[test]
    fn round_trips_through_hex() {
        let id = Id128::new();
        let hex = id.to_hex();
        assert_eq!(Id128::from_hex(&hex), Some(id));
    }

    #[test]
    fn globally_unique_within_same_millisecond() {
        let a = Id128::at(42);
        let b = Id128::at(42);
        assert_ne!(a, b);
        assert_eq!(a.timestamp_millis(), b.timestamp_millis());
    }
}
