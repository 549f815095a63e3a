//! SHA-256 content hashing for bundle integrity checks.
//!
//! Bundle files hash with SHA-256 so the on-disk integrity digest is
//! verifiable with commodity tooling (`sha256sum`) without pulling in a
//! separate hashing dependency anywhere a bundle might be inspected out
//! of band.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sha256Hash(pub [u8; 32]);

impl Sha256Hash {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    /// Hash a sequence of chunks without concatenating them first, useful
    /// when streaming a bundle's operations off disk one row at a time.
    pub fn of_chunks<'a>(chunks: impl Iterator<Item = &'a [u8]>) -> Self {
        let mut hasher = Sha256::new();
        for chunk in chunks {
            hasher.update(chunk);
        }
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Debug for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha256Hash({})", self.to_hex())
    }
}

impl fmt::Display for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(Sha256Hash::of(b"hello"), Sha256Hash::of(b"hello"));
    }

    #[test]
    fn different_input_differs() {
        assert_ne!(Sha256Hash::of(b"hello"), Sha256Hash::of(b"world"));
    }

    #[test]
    fn chunked_hash_matches_concatenated() {
        let whole = Sha256Hash::of(b"helloworld");
        let chunked = Sha256Hash::of_chunks([&b"hello"[..], &b"world"[..]].into_iter());
        assert_eq!(whole, chunked);
    }

    #[test]
    fn round_trips_through_hex() {
        let h = Sha256Hash::of(b"bundle contents");
        assert_eq!(Sha256Hash::from_hex(&h.to_hex()), Some(h));
    }

    #[test]
    fn known_vector_matches_sha256_of_empty_input() {
        let h = Sha256Hash::of(b"");
        assert_eq!(
            h.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
