//! Optional Ed25519 device identity keys.
//!
//! Devices may sign bundles on export so an importer can verify provenance
//! before merging a stranger's operations into its own log. Signing is
//! optional: a device with no keypair configured can still capture, apply,
//! and exchange operations over a trusted transport.

use crate::error::{Error, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

/// A device's signing identity.
pub struct DeviceKeyPair {
    signing_key: SigningKey,
}

impl DeviceKeyPair {
    /// Generate a fresh keypair using the OS CSPRNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Reconstruct a keypair from a 32-byte seed, e.g. one loaded from the
    /// device's config file.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn seed_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key(&self) -> DevicePublicKey {
        DevicePublicKey(self.signing_key.verifying_key())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

/// A device's public verifying key, as distributed to peers.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DevicePublicKey(VerifyingKey);

impl DevicePublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|e| Error::InvalidPublicKey(e.to_string()))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> Result<()> {
        let sig = Signature::from_bytes(signature);
        self.0
            .verify(message, &sig)
            .map_err(|_| Error::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trips() {
        let keypair = DeviceKeyPair::generate();
        let sig = keypair.sign(b"bundle digest");
        keypair.public_key().verify(b"bundle digest", &sig).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let keypair = DeviceKeyPair::generate();
        let sig = keypair.sign(b"bundle digest");
        assert!(keypair.public_key().verify(b"different digest", &sig).is_err());
    }

    #[test]
    fn seed_round_trip_reproduces_same_identity() {
        let keypair = DeviceKeyPair::generate();
        let seed = keypair.seed_bytes();
        let restored = DeviceKeyPair::from_seed(&seed);
        assert_eq!(keypair.public_key(), restored.public_key());
    }

    #[test]
    fn public_key_bytes_round_trip() {
        let keypair = DeviceKeyPair::generate();
        let pub_bytes = keypair.public_key().to_bytes();
        let restored = DevicePublicKey::from_bytes(&pub_bytes).unwrap();
        assert_eq!(keypair.public_key(), restored);
    }
}
