//! Shared error types for the replidb core protocol crate.

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced while encoding, decoding, or validating core protocol
/// values. Corresponds to `ValidationError` / `BundleError` in the
/// engine-level error taxonomy (see `syncd::error`).
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error (non-canonical paths only).
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// A value codec payload was truncated or carried an unknown type tag.
    #[error("malformed value codec payload: {0}")]
    MalformedCodec(String),

    /// Hash mismatch (computed != transmitted content hash).
    #[error("hash mismatch: computed {computed} != transmitted {transmitted}")]
    HashMismatch { computed: String, transmitted: String },

    /// Invalid Ed25519 signature.
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key bytes.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// A float value cannot be canonically encoded (NaN or infinite).
    #[error("float normalization error: {0}")]
    FloatNormalization(String),
}
