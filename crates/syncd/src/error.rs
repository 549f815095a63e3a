//! Engine-level error taxonomy.
//!
//! Each module defines its own `thiserror` enum; this module rolls them
//! up into [`EngineError`] at the CLI boundary, where they map 1:1 onto
//! the exit codes in `main.rs`.

use crate::apply::ApplyError;
use crate::bundle::BundleError;
use crate::checkpoint::CheckpointError;
use crate::schema_migration::SchemaError;
use crate::transport::TransportError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input: bad primary key encoding, unknown table, etc.
    /// Caller-visible, non-retryable.
    #[error("validation error: {0}")]
    Validation(String),

    /// Bundle references unknown or incompatible schema. The whole bundle
    /// is rejected; the sync loop transitions to ERROR.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Integrity hash mismatch or unreadable bundle container. The bundle
    /// is marked tainted.
    #[error("bundle error: {0}")]
    Bundle(#[from] BundleError),

    /// Underlying `rusqlite` store failure. The transaction is rolled
    /// back and the checkpoint marked aborted; retryable.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Network/transport failure. The sync loop enters WAITING_RETRY.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A checkpoint could not be created, committed, or resumed.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Apply pipeline failure not otherwise covered above.
    #[error("apply error: {0}")]
    Apply(#[from] ApplyError),

    /// Trigger-capture/staging failure.
    #[error("capture error: {0}")]
    Capture(#[from] crate::capture::CaptureError),

    /// Conflict registry failure.
    #[error("conflict error: {0}")]
    Conflict(#[from] crate::conflict::ConflictError),

    /// Peer registry failure.
    #[error("peer error: {0}")]
    Peer(#[from] crate::peer::PeerError),

    /// Operation log failure.
    #[error("oplog error: {0}")]
    Oplog(#[from] crate::oplog::OplogError),

    /// Unresolved conflicts block the requested operation (e.g. a
    /// migration that touches a conflicted row).
    #[error("{0} unresolved conflict(s) block this operation")]
    ConflictsBlockOperation(usize),

    /// Core protocol encode/decode failure.
    #[error("codec error: {0}")]
    Codec(#[from] sync_proto::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Process exit code: 0 success, 2 usage, 3 schema-incompatible
    /// bundle, 4 transport failure, 5 unresolved conflicts, 1 other.
    pub fn exit_code(&self) -> u8 {
        match self {
            EngineError::Validation(_) => 2,
            EngineError::Schema(_) => 3,
            EngineError::Transport(_) => 4,
            EngineError::ConflictsBlockOperation(_) => 5,
            _ => 1,
        }
    }
}
