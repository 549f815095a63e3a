//! Core data-model types shared between the wire format, the embedded
//! store schema, and the engine crate: [`Device`], [`Operation`],
//! [`ConflictRecord`], [`Bundle`], [`Checkpoint`], [`SchemaMigration`], and
//! [`Peer`].

use crate::clock::VectorClock;
use crate::crypto::DevicePublicKey;
use crate::id::Id128;
use serde::{Deserialize, Serialize};

/// A node identity. Created once at initialization and immutable
/// thereafter; the signing key is optional (see `sync-proto::crypto`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: Id128,
    pub display_name: String,
    /// Present only when this device has opted into signing bundle
    /// manifests on export.
    pub public_key: Option<[u8; 32]>,
}

impl Device {
    pub fn public_key(&self) -> Option<DevicePublicKey> {
        self.public_key.and_then(|bytes| DevicePublicKey::from_bytes(&bytes).ok())
    }
}

/// The kind of change an [`Operation`] captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    Insert,
    Update,
    Delete,
    SchemaMigration,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Insert => "INSERT",
            OpType::Update => "UPDATE",
            OpType::Delete => "DELETE",
            OpType::SchemaMigration => "SCHEMA_MIGRATION",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "INSERT" => Some(OpType::Insert),
            "UPDATE" => Some(OpType::Update),
            "DELETE" => Some(OpType::Delete),
            "SCHEMA_MIGRATION" => Some(OpType::SchemaMigration),
            _ => None,
        }
    }
}

/// The atomic replication unit: one captured row mutation or schema
/// change. Immutable once persisted, globally unique `op_id`, chained to
/// the originating device's previous operation via `parent_op_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub op_id: Id128,
    pub device_id: Id128,
    /// Previous op_id written by this device; `None` for a device's first
    /// operation.
    pub parent_op_id: Option<Id128>,
    /// Snapshot of the originator's vector clock at capture time.
    pub vector_clock: VectorClock,
    pub table_name: String,
    pub op_type: OpType,
    /// Binary-encoded primary key tuple, using the deterministic value codec.
    pub row_pk: Vec<u8>,
    /// Encoded column map, present for UPDATE/DELETE.
    pub old_values: Option<Vec<u8>>,
    /// Encoded column map, present for INSERT/UPDATE.
    pub new_values: Option<Vec<u8>>,
    pub schema_version: u32,
    /// Physical microsecond timestamp at capture.
    pub created_at: u64,
    /// `true` if captured on this device, `false` if imported from a peer.
    pub is_local: bool,
    /// Set once the op has been successfully replayed against user state.
    pub applied_at: Option<u64>,
}

/// Resolution lifecycle of a [`ConflictRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionState {
    Unresolved,
    Resolved,
    Deferred,
}

impl ResolutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionState::Unresolved => "unresolved",
            ResolutionState::Resolved => "resolved",
            ResolutionState::Deferred => "deferred",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "unresolved" => Some(ResolutionState::Unresolved),
            "resolved" => Some(ResolutionState::Resolved),
            "deferred" => Some(ResolutionState::Deferred),
            _ => None,
        }
    }
}

/// A detected pair of concurrent mutating operations targeting the same
/// `(table_name, row_pk)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub conflict_id: Id128,
    pub table_name: String,
    pub row_pk: Vec<u8>,
    pub local_op_id: Id128,
    pub remote_op_id: Id128,
    pub detected_at: u64,
    pub resolution_state: ResolutionState,
    pub resolved_by: Option<String>,
    pub winning_op_id: Option<Id128>,
}

/// The manifest half of a [`Bundle`] (the operations and schema snapshot
/// live alongside it in the bundle container, see `syncd::bundle`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleManifest {
    pub bundle_id: Id128,
    pub source_device_id: Id128,
    pub peer_device_id: Id128,
    pub created_at: u64,
    pub format_version: u32,
    pub op_count: u32,
    pub causal_summary: VectorClock,
    pub sha256: [u8; 32],
}

/// A table's schema as captured into a bundle, so an importer can check
/// compatibility before applying any operations referencing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSnapshotEntry {
    pub table_name: String,
    pub schema_version: u32,
    pub columns: Vec<String>,
}

/// A fully materialized bundle: manifest, ordered operations, and the
/// schema snapshot needed to validate them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub manifest: BundleManifest,
    pub operations: Vec<Operation>,
    pub schema_snapshot: Vec<SchemaSnapshotEntry>,
}

/// Lifecycle state of a crash-safe apply checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointStatus {
    InProgress,
    Committed,
    Aborted,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::InProgress => "in_progress",
            CheckpointStatus::Committed => "committed",
            CheckpointStatus::Aborted => "aborted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(CheckpointStatus::InProgress),
            "committed" => Some(CheckpointStatus::Committed),
            "aborted" => Some(CheckpointStatus::Aborted),
            _ => None,
        }
    }
}

/// A record of an in-flight or completed apply batch, used to make
/// imports resumable after a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: Id128,
    pub started_at: u64,
    pub last_applied_op_id: Option<Id128>,
    pub vector_clock_at_start: VectorClock,
    pub status: CheckpointStatus,
}

/// The kind of schema change. Only additive column changes are
/// first-class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaMigrationKind {
    AddColumn,
}

impl SchemaMigrationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaMigrationKind::AddColumn => "ADD_COLUMN",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ADD_COLUMN" => Some(SchemaMigrationKind::AddColumn),
            _ => None,
        }
    }
}

/// A single additive schema change, replicated as a `SCHEMA_MIGRATION`
/// operation once applied locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaMigration {
    pub migration_id: Id128,
    pub table_name: String,
    pub kind: SchemaMigrationKind,
    pub column_name: String,
    pub column_type: String,
    pub default_value: Option<Vec<u8>>,
    pub created_at: u64,
    pub applied_at: Option<u64>,
}

/// What a device knows about a sync partner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub peer_id: Id128,
    pub last_seen: Option<u64>,
    pub last_sync_at: Option<u64>,
    pub last_sent_vector_clock: Option<VectorClock>,
    pub last_received_vector_clock: Option<VectorClock>,
    pub endpoint_hint: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_type_round_trips_through_string() {
        for t in [OpType::Insert, OpType::Update, OpType::Delete, OpType::SchemaMigration] {
            assert_eq!(OpType::from_str(t.as_str()), Some(t));
        }
    }

    #[test]
    fn resolution_state_round_trips_through_string() {
        for s in [ResolutionState::Unresolved, ResolutionState::Resolved, ResolutionState::Deferred] {
            assert_eq!(ResolutionState::from_str(s.as_str()), Some(s));
        }
    }

    #[test]
    fn checkpoint_status_round_trips_through_string() {
        for s in [CheckpointStatus::InProgress, CheckpointStatus::Committed, CheckpointStatus::Aborted] {
            assert_eq!(CheckpointStatus::from_str(s.as_str()), Some(s));
        }
    }

    #[test]
    fn schema_migration_kind_round_trips() {
        assert_eq!(
            SchemaMigrationKind::from_str(SchemaMigrationKind::AddColumn.as_str()),
            Some(SchemaMigrationKind::AddColumn)
        );
    }

    #[test]
    fn device_without_public_key_resolves_to_none() {
        let device = Device {
            device_id: Id128::new(),
            display_name: "laptop".into(),
            public_key: None,
        };
        assert!(device.public_key().is_none());
    }
}
