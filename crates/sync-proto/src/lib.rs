//! Core identifiers, codecs, clocks, and data-model types shared by the
//! replidb replication engine.
//!
//! # Modules
//!
//! - [`id`]: time-ordered 128-bit identifiers
//! - [`codec`]: deterministic value-map encoding
//! - [`clock`]: vector clocks and the hybrid logical clock
//! - [`hash`]: SHA-256 content hashing
//! - [`crypto`]: optional device signing keys
//! - [`types`]: Device, Operation, ConflictRecord, Bundle, Checkpoint,
//!   SchemaMigration, Peer
//! - [`error`]: shared error type

pub mod clock;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod hash;
pub mod id;
pub mod types;

pub use clock::{ClockOrdering, VectorClock};
pub use codec::{decode_value_map, encode_value_map, Value, ValueMap};
pub use error::{Error, Result};
pub use hash::Sha256Hash;
pub use id::Id128;
pub use types::*;
