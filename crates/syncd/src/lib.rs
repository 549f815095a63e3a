//! syncd - embedded multi-master replication engine
//!
//! This crate provides:
//! - An append-only operation log captured from ordinary table writes via triggers
//! - Deterministic causal ordering and deduplication across peers
//! - Conflict detection and a pluggable resolver registry
//! - Crash-safe checkpointed apply and additive schema migrations
//! - A bundle file format and pluggable transport for peer exchange
//! - A scheduled sync loop driving that transport against known peers

pub mod apply;
pub mod bundle;
pub mod capture;
pub mod checkpoint;
pub mod config;
pub mod conflict;
pub mod device;
pub mod engine;
pub mod error;
pub mod oplog;
pub mod ordering;
pub mod peer;
pub mod schema;
pub mod schema_migration;
pub mod sync_loop;
pub mod transport;

pub use config::Cli;
pub use engine::{Engine, EngineStats};
pub use error::{EngineError, Result};
