//! Top-level engine: owns the embedded connection and device identity,
//! and exposes the operations a front-end (CLI or otherwise) drives.
//!
//! Config, storage, and the operation log are bundled behind one struct
//! with `init`/`open`/`stats`, the way a long-running service typically
//! wraps its dependencies for a thin CLI front-end. This one has no
//! network listener of its own — a `Transport` is injected into
//! [`crate::sync_loop::SyncLoop`] separately, since discovery and
//! daemonization stay out of scope.

use crate::device;
use crate::error::{EngineError, Result};
use crate::oplog::DeviceContext;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use sync_proto::clock::VectorClock;
use sync_proto::id::Id128;
use sync_proto::types::{ConflictRecord, Device, Operation, Peer, SchemaMigration};

/// The connection and the in-memory clock-allocation state travel behind
/// one lock: every mutation that touches the log also ticks the device's
/// clock, so two separate mutexes would just invite them to drift apart.
pub struct Store {
    pub(crate) conn: Connection,
    pub(crate) device_ctx: DeviceContext,
}

#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub operation_count: u64,
    pub unresolved_conflicts: usize,
    pub peer_count: usize,
}

/// A single embedded-replication node: the opened store plus the local
/// device identity.
pub struct Engine {
    pub(crate) store: Arc<Mutex<Store>>,
    pub device: Device,
}

impl Engine {
    /// Initialize a brand-new store at `path` with a fresh device
    /// identity. Fails if the store already has one — identity is
    /// created once, immutable thereafter.
    pub fn init(path: impl AsRef<Path>, display_name: &str, enable_signing: bool) -> Result<Self> {
        let conn = crate::schema::open_store(path)?;
        crate::capture::init_staging(&conn)?;
        let (device, _keypair) =
            device::create(&conn, display_name, enable_signing).map_err(|e| EngineError::Validation(e.to_string()))?;
        let device_ctx = DeviceContext::new(device.device_id);
        Ok(Self {
            store: Arc::new(Mutex::new(Store { conn, device_ctx })),
            device,
        })
    }

    /// Open an already-initialized store, restoring clock-allocation state
    /// from the persisted log and recovering any checkpoint a prior crash
    /// left `in_progress`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = crate::schema::open_store(path)?;
        crate::capture::init_staging(&conn)?;
        let (device, _keypair) = device::require(&conn).map_err(|e| EngineError::Validation(e.to_string()))?;
        let device_ctx = restore_device_context(&conn, device.device_id)?;
        crate::checkpoint::recover(&conn)?;
        Ok(Self {
            store: Arc::new(Mutex::new(Store { conn, device_ctx })),
            device,
        })
    }

    /// Run arbitrary SQL against the store's single connection, e.g. to
    /// create or write an application table. Writes against a table opted
    /// into capture are automatically staged by its triggers; follow up
    /// with [`Engine::promote_captured`] to turn staged rows into log
    /// operations.
    pub fn with_connection<R>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<R>) -> Result<R> {
        let store = self.store.lock();
        Ok(f(&store.conn)?)
    }

    /// Import a bundle file directly into the local store, without a
    /// [`crate::transport::Transport`] round-trip (used by tests and by
    /// out-of-band bundle delivery).
    pub fn import_bundle_file(&self, path: impl AsRef<Path>) -> Result<crate::bundle::ImportReport> {
        let mut guard = self.store.lock();
        let store = &mut *guard;
        Ok(crate::bundle::import_bundle(&mut store.conn, &mut store.device_ctx, path)?)
    }

    /// Opt a user table into capture. Idempotent.
    pub fn enable_table(&self, table_name: &str, pk_columns: &[String], all_columns: &[String]) -> Result<()> {
        let store = self.store.lock();
        crate::capture::enable_sync_for_table(&store.conn, table_name, pk_columns, all_columns)?;
        Ok(())
    }

    /// Drain staged capture rows into the operation log. Call after every
    /// write transaction against an opted-in table.
    pub fn promote_captured(&self) -> Result<usize> {
        let mut guard = self.store.lock();
        let store = &mut *guard;
        let ops = crate::capture::promote_staged(&store.conn, &mut store.device_ctx)?;
        Ok(ops.len())
    }

    pub fn vector_clock(&self) -> VectorClock {
        self.store.lock().device_ctx.vector_clock().clone()
    }

    pub fn stats(&self) -> Result<EngineStats> {
        let store = self.store.lock();
        Ok(EngineStats {
            operation_count: crate::oplog::operation_count(&store.conn)?,
            unresolved_conflicts: crate::conflict::list_unresolved(&store.conn)?.len(),
            peer_count: crate::peer::list(&store.conn)?.len(),
        })
    }

    pub fn unresolved_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        Ok(crate::conflict::list_unresolved(&self.store.lock().conn)?)
    }

    /// Run `resolver` against a pending conflict, synthesizing and
    /// persisting the resulting local operation when it resolves.
    pub fn resolve_conflict(&self, conflict_id: Id128, resolver: &crate::conflict::ResolverKind) -> Result<Option<Operation>> {
        let mut guard = self.store.lock();
        let store = &mut *guard;
        let conflict = crate::conflict::get_conflict(&store.conn, conflict_id)?
            .ok_or_else(|| EngineError::Validation(format!("conflict {conflict_id} not found")))?;
        let local_op = crate::oplog::get_operation(&store.conn, &conflict.local_op_id)?;
        let remote_op = crate::oplog::get_operation(&store.conn, &conflict.remote_op_id)?;
        let (Some(local_op), Some(remote_op)) = (local_op, remote_op) else {
            return Err(EngineError::Validation("conflict references a missing operation".into()));
        };
        let local_row = crate::conflict::decode_row_values(&local_op)?;
        let remote_row = crate::conflict::decode_row_values(&remote_op)?;
        let ctx = crate::conflict::ConflictContext {
            conflict: &conflict,
            local_op: &local_op,
            remote_op: &remote_op,
            local_row: local_row.as_ref(),
            remote_row: remote_row.as_ref(),
        };
        let resolution = resolver.resolve(&ctx);
        let op = crate::conflict::apply_resolution(
            &store.conn,
            conflict_id,
            resolution,
            &mut store.device_ctx,
            &conflict.table_name,
            &conflict.row_pk,
        )?;
        Ok(op)
    }

    /// Create and replicate an additive schema migration.
    pub fn create_migration(
        &self,
        table_name: &str,
        column_name: &str,
        column_type: &str,
        default_value: Option<sync_proto::codec::Value>,
    ) -> Result<SchemaMigration> {
        let mut guard = self.store.lock();
        let store = &mut *guard;
        let (migration, _op) = crate::schema_migration::create_addition(
            &mut store.conn,
            &mut store.device_ctx,
            table_name,
            column_name,
            column_type,
            default_value,
        )?;
        Ok(migration)
    }

    pub fn register_peer(&self, peer_id: Id128, endpoint_hint: Option<&str>) -> Result<()> {
        Ok(crate::peer::register(&self.store.lock().conn, peer_id, endpoint_hint)?)
    }

    pub fn peers(&self) -> Result<Vec<Peer>> {
        Ok(crate::peer::list(&self.store.lock().conn)?)
    }

    /// Run a single bundle exchange against `peer_id` through `transport`,
    /// outside the scheduled sync loop (the CLI's `sync` subcommand).
    pub async fn sync_once<T: crate::transport::Transport>(&self, transport: &mut T, peer_id: Id128) -> Result<usize> {
        crate::sync_loop::sync_with_peer_once(&self.store, self.device.device_id, transport, peer_id).await
    }

    pub fn store_handle(&self) -> Arc<Mutex<Store>> {
        self.store.clone()
    }

    /// Write a bundle of every operation the peer at `peer_vector_clock`
    /// hasn't seen, without going through a [`crate::transport::Transport`]
    /// (the CLI's `snapshot` subcommand).
    pub fn generate_bundle_to(
        &self,
        peer_id: Id128,
        peer_vector_clock: &VectorClock,
        out_path: impl AsRef<Path>,
    ) -> Result<sync_proto::types::BundleManifest> {
        let store = self.store.lock();
        Ok(crate::bundle::generate_bundle(&store.conn, self.device.device_id, peer_id, peer_vector_clock, out_path)?)
    }
}

/// Rebuild a `DeviceContext`'s clock and per-device chain head from the
/// persisted log, so a restarted process neither reuses clock values nor
/// breaks the parent-chain invariant.
fn restore_device_context(conn: &Connection, device_id: Id128) -> Result<DeviceContext> {
    let ops = crate::oplog::get_new_operations(conn, &VectorClock::new())?;
    let mut clock = VectorClock::new();
    let mut last_op_id: Option<Id128> = None;
    let mut last_created_at = 0u64;
    for op in &ops {
        clock.merge(&op.vector_clock);
        if op.device_id == device_id && op.created_at >= last_created_at {
            last_created_at = op.created_at;
            last_op_id = Some(op.op_id);
        }
    }
    Ok(DeviceContext::restore(device_id, clock, last_op_id))
}
