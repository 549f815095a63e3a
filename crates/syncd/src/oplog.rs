//! The operation log: persistence for [`Operation`] rows, plus
//! [`DeviceContext`], the in-memory allocator that gives each locally
//! captured operation its `op_id`, ticked vector clock, and per-device
//! `parent_op_id` chain.
//!
//! An `Arc`-shared struct wrapping the store plus a cached version-vector
//! is a common shape for this kind of log; here it tracks the full causal
//! [`VectorClock`] rather than a flat per-replica counter.

use rusqlite::{params, Connection, OptionalExtension};
use sync_proto::clock::VectorClock;
use sync_proto::id::Id128;
use sync_proto::types::{OpType, Operation};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OplogError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("codec error: {0}")]
    Codec(#[from] sync_proto::Error),
}

type Result<T> = std::result::Result<T, OplogError>;

/// Per-device allocation state for locally captured operations: the
/// device's own vector clock plus the last op_id it produced (the head of
/// its per-device chain).
pub struct DeviceContext {
    pub device_id: Id128,
    clock: VectorClock,
    last_op_id: Option<Id128>,
}

impl DeviceContext {
    pub fn new(device_id: Id128) -> Self {
        Self {
            device_id,
            clock: VectorClock::new(),
            last_op_id: None,
        }
    }

    /// Restore allocation state from what's already on disk, so a
    /// restarted process doesn't reuse clock values or break the
    /// parent-chain invariant.
    pub fn restore(device_id: Id128, clock: VectorClock, last_op_id: Option<Id128>) -> Self {
        Self {
            device_id,
            clock,
            last_op_id,
        }
    }

    pub fn vector_clock(&self) -> &VectorClock {
        &self.clock
    }

    /// Allocate the next locally-captured operation: ticks this device's
    /// clock entry, chains off the previous op_id, and stamps
    /// `created_at`/`is_local`.
    pub fn next_operation(
        &mut self,
        table_name: String,
        op_type: OpType,
        row_pk: Vec<u8>,
        old_values: Option<Vec<u8>>,
        new_values: Option<Vec<u8>>,
        schema_version: u32,
    ) -> Operation {
        self.clock.increment(self.device_id);
        let op_id = Id128::new();
        let parent_op_id = self.last_op_id;
        self.last_op_id = Some(op_id);

        Operation {
            op_id,
            device_id: self.device_id,
            parent_op_id,
            vector_clock: self.clock.clone(),
            table_name,
            op_type,
            row_pk,
            old_values,
            new_values,
            schema_version,
            created_at: now_micros(),
            is_local: true,
            applied_at: None,
        }
    }

    /// Merge a remote device's clock contribution into our view of global
    /// causality, e.g. after importing a bundle.
    pub fn observe_remote_clock(&mut self, remote: &VectorClock) {
        self.clock.merge(remote);
    }
}

fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_micros() as u64
}

/// Persist an operation. The log is append-only and is the source of
/// truth regardless of whether the op ends up mutating user state —
/// conflicts are recorded separately.
pub fn insert_operation(conn: &Connection, op: &Operation) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_operations
            (op_id, device_id, parent_op_id, vector_clock, table_name, op_type,
             row_pk, old_values, new_values, schema_version, created_at, is_local, applied_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            op.op_id.as_bytes(),
            op.device_id.as_bytes(),
            op.parent_op_id.map(|id| *id.as_bytes()),
            op.vector_clock.encode()?,
            op.table_name,
            op.op_type.as_str(),
            op.row_pk,
            op.old_values,
            op.new_values,
            op.schema_version,
            op.created_at,
            op.is_local as i64,
            op.applied_at,
        ],
    )?;
    Ok(())
}

/// Mark an operation as applied at the given physical-microsecond
/// timestamp.
pub fn mark_applied(conn: &Connection, op_id: &Id128, applied_at: u64) -> Result<()> {
    conn.execute(
        "UPDATE sync_operations SET applied_at = ?1 WHERE op_id = ?2",
        params![applied_at, op_id.as_bytes()],
    )?;
    Ok(())
}

pub fn has_operation(conn: &Connection, op_id: &Id128) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sync_operations WHERE op_id = ?1)",
        params![op_id.as_bytes()],
        |row| row.get(0),
    )?;
    Ok(exists)
}

pub fn get_operation(conn: &Connection, op_id: &Id128) -> Result<Option<Operation>> {
    conn.query_row(
        "SELECT op_id, device_id, parent_op_id, vector_clock, table_name, op_type,
                row_pk, old_values, new_values, schema_version, created_at, is_local, applied_at
         FROM sync_operations WHERE op_id = ?1",
        params![op_id.as_bytes()],
        row_to_operation,
    )
    .optional()
    .map_err(OplogError::from)?
    .transpose()
}

/// Operations whose per-device counter exceeds `since_vc[device_id]`, for
/// every device — the streaming counterpart to `generate_bundle`.
pub fn get_new_operations(conn: &Connection, since_vc: &VectorClock) -> Result<Vec<Operation>> {
    let mut stmt = conn.prepare(
        "SELECT op_id, device_id, parent_op_id, vector_clock, table_name, op_type,
                row_pk, old_values, new_values, schema_version, created_at, is_local, applied_at
         FROM sync_operations ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map([], row_to_operation)?;
    let mut out = Vec::new();
    for row in rows {
        let op = row??;
        if op.vector_clock.get(&op.device_id) > since_vc.get(&op.device_id) {
            out.push(op);
        }
    }
    Ok(out)
}

pub fn operation_count(conn: &Connection) -> Result<u64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM sync_operations", [], |row| row.get(0))?)
}

fn row_to_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Operation>> {
    let op_id_bytes: [u8; 16] = row.get(0)?;
    let device_id_bytes: [u8; 16] = row.get(1)?;
    let parent_bytes: Option<[u8; 16]> = row.get(2)?;
    let vc_bytes: Vec<u8> = row.get(3)?;
    let op_type_str: String = row.get(5)?;

    Ok((|| -> Result<Operation> {
        Ok(Operation {
            op_id: Id128(op_id_bytes),
            device_id: Id128(device_id_bytes),
            parent_op_id: parent_bytes.map(Id128),
            vector_clock: VectorClock::decode(&vc_bytes)?,
            table_name: row.get(4)?,
            op_type: OpType::from_str(&op_type_str)
                .ok_or_else(|| sync_proto::Error::MalformedCodec(format!("unknown op_type {op_type_str}")))?,
            row_pk: row.get(6)?,
            old_values: row.get(7)?,
            new_values: row.get(8)?,
            schema_version: row.get(9)?,
            created_at: row.get(10)?,
            is_local: row.get::<_, i64>(11)? != 0,
            applied_at: row.get(12)?,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::open_in_memory;

    #[test]
    fn device_context_ticks_clock_and_chains_parent() {
        let mut ctx = DeviceContext::new(Id128::new());
        let op1 = ctx.next_operation("t".into(), OpType::Insert, vec![1], None, Some(vec![2]), 0);
        let op2 = ctx.next_operation("t".into(), OpType::Insert, vec![3], None, Some(vec![4]), 0);
        assert_eq!(op1.parent_op_id, None);
        assert_eq!(op2.parent_op_id, Some(op1.op_id));
        assert_eq!(op2.vector_clock.get(&ctx.device_id), 2);
    }

    #[test]
    fn insert_and_fetch_round_trips() {
        let conn = open_in_memory().unwrap();
        let mut ctx = DeviceContext::new(Id128::new());
        let op = ctx.next_operation("t".into(), OpType::Insert, vec![9], None, Some(vec![1, 2]), 0);
        insert_operation(&conn, &op).unwrap();

        assert!(has_operation(&conn, &op.op_id).unwrap());
        let fetched = get_operation(&conn, &op.op_id).unwrap().unwrap();
        assert_eq!(fetched.op_id, op.op_id);
        assert_eq!(fetched.table_name, "t");
    }

    #[test]
    fn get_new_operations_filters_by_device_counter() {
        let conn = open_in_memory().unwrap();
        let mut ctx = DeviceContext::new(Id128::new());
        let op1 = ctx.next_operation("t".into(), OpType::Insert, vec![1], None, Some(vec![1]), 0);
        insert_operation(&conn, &op1).unwrap();
        let op2 = ctx.next_operation("t".into(), OpType::Insert, vec![2], None, Some(vec![2]), 0);
        insert_operation(&conn, &op2).unwrap();

        let mut since = VectorClock::new();
        since.increment(ctx.device_id);
        let fresh = get_new_operations(&conn, &since).unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].op_id, op2.op_id);
    }

    #[test]
    fn mark_applied_persists_timestamp() {
        let conn = open_in_memory().unwrap();
        let mut ctx = DeviceContext::new(Id128::new());
        let op = ctx.next_operation("t".into(), OpType::Insert, vec![1], None, Some(vec![1]), 0);
        insert_operation(&conn, &op).unwrap();
        mark_applied(&conn, &op.op_id, 42).unwrap();
        let fetched = get_operation(&conn, &op.op_id).unwrap().unwrap();
        assert_eq!(fetched.applied_at, Some(42));
    }
}
