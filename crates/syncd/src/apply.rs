//! Apply pipeline and conflict detection: fold an incoming operation
//! against the last locally-applied write for its `(table, row_pk)`,
//! using vector-clock causality to decide whether to apply, skip as
//! stale, or flag a conflict.
//!
//! A `VectorClock` comparison driving an apply/skip/conflict outcome is a
//! common shape for this kind of pipeline; this one works per-`(table,
//! row_pk)` granularity against a real relational store rather than
//! per-file.

use rusqlite::{params, Connection, OptionalExtension};
use sync_proto::clock::{ClockOrdering, VectorClock};
use sync_proto::id::Id128;
use sync_proto::types::{OpType, Operation};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("codec error: {0}")]
    Codec(#[from] sync_proto::Error),
    #[error("oplog error: {0}")]
    Oplog(#[from] crate::oplog::OplogError),
    #[error("conflict error: {0}")]
    Conflict(#[from] crate::conflict::ConflictError),
    #[error("capture error: {0}")]
    Capture(#[from] crate::capture::CaptureError),
    #[error("schema error: {0}")]
    Schema(#[from] crate::schema_migration::SchemaError),
    #[error("operation references row {0:?} with no registered primary-key columns")]
    NoPrimaryKey(String),
}

type Result<T> = std::result::Result<T, ApplyError>;

/// What happened when a single operation was applied.
#[derive(Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Mutated,
    /// Op predates the current row state; dropped per the causality rule.
    Stale,
    /// A conflict record was created; no mutation performed.
    ConflictDetected,
}

#[derive(Debug, Default)]
pub struct ApplyReport {
    pub mutated: usize,
    pub stale: usize,
    pub conflicts: usize,
}

/// Apply operations in the order produced by [`crate::ordering::total_order`],
/// recording each one to the log regardless of outcome, advancing the
/// local vector clock on every mutation.
pub fn apply_batch(
    conn: &Connection,
    ops: &[Operation],
    device: &mut crate::oplog::DeviceContext,
) -> Result<ApplyReport> {
    let mut report = ApplyReport::default();
    for op in ops {
        if op.is_local {
            continue;
        }
        crate::oplog::insert_operation(conn, op)?;
        let outcome = apply_one(conn, op)?;
        match outcome {
            ApplyOutcome::Mutated => {
                report.mutated += 1;
                crate::oplog::mark_applied(conn, &op.op_id, now_micros())?;
                device.observe_remote_clock(&op.vector_clock);
                supersede_resolved_conflicts(conn, op)?;
            }
            ApplyOutcome::Stale => report.stale += 1,
            ApplyOutcome::ConflictDetected => report.conflicts += 1,
        }
    }
    Ok(report)
}

fn apply_one(conn: &Connection, op: &Operation) -> Result<ApplyOutcome> {
    // A data op referencing a schema_version this table hasn't reached yet
    // fails without mutating, rather than writing columns that don't
    // exist locally.
    if op.op_type != OpType::SchemaMigration {
        if let Some(local_version) = crate::capture::schema_version_for_table(conn, &op.table_name)? {
            if op.schema_version > local_version {
                return Err(ApplyError::Schema(crate::schema_migration::SchemaError::AheadOfLocal(
                    op.op_id,
                    op.schema_version,
                )));
            }
        }
    }
    match op.op_type {
        OpType::Insert => apply_insert(conn, op),
        OpType::Update => apply_update_or_delete(conn, op, false),
        OpType::Delete => apply_update_or_delete(conn, op, true),
        OpType::SchemaMigration => {
            crate::schema_migration::apply_incoming(conn, op)?;
            Ok(ApplyOutcome::Mutated)
        }
    }
}

fn apply_insert(conn: &Connection, op: &Operation) -> Result<ApplyOutcome> {
    match last_local_write(conn, &op.table_name, &op.row_pk)? {
        None => {
            write_row(conn, op)?;
            Ok(ApplyOutcome::Mutated)
        }
        Some(prev) => {
            crate::conflict::record_conflict(
                conn,
                &op.table_name,
                &op.row_pk,
                prev.op_id,
                op.op_id,
                now_micros(),
            )?;
            Ok(ApplyOutcome::ConflictDetected)
        }
    }
}

fn apply_update_or_delete(conn: &Connection, op: &Operation, is_delete: bool) -> Result<ApplyOutcome> {
    let prev = match last_local_write(conn, &op.table_name, &op.row_pk)? {
        Some(p) => p,
        None => {
            // No local history for this row: nothing to conflict with,
            // apply directly.
            write_row(conn, op)?;
            return Ok(ApplyOutcome::Mutated);
        }
    };

    match prev.vector_clock.compare(&op.vector_clock) {
        ClockOrdering::Less | ClockOrdering::Equal => {
            if is_delete {
                delete_row(conn, op)?;
            } else {
                write_row(conn, op)?;
            }
            Ok(ApplyOutcome::Mutated)
        }
        ClockOrdering::Greater => Ok(ApplyOutcome::Stale),
        ClockOrdering::Concurrent => {
            crate::conflict::record_conflict(
                conn,
                &op.table_name,
                &op.row_pk,
                prev.op_id,
                op.op_id,
                now_micros(),
            )?;
            Ok(ApplyOutcome::ConflictDetected)
        }
    }
}

/// The most recently *applied* operation that mutated this (table,
/// row_pk), used as `prev` in the causality comparison. Ordered by
/// `applied_at` (this device's own clock, set when the op was applied)
/// rather than `created_at` (the originating device's clock, which is not
/// comparable across devices under clock skew) so `prev` always reflects
/// local application order. Only ops already marked applied count, since
/// a stale/conflicting op never changed row state.
fn last_local_write(conn: &Connection, table_name: &str, row_pk: &[u8]) -> Result<Option<Operation>> {
    let op_id_bytes: Option<[u8; 16]> = conn
        .query_row(
            "SELECT op_id FROM sync_operations
             WHERE table_name = ?1 AND row_pk = ?2 AND applied_at IS NOT NULL
             ORDER BY applied_at DESC LIMIT 1",
            params![table_name, row_pk],
            |row| row.get(0),
        )
        .optional()?;
    let Some(op_id_bytes) = op_id_bytes else {
        return Ok(None);
    };
    match crate::oplog::get_operation(conn, &Id128(op_id_bytes)) {
        Ok(op) => Ok(op),
        Err(crate::oplog::OplogError::Database(d)) => Err(ApplyError::Database(d)),
        Err(crate::oplog::OplogError::Codec(c)) => Err(ApplyError::Codec(c)),
    }
}

/// A pending conflict on this row is superseded, not just left unresolved
/// forever, once a later op causally follows both sides it recorded —
/// check every unresolved conflict on `(table, row_pk)` and resolve the
/// ones `op` now causally dominates.
fn supersede_resolved_conflicts(conn: &Connection, op: &Operation) -> Result<()> {
    let pending = crate::conflict::unresolved_for_row(conn, &op.table_name, &op.row_pk)?;
    for conflict in pending {
        let (Some(local_op), Some(remote_op)) = (
            crate::oplog::get_operation(conn, &conflict.local_op_id)?,
            crate::oplog::get_operation(conn, &conflict.remote_op_id)?,
        ) else {
            continue;
        };
        let local_superseded =
            matches!(local_op.vector_clock.compare(&op.vector_clock), ClockOrdering::Less | ClockOrdering::Equal);
        let remote_superseded =
            matches!(remote_op.vector_clock.compare(&op.vector_clock), ClockOrdering::Less | ClockOrdering::Equal);
        if local_superseded && remote_superseded {
            crate::conflict::mark_superseded(conn, conflict.conflict_id, op.op_id)?;
        }
    }
    Ok(())
}

/// Application-table row write is delegated to whichever module owns the
/// user's schema; the engine only tracks the generic materialized view in
/// `sync_operations` here and does not itself own arbitrary user tables
/// beyond writing through the decoded values when the table is one it
/// created (used by tests and by bundle replay of schema-less demo
/// tables). Real deployments apply via `INSERT OR REPLACE`/`UPDATE`
/// generated from `new_values`' column list against the user's own table.
fn write_row(conn: &Connection, op: &Operation) -> Result<()> {
    let Some(new_values) = op.new_values.as_deref() else {
        return Ok(());
    };
    let map = sync_proto::codec::decode_value_map(new_values)?;
    if map.is_empty() {
        return Ok(());
    }
    let columns: Vec<&str> = map.keys().map(|k| k.as_str()).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
        op.table_name,
        columns.join(", "),
        placeholders.join(", ")
    );
    let values: Vec<rusqlite::types::Value> = map.values().map(value_to_sql).collect();
    conn.execute(&sql, rusqlite::params_from_iter(values))?;
    Ok(())
}

fn delete_row(conn: &Connection, op: &Operation) -> Result<()> {
    let Some(enabled) = crate::capture::pk_columns_for_table(conn, &op.table_name)? else {
        return Ok(());
    };
    let pk_map = sync_proto::codec::decode_value_map(&op.row_pk)?;
    let conditions: Vec<String> = enabled
        .iter()
        .filter(|c| pk_map.contains_key(*c))
        .map(|c| format!("{c} = ?"))
        .collect();
    if conditions.is_empty() {
        return Ok(());
    }
    let values: Vec<rusqlite::types::Value> = enabled
        .iter()
        .filter_map(|c| pk_map.get(c))
        .map(value_to_sql)
        .collect();
    let sql = format!("DELETE FROM {} WHERE {}", op.table_name, conditions.join(" AND "));
    conn.execute(&sql, rusqlite::params_from_iter(values))?;
    Ok(())
}

fn value_to_sql(v: &sync_proto::codec::Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as SqlValue;
    use sync_proto::codec::Value;
    match v {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Real(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Blob(b) => SqlValue::Blob(b.clone()),
    }
}

fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_micros() as u64
}
