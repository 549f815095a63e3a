//! Trigger-based operation capture.
//!
//! `rusqlite` gives us real tables and triggers but no hook for building an
//! [`Operation`] (device id, vector clock, codec-encoded values) from
//! inside a trigger body — SQLite forbids a second write against the same
//! connection while a trigger's statement is still executing. So capture
//! is two-phase, staying inside the user's own transaction the whole time:
//!
//! 1. A trigger (`AFTER INSERT/UPDATE/DELETE`, plain SQL, no custom
//!    functions) appends a raw row diff to `sync_capture_staging`, using
//!    `json_object(...)` over the table's known columns.
//! 2. Immediately after the user's statement returns, [`promote_staged`]
//!    drains that staging table in sequence order and turns each row into
//!    a fully-formed `Operation`, assigning `op_id`, the device's ticked
//!    vector clock, and the per-device `parent_op_id` chain.
//!
//! Both phases run before the caller commits, so a rollback of the user's
//! statement rolls back the captured operation too — the same guarantee
//! a log writer gets from writing straight into its own change table
//! inside the caller's transaction.

use crate::oplog::DeviceContext;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value as JsonValue;
use sync_proto::codec::{encode_value_map, Value, ValueMap};
use sync_proto::types::{OpType, Operation};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("codec error: {0}")]
    Codec(#[from] sync_proto::Error),
    #[error("malformed staged row: {0}")]
    MalformedStagedRow(String),
    #[error("table {0} has no primary key columns configured")]
    NoPrimaryKey(String),
    #[error("oplog error: {0}")]
    Oplog(#[from] crate::oplog::OplogError),
}

type Result<T> = std::result::Result<T, CaptureError>;

/// Register the staging table. Idempotent; called once at engine open.
pub fn init_staging(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sync_capture_staging (
            seq        INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            op_type    TEXT NOT NULL,
            pk_json    TEXT NOT NULL,
            old_json   TEXT,
            new_json   TEXT
        );",
    )
}

/// Opt a user table into capture. `pk_columns` and `all_columns` must list
/// every column present on `table_name`; `all_columns` drives the
/// `json_object` expressions the triggers use to snapshot a row.
///
/// Idempotent: re-running against an already-enabled table is a no-op, so
/// `Engine::open` can call this unconditionally for every configured table.
pub fn enable_sync_for_table(
    conn: &Connection,
    table_name: &str,
    pk_columns: &[String],
    all_columns: &[String],
) -> Result<()> {
    if pk_columns.is_empty() {
        return Err(CaptureError::NoPrimaryKey(table_name.to_string()));
    }

    let already_enabled: bool = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sync_enabled_tables WHERE table_name = ?1)",
            params![table_name],
            |row| row.get(0),
        )?;
    if already_enabled {
        return Ok(());
    }

    let pk_json_expr = |prefix: &str| json_object_expr(prefix, pk_columns);
    let row_json_expr = |prefix: &str| json_object_expr(prefix, all_columns);

    conn.execute(
        "INSERT INTO sync_enabled_tables (table_name, pk_columns) VALUES (?1, ?2)",
        params![table_name, pk_columns.join(",")],
    )?;

    conn.execute_batch(&format!(
        "CREATE TRIGGER trg_{table}_sync_ai AFTER INSERT ON {table} BEGIN
            INSERT INTO sync_capture_staging (table_name, op_type, pk_json, old_json, new_json)
            VALUES ('{table}', 'INSERT', {pk_new}, NULL, {row_new});
        END;
        CREATE TRIGGER trg_{table}_sync_au AFTER UPDATE ON {table} BEGIN
            INSERT INTO sync_capture_staging (table_name, op_type, pk_json, old_json, new_json)
            VALUES ('{table}', 'UPDATE', {pk_new}, {row_old}, {row_new});
        END;
        CREATE TRIGGER trg_{table}_sync_ad AFTER DELETE ON {table} BEGIN
            INSERT INTO sync_capture_staging (table_name, op_type, pk_json, old_json, new_json)
            VALUES ('{table}', 'DELETE', {pk_old}, {row_old}, NULL);
        END;",
        table = table_name,
        pk_new = pk_json_expr("NEW"),
        pk_old = pk_json_expr("OLD"),
        row_new = row_json_expr("NEW"),
        row_old = row_json_expr("OLD"),
    ))?;

    Ok(())
}

/// Primary-key columns registered for `table_name` via
/// [`enable_sync_for_table`], or `None` if the table was never enabled.
pub fn pk_columns_for_table(conn: &Connection, table_name: &str) -> Result<Option<Vec<String>>> {
    let pk_csv: Option<String> = conn
        .query_row(
            "SELECT pk_columns FROM sync_enabled_tables WHERE table_name = ?1",
            params![table_name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(pk_csv.map(|csv| csv.split(',').map(|s| s.to_string()).collect()))
}

/// Current local schema version for an enabled table, or `None` if the
/// table was never enabled.
pub fn schema_version_for_table(conn: &Connection, table_name: &str) -> Result<Option<u32>> {
    Ok(conn
        .query_row(
            "SELECT schema_version FROM sync_enabled_tables WHERE table_name = ?1",
            params![table_name],
            |row| row.get(0),
        )
        .optional()?)
}

/// Bump the locally recorded schema version after an additive migration.
/// Called by `schema_migration::apply_addition` inside the caller's
/// transaction, never directly by capture callers.
pub fn set_schema_version(conn: &Connection, table_name: &str, version: u32) -> Result<()> {
    conn.execute(
        "UPDATE sync_enabled_tables SET schema_version = ?1 WHERE table_name = ?2",
        params![version, table_name],
    )?;
    Ok(())
}

fn json_object_expr(prefix: &str, columns: &[String]) -> String {
    let pairs: Vec<String> = columns
        .iter()
        .map(|c| format!("'{c}', {prefix}.{c}"))
        .collect();
    format!("json_object({})", pairs.join(", "))
}

/// Drain `sync_capture_staging` in sequence order, converting each staged
/// diff into a persisted [`Operation`] against `device`'s clock.
pub fn promote_staged(conn: &Connection, device: &mut DeviceContext) -> Result<Vec<Operation>> {
    let mut stmt = conn.prepare(
        "SELECT seq, table_name, op_type, pk_json, old_json, new_json
         FROM sync_capture_staging ORDER BY seq ASC",
    )?;
    let rows: Vec<(i64, String, String, String, Option<String>, Option<String>)> = stmt
        .query_map([], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        })?
        .collect::<rusqlite::Result<_>>()?;
    drop(stmt);

    let mut produced = Vec::with_capacity(rows.len());
    for (seq, table_name, op_type_str, pk_json, old_json, new_json) in rows {
        let op_type = OpType::from_str(&op_type_str)
            .ok_or_else(|| CaptureError::MalformedStagedRow(format!("unknown op_type {op_type_str}")))?;
        let row_pk = encode_value_map(&json_to_value_map(&pk_json)?)?;
        let old_values = old_json.as_deref().map(json_to_value_map).transpose()?
            .map(|m| encode_value_map(&m)).transpose()?;
        let new_values = new_json.as_deref().map(json_to_value_map).transpose()?
            .map(|m| encode_value_map(&m)).transpose()?;

        let schema_version = schema_version_for_table(conn, &table_name)?.unwrap_or(0);
        let op = device.next_operation(table_name, op_type, row_pk, old_values, new_values, schema_version);
        crate::oplog::insert_operation(conn, &op)?;
        conn.execute("DELETE FROM sync_capture_staging WHERE seq = ?1", params![seq])?;
        produced.push(op);
    }
    Ok(produced)
}

fn json_to_value_map(text: &str) -> Result<ValueMap> {
    let parsed: JsonValue = serde_json::from_str(text)
        .map_err(|e| CaptureError::MalformedStagedRow(e.to_string()))?;
    let object = parsed
        .as_object()
        .ok_or_else(|| CaptureError::MalformedStagedRow("expected JSON object".into()))?;
    let mut map = ValueMap::new();
    for (key, value) in object {
        map.insert(key.clone(), json_to_value(value)?);
    }
    Ok(map)
}

fn json_to_value(value: &JsonValue) -> Result<Value> {
    Ok(match value {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Integer(*b as i64),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i)
            } else if let Some(f) = n.as_f64() {
                Value::Real(f)
            } else {
                return Err(CaptureError::MalformedStagedRow(format!("unrepresentable number {n}")));
            }
        }
        JsonValue::String(s) => Value::Text(s.clone()),
        other => return Err(CaptureError::MalformedStagedRow(format!("unsupported JSON value {other}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::open_in_memory;
    use sync_proto::Id128;

    fn setup() -> (Connection, DeviceContext) {
        let conn = open_in_memory().unwrap();
        init_staging(&conn).unwrap();
        conn.execute_batch("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT);")
            .unwrap();
        let device = DeviceContext::new(Id128::new());
        (conn, device)
    }

    #[test]
    fn insert_is_captured_and_promoted() {
        let (conn, mut device) = setup();
        enable_sync_for_table(
            &conn,
            "notes",
            &["id".to_string()],
            &["id".to_string(), "body".to_string()],
        )
        .unwrap();

        conn.execute("INSERT INTO notes (id, body) VALUES (1, 'hello')", [])
            .unwrap();
        let ops = promote_staged(&conn, &mut device).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op_type, OpType::Insert);
        assert_eq!(ops[0].table_name, "notes");
        assert!(ops[0].old_values.is_none());
        assert!(ops[0].new_values.is_some());
    }

    #[test]
    fn update_captures_both_old_and_new() {
        let (conn, mut device) = setup();
        enable_sync_for_table(
            &conn,
            "notes",
            &["id".to_string()],
            &["id".to_string(), "body".to_string()],
        )
        .unwrap();
        conn.execute("INSERT INTO notes (id, body) VALUES (1, 'hello')", [])
            .unwrap();
        promote_staged(&conn, &mut device).unwrap();

        conn.execute("UPDATE notes SET body = 'world' WHERE id = 1", [])
            .unwrap();
        let ops = promote_staged(&conn, &mut device).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op_type, OpType::Update);
        assert!(ops[0].old_values.is_some());
        assert!(ops[0].new_values.is_some());
    }

    #[test]
    fn enable_sync_for_table_is_idempotent() {
        let (conn, _device) = setup();
        enable_sync_for_table(&conn, "notes", &["id".to_string()], &["id".to_string(), "body".to_string()]).unwrap();
        enable_sync_for_table(&conn, "notes", &["id".to_string()], &["id".to_string(), "body".to_string()]).unwrap();
    }

    #[test]
    fn rollback_discards_staged_capture() {
        let (mut conn, mut device) = setup();
        enable_sync_for_table(&conn, "notes", &["id".to_string()], &["id".to_string(), "body".to_string()]).unwrap();

        let tx = conn.transaction().unwrap();
        tx.execute("INSERT INTO notes (id, body) VALUES (1, 'x')", []).unwrap();
        tx.rollback().unwrap();

        let ops = promote_staged(&conn, &mut device).unwrap();
        assert!(ops.is_empty());
    }
}
