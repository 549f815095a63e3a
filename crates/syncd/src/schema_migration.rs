//! Additive schema evolution: `ALTER TABLE ... ADD COLUMN` run inside a
//! transaction with progress recorded in a dedicated table, restricted to
//! the single first-class migration kind this engine supports —
//! `ADD_COLUMN` — and emitting a `SCHEMA_MIGRATION` [`Operation`] so the
//! change replicates to peers.

use rusqlite::{params, Connection};
use sync_proto::codec::{decode_value_map, Value};
use sync_proto::id::Id128;
use sync_proto::types::{Operation, SchemaMigration, SchemaMigrationKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("codec error: {0}")]
    Codec(#[from] sync_proto::Error),
    #[error("capture error: {0}")]
    Capture(#[from] crate::capture::CaptureError),
    #[error("oplog error: {0}")]
    Oplog(#[from] crate::oplog::OplogError),
    #[error("table {table} not enabled for sync")]
    TableNotEnabled { table: String },
    #[error(
        "incompatible schema for table {table}: remote version {remote_version} not reachable from local version {local_version}"
    )]
    Incompatible {
        table: String,
        local_version: u32,
        remote_version: u32,
    },
    #[error("operation {0} targets schema_version {1}, which is ahead of the locally applied migrations")]
    AheadOfLocal(Id128, u32),
}

type Result<T> = std::result::Result<T, SchemaError>;

/// Create a local `ADD_COLUMN` migration: alter the table, record it, and
/// return the `SCHEMA_MIGRATION` operation that replicates the change.
/// Runs inside a single transaction so a failed `ALTER TABLE` never leaves
/// a half-applied migration record behind.
pub fn create_addition(
    conn: &mut Connection,
    device: &mut crate::oplog::DeviceContext,
    table_name: &str,
    column_name: &str,
    column_type: &str,
    default_value: Option<Value>,
) -> Result<(SchemaMigration, Operation)> {
    let current_version = crate::capture::schema_version_for_table(conn, table_name)?
        .ok_or_else(|| SchemaError::TableNotEnabled { table: table_name.to_string() })?;
    let new_version = current_version + 1;

    let tx = conn.transaction()?;
    let default_sql = default_value
        .as_ref()
        .map(sql_literal)
        .unwrap_or_else(|| "NULL".to_string());
    tx.execute_batch(&format!(
        "ALTER TABLE {table_name} ADD COLUMN {column_name} {column_type} DEFAULT {default_sql};"
    ))?;

    let migration = SchemaMigration {
        migration_id: Id128::new(),
        table_name: table_name.to_string(),
        kind: SchemaMigrationKind::AddColumn,
        column_name: column_name.to_string(),
        column_type: column_type.to_string(),
        default_value: default_value.map(|v| encode_single(&v)).transpose()?,
        created_at: now_micros(),
        applied_at: Some(now_micros()),
    };
    insert_migration_record(&tx, &migration)?;
    crate::capture::set_schema_version(&tx, table_name, new_version)?;

    let row_pk = sync_proto::codec::encode_value_map(&migration_pk(&migration))?;
    let new_values = sync_proto::codec::encode_value_map(&migration_payload(&migration))?;
    let op = device.next_operation(
        table_name.to_string(),
        sync_proto::types::OpType::SchemaMigration,
        row_pk,
        None,
        Some(new_values),
        new_version,
    );
    crate::oplog::insert_operation(&tx, &op)?;
    tx.commit()?;

    Ok((migration, op))
}

/// Apply an incoming `SCHEMA_MIGRATION` operation: alter the table to
/// match, bump the local schema version, and record the migration.
/// Idempotent against replays of a migration already applied (by
/// migration_id), matching the log-level dedup for data operations.
pub fn apply_incoming(conn: &Connection, op: &Operation) -> Result<()> {
    let payload = op
        .new_values
        .as_deref()
        .ok_or_else(|| SchemaError::Incompatible {
            table: op.table_name.clone(),
            local_version: 0,
            remote_version: op.schema_version,
        })?;
    let map = decode_value_map(payload)?;
    let migration_id = match map.get("migration_id") {
        Some(Value::Blob(b)) if b.len() == 16 => {
            let mut arr = [0u8; 16];
            arr.copy_from_slice(b);
            Id128(arr)
        }
        _ => return Err(SchemaError::Codec(sync_proto::Error::MalformedCodec("missing migration_id".into()))),
    };
    if migration_already_applied(conn, migration_id)? {
        return Ok(());
    }

    let column_name = text_field(&map, "column_name")?;
    let column_type = text_field(&map, "column_type")?;
    let default_sql = match map.get("default_value") {
        Some(Value::Blob(b)) if !b.is_empty() => {
            let decoded = sync_proto::codec::decode_value_map(b).ok();
            decoded
                .and_then(|m| m.get("v").cloned())
                .map(|v| sql_literal(&v))
                .unwrap_or_else(|| "NULL".to_string())
        }
        _ => "NULL".to_string(),
    };

    conn.execute_batch(&format!(
        "ALTER TABLE {} ADD COLUMN {} {} DEFAULT {};",
        op.table_name, column_name, column_type, default_sql
    ))?;

    let migration = SchemaMigration {
        migration_id,
        table_name: op.table_name.clone(),
        kind: SchemaMigrationKind::AddColumn,
        column_name,
        column_type,
        default_value: None,
        created_at: op.created_at,
        applied_at: Some(now_micros()),
    };
    insert_migration_record(conn, &migration)?;
    crate::capture::set_schema_version(conn, &op.table_name, op.schema_version)?;
    Ok(())
}

/// `true` iff `local_version == remote_version`, or every version
/// between them is covered by an additive migration already applied
/// locally — i.e. `remote_version <= local_version`, since this engine
/// only ever moves a table's version forward one migration at a time and
/// keeps every prior migration's effect in place.
pub fn check_compatibility(conn: &Connection, table_name: &str, remote_version: u32) -> Result<bool> {
    let local_version = crate::capture::schema_version_for_table(conn, table_name)?
        .ok_or_else(|| SchemaError::TableNotEnabled { table: table_name.to_string() })?;
    Ok(remote_version <= local_version)
}

fn migration_already_applied(conn: &Connection, migration_id: Id128) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sync_schema_migrations WHERE migration_id = ?1)",
        params![migration_id.as_bytes()],
        |row| row.get(0),
    )?)
}

fn insert_migration_record(conn: &Connection, migration: &SchemaMigration) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_schema_migrations
            (migration_id, table_name, kind, column_name, column_type, default_value, created_at, applied_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            migration.migration_id.as_bytes(),
            migration.table_name,
            migration.kind.as_str(),
            migration.column_name,
            migration.column_type,
            migration.default_value,
            migration.created_at,
            migration.applied_at,
        ],
    )?;
    Ok(())
}

fn migration_pk(migration: &SchemaMigration) -> sync_proto::codec::ValueMap {
    let mut m = sync_proto::codec::ValueMap::new();
    m.insert("migration_id".into(), Value::Blob(migration.migration_id.as_bytes().to_vec()));
    m
}

fn migration_payload(migration: &SchemaMigration) -> sync_proto::codec::ValueMap {
    let mut m = sync_proto::codec::ValueMap::new();
    m.insert("migration_id".into(), Value::Blob(migration.migration_id.as_bytes().to_vec()));
    m.insert("column_name".into(), Value::Text(migration.column_name.clone()));
    m.insert("column_type".into(), Value::Text(migration.column_type.clone()));
    m.insert(
        "default_value".into(),
        migration.default_value.clone().map(Value::Blob).unwrap_or(Value::Null),
    );
    m
}

fn text_field(map: &sync_proto::codec::ValueMap, key: &str) -> Result<String> {
    match map.get(key) {
        Some(Value::Text(s)) => Ok(s.clone()),
        _ => Err(SchemaError::Codec(sync_proto::Error::MalformedCodec(format!("missing {key}")))),
    }
}

fn encode_single(v: &Value) -> std::result::Result<Vec<u8>, sync_proto::Error> {
    let mut m = sync_proto::codec::ValueMap::new();
    m.insert("v".into(), v.clone());
    sync_proto::codec::encode_value_map(&m)
}

fn sql_literal(v: &Value) -> String {
    match v {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Blob(b) => format!("x'{}'", hex::encode(b)),
    }
}

fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::enable_sync_for_table;
    use crate::oplog::DeviceContext;
    use crate::schema::open_in_memory;

    fn setup() -> Connection {
        let conn = open_in_memory().unwrap();
        crate::capture::init_staging(&conn).unwrap();
        conn.execute_batch("CREATE TABLE todos (id INTEGER PRIMARY KEY, title TEXT);").unwrap();
        enable_sync_for_table(&conn, "todos", &["id".to_string()], &["id".to_string(), "title".to_string()]).unwrap();
        conn
    }

    #[test]
    fn create_addition_alters_table_and_bumps_version() {
        let mut conn = setup();
        let mut device = DeviceContext::new(Id128::new());
        let (migration, op) = create_addition(
            &mut conn,
            &mut device,
            "todos",
            "priority",
            "INTEGER",
            Some(Value::Integer(0)),
        )
        .unwrap();
        assert_eq!(migration.column_name, "priority");
        assert_eq!(op.schema_version, 1);

        conn.execute("INSERT INTO todos (id, title, priority) VALUES (1, 'x', 5)", []).unwrap();
        let priority: i64 = conn.query_row("SELECT priority FROM todos WHERE id = 1", [], |r| r.get(0)).unwrap();
        assert_eq!(priority, 5);
        assert_eq!(crate::capture::schema_version_for_table(&conn, "todos").unwrap(), Some(1));
    }

    #[test]
    fn apply_incoming_is_idempotent_on_replay() {
        let mut conn = setup();
        let mut device = DeviceContext::new(Id128::new());
        let (_migration, op) = create_addition(&mut conn, &mut device, "todos", "priority", "INTEGER", None).unwrap();

        apply_incoming(&conn, &op).unwrap();
        apply_incoming(&conn, &op).unwrap();
    }

    #[test]
    fn check_compatibility_accepts_equal_or_lower_remote_version() {
        let mut conn = setup();
        let mut device = DeviceContext::new(Id128::new());
        create_addition(&mut conn, &mut device, "todos", "priority", "INTEGER", None).unwrap();

        assert!(check_compatibility(&conn, "todos", 1).unwrap());
        assert!(check_compatibility(&conn, "todos", 0).unwrap());
        assert!(!check_compatibility(&conn, "todos", 2).unwrap());
    }
}
