//! Embedded-store schema: the internal tables backing the replication
//! engine, plus connection setup. Created once at
//! [`crate::engine::Engine::open`] via a single
//! `CREATE TABLE IF NOT EXISTS` batch.

use rusqlite::Connection;
use std::path::Path;

/// Open (creating if necessary) the embedded store at `path` and apply the
/// internal schema. WAL mode matches the "single exclusive writer, many
/// point-in-time readers" resource policy this engine relies on.
pub fn open_store(path: impl AsRef<Path>) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    apply_internal_schema(&conn)?;
    Ok(conn)
}

/// Open an in-memory store, used by tests and by `import_bundle`'s staging
/// step before the destination connection is known.
pub fn open_in_memory() -> rusqlite::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    apply_internal_schema(&conn)?;
    Ok(conn)
}

fn apply_internal_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sync_operations (
            op_id           BLOB PRIMARY KEY,
            device_id       BLOB NOT NULL,
            parent_op_id    BLOB,
            vector_clock    BLOB NOT NULL,
            table_name      TEXT NOT NULL,
            op_type         TEXT NOT NULL,
            row_pk          BLOB NOT NULL,
            old_values      BLOB,
            new_values      BLOB,
            schema_version  INTEGER NOT NULL,
            created_at      INTEGER NOT NULL,
            is_local        INTEGER NOT NULL,
            applied_at      INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_sync_operations_device
            ON sync_operations(device_id);
        CREATE INDEX IF NOT EXISTS idx_sync_operations_row
            ON sync_operations(table_name, row_pk);

        CREATE TABLE IF NOT EXISTS sync_conflicts (
            conflict_id       BLOB PRIMARY KEY,
            table_name        TEXT NOT NULL,
            row_pk            BLOB NOT NULL,
            local_op_id       BLOB NOT NULL,
            remote_op_id      BLOB NOT NULL,
            detected_at       INTEGER NOT NULL,
            resolution_state  TEXT NOT NULL,
            resolved_by       TEXT,
            winning_op_id     BLOB
        );

        CREATE TABLE IF NOT EXISTS sync_vector_clock (
            device_id BLOB PRIMARY KEY,
            counter   INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_device (
            id           INTEGER PRIMARY KEY CHECK (id = 0),
            device_id    BLOB NOT NULL,
            display_name TEXT NOT NULL,
            public_key   BLOB,
            seed         BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_enabled_tables (
            table_name      TEXT PRIMARY KEY,
            pk_columns      TEXT NOT NULL,
            schema_version  INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS sync_checkpoints (
            checkpoint_id         BLOB PRIMARY KEY,
            started_at            INTEGER NOT NULL,
            last_applied_op_id    BLOB,
            vector_clock_at_start BLOB NOT NULL,
            status                TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_schema_migrations (
            migration_id    BLOB PRIMARY KEY,
            table_name      TEXT NOT NULL,
            kind            TEXT NOT NULL,
            column_name     TEXT NOT NULL,
            column_type     TEXT NOT NULL,
            default_value   BLOB,
            created_at      INTEGER NOT NULL,
            applied_at      INTEGER
        );

        CREATE TABLE IF NOT EXISTS imported_bundles (
            bundle_id   BLOB PRIMARY KEY,
            imported_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_peers (
            peer_id                    BLOB PRIMARY KEY,
            last_seen                  INTEGER,
            last_sync_at               INTEGER,
            last_sent_vector_clock     BLOB,
            last_received_vector_clock BLOB,
            endpoint_hint              TEXT
        );
        ",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_all_nine_internal_tables() {
        let conn = open_in_memory().unwrap();
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name LIKE 'sync_%' OR name = 'imported_bundles'")
            .unwrap();
        let names: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        for expected in [
            "sync_operations",
            "sync_conflicts",
            "sync_vector_clock",
            "sync_device",
            "sync_enabled_tables",
            "sync_checkpoints",
            "sync_schema_migrations",
            "imported_bundles",
            "sync_peers",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing table {expected}");
        }
    }

    #[test]
    fn open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        open_store(&path).unwrap();
        open_store(&path).unwrap();
    }
}
