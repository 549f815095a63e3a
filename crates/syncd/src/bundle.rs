//! Bundle generation and import.
//!
//! A bundle is a second SQLite file — its own `bundle_manifest` /
//! `bundle_operations` / `bundle_schema_snapshot` tables — built with
//! the same `schema::open_store`-style connection the main store uses, so
//! writing and reading a bundle reuses ordinary `rusqlite` rows rather than
//! a bespoke wire format.

use rusqlite::{params, Connection};
use std::path::Path;
use sync_proto::clock::VectorClock;
use sync_proto::hash::Sha256Hash;
use sync_proto::id::Id128;
use sync_proto::types::{BundleManifest, Operation, SchemaSnapshotEntry};
use thiserror::Error;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("codec error: {0}")]
    Codec(#[from] sync_proto::Error),
    #[error("schema error: {0}")]
    Schema(#[from] crate::schema_migration::SchemaError),
    #[error("capture error: {0}")]
    Capture(#[from] crate::capture::CaptureError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] crate::checkpoint::CheckpointError),
    #[error("oplog error: {0}")]
    Oplog(#[from] crate::oplog::OplogError),
    #[error("bundle integrity check failed: expected {expected}, computed {computed}")]
    HashMismatch { expected: String, computed: String },
    #[error("bundle format version {0} is not supported (expected {FORMAT_VERSION})")]
    UnsupportedFormatVersion(u32),
    #[error("bundle references table {0}, which is not enabled locally")]
    UnknownTable(String),
}

type Result<T> = std::result::Result<T, BundleError>;

#[derive(Debug)]
pub struct ImportReport {
    pub bundle_id: Id128,
    pub applied_count: usize,
    pub skipped: bool,
}

/// Build a bundle file at `out_path` containing every op the peer hasn't
/// seen, per its last-known vector clock.
pub fn generate_bundle(
    conn: &Connection,
    source_device_id: Id128,
    peer_device_id: Id128,
    peer_vector_clock: &VectorClock,
    out_path: impl AsRef<Path>,
) -> Result<BundleManifest> {
    let pending = crate::oplog::get_new_operations(conn, peer_vector_clock)?;
    let ops = crate::ordering::total_order(pending);

    let schema_snapshot = schema_snapshot_for(conn, &ops)?;

    let bundle_id = Id128::new();
    let created_at = now_micros();
    let op_count = ops.len() as u32;
    let causal_summary = local_causal_summary(&ops);
    let sha256 = content_hash(
        bundle_id,
        source_device_id,
        peer_device_id,
        created_at,
        FORMAT_VERSION,
        op_count,
        &causal_summary,
        &ops,
        &schema_snapshot,
    )?;

    let manifest = BundleManifest {
        bundle_id,
        source_device_id,
        peer_device_id,
        created_at,
        format_version: FORMAT_VERSION,
        op_count,
        causal_summary,
        sha256: sha256.0,
    };

    let bundle_conn = Connection::open(out_path)?;
    init_bundle_schema(&bundle_conn)?;
    write_manifest(&bundle_conn, &manifest)?;
    for op in &ops {
        write_bundle_operation(&bundle_conn, op)?;
    }
    for entry in &schema_snapshot {
        write_schema_entry(&bundle_conn, entry)?;
    }

    Ok(manifest)
}

/// Read and apply a bundle into the local store. Re-importing the same
/// `bundle_id` is a no-op, tracked via `imported_bundles`.
pub fn import_bundle(
    conn: &mut Connection,
    device: &mut crate::oplog::DeviceContext,
    bundle_path: impl AsRef<Path>,
) -> Result<ImportReport> {
    let bundle_conn = Connection::open(bundle_path)?;
    let manifest = read_manifest(&bundle_conn)?;

    if already_imported(conn, manifest.bundle_id)? {
        return Ok(ImportReport {
            bundle_id: manifest.bundle_id,
            applied_count: 0,
            skipped: true,
        });
    }

    if manifest.format_version != FORMAT_VERSION {
        return Err(BundleError::UnsupportedFormatVersion(manifest.format_version));
    }

    let ops = read_bundle_operations(&bundle_conn)?;
    let schema_snapshot = read_schema_snapshot(&bundle_conn)?;

    let computed = content_hash(
        manifest.bundle_id,
        manifest.source_device_id,
        manifest.peer_device_id,
        manifest.created_at,
        manifest.format_version,
        manifest.op_count,
        &manifest.causal_summary,
        &ops,
        &schema_snapshot,
    )?;
    if computed.0 != manifest.sha256 {
        return Err(BundleError::HashMismatch {
            expected: hex::encode(manifest.sha256),
            computed: hex::encode(computed.0),
        });
    }

    for entry in &schema_snapshot {
        let compatible = crate::schema_migration::check_compatibility(conn, &entry.table_name, entry.schema_version)
            .map_err(|e| match e {
                crate::schema_migration::SchemaError::TableNotEnabled { table } => {
                    BundleError::UnknownTable(table)
                }
                other => BundleError::Schema(other),
            })?;
        if !compatible {
            return Err(BundleError::Schema(crate::schema_migration::SchemaError::Incompatible {
                table: entry.table_name.clone(),
                local_version: crate::capture::schema_version_for_table(conn, &entry.table_name)?.unwrap_or(0),
                remote_version: entry.schema_version,
            }));
        }
    }

    let dedup_target = device.vector_clock().clone();
    let fresh = crate::ordering::dedup(ops, &dedup_target, |op_id| {
        crate::oplog::has_operation(conn, op_id).unwrap_or(false)
    });
    let ordered = crate::ordering::total_order(fresh);

    let report = crate::checkpoint::run_checkpointed(conn, &ordered, device)?;
    conn.execute(
        "INSERT INTO imported_bundles (bundle_id, imported_at) VALUES (?1, ?2)",
        params![manifest.bundle_id.as_bytes(), now_micros()],
    )?;

    Ok(ImportReport {
        bundle_id: manifest.bundle_id,
        applied_count: report.mutated,
        skipped: false,
    })
}

fn already_imported(conn: &Connection, bundle_id: Id128) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM imported_bundles WHERE bundle_id = ?1)",
            params![bundle_id.as_bytes()],
            |row| row.get(0),
        )?)
}

fn schema_snapshot_for(conn: &Connection, ops: &[Operation]) -> Result<Vec<SchemaSnapshotEntry>> {
    let mut tables: Vec<String> = ops.iter().map(|op| op.table_name.clone()).collect();
    tables.sort();
    tables.dedup();

    let mut entries = Vec::with_capacity(tables.len());
    for table_name in tables {
        let schema_version = crate::capture::schema_version_for_table(conn, &table_name)?.unwrap_or(0);
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({table_name})"))?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<_>>()?;
        entries.push(SchemaSnapshotEntry {
            table_name,
            schema_version,
            columns,
        });
    }
    Ok(entries)
}

/// Hash over the canonical encoding of every manifest field except
/// `sha256` itself, followed by the bundled ops (in their fixed total
/// order) and the schema snapshot, so two implementations fed the same
/// logical bundle compute the same digest regardless of container
/// representation or raw page layout.
#[allow(clippy::too_many_arguments)]
fn content_hash(
    bundle_id: Id128,
    source_device_id: Id128,
    peer_device_id: Id128,
    created_at: u64,
    format_version: u32,
    op_count: u32,
    causal_summary: &VectorClock,
    ops: &[Operation],
    schema_snapshot: &[SchemaSnapshotEntry],
) -> Result<Sha256Hash> {
    let mut chunks: Vec<Vec<u8>> = Vec::with_capacity(ops.len() + schema_snapshot.len() + 7);
    chunks.push(bundle_id.as_bytes().to_vec());
    chunks.push(source_device_id.as_bytes().to_vec());
    chunks.push(peer_device_id.as_bytes().to_vec());
    chunks.push(created_at.to_le_bytes().to_vec());
    chunks.push(format_version.to_le_bytes().to_vec());
    chunks.push(op_count.to_le_bytes().to_vec());
    chunks.push(causal_summary.encode()?);
    for op in ops {
        chunks.push(postcard::to_allocvec(op).map_err(sync_proto::Error::Serialization)?);
    }
    for entry in schema_snapshot {
        chunks.push(postcard::to_allocvec(entry).map_err(sync_proto::Error::Serialization)?);
    }
    Ok(Sha256Hash::of_chunks(chunks.iter().map(|c| c.as_slice())))
}

/// The vector clock reachable from the bundled ops alone — the
/// `causal_summary` a receiver can fold into its own view once every op
/// in the bundle is applied.
fn local_causal_summary(ops: &[Operation]) -> VectorClock {
    let mut vc = VectorClock::new();
    for op in ops {
        vc.merge(&op.vector_clock);
    }
    vc
}

fn init_bundle_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS bundle_manifest (
            bundle_id         BLOB PRIMARY KEY,
            source_device_id  BLOB NOT NULL,
            peer_device_id    BLOB NOT NULL,
            created_at        INTEGER NOT NULL,
            format_version    INTEGER NOT NULL,
            op_count          INTEGER NOT NULL,
            causal_summary    BLOB NOT NULL,
            sha256            BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS bundle_operations (
            seq             INTEGER PRIMARY KEY,
            op_id           BLOB NOT NULL,
            device_id       BLOB NOT NULL,
            parent_op_id    BLOB,
            vector_clock    BLOB NOT NULL,
            table_name      TEXT NOT NULL,
            op_type         TEXT NOT NULL,
            row_pk          BLOB NOT NULL,
            old_values      BLOB,
            new_values      BLOB,
            schema_version  INTEGER NOT NULL,
            created_at      INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS bundle_schema_snapshot (
            table_name      TEXT PRIMARY KEY,
            schema_version  INTEGER NOT NULL,
            columns_blob    TEXT NOT NULL
        );",
    )
}

fn write_manifest(conn: &Connection, manifest: &BundleManifest) -> Result<()> {
    conn.execute(
        "INSERT INTO bundle_manifest
            (bundle_id, source_device_id, peer_device_id, created_at, format_version, op_count, causal_summary, sha256)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            manifest.bundle_id.as_bytes(),
            manifest.source_device_id.as_bytes(),
            manifest.peer_device_id.as_bytes(),
            manifest.created_at,
            manifest.format_version,
            manifest.op_count,
            manifest.causal_summary.encode()?,
            manifest.sha256.to_vec(),
        ],
    )?;
    Ok(())
}

fn read_manifest(conn: &Connection) -> Result<BundleManifest> {
    conn.query_row(
        "SELECT bundle_id, source_device_id, peer_device_id, created_at, format_version,
                op_count, causal_summary, sha256
         FROM bundle_manifest LIMIT 1",
        [],
        |row| {
            let bundle_id: [u8; 16] = row.get(0)?;
            let source: [u8; 16] = row.get(1)?;
            let peer: [u8; 16] = row.get(2)?;
            let causal_bytes: Vec<u8> = row.get(6)?;
            let sha_bytes: Vec<u8> = row.get(7)?;
            Ok((bundle_id, source, peer, row.get::<_, u64>(3)?, row.get::<_, u32>(4)?, row.get::<_, u32>(5)?, causal_bytes, sha_bytes))
        },
    )
    .map_err(BundleError::from)
    .and_then(|(bundle_id, source, peer, created_at, format_version, op_count, causal_bytes, sha_bytes)| {
        let mut sha = [0u8; 32];
        sha.copy_from_slice(&sha_bytes);
        Ok(BundleManifest {
            bundle_id: Id128(bundle_id),
            source_device_id: Id128(source),
            peer_device_id: Id128(peer),
            created_at,
            format_version,
            op_count,
            causal_summary: VectorClock::decode(&causal_bytes)?,
            sha256: sha,
        })
    })
}

fn write_bundle_operation(conn: &Connection, op: &Operation) -> Result<()> {
    conn.execute(
        "INSERT INTO bundle_operations
            (op_id, device_id, parent_op_id, vector_clock, table_name, op_type,
             row_pk, old_values, new_values, schema_version, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
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
        ],
    )?;
    Ok(())
}

fn read_bundle_operations(conn: &Connection) -> Result<Vec<Operation>> {
    let mut stmt = conn.prepare(
        "SELECT op_id, device_id, parent_op_id, vector_clock, table_name, op_type,
                row_pk, old_values, new_values, schema_version, created_at
         FROM bundle_operations ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        let op_id: [u8; 16] = row.get(0)?;
        let device_id: [u8; 16] = row.get(1)?;
        let parent: Option<[u8; 16]> = row.get(2)?;
        let vc_bytes: Vec<u8> = row.get(3)?;
        let op_type_str: String = row.get(5)?;
        Ok((op_id, device_id, parent, vc_bytes, row.get::<_, String>(4)?, op_type_str, row.get::<_, Vec<u8>>(6)?,
            row.get::<_, Option<Vec<u8>>>(7)?, row.get::<_, Option<Vec<u8>>>(8)?, row.get::<_, u32>(9)?, row.get::<_, u64>(10)?))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (op_id, device_id, parent, vc_bytes, table_name, op_type_str, row_pk, old_values, new_values, schema_version, created_at) = row?;
        out.push(Operation {
            op_id: Id128(op_id),
            device_id: Id128(device_id),
            parent_op_id: parent.map(Id128),
            vector_clock: VectorClock::decode(&vc_bytes)?,
            table_name,
            op_type: sync_proto::types::OpType::from_str(&op_type_str)
                .ok_or_else(|| sync_proto::Error::MalformedCodec(format!("unknown op_type {op_type_str}")))?,
            row_pk,
            old_values,
            new_values,
            schema_version,
            created_at,
            is_local: false,
            applied_at: None,
        });
    }
    Ok(out)
}

fn write_schema_entry(conn: &Connection, entry: &SchemaSnapshotEntry) -> Result<()> {
    let columns_blob = entry.columns.join(",");
    conn.execute(
        "INSERT INTO bundle_schema_snapshot (table_name, schema_version, columns_blob) VALUES (?1, ?2, ?3)",
        params![entry.table_name, entry.schema_version, columns_blob],
    )?;
    Ok(())
}

fn read_schema_snapshot(conn: &Connection) -> Result<Vec<SchemaSnapshotEntry>> {
    let mut stmt = conn.prepare("SELECT table_name, schema_version, columns_blob FROM bundle_schema_snapshot")?;
    let rows = stmt.query_map([], |row| {
        let columns_blob: String = row.get(2)?;
        Ok(SchemaSnapshotEntry {
            table_name: row.get(0)?,
            schema_version: row.get(1)?,
            columns: columns_blob.split(',').filter(|s| !s.is_empty()).map(|s| s.to_string()).collect(),
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
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

    fn setup_store() -> (Connection, DeviceContext) {
        let conn = open_in_memory().unwrap();
        crate::capture::init_staging(&conn).unwrap();
        conn.execute_batch("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT);").unwrap();
        enable_sync_for_table(&conn, "notes", &["id".to_string()], &["id".to_string(), "body".to_string()]).unwrap();
        let device = DeviceContext::new(Id128::new());
        (conn, device)
    }

    #[test]
    fn generate_then_import_applies_all_ops() {
        let (conn_a, mut device_a) = setup_store();
        conn_a.execute("INSERT INTO notes (id, body) VALUES (1, 'hello')", []).unwrap();
        crate::capture::promote_staged(&conn_a, &mut device_a).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let bundle_path = dir.path().join("a-to-b.bundle");
        generate_bundle(&conn_a, device_a.device_id, Id128::new(), &VectorClock::new(), &bundle_path).unwrap();

        let (mut conn_b, mut device_b) = setup_store();
        let report = import_bundle(&mut conn_b, &mut device_b, &bundle_path).unwrap();
        assert_eq!(report.applied_count, 1);
        assert!(!report.skipped);

        let body: String = conn_b.query_row("SELECT body FROM notes WHERE id = 1", [], |r| r.get(0)).unwrap();
        assert_eq!(body, "hello");
    }

    #[test]
    fn reimporting_same_bundle_is_a_no_op() {
        let (conn_a, mut device_a) = setup_store();
        conn_a.execute("INSERT INTO notes (id, body) VALUES (1, 'hello')", []).unwrap();
        crate::capture::promote_staged(&conn_a, &mut device_a).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let bundle_path = dir.path().join("a-to-b.bundle");
        generate_bundle(&conn_a, device_a.device_id, Id128::new(), &VectorClock::new(), &bundle_path).unwrap();

        let (mut conn_b, mut device_b) = setup_store();
        import_bundle(&mut conn_b, &mut device_b, &bundle_path).unwrap();
        let second = import_bundle(&mut conn_b, &mut device_b, &bundle_path).unwrap();
        assert_eq!(second.applied_count, 0);
        assert!(second.skipped);
    }
}
