//! End-to-end scenarios against two independent [`Engine`] instances,
//! each backed by its own store file — the multi-device cases unit tests
//! inside the crate can't exercise on their own.

use rusqlite::OptionalExtension;
use sync_proto::codec::Value;
use syncd::conflict::ResolverKind;
use syncd::Engine;
use tempfile::tempdir;

const TODOS_COLUMNS: &[&str] = &["id", "title"];

fn new_engine(display_name: &str) -> (tempfile::TempDir, Engine) {
    let dir = tempdir().unwrap();
    let engine = Engine::init(dir.path().join("store.db"), display_name, false).unwrap();
    engine
        .with_connection(|conn| conn.execute_batch("CREATE TABLE todos (id INTEGER PRIMARY KEY, title TEXT);"))
        .unwrap();
    engine
        .enable_table(
            "todos",
            &["id".to_string()],
            TODOS_COLUMNS.iter().map(|s| s.to_string()).collect::<Vec<_>>().as_slice(),
        )
        .unwrap();
    (dir, engine)
}

fn insert_todo(engine: &Engine, id: i64, title: &str) {
    engine
        .with_connection(|conn| conn.execute("INSERT INTO todos (id, title) VALUES (?1, ?2)", (id, title)))
        .unwrap();
    engine.promote_captured().unwrap();
}

fn title_of(engine: &Engine, id: i64) -> Option<String> {
    engine
        .with_connection(|conn| {
            conn.query_row("SELECT title FROM todos WHERE id = ?1", [id], |r| r.get(0))
                .optional()
        })
        .unwrap()
}

fn exchange(from: &Engine, to: &Engine, dir: &std::path::Path, name: &str) -> usize {
    let bundle_path = dir.join(name);
    let to_vc = to.vector_clock();
    from.generate_bundle_to(to.device.device_id, &to_vc, &bundle_path).unwrap();
    to.import_bundle_file(&bundle_path).unwrap().applied_count
}

/// S1: two devices insert the same primary key concurrently. After
/// bidirectional sync both hold exactly one conflict record, and resolving
/// with the same deterministic resolver converges both rows.
#[test]
fn s1_concurrent_insert_same_pk_produces_one_conflict_per_side() {
    let exchange_dir = tempdir().unwrap();
    let (_a_dir, a) = new_engine("device-a");
    let (_b_dir, b) = new_engine("device-b");

    insert_todo(&a, 1, "A");
    insert_todo(&b, 1, "B");

    exchange(&a, &b, exchange_dir.path(), "a-to-b.bundle");
    exchange(&b, &a, exchange_dir.path(), "b-to-a.bundle");

    let a_conflicts = a.unresolved_conflicts().unwrap();
    let b_conflicts = b.unresolved_conflicts().unwrap();
    assert_eq!(a_conflicts.len(), 1);
    assert_eq!(b_conflicts.len(), 1);

    a.resolve_conflict(a_conflicts[0].conflict_id, &ResolverKind::LastWriteWins).unwrap();
    b.resolve_conflict(b_conflicts[0].conflict_id, &ResolverKind::LastWriteWins).unwrap();

    assert_eq!(title_of(&a, 1), title_of(&b, 1));
}

/// S2: A inserts, syncs to B, B updates, syncs back. A converges on B's
/// edit with zero conflicts.
#[test]
fn s2_causal_chain_converges_with_no_conflicts() {
    let exchange_dir = tempdir().unwrap();
    let (_a_dir, a) = new_engine("device-a");
    let (_b_dir, b) = new_engine("device-b");

    insert_todo(&a, 1, "A");
    exchange(&a, &b, exchange_dir.path(), "a-to-b.bundle");
    assert_eq!(title_of(&b, 1), Some("A".to_string()));

    b.with_connection(|conn| conn.execute("UPDATE todos SET title = 'x' WHERE id = 1", []))
        .unwrap();
    b.promote_captured().unwrap();

    exchange(&b, &a, exchange_dir.path(), "b-to-a.bundle");

    assert_eq!(title_of(&a, 1), Some("x".to_string()));
    assert!(a.unresolved_conflicts().unwrap().is_empty());
    assert_eq!(a.vector_clock().get(&a.device.device_id), 1);
    assert_eq!(a.vector_clock().get(&b.device.device_id), 1);
}

/// S3: importing the same bundle three times applies once, then is a no-op.
#[test]
fn s3_idempotent_replay_applies_once() {
    let exchange_dir = tempdir().unwrap();
    let (_a_dir, a) = new_engine("device-a");
    let (_b_dir, b) = new_engine("device-b");

    insert_todo(&a, 1, "A");
    insert_todo(&a, 2, "A2");

    let bundle_path = exchange_dir.path().join("a-to-b.bundle");
    a.generate_bundle_to(b.device.device_id, &b.vector_clock(), &bundle_path).unwrap();

    let first = b.import_bundle_file(&bundle_path).unwrap();
    let second = b.import_bundle_file(&bundle_path).unwrap();
    let third = b.import_bundle_file(&bundle_path).unwrap();

    assert_eq!((first.applied_count, first.skipped), (2, false));
    assert_eq!((second.applied_count, second.skipped), (0, true));
    assert_eq!((third.applied_count, third.skipped), (0, true));
}

/// S4: a concurrent UPDATE and DELETE on the same row conflict; under the
/// manual resolver the row is preserved and the conflict stays open.
#[test]
fn s4_concurrent_update_delete_conflict_preserves_row_under_manual_resolver() {
    let exchange_dir = tempdir().unwrap();
    let (_a_dir, a) = new_engine("device-a");
    let (_b_dir, b) = new_engine("device-b");

    insert_todo(&a, 1, "A");
    exchange(&a, &b, exchange_dir.path(), "seed.bundle");

    a.with_connection(|conn| conn.execute("UPDATE todos SET title = 'updated' WHERE id = 1", []))
        .unwrap();
    a.promote_captured().unwrap();

    b.with_connection(|conn| conn.execute("DELETE FROM todos WHERE id = 1", []))
        .unwrap();
    b.promote_captured().unwrap();

    exchange(&a, &b, exchange_dir.path(), "a-to-b.bundle");
    exchange(&b, &a, exchange_dir.path(), "b-to-a.bundle");

    let a_conflicts = a.unresolved_conflicts().unwrap();
    assert_eq!(a_conflicts.len(), 1);

    a.resolve_conflict(a_conflicts[0].conflict_id, &ResolverKind::Manual).unwrap();
    assert!(!a.unresolved_conflicts().unwrap().is_empty());
    assert_eq!(title_of(&a, 1), Some("updated".to_string()));
}

/// S6: an additive migration replicates as a SCHEMA_MIGRATION op; the
/// receiving device gains the column and later data ops targeting the new
/// version apply cleanly.
#[test]
fn s6_additive_migration_replicates_and_unblocks_future_ops() {
    let exchange_dir = tempdir().unwrap();
    let (_a_dir, a) = new_engine("device-a");
    let (_b_dir, b) = new_engine("device-b");

    a.create_migration("todos", "priority", "INTEGER", Some(Value::Integer(0))).unwrap();
    exchange(&a, &b, exchange_dir.path(), "migration.bundle");

    let has_priority = b
        .with_connection(|conn| {
            let mut stmt = conn.prepare("PRAGMA table_info(todos)")?;
            let names: Vec<String> = stmt.query_map([], |r| r.get(1))?.collect::<rusqlite::Result<_>>()?;
            Ok(names.contains(&"priority".to_string()))
        })
        .unwrap();
    assert!(has_priority);

    insert_todo(&a, 1, "after-migration");
    exchange(&a, &b, exchange_dir.path(), "data.bundle");
    assert_eq!(title_of(&b, 1), Some("after-migration".to_string()));
}
