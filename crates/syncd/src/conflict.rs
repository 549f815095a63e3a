//! Conflict records and the resolver registry.
//!
//! A `ConflictResolver` trait over a detected conflict is a common shape
//! for this kind of registry; here it's collapsed into a closed
//! `ResolverKind` enum (tagged variants over a small closed set plus a
//! `Custom` variant) rather than dynamic dispatch, since a genuinely
//! caller-supplied strategy still needs to hold arbitrary logic somehow —
//! that one arm carries a boxed `Fn`.

use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use sync_proto::codec::{decode_value_map, encode_value_map, ValueMap};
use sync_proto::id::Id128;
use sync_proto::types::{ConflictRecord, Operation, ResolutionState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("codec error: {0}")]
    Codec(#[from] sync_proto::Error),
    #[error("capture error: {0}")]
    Capture(#[from] crate::capture::CaptureError),
    #[error("oplog error: {0}")]
    Oplog(#[from] crate::oplog::OplogError),
    #[error("conflict {0} not found")]
    NotFound(String),
}

type Result<T> = std::result::Result<T, ConflictError>;

/// Everything a resolver needs to decide a conflict's outcome.
pub struct ConflictContext<'a> {
    pub conflict: &'a ConflictRecord,
    pub local_op: &'a Operation,
    pub remote_op: &'a Operation,
    pub local_row: Option<&'a ValueMap>,
    pub remote_row: Option<&'a ValueMap>,
}

/// The outcome of running a resolver against a [`ConflictContext`].
pub enum ResolutionResult {
    /// The conflict is settled; apply `values` as a new local operation
    /// (which itself replicates, closing the conflict everywhere once
    /// propagated).
    Resolved { values: ValueMap, resolved_by: String },
    /// No automatic decision; leave the conflict for an operator.
    Deferred,
}

/// A closed set of built-in resolution strategies, plus an escape hatch
/// for caller-supplied logic.
pub enum ResolverKind {
    /// Pick the op with the greater `(physical_ms, device_id)` pair.
    LastWriteWins,
    /// Merge column-by-column, taking each from the op with the greater
    /// timestamp; `prefer_local` breaks exact ties.
    FieldMerge { prefer_local: bool },
    /// Always defer to an operator.
    Manual,
    /// Caller-supplied resolution function.
    Custom(Arc<dyn Fn(&ConflictContext) -> ResolutionResult + Send + Sync>),
}

impl ResolverKind {
    pub fn resolve(&self, ctx: &ConflictContext) -> ResolutionResult {
        match self {
            ResolverKind::LastWriteWins => resolve_last_write_wins(ctx),
            ResolverKind::FieldMerge { prefer_local } => resolve_field_merge(ctx, *prefer_local),
            ResolverKind::Manual => ResolutionResult::Deferred,
            ResolverKind::Custom(f) => f(ctx),
        }
    }
}

fn resolve_last_write_wins(ctx: &ConflictContext) -> ResolutionResult {
    let local_wins = (ctx.local_op.created_at, ctx.local_op.device_id)
        >= (ctx.remote_op.created_at, ctx.remote_op.device_id);
    let (winner, values) = if local_wins {
        (ctx.local_op, ctx.local_row)
    } else {
        (ctx.remote_op, ctx.remote_row)
    };
    match values {
        Some(v) => ResolutionResult::Resolved {
            values: v.clone(),
            resolved_by: format!("last-write-wins:{}", winner.op_id),
        },
        None => ResolutionResult::Deferred,
    }
}

fn resolve_field_merge(ctx: &ConflictContext, prefer_local: bool) -> ResolutionResult {
    let (local, remote) = match (ctx.local_row, ctx.remote_row) {
        (Some(l), Some(r)) => (l, r),
        _ => return ResolutionResult::Deferred,
    };
    let local_newer = match ctx.local_op.created_at.cmp(&ctx.remote_op.created_at) {
        std::cmp::Ordering::Equal => prefer_local,
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
    };

    let mut merged = ValueMap::new();
    let keys = local.keys().chain(remote.keys());
    for key in keys {
        if merged.contains_key(key) {
            continue;
        }
        let value = if local_newer {
            local.get(key).or_else(|| remote.get(key))
        } else {
            remote.get(key).or_else(|| local.get(key))
        };
        if let Some(v) = value {
            merged.insert(key.clone(), v.clone());
        }
    }

    ResolutionResult::Resolved {
        values: merged,
        resolved_by: "field-merge".to_string(),
    }
}

/// Create (and persist) a conflict record for a concurrent pair.
pub fn record_conflict(
    conn: &Connection,
    table_name: &str,
    row_pk: &[u8],
    local_op_id: Id128,
    remote_op_id: Id128,
    detected_at: u64,
) -> Result<ConflictRecord> {
    let conflict = ConflictRecord {
        conflict_id: Id128::new(),
        table_name: table_name.to_string(),
        row_pk: row_pk.to_vec(),
        local_op_id,
        remote_op_id,
        detected_at,
        resolution_state: ResolutionState::Unresolved,
        resolved_by: None,
        winning_op_id: None,
    };
    conn.execute(
        "INSERT INTO sync_conflicts
            (conflict_id, table_name, row_pk, local_op_id, remote_op_id, detected_at,
             resolution_state, resolved_by, winning_op_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            conflict.conflict_id.as_bytes(),
            conflict.table_name,
            conflict.row_pk,
            conflict.local_op_id.as_bytes(),
            conflict.remote_op_id.as_bytes(),
            conflict.detected_at,
            conflict.resolution_state.as_str(),
            conflict.resolved_by,
            conflict.winning_op_id.map(|id| *id.as_bytes()),
        ],
    )?;
    Ok(conflict)
}

/// Mark a conflict resolved because a later op causally superseded both
/// sides, without running a resolver.
pub fn mark_superseded(conn: &Connection, conflict_id: Id128, winning_op_id: Id128) -> Result<()> {
    conn.execute(
        "UPDATE sync_conflicts SET resolution_state = ?1, winning_op_id = ?2 WHERE conflict_id = ?3",
        params![
            ResolutionState::Resolved.as_str(),
            winning_op_id.as_bytes(),
            conflict_id.as_bytes(),
        ],
    )?;
    Ok(())
}

/// Apply a resolver's decision, synthesizing a new local op from the
/// chosen values when resolved.
pub fn apply_resolution(
    conn: &Connection,
    conflict_id: Id128,
    resolution: ResolutionResult,
    device: &mut crate::oplog::DeviceContext,
    table_name: &str,
    row_pk: &[u8],
) -> Result<Option<Operation>> {
    match resolution {
        ResolutionResult::Deferred => {
            conn.execute(
                "UPDATE sync_conflicts SET resolution_state = ?1 WHERE conflict_id = ?2",
                params![ResolutionState::Deferred.as_str(), conflict_id.as_bytes()],
            )?;
            Ok(None)
        }
        ResolutionResult::Resolved { values, resolved_by } => {
            let encoded = encode_value_map(&values)?;
            let schema_version = crate::capture::schema_version_for_table(conn, table_name)?.unwrap_or(0);
            let op = device.next_operation(
                table_name.to_string(),
                sync_proto::types::OpType::Update,
                row_pk.to_vec(),
                None,
                Some(encoded),
                schema_version,
            );
            crate::oplog::insert_operation(conn, &op)?;
            conn.execute(
                "UPDATE sync_conflicts SET resolution_state = ?1, resolved_by = ?2, winning_op_id = ?3
                 WHERE conflict_id = ?4",
                params![
                    ResolutionState::Resolved.as_str(),
                    resolved_by,
                    op.op_id.as_bytes(),
                    conflict_id.as_bytes(),
                ],
            )?;
            Ok(Some(op))
        }
    }
}

pub fn get_conflict(conn: &Connection, conflict_id: Id128) -> Result<Option<ConflictRecord>> {
    conn.query_row(
        "SELECT conflict_id, table_name, row_pk, local_op_id, remote_op_id, detected_at,
                resolution_state, resolved_by, winning_op_id
         FROM sync_conflicts WHERE conflict_id = ?1",
        params![conflict_id.as_bytes()],
        row_to_conflict,
    )
    .optional()
    .map_err(ConflictError::from)
}

pub fn list_unresolved(conn: &Connection) -> Result<Vec<ConflictRecord>> {
    let mut stmt = conn.prepare(
        "SELECT conflict_id, table_name, row_pk, local_op_id, remote_op_id, detected_at,
                resolution_state, resolved_by, winning_op_id
         FROM sync_conflicts WHERE resolution_state = 'unresolved'",
    )?;
    let rows = stmt.query_map([], row_to_conflict)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Unresolved conflicts recorded against a specific `(table, row_pk)`,
/// used to check whether a newly-applied op causally supersedes any of
/// them.
pub fn unresolved_for_row(conn: &Connection, table_name: &str, row_pk: &[u8]) -> Result<Vec<ConflictRecord>> {
    let mut stmt = conn.prepare(
        "SELECT conflict_id, table_name, row_pk, local_op_id, remote_op_id, detected_at,
                resolution_state, resolved_by, winning_op_id
         FROM sync_conflicts WHERE resolution_state = 'unresolved' AND table_name = ?1 AND row_pk = ?2",
    )?;
    let rows = stmt.query_map(params![table_name, row_pk], row_to_conflict)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn row_to_conflict(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConflictRecord> {
    let local_op: [u8; 16] = row.get(3)?;
    let remote_op: [u8; 16] = row.get(4)?;
    let resolution_state_str: String = row.get(6)?;
    let winning: Option<[u8; 16]> = row.get(8)?;
    let conflict_id: [u8; 16] = row.get(0)?;
    Ok(ConflictRecord {
        conflict_id: Id128(conflict_id),
        table_name: row.get(1)?,
        row_pk: row.get(2)?,
        local_op_id: Id128(local_op),
        remote_op_id: Id128(remote_op),
        detected_at: row.get(5)?,
        resolution_state: ResolutionState::from_str(&resolution_state_str).unwrap_or(ResolutionState::Unresolved),
        resolved_by: row.get(7)?,
        winning_op_id: winning.map(Id128),
    })
}

/// Decode a persisted operation's new-values column, used to build a
/// [`ConflictContext`] before handing it to a resolver.
pub fn decode_row_values(op: &Operation) -> std::result::Result<Option<ValueMap>, sync_proto::Error> {
    op.new_values.as_deref().map(decode_value_map).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::open_in_memory;
    use sync_proto::codec::Value;

    fn sample_map(text: &str) -> ValueMap {
        let mut m = ValueMap::new();
        m.insert("body".to_string(), Value::Text(text.to_string()));
        m
    }

    #[test]
    fn last_write_wins_picks_later_timestamp() {
        let local = fake_op(100, 1);
        let remote = fake_op(200, 2);
        let local_row = sample_map("local");
        let remote_row = sample_map("remote");
        let conflict = fake_conflict(&local, &remote);
        let ctx = ConflictContext {
            conflict: &conflict,
            local_op: &local,
            remote_op: &remote,
            local_row: Some(&local_row),
            remote_row: Some(&remote_row),
        };
        match ResolverKind::LastWriteWins.resolve(&ctx) {
            ResolutionResult::Resolved { values, .. } => {
                assert_eq!(values.get("body"), Some(&Value::Text("remote".into())));
            }
            ResolutionResult::Deferred => panic!("expected resolution"),
        }
    }

    #[test]
    fn manual_always_defers() {
        let local = fake_op(100, 1);
        let remote = fake_op(200, 2);
        let conflict = fake_conflict(&local, &remote);
        let ctx = ConflictContext {
            conflict: &conflict,
            local_op: &local,
            remote_op: &remote,
            local_row: None,
            remote_row: None,
        };
        assert!(matches!(ResolverKind::Manual.resolve(&ctx), ResolutionResult::Deferred));
    }

    #[test]
    fn field_merge_prefers_newer_op_per_side() {
        let local = fake_op(200, 1);
        let remote = fake_op(100, 2);
        let mut local_row = ValueMap::new();
        local_row.insert("a".into(), Value::Integer(1));
        let mut remote_row = ValueMap::new();
        remote_row.insert("a".into(), Value::Integer(2));
        remote_row.insert("b".into(), Value::Integer(3));
        let conflict = fake_conflict(&local, &remote);
        let ctx = ConflictContext {
            conflict: &conflict,
            local_op: &local,
            remote_op: &remote,
            local_row: Some(&local_row),
            remote_row: Some(&remote_row),
        };
        match (ResolverKind::FieldMerge { prefer_local: false }).resolve(&ctx) {
            ResolutionResult::Resolved { values, .. } => {
                assert_eq!(values.get("a"), Some(&Value::Integer(1)));
                assert_eq!(values.get("b"), Some(&Value::Integer(3)));
            }
            ResolutionResult::Deferred => panic!("expected resolution"),
        }
    }

    #[test]
    fn record_and_fetch_conflict_round_trips() {
        let conn = open_in_memory().unwrap();
        let conflict = record_conflict(&conn, "t", &[1, 2], Id128::new(), Id128::new(), 1).unwrap();
        let fetched = get_conflict(&conn, conflict.conflict_id).unwrap().unwrap();
        assert_eq!(fetched.resolution_state, ResolutionState::Unresolved);
    }

    #[test]
    fn list_unresolved_excludes_resolved() {
        let conn = open_in_memory().unwrap();
        let a = record_conflict(&conn, "t", &[1], Id128::new(), Id128::new(), 1).unwrap();
        record_conflict(&conn, "t", &[2], Id128::new(), Id128::new(), 2).unwrap();
        mark_superseded(&conn, a.conflict_id, Id128::new()).unwrap();
        assert_eq!(list_unresolved(&conn).unwrap().len(), 1);
    }

    #[test]
    fn unresolved_for_row_is_scoped_to_table_and_pk() {
        let conn = open_in_memory().unwrap();
        record_conflict(&conn, "t", &[1], Id128::new(), Id128::new(), 1).unwrap();
        record_conflict(&conn, "t", &[2], Id128::new(), Id128::new(), 2).unwrap();
        record_conflict(&conn, "other", &[1], Id128::new(), Id128::new(), 3).unwrap();
        assert_eq!(unresolved_for_row(&conn, "t", &[1]).unwrap().len(), 1);
        assert_eq!(unresolved_for_row(&conn, "t", &[9]).unwrap().len(), 0);
    }

    fn fake_op(created_at: u64, device_seed: u8) -> Operation {
        let mut device_bytes = [0u8; 16];
        device_bytes[15] = device_seed;
        Operation {
            op_id: Id128::new(),
            device_id: Id128(device_bytes),
            parent_op_id: None,
            vector_clock: sync_proto::clock::VectorClock::new(),
            table_name: "t".into(),
            op_type: sync_proto::types::OpType::Update,
            row_pk: vec![1],
            old_values: None,
            new_values: None,
            schema_version: 0,
            created_at,
            is_local: false,
            applied_at: None,
        }
    }

    fn fake_conflict(local: &Operation, remote: &Operation) -> ConflictRecord {
        ConflictRecord {
            conflict_id: Id128::new(),
            table_name: "t".into(),
            row_pk: vec![1],
            local_op_id: local.op_id,
            remote_op_id: remote.op_id,
            detected_at: 0,
            resolution_state: ResolutionState::Unresolved,
            resolved_by: None,
            winning_op_id: None,
        }
    }
}
