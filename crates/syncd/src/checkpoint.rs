//! Crash-safe three-phase apply executor: record a checkpoint row before
//! the batch starts, run the whole batch inside one exclusive
//! transaction, and commit or abort the row depending on the outcome, so
//! a crash mid-batch always leaves a resumable trail instead of a torn
//! write.

use rusqlite::{params, Connection, OptionalExtension};
use sync_proto::clock::VectorClock;
use sync_proto::id::Id128;
use sync_proto::types::{Checkpoint, CheckpointStatus, Operation};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("codec error: {0}")]
    Codec(#[from] sync_proto::Error),
    #[error("apply error: {0}")]
    Apply(#[from] crate::apply::ApplyError),
    #[error("another checkpoint is already in progress: {0}")]
    AlreadyInProgress(String),
}

type Result<T> = std::result::Result<T, CheckpointError>;

fn create_checkpoint(conn: &Connection, vector_clock_at_start: &VectorClock) -> Result<Checkpoint> {
    if let Some(existing) = in_progress_checkpoint(conn)? {
        return Err(CheckpointError::AlreadyInProgress(existing.checkpoint_id.to_hex()));
    }
    let checkpoint = Checkpoint {
        checkpoint_id: Id128::new(),
        started_at: now_micros(),
        last_applied_op_id: None,
        vector_clock_at_start: vector_clock_at_start.clone(),
        status: CheckpointStatus::InProgress,
    };
    conn.execute(
        "INSERT INTO sync_checkpoints
            (checkpoint_id, started_at, last_applied_op_id, vector_clock_at_start, status)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            checkpoint.checkpoint_id.as_bytes(),
            checkpoint.started_at,
            checkpoint.last_applied_op_id.map(|id| *id.as_bytes()),
            checkpoint.vector_clock_at_start.encode()?,
            checkpoint.status.as_str(),
        ],
    )?;
    Ok(checkpoint)
}

fn finish_checkpoint(conn: &Connection, checkpoint_id: Id128, status: CheckpointStatus, last_applied: Option<Id128>) -> Result<()> {
    conn.execute(
        "UPDATE sync_checkpoints SET status = ?1, last_applied_op_id = ?2 WHERE checkpoint_id = ?3",
        params![status.as_str(), last_applied.map(|id| *id.as_bytes()), checkpoint_id.as_bytes()],
    )?;
    Ok(())
}

/// A checkpoint left `in_progress` by a prior crash, if any. The
/// database's own atomicity already rolled back any partial writes,
/// so resuming means marking it aborted and re-running apply with the
/// same ops (idempotent, since dedup skips whatever already landed).
pub fn in_progress_checkpoint(conn: &Connection) -> Result<Option<Checkpoint>> {
    conn.query_row(
        "SELECT checkpoint_id, started_at, last_applied_op_id, vector_clock_at_start, status
         FROM sync_checkpoints WHERE status = 'in_progress' LIMIT 1",
        [],
        row_to_checkpoint,
    )
    .optional()
    .map_err(CheckpointError::from)?
    .transpose()
}

fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<std::result::Result<Checkpoint, CheckpointError>> {
    let checkpoint_id: [u8; 16] = row.get(0)?;
    let last_applied: Option<[u8; 16]> = row.get(2)?;
    let vc_bytes: Vec<u8> = row.get(3)?;
    let status_str: String = row.get(4)?;
    Ok((|| -> Result<Checkpoint> {
        Ok(Checkpoint {
            checkpoint_id: Id128(checkpoint_id),
            started_at: row.get(1)?,
            last_applied_op_id: last_applied.map(Id128),
            vector_clock_at_start: VectorClock::decode(&vc_bytes)?,
            status: CheckpointStatus::from_str(&status_str)
                .ok_or_else(|| CheckpointError::Codec(sync_proto::Error::MalformedCodec("bad checkpoint status".into())))?,
        })
    })())
}

/// Resolve any checkpoint left `in_progress` by marking it `aborted`. The
/// caller is expected to re-run `run_checkpointed` with the same ops
/// afterward; dedup makes that a no-op for anything that already landed.
pub fn recover(conn: &Connection) -> Result<()> {
    if let Some(stale) = in_progress_checkpoint(conn)? {
        finish_checkpoint(conn, stale.checkpoint_id, CheckpointStatus::Aborted, stale.last_applied_op_id)?;
    }
    Ok(())
}

/// Run an apply batch inside the three-phase protocol: create the
/// checkpoint, apply inside one atomic transaction, and mark it
/// committed or aborted on the way out.
pub fn run_checkpointed(
    conn: &mut Connection,
    ops: &[Operation],
    device: &mut crate::oplog::DeviceContext,
) -> Result<crate::apply::ApplyReport> {
    recover(conn)?;
    let checkpoint = create_checkpoint(conn, device.vector_clock())?;

    let tx = conn.transaction()?;
    let result = crate::apply::apply_batch(&tx, ops, device);
    match result {
        Ok(report) => {
            let last = ops.last().map(|o| o.op_id);
            tx.commit()?;
            finish_checkpoint(conn, checkpoint.checkpoint_id, CheckpointStatus::Committed, last)?;
            Ok(report)
        }
        Err(e) => {
            drop(tx); // rolls back; must end before `conn` is reborrowed below
            finish_checkpoint(conn, checkpoint.checkpoint_id, CheckpointStatus::Aborted, None)?;
            Err(CheckpointError::Apply(e))
        }
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
    use crate::oplog::DeviceContext;
    use crate::schema::open_in_memory;

    #[test]
    fn checkpoint_commits_on_success() {
        let mut conn = open_in_memory().unwrap();
        let mut device = DeviceContext::new(Id128::new());
        let report = run_checkpointed(&mut conn, &[], &mut device).unwrap();
        assert_eq!(report.mutated, 0);
        assert!(in_progress_checkpoint(&conn).unwrap().is_none());
    }

    #[test]
    fn stale_in_progress_checkpoint_is_recovered() {
        let conn = open_in_memory().unwrap();
        create_checkpoint(&conn, &VectorClock::new()).unwrap();
        assert!(in_progress_checkpoint(&conn).unwrap().is_some());
        recover(&conn).unwrap();
        assert!(in_progress_checkpoint(&conn).unwrap().is_none());
    }

    #[test]
    fn cannot_create_two_concurrent_checkpoints() {
        let conn = open_in_memory().unwrap();
        create_checkpoint(&conn, &VectorClock::new()).unwrap();
        assert!(create_checkpoint(&conn, &VectorClock::new()).is_err());
    }
}
