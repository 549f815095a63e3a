//! Peer registry: what this device knows about its sync partners,
//! persisted in `sync_peers`.
//!
//! An in-memory `RwLock<HashMap<...>>` peer map is a common shape for this
//! kind of registry; here it's replaced by rows in the embedded store so
//! peer state survives a restart.

use rusqlite::{params, Connection, OptionalExtension};
use sync_proto::clock::VectorClock;
use sync_proto::id::Id128;
use sync_proto::types::Peer;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("codec error: {0}")]
    Codec(#[from] sync_proto::Error),
}

type Result<T> = std::result::Result<T, PeerError>;

/// Register a peer for synchronization, if not already known. Idempotent.
pub fn register(conn: &Connection, peer_id: Id128, endpoint_hint: Option<&str>) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_peers (peer_id, last_seen, last_sync_at, last_sent_vector_clock, last_received_vector_clock, endpoint_hint)
         VALUES (?1, NULL, NULL, NULL, NULL, ?2)
         ON CONFLICT(peer_id) DO NOTHING",
        params![peer_id.as_bytes(), endpoint_hint],
    )?;
    Ok(())
}

pub fn unregister(conn: &Connection, peer_id: Id128) -> Result<()> {
    conn.execute("DELETE FROM sync_peers WHERE peer_id = ?1", params![peer_id.as_bytes()])?;
    Ok(())
}

/// Record the outcome of a completed sync cycle with `peer_id`.
pub fn record_sync(
    conn: &Connection,
    peer_id: Id128,
    now: u64,
    sent_vc: &VectorClock,
    received_vc: &VectorClock,
) -> Result<()> {
    conn.execute(
        "UPDATE sync_peers SET last_seen = ?1, last_sync_at = ?1, last_sent_vector_clock = ?2, last_received_vector_clock = ?3
         WHERE peer_id = ?4",
        params![now, sent_vc.encode()?, received_vc.encode()?, peer_id.as_bytes()],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, peer_id: Id128) -> Result<Option<Peer>> {
    conn.query_row(
        "SELECT peer_id, last_seen, last_sync_at, last_sent_vector_clock, last_received_vector_clock, endpoint_hint
         FROM sync_peers WHERE peer_id = ?1",
        params![peer_id.as_bytes()],
        row_to_peer,
    )
    .optional()
    .map_err(PeerError::from)?
    .transpose()
}

pub fn list(conn: &Connection) -> Result<Vec<Peer>> {
    let mut stmt = conn.prepare(
        "SELECT peer_id, last_seen, last_sync_at, last_sent_vector_clock, last_received_vector_clock, endpoint_hint
         FROM sync_peers ORDER BY peer_id ASC",
    )?;
    let rows = stmt.query_map([], row_to_peer)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

/// Peers whose last sync is at least `interval_secs` old (or who have
/// never synced), mirroring `SyncManager::peers_needing_sync`'s interval
/// check against a persisted timestamp instead of an in-memory `Instant`.
pub fn peers_needing_sync(conn: &Connection, now: u64, interval_secs: u64) -> Result<Vec<Id128>> {
    let interval_micros = interval_secs.saturating_mul(1_000_000);
    let mut stmt = conn.prepare(
        "SELECT peer_id FROM sync_peers
         WHERE last_sync_at IS NULL OR (?1 - last_sync_at) >= ?2",
    )?;
    let rows = stmt.query_map(params![now, interval_micros], |row| {
        let bytes: [u8; 16] = row.get(0)?;
        Ok(Id128(bytes))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn row_to_peer(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Peer>> {
    let peer_id: [u8; 16] = row.get(0)?;
    let sent_bytes: Option<Vec<u8>> = row.get(3)?;
    let received_bytes: Option<Vec<u8>> = row.get(4)?;
    Ok((|| -> Result<Peer> {
        Ok(Peer {
            peer_id: Id128(peer_id),
            last_seen: row.get(1)?,
            last_sync_at: row.get(2)?,
            last_sent_vector_clock: sent_bytes.as_deref().map(VectorClock::decode).transpose()?,
            last_received_vector_clock: received_bytes.as_deref().map(VectorClock::decode).transpose()?,
            endpoint_hint: row.get(5)?,
        })
    })())
}
