//! The scheduled sync loop: IDLE -> SYNCING -> IDLE | WAITING_RETRY | ERROR
//! state machine, driving a [`Transport`] against the set of registered
//! peers on a fixed interval with capped exponential backoff. A
//! `tokio::select!` loop over an interval tick and a shutdown broadcast
//! channel is a common shape for this kind of scheduled background task;
//! the per-peer exchange itself moves a vector-clock exchange followed by
//! a bundle transfer in each direction over whatever [`Transport`] is
//! configured.

use crate::engine::Store;
use crate::error::EngineError;
use crate::transport::Transport;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use sync_proto::id::Id128;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
    WaitingRetry,
    Error,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SyncLoopConfig {
    /// How often to check for peers due a sync cycle.
    pub interval: Duration,
    /// Backoff floor after a transient failure.
    pub retry_base: Duration,
    /// Backoff ceiling; doubles from `retry_base` until it hits this.
    pub retry_cap: Duration,
}

impl Default for SyncLoopConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(60),
        }
    }
}

/// A sync cycle's failure, classified by whether retrying unchanged is
/// expected to help (WAITING_RETRY) or not (ERROR: malformed bundle,
/// incompatible schema, or an auth failure the operator must resolve).
pub enum CycleError {
    Transient(EngineError),
    Permanent(EngineError),
}

impl From<EngineError> for CycleError {
    fn from(err: EngineError) -> Self {
        match &err {
            EngineError::Transport(_) | EngineError::Database(_) | EngineError::Io(_) => CycleError::Transient(err),
            _ => CycleError::Permanent(err),
        }
    }
}

/// Drives scheduled exchanges with registered peers through a `Transport`.
pub struct SyncLoop<T: Transport> {
    store: Arc<Mutex<Store>>,
    device_id: Id128,
    transport: T,
    config: SyncLoopConfig,
    state: SyncState,
    attempt: u32,
    shutdown_tx: broadcast::Sender<()>,
}

impl<T: Transport> SyncLoop<T> {
    pub fn new(store: Arc<Mutex<Store>>, device_id: Id128, transport: T, config: SyncLoopConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            store,
            device_id,
            transport,
            config,
            state: SyncState::Idle,
            attempt: 0,
            shutdown_tx,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Ask a running loop to stop after its current cycle.
    pub fn stop_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run until `stop_handle().send(())` is called. Each tick drives every
    /// peer due a sync through one [`sync_with_peer_once`] cycle.
    pub async fn run(&mut self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.config.interval);

        loop {
            let wait = match self.state {
                SyncState::WaitingRetry => backoff_for(&self.config, self.attempt),
                _ => self.config.interval,
            };

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    self.state = SyncState::Stopped;
                    info!("sync loop stopped");
                    return;
                }
                _ = ticker.tick() => {}
                _ = tokio::time::sleep(wait), if self.state == SyncState::WaitingRetry => {}
            }

            self.run_due_cycles().await;
        }
    }

    /// Run one pass over every peer currently due a sync, per
    /// `peer::peers_needing_sync`'s interval check.
    pub async fn run_due_cycles(&mut self) {
        self.state = SyncState::Syncing;
        let now = now_micros();
        let due = {
            let store = self.store.lock();
            crate::peer::peers_needing_sync(&store.conn, now, self.config.interval.as_secs())
                .unwrap_or_default()
        };

        let mut any_transient = false;
        for peer_id in due {
            match sync_with_peer_once(&self.store, self.device_id, &mut self.transport, peer_id).await {
                Ok(applied) => {
                    info!(peer = %peer_id.to_hex(), applied, "sync cycle completed");
                    self.attempt = 0;
                }
                Err(CycleError::Transient(e)) => {
                    warn!(peer = %peer_id.to_hex(), error = %e, "transient sync failure, will retry");
                    any_transient = true;
                }
                Err(CycleError::Permanent(e)) => {
                    warn!(peer = %peer_id.to_hex(), error = %e, "permanent sync failure");
                    self.state = SyncState::Error;
                }
            }
        }

        if self.state != SyncState::Error {
            if any_transient {
                self.attempt = self.attempt.saturating_add(1);
                self.state = SyncState::WaitingRetry;
            } else {
                self.attempt = 0;
                self.state = SyncState::Idle;
            }
        }
    }
}

fn backoff_for(config: &SyncLoopConfig, attempt: u32) -> Duration {
    let scaled = config.retry_base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    scaled.min(config.retry_cap)
}

/// One bundle exchange with `peer_id`: connect, trade vector clocks,
/// exchange bundles of whatever the other side is missing, import what
/// arrives, and record the outcome — the unit of work both the scheduled
/// loop and `Engine::sync_once` drive.
pub(crate) async fn sync_with_peer_once<T: Transport>(
    store: &Arc<Mutex<Store>>,
    local_device_id: Id128,
    transport: &mut T,
    peer_id: Id128,
) -> std::result::Result<usize, CycleError> {
    transport.connect(peer_id).await.map_err(EngineError::from).map_err(CycleError::from)?;
    let result = run_exchange(store, local_device_id, transport, peer_id).await;
    let _ = transport.disconnect(peer_id).await;
    result
}

async fn run_exchange<T: Transport>(
    store: &Arc<Mutex<Store>>,
    local_device_id: Id128,
    transport: &mut T,
    peer_id: Id128,
) -> std::result::Result<usize, CycleError> {
    let local_vc = {
        let guard = store.lock();
        guard.device_ctx.vector_clock().clone()
    };

    let remote_vc = transport
        .exchange_vector_clock(peer_id, &local_vc)
        .await
        .map_err(EngineError::from)
        .map_err(CycleError::from)?;

    let temp_dir = tempfile::tempdir().map_err(EngineError::from).map_err(CycleError::from)?;
    let outgoing_path = temp_dir.path().join("outgoing.bundle");
    {
        let guard = store.lock();
        crate::bundle::generate_bundle(&guard.conn, local_device_id, peer_id, &remote_vc, &outgoing_path)
            .map_err(EngineError::from)
            .map_err(CycleError::from)?;
    }
    transport
        .send_bundle(peer_id, &outgoing_path)
        .await
        .map_err(EngineError::from)
        .map_err(CycleError::from)?;

    let mut applied = 0;
    if let Some(incoming_path) = transport
        .receive_bundle(peer_id, temp_dir.path())
        .await
        .map_err(EngineError::from)
        .map_err(CycleError::from)?
    {
        let mut guard = store.lock();
        let report = crate::bundle::import_bundle(&mut guard.conn, &mut guard.device_ctx, &incoming_path)
            .map_err(EngineError::from)
            .map_err(CycleError::from)?;
        applied = report.applied_count;
    }

    let now = now_micros();
    {
        let guard = store.lock();
        crate::peer::record_sync(&guard.conn, peer_id, now, &local_vc, &remote_vc)
            .map_err(EngineError::from)
            .map_err(CycleError::from)?;
    }

    Ok(applied)
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
    use crate::engine::Engine;

    #[test]
    fn backoff_doubles_until_cap() {
        let config = SyncLoopConfig {
            interval: Duration::from_secs(30),
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(10),
        };
        assert_eq!(backoff_for(&config, 0), Duration::from_secs(1));
        assert_eq!(backoff_for(&config, 1), Duration::from_secs(2));
        assert_eq!(backoff_for(&config, 2), Duration::from_secs(4));
        assert_eq!(backoff_for(&config, 10), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn sync_with_no_due_peers_stays_idle() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::init(dir.path().join("store.db"), "laptop", false).unwrap();
        let transport = crate::transport::FileDropTransport::new(dir.path().join("drop"));
        let mut sync_loop = SyncLoop::new(engine.store_handle(), engine.device.device_id, transport, SyncLoopConfig::default());
        sync_loop.run_due_cycles().await;
        assert_eq!(sync_loop.state(), SyncState::Idle);
    }
}
