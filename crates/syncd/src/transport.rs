//! Peer transport adapter: only the transport contract is specified here
//! — vector-clock exchange, then a bundle transfer in each direction —
//! never a wire protocol. [`FileDropTransport`] is the one concrete
//! adapter this crate ships: peers exchange bundles by dropping them into
//! a shared directory, useful for local testing and for transports like
//! sneakernet/USB sync that stay external collaborators.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use sync_proto::clock::VectorClock;
use sync_proto::id::Id128;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] sync_proto::Error),
    #[error("peer {0} is not connected")]
    NotConnected(String),
    #[error("peer {0} did not respond with a vector clock")]
    NoVectorClockExchanged(String),
}

type Result<T> = std::result::Result<T, TransportError>;

/// What a sync cycle needs from a transport: establish a session, learn
/// the peer's view of causality, and move bundles in both directions.
/// Adapters besides [`FileDropTransport`] (a real socket/WebSocket
/// client) are out of scope for this crate.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&mut self, peer_id: Id128) -> Result<()>;
    async fn disconnect(&mut self, peer_id: Id128) -> Result<()>;
    async fn exchange_vector_clock(&mut self, peer_id: Id128, local: &VectorClock) -> Result<VectorClock>;
    async fn send_bundle(&mut self, peer_id: Id128, bundle_path: &Path) -> Result<()>;
    async fn receive_bundle(&mut self, peer_id: Id128, dest_dir: &Path) -> Result<Option<PathBuf>>;
}

/// A transport that exchanges bundles and vector-clock announcements as
/// files in a shared directory: `<root>/<peer>/to-us.clock`,
/// `<root>/<peer>/from-us.clock`, and `<root>/<peer>/*.bundle`.
pub struct FileDropTransport {
    root: PathBuf,
    connected: std::collections::HashSet<Id128>,
}

impl FileDropTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            connected: std::collections::HashSet::new(),
        }
    }

    fn peer_dir(&self, peer_id: Id128) -> PathBuf {
        self.root.join(peer_id.to_hex())
    }

    fn require_connected(&self, peer_id: Id128) -> Result<()> {
        if self.connected.contains(&peer_id) {
            Ok(())
        } else {
            Err(TransportError::NotConnected(peer_id.to_hex()))
        }
    }
}

#[async_trait]
impl Transport for FileDropTransport {
    async fn connect(&mut self, peer_id: Id128) -> Result<()> {
        fs::create_dir_all(self.peer_dir(peer_id)).await?;
        self.connected.insert(peer_id);
        Ok(())
    }

    async fn disconnect(&mut self, peer_id: Id128) -> Result<()> {
        self.connected.remove(&peer_id);
        Ok(())
    }

    async fn exchange_vector_clock(&mut self, peer_id: Id128, local: &VectorClock) -> Result<VectorClock> {
        self.require_connected(peer_id)?;
        let dir = self.peer_dir(peer_id);
        fs::write(dir.join("from-us.clock"), local.encode()?).await?;

        let their_clock_path = dir.join("to-us.clock");
        match fs::read(&their_clock_path).await {
            Ok(bytes) => Ok(VectorClock::decode(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(VectorClock::new()),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    async fn send_bundle(&mut self, peer_id: Id128, bundle_path: &Path) -> Result<()> {
        self.require_connected(peer_id)?;
        let dir = self.peer_dir(peer_id);
        let file_name = bundle_path
            .file_name()
            .ok_or_else(|| TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, "bundle path has no file name")))?;
        fs::copy(bundle_path, dir.join(file_name)).await?;
        Ok(())
    }

    async fn receive_bundle(&mut self, peer_id: Id128, dest_dir: &Path) -> Result<Option<PathBuf>> {
        self.require_connected(peer_id)?;
        let dir = self.peer_dir(peer_id);
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("bundle") {
                let dest = dest_dir.join(entry.file_name());
                fs::copy(&path, &dest).await?;
                fs::remove_file(&path).await?;
                return Ok(Some(dest));
            }
        }
        Ok(None)
    }
}
