//! CLI configuration for syncd.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// syncd - embedded multi-master replication engine
#[derive(Parser, Debug, Clone)]
#[command(name = "syncd")]
#[command(about = "Embedded multi-master replication engine and sync daemon")]
pub struct Cli {
    /// Path to the embedded store file.
    #[arg(short, long, default_value = "./syncd.db", env = "SYNCD_STORE")]
    pub store: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty).
    #[arg(long, default_value = "pretty")]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create a new store and device identity.
    Init {
        /// Human-readable name for this device.
        #[arg(long)]
        display_name: String,
        /// Generate and advertise an Ed25519 signing key.
        #[arg(long)]
        sign: bool,
    },
    /// Run the scheduled sync loop against a file-drop transport.
    Serve {
        /// Shared directory the file-drop transport exchanges bundles through.
        #[arg(long)]
        drop_dir: PathBuf,
        /// Seconds between checks for peers due a sync.
        #[arg(long, default_value = "30")]
        interval_secs: u64,
    },
    /// Run one sync cycle against a single peer.
    Sync {
        /// Shared directory the file-drop transport exchanges bundles through.
        #[arg(long)]
        drop_dir: PathBuf,
        /// Hex-encoded id of the peer to sync with.
        #[arg(long)]
        peer: String,
    },
    /// Print operation count, unresolved conflicts, and peer count.
    Status,
    /// Resolve a pending conflict.
    Resolve {
        /// Hex-encoded conflict id.
        #[arg(long)]
        conflict: String,
        /// Resolution strategy: last-write-wins, field-merge, or manual.
        #[arg(long, default_value = "last-write-wins")]
        strategy: String,
    },
    /// Apply an additive schema migration.
    Migrate {
        #[arg(long)]
        table: String,
        #[arg(long)]
        column: String,
        #[arg(long)]
        column_type: String,
    },
    /// Register a peer and/or list known peers.
    Peers {
        /// Hex-encoded id of a peer to register.
        #[arg(long)]
        register: Option<String>,
        /// Endpoint hint to record alongside a registered peer.
        #[arg(long)]
        endpoint_hint: Option<String>,
    },
    /// Write a bundle containing every operation since a given vector clock.
    Snapshot {
        #[arg(long)]
        out: PathBuf,
        /// Hex-encoded id to attribute the bundle to.
        #[arg(long)]
        peer: String,
    },
}
