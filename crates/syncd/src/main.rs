//! syncd - embedded multi-master replication engine
//!
//! A thin `clap::Subcommand` front-end over the engine library: no
//! daemonization, no network listener of its own, just enough to exercise
//! the engine end-to-end against a file-drop transport.

use clap::Parser;
use std::process::ExitCode;
use syncd::config::{Cli, Command};
use syncd::conflict::ResolverKind;
use syncd::sync_loop::{SyncLoop, SyncLoopConfig};
use syncd::transport::FileDropTransport;
use syncd::{Engine, EngineError};
use sync_proto::id::Id128;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("syncd=debug")
    } else {
        EnvFilter::from_default_env().add_directive("syncd=info".parse().unwrap())
    };
    if cli.log_format == "json" {
        tracing_subscriber::registry().with(fmt::layer().json()).with(filter).init();
    } else {
        tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
    }

    info!("syncd v{}", env!("CARGO_PKG_VERSION"));

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<(), EngineError> {
    match cli.command {
        Command::Init { display_name, sign } => {
            let engine = Engine::init(&cli.store, &display_name, sign)?;
            info!(device_id = %engine.device.device_id, "initialized device identity");
            Ok(())
        }
        Command::Serve { drop_dir, interval_secs } => {
            let engine = Engine::open(&cli.store)?;
            let transport = FileDropTransport::new(drop_dir);
            let config = SyncLoopConfig {
                interval: std::time::Duration::from_secs(interval_secs),
                ..SyncLoopConfig::default()
            };
            let mut sync_loop = SyncLoop::new(engine.store_handle(), engine.device.device_id, transport, config);
            let stop = sync_loop.stop_handle();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("received shutdown signal");
                let _ = stop.send(());
            });
            sync_loop.run().await;
            Ok(())
        }
        Command::Sync { drop_dir, peer } => {
            let engine = Engine::open(&cli.store)?;
            let peer_id = parse_id(&peer)?;
            let mut transport = FileDropTransport::new(drop_dir);
            let applied = engine.sync_once(&mut transport, peer_id).await?;
            info!(applied, "sync cycle completed");
            Ok(())
        }
        Command::Status => {
            let engine = Engine::open(&cli.store)?;
            let stats = engine.stats()?;
            println!(
                "operations={} unresolved_conflicts={} peers={}",
                stats.operation_count, stats.unresolved_conflicts, stats.peer_count
            );
            Ok(())
        }
        Command::Resolve { conflict, strategy } => {
            let engine = Engine::open(&cli.store)?;
            let conflict_id = parse_id(&conflict)?;
            let resolver = match strategy.as_str() {
                "last-write-wins" => ResolverKind::LastWriteWins,
                "field-merge" => ResolverKind::FieldMerge { prefer_local: false },
                "manual" => ResolverKind::Manual,
                other => return Err(EngineError::Validation(format!("unknown resolution strategy {other}"))),
            };
            let op = engine.resolve_conflict(conflict_id, &resolver)?;
            match op {
                Some(op) => info!(op_id = %op.op_id, "conflict resolved"),
                None => info!("conflict deferred"),
            }
            Ok(())
        }
        Command::Migrate { table, column, column_type } => {
            let engine = Engine::open(&cli.store)?;
            let pending = engine.unresolved_conflicts()?;
            if !pending.is_empty() {
                return Err(EngineError::ConflictsBlockOperation(pending.len()));
            }
            let migration = engine.create_migration(&table, &column, &column_type, None)?;
            info!(migration_id = %migration.migration_id, "migration applied");
            Ok(())
        }
        Command::Peers { register, endpoint_hint } => {
            let engine = Engine::open(&cli.store)?;
            if let Some(peer) = register {
                let peer_id = parse_id(&peer)?;
                engine.register_peer(peer_id, endpoint_hint.as_deref())?;
            }
            for peer in engine.peers()? {
                println!("{} last_sync_at={:?}", peer.peer_id, peer.last_sync_at);
            }
            Ok(())
        }
        Command::Snapshot { out, peer } => {
            let engine = Engine::open(&cli.store)?;
            let peer_id = parse_id(&peer)?;
            let vector_clock = engine
                .peers()?
                .into_iter()
                .find(|p| p.peer_id == peer_id)
                .and_then(|p| p.last_sent_vector_clock)
                .unwrap_or_default();
            engine.generate_bundle_to(peer_id, &vector_clock, &out)?;
            info!(path = %out.display(), "wrote snapshot bundle");
            Ok(())
        }
    }
}

fn parse_id(s: &str) -> Result<Id128, EngineError> {
    Id128::from_hex(s).ok_or_else(|| EngineError::Validation(format!("invalid id {s}")))
}
