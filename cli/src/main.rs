//! chainsync CLI — run and inspect the event sync engine.
//!
//! Usage:
//! ```bash
//! chainsync run ./chainsync.json
//! chainsync status ./chainsync.json
//! chainsync info
//! ```

use std::env;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use chainsync_core::config::SyncConfig;
use chainsync_core::coordinator::SyncCoordinator;
use chainsync_core::health::HealthMonitor;
use chainsync_core::lifecycle::LifecycleManager;
use chainsync_core::queue::{InProcessQueue, WorkQueue};
use chainsync_core::store::{EventStore, FailureSink, ProgressStore};
use chainsync_evm::EvmLedgerClient;
use chainsync_storage::{MemoryStore, SqliteStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    match args[1].as_str() {
        "run" => cmd_run(config_arg(&args)?).await,
        "status" => cmd_status(config_arg(&args)?).await,
        "info" => {
            cmd_info();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("chainsync {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    }
}

fn config_arg(args: &[String]) -> anyhow::Result<&str> {
    args.get(2)
        .map(String::as_str)
        .context("missing <config.json> argument")
}

fn print_usage() {
    println!("chainsync {}", env!("CARGO_PKG_VERSION"));
    println!("Resumable, idempotent blockchain event sync engine\n");
    println!("USAGE:");
    println!("    chainsync <COMMAND> [config.json]\n");
    println!("COMMANDS:");
    println!("    run <config.json>     Run the sync engine until Ctrl-C");
    println!("    status <config.json>  Print sync progress and health");
    println!("    info                  Show engine defaults");
    println!("    version               Print version");
    println!("    help                  Print this help");
}

fn cmd_info() {
    println!("chainsync v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default batch size: 1000 blocks/query");
    println!("  Default monitor interval: 30s");
    println!("  Default drain timeout: 30s");
    println!("  Default workers: 4");
    println!("  Storage backends: memory, SQLite (database_path)");
    println!("  Chains: EVM (Ethereum, Arbitrum, Base, Polygon, Optimism, ...)");
}

type Stores = (
    Arc<dyn ProgressStore>,
    Arc<dyn EventStore>,
    Arc<dyn FailureSink>,
);

async fn build_stores(config: &SyncConfig) -> anyhow::Result<Stores> {
    match &config.database_path {
        Some(path) => {
            let store = Arc::new(
                SqliteStore::open(path)
                    .await
                    .with_context(|| format!("cannot open database {path}"))?,
            );
            tracing::info!(%path, "using sqlite storage");
            Ok((store.clone(), store.clone(), store))
        }
        None => {
            let store = Arc::new(MemoryStore::new());
            tracing::warn!("no database_path configured; state will not survive restarts");
            Ok((store.clone(), store.clone(), store))
        }
    }
}

async fn cmd_run(config_path: &str) -> anyhow::Result<()> {
    let config = SyncConfig::from_file(config_path)?;
    anyhow::ensure!(!config.rpc_url.is_empty(), "rpc_url is not configured");
    anyhow::ensure!(
        !config.enabled_entities().is_empty(),
        "no enabled entities configured"
    );
    for entity in &config.entities {
        for kind in &entity.event_kinds {
            anyhow::ensure!(
                chainsync_evm::kinds::topic_for(kind).is_some(),
                "entity {}: unknown event kind {kind}",
                entity.address
            );
        }
    }

    let ledger = Arc::new(EvmLedgerClient::new(&config.rpc_url)?);
    let (progress, events, failures) = build_stores(&config).await?;
    let queue = Arc::new(InProcessQueue::new());

    let coordinator = Arc::new(SyncCoordinator::new(
        config.clone(),
        ledger.clone(),
        progress.clone(),
        events,
        failures,
        queue.clone() as Arc<dyn WorkQueue>,
    ));
    queue.start(config.workers, coordinator.clone());

    let lifecycle = LifecycleManager::new(
        config.clone(),
        coordinator.clone(),
        progress.clone(),
        queue.clone(),
    );
    lifecycle.run_recovery().await?;

    // Entities configured but never indexed get their first start here;
    // recovery only resumes rows that already exist.
    for entity in config.enabled_entities() {
        let entity = entity.normalized();
        if progress.load(&entity.address, entity.chain_id).await?.is_none() {
            match coordinator.start(&entity.address).await {
                Ok(row) => tracing::info!(
                    address = %entity.address,
                    chain_id = entity.chain_id,
                    from_block = row.sync_start_block,
                    "entity started"
                ),
                Err(err) => tracing::warn!(
                    address = %entity.address,
                    chain_id = entity.chain_id,
                    error = %err,
                    "entity could not be started"
                ),
            }
        }
    }

    tracing::info!("sync engine running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for shutdown signal")?;

    tracing::info!("shutdown signal received");
    lifecycle.drain(config.drain_timeout()).await;
    queue.join().await;
    Ok(())
}

async fn cmd_status(config_path: &str) -> anyhow::Result<()> {
    let config = SyncConfig::from_file(config_path)?;
    let ledger = Arc::new(EvmLedgerClient::new(&config.rpc_url)?);
    let (progress, _, failures) = build_stores(&config).await?;

    let rows = progress.list().await?;
    if rows.is_empty() {
        println!("No entities have been indexed yet.");
    }
    for row in &rows {
        println!(
            "{} (chain {}): block {} | events {} | {}",
            row.entity_address,
            row.chain_id,
            row.last_processed_block,
            row.total_events_processed,
            if row.is_syncing { "syncing" } else { "idle" },
        );
    }

    let monitor = HealthMonitor::new(config, ledger, progress, failures);
    let report = monitor.check().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
