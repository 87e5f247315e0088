//! Trailbook sync probe
//!
//! Talks to a Trailbook backend the same way the app does, to check that
//! it is reachable and provisioned and to watch changes as they arrive.
//!
//! Usage:
//!   trailbook-probe --url https://example.supabase.co --api-key KEY check
//!   trailbook-probe watch journal_entries
//!   trailbook-probe dump map_pins

use std::sync::Arc;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use trailbook_probe::{event_line, probe, record_line, render_status};
use trailbook_sync::{RestStore, RestStoreConfig, SyncConfig, SyncCoordinator, SyncStatus};
use trailbook_types::{ChangeEvent, Collection};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "trailbook-probe")]
#[command(about = "Inspect a Trailbook sync backend")]
struct Args {
    /// Backend project URL
    #[arg(long, env = "TRAILBOOK_URL")]
    url: String,

    /// Public API key
    #[arg(long, env = "TRAILBOOK_API_KEY")]
    api_key: String,

    /// User access token (defaults to the API key)
    #[arg(long, env = "TRAILBOOK_ACCESS_TOKEN")]
    access_token: Option<String>,

    /// Change feed polling interval in milliseconds
    #[arg(long, default_value = "5000")]
    poll_ms: u64,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check connectivity and read every collection once
    Check {
        /// Collections to check (defaults to all known collections)
        collections: Vec<String>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print change notifications for a collection until interrupted
    Watch { collection: String },
    /// Print every record in a collection as JSON lines
    Dump { collection: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let store_config = RestStoreConfig {
        access_token: args.access_token.clone(),
        poll_interval_ms: args.poll_ms,
        ..RestStoreConfig::new(args.url.clone(), args.api_key.clone())
    };
    let store = RestStore::new(store_config).context("invalid backend configuration")?;
    let config = SyncConfig {
        check_on_initialize: false,
        ..SyncConfig::default()
    };
    let coordinator = SyncCoordinator::new(Arc::new(store), config);

    let result = match args.command {
        Command::Check { collections, json } => check(&coordinator, collections, json).await,
        Command::Watch { collection } => watch(&coordinator, &collection).await,
        Command::Dump { collection } => dump(&coordinator, &collection).await,
    };
    coordinator.dispose();
    result
}

async fn check(coordinator: &Arc<SyncCoordinator>, names: Vec<String>, json: bool) -> Result<()> {
    let names = if names.is_empty() {
        Collection::KNOWN.iter().map(|n| n.to_string()).collect()
    } else {
        names
    };
    let collections = names
        .into_iter()
        .map(Collection::new)
        .collect::<Result<Vec<_>, _>>()?;

    info!("Checking {} collections", collections.len());
    let report = probe(coordinator, &collections).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("\n========================================");
        println!("  Trailbook backend ({})", report.backend);
        println!("========================================");
        print!("{}", render_status(&coordinator.status()));
        println!();
        for c in &report.collections {
            match (&c.rows, &c.error) {
                (Some(rows), _) => println!("  {:<20} {} rows", c.name, rows),
                (None, Some(error)) => println!("  {:<20} {}", c.name, error),
                (None, None) => println!("  {:<20} ?", c.name),
            }
        }
        let missing = report.needs_setup();
        if !missing.is_empty() {
            println!("\n  Needs setup: {}", missing.join(", "));
        }
        println!("========================================\n");
    }

    if !report.is_healthy() {
        bail!("backend check failed");
    }
    Ok(())
}

async fn watch(coordinator: &Arc<SyncCoordinator>, name: &str) -> Result<()> {
    let collection = Collection::new(name)?;

    if !coordinator.check_connection().await {
        warn!("Backend unreachable, watching anyway");
    }

    let _status = coordinator.subscribe_to_status(|status: &SyncStatus| {
        info!("{}", status.indicator_label());
    });
    let _changes = coordinator.subscribe(collection.clone(), |event: &ChangeEvent| {
        println!("{}", event_line(event));
    });
    info!("Watching {} (Ctrl-C to stop)", collection);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Stopping");
    Ok(())
}

async fn dump(coordinator: &Arc<SyncCoordinator>, name: &str) -> Result<()> {
    let collection = Collection::new(name)?;
    let rows = coordinator.store().fetch_all(&collection).await?;
    for row in &rows {
        println!("{}", record_line(row));
    }
    info!("{} rows in {}", rows.len(), collection);
    Ok(())
}
