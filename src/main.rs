use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;

use mdfeed_rs::clock;
use mdfeed_rs::config::Settings;
use mdfeed_rs::market_data::router::FeedRouter;
use mdfeed_rs::persist::{CompressionManager, EventFilter, EventStore, ExportFormat};
use mdfeed_rs::telemetry;

#[derive(Parser, Debug)]
#[command(name = "mdfeed", version, about = "Market-data feed core")]
struct Cli {
    /// Settings file (defaults to ./mdfeed.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream the given keys and print merged updates as JSON lines
    Run {
        /// Price keys for the primary provider
        #[arg(short, long, value_delimiter = ',')]
        keys: Vec<String>,
        /// Wallet accounts for the Helius stream
        #[arg(short, long, value_delimiter = ',')]
        wallets: Vec<String>,
    },
    /// Export audit events
    Export {
        /// json or csv
        #[arg(short, long, default_value = "json")]
        format: ExportFormat,
        #[arg(short, long)]
        aggregate: Option<String>,
        #[arg(long)]
        limit: Option<i64>,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Compress aged events and closed orders once
    Compress,
    /// Print event and compression statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    telemetry::init_tracing(&settings.telemetry.log_filter);
    telemetry::init_metrics(settings.telemetry.metrics_port)?;

    match cli.command {
        Command::Run { keys, wallets } => run(settings, keys, wallets).await,
        Command::Export { format, aggregate, limit, out } => {
            let store = EventStore::open(&settings.event_store, clock::system()).await?;
            let filter = EventFilter { aggregate_id: aggregate, limit, ..Default::default() };
            let bytes = store.export(&filter, format).await?;
            match out {
                Some(path) => {
                    tokio::fs::write(&path, &bytes)
                        .await
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    tracing::info!(path = %path.display(), bytes = bytes.len(), "export written");
                }
                None => println!("{}", String::from_utf8_lossy(&bytes)),
            }
            store.close().await;
            Ok(())
        }
        Command::Compress => {
            let clock = clock::system();
            let store = EventStore::open(&settings.event_store, Arc::clone(&clock)).await?;
            let manager = CompressionManager::new(store.pool().clone(), settings.compression.clone(), clock).await?;
            let summary = manager.run_once().await?;
            println!("compressed {} events and {} orders", summary.events, summary.orders);
            store.close().await;
            Ok(())
        }
        Command::Stats => {
            let clock = clock::system();
            let store = EventStore::open(&settings.event_store, Arc::clone(&clock)).await?;
            let events = store.stats().await?;
            let manager = CompressionManager::new(store.pool().clone(), settings.compression.clone(), clock).await?;
            let compression = manager.stats().await?;
            println!("{}", serde_json::to_string_pretty(&events)?);
            println!("{}", serde_json::to_string_pretty(&compression)?);
            store.close().await;
            Ok(())
        }
    }
}

async fn run(settings: Settings, keys: Vec<String>, wallets: Vec<String>) -> Result<()> {
    if keys.is_empty() && wallets.is_empty() {
        anyhow::bail!("nothing to stream, pass --keys and/or --wallets");
    }
    let router = FeedRouter::start(settings).await?;
    let mut streams = Vec::new();
    if !keys.is_empty() {
        streams.push(router.subscribe(keys).await?);
    }
    if !wallets.is_empty() {
        streams.push(router.subscribe_wallets(wallets).await?);
    }
    let mut updates = futures::stream::select_all(streams);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.next() => match update {
                Some(update) => println!("{}", serde_json::to_string(&update)?),
                None => break,
            },
        }
    }

    for status in router.status() {
        tracing::info!(
            provider = status.provider,
            state = ?status.state,
            received = status.statistics.messages_received,
            reconnects = status.statistics.reconnect_count,
            p99_us = status.latency.p99_us,
            "stream summary"
        );
    }
    router.shutdown().await;
    Ok(())
}
