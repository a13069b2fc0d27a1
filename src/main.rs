//! telemetry-sync - inspect and maintain offline telemetry buffers
//!
//! # Usage
//!
//! ```bash
//! # Per-stream counts, bytes and age of the oldest entry
//! telemetry-sync status
//!
//! # Drain every stream into the configured sink
//! telemetry-sync --config telemetry_sync.toml flush
//!
//! # Drop expired entries / clear one stream
//! telemetry-sync sweep
//! telemetry-sync purge --stream reports
//!
//! # Validate a config file and print the effective values
//! telemetry-sync --config telemetry_sync.toml check-config
//! ```
//!
//! # Environment Variables
//!
//! - `TELEMETRY_SYNC_CONFIG`: config file path (same as `--config`)
//! - `TELEMETRY_SYNC_API_KEY`: anonymous sink key, overrides `sink.api_key`
//! - `RUST_LOG`: logging level (default: info)

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use telemetry_sync::config::{validation, TelemetryConfig, CONFIG_ENV_VAR};
use telemetry_sync::{
    BlobStore, BoundedBuffer, BufferStats, HttpSink, SledStore, StreamType, TelemetryHub,
    TelemetrySink,
};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "telemetry-sync")]
#[command(about = "Offline telemetry buffer maintenance")]
#[command(version)]
struct CliArgs {
    /// Config file (TOML). Without it the standard search order applies.
    #[arg(long, global = true, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// Override `storage.path`
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: SubCommand,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Show buffered entries per stream
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Remove entries older than each stream's retention window
    Sweep,
    /// Drain all streams into the configured sink
    Flush {
        /// Sink base URL, overrides `sink.url`
        #[arg(long)]
        url: Option<String>,
        /// Anonymous sink key, overrides `sink.api_key`
        #[arg(long, env = "TELEMETRY_SYNC_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
    },
    /// Drop every buffered entry of one stream
    Purge {
        /// metrics, alerts or reports
        #[arg(long)]
        stream: StreamType,
    },
    /// Load and validate the config, print warnings and effective values
    CheckConfig,
}

// ============================================================================
// Helpers
// ============================================================================

fn load_config(args: &CliArgs) -> Result<TelemetryConfig> {
    let mut config = match &args.config {
        Some(path) => TelemetryConfig::load_from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => TelemetryConfig::load(),
    };
    if let Some(dir) = &args.data_dir {
        config.storage.path = dir.display().to_string();
    }
    Ok(config)
}

fn open_store(config: &TelemetryConfig) -> Result<Arc<dyn BlobStore>> {
    let store = SledStore::open(&config.storage.path, config.storage.max_blob_bytes)
        .with_context(|| format!("opening store at {}", config.storage.path))?;
    Ok(Arc::new(store))
}

fn open_buffers(config: &TelemetryConfig, store: &Arc<dyn BlobStore>) -> Vec<BoundedBuffer> {
    StreamType::ALL
        .into_iter()
        .map(|stream| {
            BoundedBuffer::open(
                stream,
                config.stream(stream).limits(),
                config.sync.purge_fraction,
                Arc::clone(store),
            )
        })
        .collect()
}

fn print_status(stats: &[BufferStats]) {
    println!(
        "{:<8} {:>7} {:>10} {:>10} {:>8}  {}",
        "stream", "entries", "bytes", "blob", "evicted", "oldest"
    );
    let now = Utc::now();
    for s in stats {
        let oldest = s.oldest.map_or_else(
            || "-".to_string(),
            |t| format!("{} ({}m ago)", t.format("%Y-%m-%d %H:%M:%S"), (now - t).num_minutes()),
        );
        println!(
            "{:<8} {:>7} {:>10} {:>10} {:>8}  {}",
            s.stream.as_str(),
            s.count,
            s.total_bytes,
            s.blob_bytes,
            s.evicted_total,
            oldest
        );
    }
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_status(config: &TelemetryConfig, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let stats: Vec<BufferStats> = open_buffers(config, &store)
        .iter()
        .map(BoundedBuffer::stats)
        .collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_status(&stats);
    }
    Ok(())
}

fn cmd_sweep(config: &TelemetryConfig) -> Result<()> {
    let store = open_store(config)?;
    let now = Utc::now();
    for buffer in open_buffers(config, &store) {
        let removed = buffer.sweep_retention(now);
        println!("{:<8} removed {removed}", buffer.stream().as_str());
    }
    Ok(())
}

async fn cmd_flush(
    config: &TelemetryConfig,
    url: Option<String>,
    api_key: Option<String>,
) -> Result<()> {
    let Some(url) = url.or_else(|| config.sink.url.clone()) else {
        bail!("no sink URL: set sink.url in the config or pass --url");
    };
    let api_key = api_key.or_else(|| config.sink.api_key.clone());
    let sink: Arc<dyn TelemetrySink> = Arc::new(
        HttpSink::new(&url, api_key.as_deref(), config.sync.timeout())
            .context("building HTTP sink")?,
    );

    let store = open_store(config)?;
    let hub = TelemetryHub::new(config, store, Arc::clone(&sink), sink);
    // Initialization already flushes pending entries when the sink is up
    hub.initialize().wait().await;
    let results = hub.flush_all().await;

    for (stream, result) in &results {
        println!("{:<8} {result}", stream.as_str());
    }
    for stats in hub.stats() {
        if stats.buffer.count > 0 {
            warn!(stream = %stats.stream, remaining = stats.buffer.count, "Entries still buffered");
        }
    }
    if results.iter().any(|(_, r)| r.failed > 0) {
        bail!("one or more streams failed to flush");
    }
    Ok(())
}

fn cmd_purge(config: &TelemetryConfig, stream: StreamType) -> Result<()> {
    let store = open_store(config)?;
    let buffer = BoundedBuffer::open(
        stream,
        config.stream(stream).limits(),
        config.sync.purge_fraction,
        store,
    );
    let removed = buffer.clear();
    info!(stream = %stream, removed, "Stream purged");
    println!("{:<8} purged {removed}", stream.as_str());
    Ok(())
}

fn cmd_check_config(args: &CliArgs) -> Result<()> {
    if let Some(path) = &args.config {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let warnings = validation::validate_unknown_keys(&raw);
        for w in &warnings {
            println!("warning: {w}");
        }
        if warnings.is_empty() {
            println!("no unknown keys");
        }
    }
    let config = load_config(args)?;
    config.validate()?;
    println!("{}", config.to_toml()?);
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();

    match &args.command {
        SubCommand::CheckConfig => cmd_check_config(&args),
        SubCommand::Status { json } => cmd_status(&load_config(&args)?, *json),
        SubCommand::Sweep => cmd_sweep(&load_config(&args)?),
        SubCommand::Flush { url, api_key } => {
            cmd_flush(&load_config(&args)?, url.clone(), api_key.clone()).await
        }
        SubCommand::Purge { stream } => cmd_purge(&load_config(&args)?, *stream),
    }
}
