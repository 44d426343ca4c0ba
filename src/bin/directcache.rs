//! directcache command-line tool
//!
//! Drives an in-process cache for capacity planning and soak testing:
//! - Fill a cache with fixed-size payloads until allocation fails
//! - Run concurrent store/get/release churn with maintenance enabled
//! - Print the status report of a freshly configured cache
//!
//! # Examples
//!
//! ```bash
//! # How many 230-byte entries fit in the configured memory?
//! directcache fill --payload 230
//!
//! # Eight workers, one million operations, settings from a file
//! directcache --config cache.toml churn --ops 1000000 --workers 8
//! ```

use clap::{Args, Parser, Subcommand};
use directcache::error::Error;
use directcache::storage::human_size;
use directcache::{CacheConfig, DirectCache, Handle};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Off-heap blob cache tool
#[derive(Parser, Debug)]
#[command(name = "directcache")]
#[command(version = directcache::VERSION)]
#[command(about = "Off-heap blob cache with online compaction", long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file (defaults and DIRECTCACHE_* variables otherwise)
    #[arg(long, global = true, env = "DIRECTCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "DIRECTCACHE_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store fixed payloads until allocation fails
    Fill(FillArgs),

    /// Concurrent random store/get/release
    Churn(ChurnArgs),

    /// Show the status of a freshly configured cache
    Status,

    /// Show version
    Version,
}

#[derive(Args, Debug)]
struct FillArgs {
    /// Payload size in bytes
    #[arg(long, default_value = "230")]
    payload: usize,
}

#[derive(Args, Debug)]
struct ChurnArgs {
    /// Total operations across all workers
    #[arg(long, default_value = "100000")]
    ops: usize,

    /// Worker threads
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Largest payload in bytes
    #[arg(long, default_value = "4096")]
    max_payload: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;

    let config = match &cli.config {
        Some(path) => CacheConfig::from_file(path)?.with_env_overrides(),
        None => CacheConfig::from_env(),
    };

    match cli.command {
        Commands::Fill(args) => fill_command(config, args).await,
        Commands::Churn(args) => churn_command(config, args).await,
        Commands::Status => status_command(config).await,
        Commands::Version => {
            println!("directcache {}", directcache::VERSION);
            Ok(())
        }
    }
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "directcache.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

/// Fill command - measure usable capacity for one payload size
async fn fill_command(config: CacheConfig, args: FillArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.payload > 0, "payload must be at least one byte");
    let total = config.total_memory;
    let cache = DirectCache::new(config)?;
    let payload = vec![0xa5u8; args.payload];

    let started = Instant::now();
    let mut stored = 0usize;
    let stop = loop {
        match cache.store(&payload) {
            Ok(_) => stored += payload.len(),
            Err(e) => break e,
        }
    };

    println!(
        "Stored {} entries, {} of {} ({:.3}%) in {:?}; stopped by: {}",
        cache.size(),
        human_size(stored),
        human_size(total),
        stored as f64 * 100.0 / total as f64,
        started.elapsed(),
        stop
    );
    println!("{}", cache.status());

    cache.close().await;
    Ok(())
}

/// Churn command - concurrent workload with maintenance running
async fn churn_command(config: CacheConfig, args: ChurnArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.workers > 0, "at least one worker is required");
    anyhow::ensure!(args.max_payload > 0, "max payload must be at least one byte");

    let cache = DirectCache::start(config)?;
    info!(cache = cache.name(), workers = args.workers, ops = args.ops, "Starting churn");

    let started = Instant::now();
    let per_worker = args.ops / args.workers;
    let mut workers = Vec::with_capacity(args.workers);
    for _ in 0..args.workers {
        let cache = Arc::clone(&cache);
        let max_payload = args.max_payload;
        workers.push(tokio::task::spawn_blocking(move || {
            churn_worker(&cache, per_worker, max_payload)
        }));
    }

    let mut totals = ChurnTotals::default();
    for worker in workers {
        totals.absorb(worker.await??);
    }

    println!(
        "{} ops in {:?}: {} stores, {} gets, {} releases, {} rejected stores",
        per_worker * args.workers,
        started.elapsed(),
        totals.stores,
        totals.gets,
        totals.releases,
        totals.rejected
    );
    println!("{}", cache.status());
    println!("{}", serde_json::to_string_pretty(&cache.stats())?);

    cache.close().await;
    Ok(())
}

#[derive(Debug, Default)]
struct ChurnTotals {
    stores: usize,
    gets: usize,
    releases: usize,
    rejected: usize,
}

impl ChurnTotals {
    fn absorb(&mut self, other: ChurnTotals) {
        self.stores += other.stores;
        self.gets += other.gets;
        self.releases += other.releases;
        self.rejected += other.rejected;
    }
}

fn churn_worker(cache: &DirectCache, ops: usize, max_payload: usize) -> anyhow::Result<ChurnTotals> {
    let mut rng = rand::thread_rng();
    let mut live: Vec<(Handle, u8)> = Vec::new();
    let mut totals = ChurnTotals::default();

    for _ in 0..ops {
        match rng.gen_range(0..3) {
            0 if !live.is_empty() => {
                let (handle, fill) = live[rng.gen_range(0..live.len())];
                let bytes = cache.get(&handle)?;
                anyhow::ensure!(
                    bytes.iter().all(|&b| b == fill),
                    "corrupted payload behind {}",
                    handle
                );
                totals.gets += 1;
            }
            1 if !live.is_empty() => {
                let (handle, _) = live.swap_remove(rng.gen_range(0..live.len()));
                cache.release(&handle)?;
                totals.releases += 1;
            }
            _ => {
                let fill: u8 = rng.gen();
                let payload = vec![fill; rng.gen_range(1..=max_payload)];
                match cache.store(&payload) {
                    Ok(handle) => {
                        live.push((handle, fill));
                        totals.stores += 1;
                    }
                    Err(e @ (Error::AllocationFailed { .. } | Error::CapacityExhausted { .. })) => {
                        debug!(error = %e, "Store rejected");
                        totals.rejected += 1;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    for (handle, _) in live {
        cache.release(&handle)?;
        totals.releases += 1;
    }
    Ok(totals)
}

/// Status command - print the report of an empty cache
async fn status_command(config: CacheConfig) -> anyhow::Result<()> {
    let cache = DirectCache::new(config)?;
    println!("{}", cache.status());
    println!("{}", serde_json::to_string_pretty(&cache.stats())?);
    cache.close().await;
    Ok(())
}
