//! framesync - edge agent pushing ready captures to collector servers.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use framesync::config::SenderCfg;
use framesync::protocol::DEFAULT_CHUNK_SIZE;
use framesync::sender::Uploader;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "framesync - resumable chunked upload agent for capture devices"
)]
struct Args {
    /// Directory watched for ready capture files
    #[arg(short = 'd', long)]
    dir: PathBuf,

    /// Collector server addresses (host:port), tried round-robin
    #[arg(short = 's', long = "server", required = true)]
    servers: Vec<String>,

    /// Device identifier sent in the handshake (typically the MAC)
    #[arg(long)]
    device_id: String,

    /// Chunk size in bytes
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: u64,

    /// Maximum files taken per directory scan
    #[arg(long, default_value_t = 16)]
    batch: usize,

    /// Seconds between directory scans
    #[arg(long, default_value_t = 2)]
    scan_interval: u64,

    /// Upload throughput cap in bytes/sec (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    limit: u64,

    /// Seconds between system usage reports (0 disables)
    #[arg(long, default_value_t = 60)]
    usage_interval: u64,

    /// Show debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    anyhow::ensure!(args.chunk_size > 0, "chunk size must be positive");
    anyhow::ensure!(
        args.dir.is_dir(),
        "watch directory {:?} does not exist",
        args.dir
    );

    let cfg = SenderCfg {
        device_id: args.device_id,
        target: args.dir,
        backups: args.servers,
        chunk_size: args.chunk_size,
        batch_fetch: args.batch,
        scan_interval: Duration::from_secs(args.scan_interval),
        limit_bytes_per_sec: args.limit,
        usage_interval: Duration::from_secs(args.usage_interval),
        ..SenderCfg::default()
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let _uploader = Uploader::start(cfg, None, shutdown_rx);
    info!("agent: started");

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    info!("agent: shutting down");
    let _ = shutdown_tx.send(true);
    // Give in-flight tasks a moment to observe the flag.
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}
