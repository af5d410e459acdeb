//! framesyncd - collector daemon accepting chunked uploads from devices.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use framesync::config::ServerCfg;
use framesync::receiver::{log_ingests, FileServer};
use framesync::retry::RetryPolicy;
use framesync::store::{DeviceIdentity, FsObjectStore, StaticDirectory};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "framesyncd - collector daemon for resumable chunked uploads"
)]
struct Args {
    /// Listen address
    #[arg(short = 'b', long, default_value = "0.0.0.0:9610")]
    bind: String,

    /// Root directory for stored objects
    #[arg(short = 'o', long)]
    out: PathBuf,

    /// Bucket name objects are stored under
    #[arg(long, default_value = "captures")]
    bucket: String,

    /// Seconds a session may stay idle before it is closed
    #[arg(long, default_value_t = 60)]
    session_timeout: u64,

    /// Durable-write attempts before an upload is failed
    #[arg(long, default_value_t = 3)]
    storage_attempts: u32,

    /// Show debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let cfg = ServerCfg {
        addr: args.bind,
        bucket: args.bucket,
        session_timeout: Duration::from_secs(args.session_timeout),
        storage_retry: RetryPolicy {
            max_attempts: args.storage_attempts,
            ..RetryPolicy::default()
        },
        ..ServerCfg::default()
    };

    let store = Arc::new(FsObjectStore::new(args.out));
    // No registry is wired in the standalone daemon; accept every device
    // under a null owner.
    let directory = Arc::new(StaticDirectory::permissive(DeviceIdentity {
        owner_id: 0,
        profiles: Vec::new(),
    }));

    let (ingest_tx, ingest_rx) = tokio::sync::mpsc::channel(256);
    tokio::spawn(log_ingests(ingest_rx));

    let server = FileServer::bind(cfg, store, directory, ingest_tx)
        .await
        .context("start server")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let serve = tokio::spawn(server.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    info!("daemon: shutting down");
    let _ = shutdown_tx.send(true);
    serve.await.context("join accept loop")??;
    Ok(())
}
