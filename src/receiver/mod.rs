//! Collector server: accepts device connections and drives one session
//! per connection over the frame codec.

mod session;

pub use session::{Outcome, Session};

use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, error, info};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::codec::{read_frame_timed, write_frame};
use crate::config::ServerCfg;
use crate::reassembly::FileTable;
use crate::store::{Directory, IngestRecord, ObjectStore};

pub struct FileServer {
    cfg: ServerCfg,
    listener: TcpListener,
    table: Arc<FileTable>,
    directory: Arc<dyn Directory>,
    next_session: AtomicU64,
}

impl FileServer {
    /// Bind the listen socket and build the shared upload table. Completed
    /// uploads are announced on `downstream` after the durable write.
    pub async fn bind(
        cfg: ServerCfg,
        store: Arc<dyn ObjectStore>,
        directory: Arc<dyn Directory>,
        downstream: mpsc::Sender<IngestRecord>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&cfg.addr)
            .await
            .with_context(|| format!("bind {}", cfg.addr))?;
        let table = Arc::new(FileTable::new(
            cfg.bucket.clone(),
            cfg.max_chunk_size,
            cfg.storage_retry,
            store,
            directory.clone(),
            downstream,
        ));
        Ok(Self {
            cfg,
            listener,
            table,
            directory,
            next_session: AtomicU64::new(0),
        })
    }

    /// The actually-bound address; the configured one may use port 0.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener.local_addr().context("listener local addr")
    }

    /// Accept loop. Returns when the shutdown flag flips; in-flight
    /// sessions observe the same flag and wind down on their own.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("server: listening on {}", self.local_addr()?);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("server: shutdown requested, stop accepting");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted.context("accept")?;
                    let id = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!("server: session {} accepted from {}", id, peer);
                    let cfg = self.cfg.clone();
                    let table = Arc::clone(&self.table);
                    let directory = Arc::clone(&self.directory);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let addr = peer.to_string();
                        if let Err(err) =
                            serve_session(stream, addr.clone(), cfg, table, directory, shutdown)
                                .await
                        {
                            info!("server: session {} ({}) ended: {:#}", id, addr, err);
                        } else {
                            debug!("server: session {} ({}) closed", id, addr);
                        }
                    });
                }
            }
        }
    }
}

async fn serve_session(
    mut stream: TcpStream,
    addr: String,
    cfg: ServerCfg,
    table: Arc<FileTable>,
    directory: Arc<dyn Directory>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    stream.set_nodelay(true).ok();
    let session_timeout = cfg.session_timeout;
    let mut session = Session::new(addr, cfg, table, directory);
    loop {
        let msg = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            res = read_frame_timed(&mut stream, session_timeout) => match res {
                Ok(msg) => msg,
                Err(err) if is_clean_eof(&err) => return Ok(()),
                Err(err) => return Err(err),
            },
        };
        match session.on_req(msg).await? {
            Outcome::Reply(rsp) => write_frame(&mut stream, &rsp).await?,
            Outcome::ReplyThenClose(rsp) => {
                write_frame(&mut stream, &rsp).await?;
                anyhow::bail!("peer violated the protocol");
            }
            Outcome::Silent => {}
        }
    }
}

/// The peer hanging up between frames is a normal close, not a failure.
fn is_clean_eof(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
        .any(|io| io.kind() == ErrorKind::UnexpectedEof)
}

/// Drain the downstream channel, logging each ingest. Stands in for a
/// queue publisher when the daemon runs without one.
pub async fn log_ingests(mut rx: mpsc::Receiver<IngestRecord>) {
    while let Some(record) = rx.recv().await {
        info!(
            "ingest: owner {} profile {} key {} bytes {} mod_time {}",
            record.owner_id,
            record.device_profile,
            record.object_key,
            record.bytes.len(),
            record.mod_time
        );
    }
    error!("ingest: downstream channel closed");
}
