//! Sender upload engine.
//!
//! Watches a directory of ready captures and drives each file through a
//! prepare -> uploading -> complete state machine against a round-robin
//! choice of collector server. All state transitions run on one event loop
//! consuming the ready queue and the connection pool's event channel;
//! the prepare and uploading tables are keyed by sequence id and upload id
//! respectively and hold exactly one session per live file.

pub mod scan;
pub mod servers;
pub mod session;

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};

use crate::config::SenderCfg;
use crate::limiter::RateLimiter;
use crate::pool::{ConnectionPool, PoolEvent};
use crate::protocol::{
    chunk_count, Code, Handshake, InitUpload, InitUploadResponse, Message, Upload,
    UploadComplete, UploadCompleteResponse, UploadContinue, UploadResponse,
};
use crate::usage::UsageSampler;

use scan::{fetch_ready, Countdown};
use servers::{Discovery, ServerList};
use session::{Step, UploadSession};

const EVENT_BUF: usize = 128;

enum NextAction {
    SendChunk,
    SendComplete,
    Abandon,
}

pub struct Uploader {
    cfg: SenderCfg,
    pool: Arc<ConnectionPool>,
    servers: Arc<ServerList>,
    limiter: RateLimiter,
    seq: AtomicU64,
    /// Sessions awaiting InitUploadResponse, keyed by sequence id.
    prepares: RwLock<HashMap<u64, UploadSession>>,
    /// Sessions past the prepare handshake, keyed by server upload id.
    uploadings: RwLock<HashMap<u64, UploadSession>>,
    ready_tx: mpsc::Sender<PathBuf>,
    /// Countdown for the batch currently in flight.
    gate: Mutex<Option<Arc<Countdown>>>,
}

impl Uploader {
    /// Wire up the engine and spawn its background tasks: the event loop,
    /// the directory scanner, the server-list refresher, and the usage
    /// reporter. Tasks stop when the shutdown flag flips.
    pub fn start(
        cfg: SenderCfg,
        discovery: Option<Arc<dyn Discovery>>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (ready_tx, ready_rx) = mpsc::channel(EVENT_BUF);
        let (pool_tx, pool_rx) = mpsc::channel(EVENT_BUF);

        let hello = Message::Handshake(Handshake {
            device_id: cfg.device_id.clone(),
        });
        let pool = Arc::new(ConnectionPool::new(
            pool_tx,
            Some(hello),
            cfg.connect_timeout,
            cfg.read_timeout,
            cfg.write_timeout,
        ));
        let servers = Arc::new(ServerList::new(cfg.backups.clone(), discovery));
        let limiter = RateLimiter::new(cfg.limit_bytes_per_sec);

        let uploader = Arc::new(Self {
            cfg,
            pool,
            servers,
            limiter,
            seq: AtomicU64::new(0),
            prepares: RwLock::new(HashMap::new()),
            uploadings: RwLock::new(HashMap::new()),
            ready_tx,
            gate: Mutex::new(None),
        });

        tokio::spawn(Arc::clone(&uploader).run(ready_rx, pool_rx, shutdown.clone()));
        tokio::spawn(Arc::clone(&uploader).run_scan(shutdown.clone()));
        tokio::spawn(Arc::clone(&uploader).run_refresh(shutdown.clone()));
        tokio::spawn(Arc::clone(&uploader).run_usage(shutdown));
        uploader
    }

    async fn run(
        self: Arc<Self>,
        mut ready_rx: mpsc::Receiver<PathBuf>,
        mut pool_rx: mpsc::Receiver<PoolEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("task-upload: started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("task-upload: stopped");
                    return;
                }
                Some(path) = ready_rx.recv() => self.handle_prepare(path).await,
                Some(event) = pool_rx.recv() => self.handle_pool_event(event).await,
                else => return,
            }
        }
    }

    /// Directory scan loop: one batch at a time, the next scan armed only
    /// after every file of the current batch has reached a terminal
    /// outcome.
    async fn run_scan(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("task-fetch: started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("task-fetch: stopped");
                    return;
                }
                _ = tokio::time::sleep(self.cfg.scan_interval) => {}
            }

            let files = match fetch_ready(&self.cfg.target, self.cfg.batch_fetch) {
                Ok(files) => files,
                Err(err) => {
                    error!("fetch: fetch files failed, errors: {:#}", err);
                    continue;
                }
            };
            if files.is_empty() {
                continue;
            }
            debug!("fetch: get {} files", files.len());

            let gate = Arc::new(Countdown::new(files.len()));
            *self.gate.lock() = Some(Arc::clone(&gate));
            for file in files {
                if self.ready_tx.send(file).await.is_err() {
                    return;
                }
            }

            tokio::select! {
                _ = shutdown.changed() => return,
                _ = gate.wait() => {
                    debug!("task-waitting: last files upload complete");
                }
            }
        }
    }

    async fn run_refresh(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("task-refresh: started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("task-refresh: stopped");
                    return;
                }
                _ = tokio::time::sleep(self.cfg.refresh_interval) => {
                    self.servers.refresh();
                }
            }
        }
    }

    async fn run_usage(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if self.cfg.usage_interval.is_zero() {
            return;
        }
        info!("task-usage: started");
        let mut sampler = UsageSampler::new(self.cfg.device_id.clone());
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("task-usage: stopped");
                    return;
                }
                _ = tokio::time::sleep(self.cfg.usage_interval) => {}
            }
            let report = sampler.sample();
            self.pool.broadcast(&Message::SystemUsage(report)).await;
        }
    }

    async fn handle_pool_event(self: &Arc<Self>, event: PoolEvent) {
        match event {
            PoolEvent::Connected { addr } => info!("net: {} connected", addr),
            PoolEvent::ConnectFailed { addr } => {
                error!("net: {} connect failed", addr)
            }
            PoolEvent::ConnectionClosed { addr } => {
                self.retry_prepares_closed(&addr);
                self.retry_uploadings_closed(&addr);
            }
            PoolEvent::Frame { msg, .. } => match msg {
                Message::HandshakeResponse(rsp) => {
                    debug!(
                        "upload: handshake confirmed for owner {} with {} profiles",
                        rsp.owner_id,
                        rsp.device_profiles.len()
                    );
                }
                Message::InitUploadResponse(rsp) => self.handle_init_rsp(rsp).await,
                Message::UploadResponse(rsp) => self.handle_upload_rsp(rsp).await,
                Message::UploadCompleteResponse(rsp) => self.handle_complete_rsp(rsp).await,
                Message::Heartbeat => debug!("net: heartbeat echo"),
                other => warn!("net: unexpected message (cmd {})", other.command()),
            },
        }
    }

    /// Dequeue one ready file and run the Preparing step.
    async fn handle_prepare(self: &Arc<Self>, path: PathBuf) {
        if self.in_processing(&path) {
            debug!("upload-pre: file {:?} already in processing", path);
            return;
        }

        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(err) => {
                error!("upload-pre: stat {:?} failed, errors: {}", path, err);
                self.complete_notify();
                return;
            }
        };

        // Vacuously complete: nothing to transfer, nothing to tell a server.
        if meta.len() == 0 {
            warn!("{:?} is empty", path);
            let _ = std::fs::remove_file(&path);
            self.complete_notify();
            return;
        }

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) => {
                error!("upload-pre: open {:?} failed, errors: {}", path, err);
                self.complete_notify();
                return;
            }
        };

        let dest = match self.servers.next_available() {
            Some(dest) => dest,
            None => {
                error!("upload-pre: no server available for {:?}", path);
                self.requeue_delayed(path, self.cfg.retry_interval);
                return;
            }
        };

        let mod_time = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let source_label = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let init = InitUpload {
            seq,
            content_length: meta.len(),
            chunk_count: chunk_count(meta.len(), self.cfg.chunk_size),
            mod_time,
            source_label,
            device_id: self.cfg.device_id.clone(),
        };
        let session = UploadSession::new(path, file, init, dest);
        self.prepares.write().insert(seq, session);
        self.send_init(seq).await;
    }

    async fn send_init(self: &Arc<Self>, seq: u64) {
        let (dest, msg) = {
            let prepares = self.prepares.read();
            match prepares.get(&seq) {
                Some(session) => (
                    session.dest.clone(),
                    Message::InitUpload(session.init.clone()),
                ),
                None => return,
            }
        };
        if self.pool.send(&dest, &msg).await.is_err() {
            if let Some(session) = self.prepares.write().remove(&seq) {
                session.close(false);
                // retry after a while against a re-chosen server
                self.requeue_delayed(session.path, self.cfg.retry_interval);
            }
        }
    }

    async fn handle_init_rsp(self: &Arc<Self>, rsp: InitUploadResponse) {
        let mut session = match self.prepares.write().remove(&rsp.seq) {
            Some(session) => session,
            None => {
                warn!("upload: init response for unknown seq {}", rsp.seq);
                return;
            }
        };
        if rsp.code != Code::Success {
            session.close(false);
            self.requeue(session.path.clone());
            return;
        }
        session.id = rsp.upload_id;
        session.step = Step::Uploading;
        self.uploadings.write().insert(rsp.upload_id, session);
        self.next_chunk(rsp.upload_id).await;
    }

    async fn handle_upload_rsp(self: &Arc<Self>, rsp: UploadResponse) {
        match rsp.code {
            Code::InvalidChunkIndex => {
                // A well-behaved sender cannot trigger this; abandon the
                // file (it stays on disk) rather than loop forever.
                error!("bug: invalid chunk index for upload {}", rsp.upload_id);
                if let Some(session) = self.uploadings.write().remove(&rsp.upload_id) {
                    session.close(false);
                    self.complete_notify();
                }
                return;
            }
            Code::Missing => {
                // Server lost the upload state; retry with init upload
                // against another server.
                if let Some(session) = self.uploadings.write().remove(&rsp.upload_id) {
                    session.close(false);
                    self.requeue(session.path);
                }
                return;
            }
            _ => {}
        }

        let action = {
            let mut uploadings = self.uploadings.write();
            match uploadings.get_mut(&rsp.upload_id) {
                None => return,
                Some(session) => match session.adjust_next_index(rsp.index + 1) {
                    Err(err) => {
                        error!("upload: {:?}: {:#}", session.path, err);
                        NextAction::Abandon
                    }
                    Ok(()) if session.is_complete() => NextAction::SendComplete,
                    Ok(()) => NextAction::SendChunk,
                },
            }
        };

        match action {
            NextAction::Abandon => {
                if let Some(session) = self.uploadings.write().remove(&rsp.upload_id) {
                    session.close(false);
                    self.complete_notify();
                }
            }
            NextAction::SendComplete => {
                self.send_uploading(
                    rsp.upload_id,
                    Message::UploadComplete(UploadComplete {
                        upload_id: rsp.upload_id,
                    }),
                );
            }
            NextAction::SendChunk => self.next_chunk(rsp.upload_id).await,
        }
    }

    async fn handle_complete_rsp(self: &Arc<Self>, rsp: UploadCompleteResponse) {
        let mut session = match self.uploadings.write().remove(&rsp.upload_id) {
            Some(session) => session,
            None => {
                warn!("upload: complete response for unknown id {}", rsp.upload_id);
                return;
            }
        };
        if rsp.code == Code::Success {
            session.step = Step::Complete;
            session.close(true);
            self.complete_notify();
        } else {
            // Storage trouble or lost state; retry with init upload
            // against another server.
            session.close(false);
            self.requeue(session.path.clone());
        }
    }

    /// Read and send the next chunk for an uploading session, gated by the
    /// process-wide rate limiter.
    async fn next_chunk(self: &Arc<Self>, id: u64) {
        let chunk = {
            let mut uploadings = self.uploadings.write();
            match uploadings.get_mut(&id) {
                None => return,
                Some(session) => session.read_chunk(self.cfg.chunk_size),
            }
        };
        match chunk {
            Err(err) => {
                error!("upload: read chunk for {} failed, errors: {:#}", id, err);
                if let Some(session) = self.uploadings.write().remove(&id) {
                    session.close(false);
                    self.requeue_delayed(session.path, self.cfg.retry_interval);
                }
            }
            Ok((data, index)) => {
                self.limiter.acquire(data.len() as u64).await;
                self.send_uploading(
                    id,
                    Message::Upload(Upload {
                        upload_id: id,
                        index,
                        data,
                    }),
                );
            }
        }
    }

    /// Send a message for an uploading session, retrying the same
    /// destination up to the per-server ceiling before re-queueing the
    /// file from Preparing against a fresh choice. Runs on its own task;
    /// the event loop must stay free to drain pool events while a session
    /// sleeps between attempts.
    fn send_uploading(self: &Arc<Self>, id: u64, msg: Message) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let dest = match this.uploadings.read().get(&id) {
                    Some(session) => session.dest.clone(),
                    None => return,
                };
                if this.pool.send(&dest, &msg).await.is_ok() {
                    return;
                }

                let exhausted = {
                    let mut uploadings = this.uploadings.write();
                    match uploadings.get_mut(&id) {
                        None => return,
                        Some(session) => {
                            session.retries += 1;
                            session.retries > this.cfg.retries_per_server
                        }
                    }
                };
                if exhausted {
                    if let Some(session) = this.uploadings.write().remove(&id) {
                        error!(
                            "write-upload: {:?} retries {} times, ignore",
                            session.path, session.retries
                        );
                        session.close(false);
                        this.requeue(session.path);
                    }
                    return;
                }
                tokio::time::sleep(this.cfg.retry_interval).await;
            }
        });
    }

    /// A prepare has no server-side state to reconcile, so a closed
    /// connection just re-queues it immediately against a new choice.
    fn retry_prepares_closed(self: &Arc<Self>, addr: &str) {
        let seqs: Vec<u64> = self
            .prepares
            .read()
            .iter()
            .filter(|(_, s)| s.dest == addr)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in seqs {
            if let Some(session) = self.prepares.write().remove(&seq) {
                session.close(false);
                self.requeue(session.path);
            }
        }
    }

    /// An uploading session has server-side chunks worth keeping: ask the
    /// server where it left off instead of starting over.
    fn retry_uploadings_closed(self: &Arc<Self>, addr: &str) {
        let ids: Vec<u64> = self
            .uploadings
            .read()
            .iter()
            .filter(|(_, s)| s.dest == addr)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.send_uploading(id, Message::UploadContinue(UploadContinue { upload_id: id }));
        }
    }

    fn in_processing(&self, path: &Path) -> bool {
        self.prepares.read().values().any(|s| s.path == path)
            || self.uploadings.read().values().any(|s| s.path == path)
    }

    fn requeue(self: &Arc<Self>, path: PathBuf) {
        let tx = self.ready_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(path).await;
        });
    }

    fn requeue_delayed(self: &Arc<Self>, path: PathBuf, delay: std::time::Duration) {
        let tx = self.ready_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(path).await;
        });
    }

    /// One file of the current batch reached a terminal outcome.
    fn complete_notify(&self) {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.done();
        }
    }
}
