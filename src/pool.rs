//! Address-based connection pool.
//!
//! At most one live connection per destination address, lazily dialed with
//! a bounded connect timeout. Every connection gets a background read task
//! forwarding decoded frames to the owner's event channel, and a keepalive
//! task that probes with a heartbeat after a write-idle interval instead of
//! letting the peer's read deadline kill a healthy idle connection.
//! Removal is compare-and-delete on a connection id so a stale failure can
//! never evict a freshly reconnected entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, error, info};
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Duration, Instant};

use crate::codec::{read_frame_timed, write_frame_timed};
use crate::protocol::Message;

/// Notifications and inbound traffic surfaced to the pool's owner.
#[derive(Debug)]
pub enum PoolEvent {
    Connected { addr: String },
    ConnectFailed { addr: String },
    /// The connection to `addr` is gone; the owner decides how to resume.
    ConnectionClosed { addr: String },
    Frame { addr: String, msg: Message },
}

#[derive(Clone)]
struct ConnHandle {
    id: u64,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    last_write: Arc<parking_lot::Mutex<Instant>>,
}

pub struct ConnectionPool {
    conns: RwLock<HashMap<String, ConnHandle>>,
    events: mpsc::Sender<PoolEvent>,
    /// Sent immediately after every successful dial (the device handshake).
    hello: Option<Message>,
    connect_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    next_id: AtomicU64,
}

impl ConnectionPool {
    pub fn new(
        events: mpsc::Sender<PoolEvent>,
        hello: Option<Message>,
        connect_timeout: Duration,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
            events,
            hello,
            connect_timeout,
            read_timeout,
            write_timeout,
            next_id: AtomicU64::new(0),
        }
    }

    /// Send one message, dialing the destination first if needed. A write
    /// failure tears the connection down; retrying is the caller's policy.
    pub async fn send(self: &Arc<Self>, addr: &str, msg: &Message) -> Result<()> {
        let handle = self.acquire(addr).await?;
        let res = {
            let mut writer = handle.writer.lock().await;
            write_frame_timed(&mut *writer, msg, self.write_timeout).await
        };
        match res {
            Ok(()) => {
                *handle.last_write.lock() = Instant::now();
                debug!("net: {} sent (cmd {})", addr, msg.command());
                Ok(())
            }
            Err(err) => {
                error!("net: {} send failed, errors: {:#}", addr, err);
                self.teardown(addr, &handle).await;
                Err(err)
            }
        }
    }

    /// Best-effort send to every live connection (usage reports). Errors
    /// are logged per destination, never propagated.
    pub async fn broadcast(self: &Arc<Self>, msg: &Message) {
        let targets: Vec<(String, ConnHandle)> = self
            .conns
            .read()
            .iter()
            .map(|(a, h)| (a.clone(), h.clone()))
            .collect();
        for (addr, handle) in targets {
            let res = {
                let mut writer = handle.writer.lock().await;
                write_frame_timed(&mut *writer, msg, self.write_timeout).await
            };
            match res {
                Ok(()) => *handle.last_write.lock() = Instant::now(),
                Err(err) => error!("net: {} broadcast failed, errors: {:#}", addr, err),
            }
        }
    }

    pub fn is_connected(&self, addr: &str) -> bool {
        self.conns.read().contains_key(addr)
    }

    async fn acquire(self: &Arc<Self>, addr: &str) -> Result<ConnHandle> {
        if let Some(handle) = self.conns.read().get(addr).cloned() {
            return Ok(handle);
        }

        let dial = timeout(self.connect_timeout, TcpStream::connect(addr)).await;
        let stream = match dial {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                self.emit(PoolEvent::ConnectFailed { addr: addr.into() }).await;
                return Err(err).with_context(|| format!("connect {}", addr));
            }
            Err(_) => {
                self.emit(PoolEvent::ConnectFailed { addr: addr.into() }).await;
                anyhow::bail!(
                    "connect {} timeout ({} ms)",
                    addr,
                    self.connect_timeout.as_millis()
                );
            }
        };
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        let handle = ConnHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            writer: Arc::new(Mutex::new(writer)),
            last_write: Arc::new(parking_lot::Mutex::new(Instant::now())),
        };

        {
            let mut conns = self.conns.write();
            if let Some(existing) = conns.get(addr) {
                // Lost the dial race; keep the cached entry.
                return Ok(existing.clone());
            }
            conns.insert(addr.to_string(), handle.clone());
        }
        info!("net: {} connected", addr);

        let pool = Arc::clone(self);
        let loop_addr = addr.to_string();
        let id = handle.id;
        tokio::spawn(async move {
            pool.read_loop(loop_addr, id, reader).await;
        });

        let pool = Arc::clone(self);
        let ka_addr = addr.to_string();
        let ka_handle = handle.clone();
        tokio::spawn(async move {
            pool.keepalive_loop(ka_addr, ka_handle).await;
        });

        self.emit(PoolEvent::Connected { addr: addr.into() }).await;

        if let Some(hello) = self.hello.clone() {
            let res = {
                let mut writer = handle.writer.lock().await;
                write_frame_timed(&mut *writer, &hello, self.write_timeout).await
            };
            if let Err(err) = res {
                error!("net: {} failed to send handshake, errors: {:#}", addr, err);
                self.teardown(addr, &handle).await;
                return Err(err);
            }
            *handle.last_write.lock() = Instant::now();
        }

        Ok(handle)
    }

    async fn read_loop(self: Arc<Self>, addr: String, id: u64, mut reader: OwnedReadHalf) {
        loop {
            match read_frame_timed(&mut reader, self.read_timeout).await {
                Ok(msg) => {
                    debug!("net: {} read (cmd {})", addr, msg.command());
                    if self
                        .events
                        .send(PoolEvent::Frame {
                            addr: addr.clone(),
                            msg,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(err) => {
                    error!("net: {} read failed, errors: {:#}", addr, err);
                    if self.remove_if_matches(&addr, id) {
                        self.emit(PoolEvent::ConnectionClosed { addr }).await;
                    }
                    return;
                }
            }
        }
    }

    async fn keepalive_loop(self: Arc<Self>, addr: String, handle: ConnHandle) {
        loop {
            tokio::time::sleep(self.write_timeout).await;
            let current = self.conns.read().get(&addr).map(|h| h.id);
            if current != Some(handle.id) {
                return;
            }
            let idle = handle.last_write.lock().elapsed();
            if idle < self.write_timeout {
                continue;
            }
            debug!("net: sent HB to {}", addr);
            let res = {
                let mut writer = handle.writer.lock().await;
                write_frame_timed(&mut *writer, &Message::Heartbeat, self.write_timeout).await
            };
            match res {
                Ok(()) => *handle.last_write.lock() = Instant::now(),
                Err(err) => {
                    error!("net: {} heartbeat failed, errors: {:#}", addr, err);
                    self.teardown(&addr, &handle).await;
                    return;
                }
            }
        }
    }

    /// Shut the socket down and drop the cache entry, notifying the owner
    /// exactly once per live connection.
    async fn teardown(self: &Arc<Self>, addr: &str, handle: &ConnHandle) {
        {
            let mut writer = handle.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        if self.remove_if_matches(addr, handle.id) {
            self.emit(PoolEvent::ConnectionClosed { addr: addr.into() }).await;
        }
    }

    /// Compare-and-delete: only removes the entry if it still holds the
    /// same connection, guarding against a racing reconnect.
    fn remove_if_matches(&self, addr: &str, id: u64) -> bool {
        let mut conns = self.conns.write();
        if conns.get(addr).map(|h| h.id) == Some(id) {
            conns.remove(addr);
            debug!("net: {} removed from pool", addr);
            true
        } else {
            false
        }
    }

    async fn emit(&self, event: PoolEvent) {
        let _ = self.events.send(event).await;
    }
}
