//! Configuration for the sender agent and the collector server.

use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::DEFAULT_CHUNK_SIZE;
use crate::retry::RetryPolicy;

/// Sender (edge agent) configuration.
#[derive(Debug, Clone)]
pub struct SenderCfg {
    /// Device identifier sent in the handshake (typically the MAC).
    pub device_id: String,
    /// Directory watched for ready files.
    pub target: PathBuf,
    /// Static fallback server list when discovery is absent or failing.
    pub backups: Vec<String>,
    pub chunk_size: u64,
    /// Maximum files taken per directory scan batch.
    pub batch_fetch: usize,
    /// Delay before re-scanning after a batch completes.
    pub scan_interval: Duration,
    /// Server-list refresh period.
    pub refresh_interval: Duration,
    /// Upload throughput cap in bytes/sec; 0 = unlimited.
    pub limit_bytes_per_sec: u64,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Write-idle interval after which a heartbeat probe is sent.
    pub write_timeout: Duration,
    /// Gap between resends of the same message to the same server.
    pub retry_interval: Duration,
    /// Resend ceiling per server before re-queueing against another.
    pub retries_per_server: u32,
    /// System usage report period; zero disables reporting.
    pub usage_interval: Duration,
}

impl Default for SenderCfg {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            target: PathBuf::new(),
            backups: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            batch_fetch: 16,
            scan_interval: Duration::from_secs(2),
            refresh_interval: Duration::from_secs(30),
            limit_bytes_per_sec: 0,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_secs(2),
            retries_per_server: 3,
            usage_interval: Duration::from_secs(60),
        }
    }
}

/// Collector server configuration.
#[derive(Debug, Clone)]
pub struct ServerCfg {
    pub addr: String,
    /// Idle read deadline for a session before it is closed.
    pub session_timeout: Duration,
    /// Blob store bucket receiving completed objects.
    pub bucket: String,
    /// Upper bound accepted for a single chunk payload.
    pub max_chunk_size: u64,
    /// Upper bound accepted for a declared chunk count.
    pub max_chunk_count: u32,
    /// Upper bound accepted for a declared content length.
    pub max_content_length: u64,
    /// Durable-write retry policy.
    pub storage_retry: RetryPolicy,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:9610".into(),
            session_timeout: Duration::from_secs(60),
            bucket: "captures".into(),
            max_chunk_size: 4 * 1024 * 1024,
            max_chunk_count: 16 * 1024,
            max_content_length: 1 << 32,
            storage_retry: RetryPolicy::default(),
        }
    }
}
