//! Wire protocol messages and constants for the framesync framed transport.
//!
//! Every frame is `[4-byte big-endian payload length][1-byte command][body]`
//! where the body is the bincode encoding of the matching message struct.
//! The length prefix covers the command byte plus the body.

use serde::{Deserialize, Serialize};

// Maximum frame payload size - prevents memory exhaustion from a bogus
// length prefix. Large enough for a maximum-size chunk plus envelope.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

// Default chunk size for file uploads. A captured frame is typically a
// few tens of KB, so most files fit in a handful of chunks.
pub const DEFAULT_CHUNK_SIZE: u64 = 256 * 1024;

// Command bytes (keep numeric values stable across versions)
pub mod cmd {
    pub const HANDSHAKE: u8 = 0;
    pub const HANDSHAKE_RSP: u8 = 1;
    pub const INIT_UPLOAD: u8 = 2;
    pub const INIT_UPLOAD_RSP: u8 = 3;
    pub const UPLOAD: u8 = 4;
    pub const UPLOAD_RSP: u8 = 5;
    pub const UPLOAD_CONTINUE: u8 = 6;
    pub const UPLOAD_COMPLETE: u8 = 7;
    pub const UPLOAD_COMPLETE_RSP: u8 = 8;
    pub const HEARTBEAT: u8 = 9;
    pub const SYS_USAGE: u8 = 10;
}

/// Status codes carried in response messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Code {
    Success,
    /// Chunk index outside the declared range, or an oversized payload.
    /// A well-behaved client cannot produce this; fatal to the session.
    InvalidChunkIndex,
    /// The server has no record of the upload id (restart or eviction).
    Missing,
    /// A retriable storage failure. Reserved on the wire for servers that
    /// report interim write errors; current servers retry internally and
    /// answer only MaxRetriesExceeded once every attempt is spent.
    StorageError,
    /// The durable write failed on every attempt; terminal for this upload.
    MaxRetriesExceeded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub owner_id: u64,
    pub device_id: String,
    pub device_profiles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitUpload {
    /// Sender-assigned sequence correlating this request to its response.
    pub seq: u64,
    pub content_length: u64,
    pub chunk_count: u32,
    /// File modification time, unix seconds.
    pub mod_time: i64,
    /// Capture source within the device (camera name).
    pub source_label: String,
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitUploadResponse {
    pub seq: u64,
    /// Server-assigned id correlating every later message for this file.
    pub upload_id: u64,
    pub code: Code,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upload {
    pub upload_id: u64,
    pub index: i64,
    pub data: Vec<u8>,
}

/// Response to both Upload and UploadContinue. For a continue request the
/// index is the last contiguously appended chunk, -1 when none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub upload_id: u64,
    pub index: i64,
    pub code: Code,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadContinue {
    pub upload_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadComplete {
    pub upload_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadCompleteResponse {
    pub upload_id: u64,
    pub code: Code,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemUsageReport {
    pub device_id: String,
    pub cpu_percent: u32,
    pub mem_percent: u32,
    pub disk_percent: u32,
    pub load1: f32,
}

/// Every message that can cross the wire, tagged by its command byte.
/// The codec matches on this exhaustively; there is no untyped path.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Handshake(Handshake),
    HandshakeResponse(HandshakeResponse),
    InitUpload(InitUpload),
    InitUploadResponse(InitUploadResponse),
    Upload(Upload),
    UploadResponse(UploadResponse),
    UploadContinue(UploadContinue),
    UploadComplete(UploadComplete),
    UploadCompleteResponse(UploadCompleteResponse),
    Heartbeat,
    SystemUsage(SystemUsageReport),
}

impl Message {
    pub fn command(&self) -> u8 {
        match self {
            Message::Handshake(_) => cmd::HANDSHAKE,
            Message::HandshakeResponse(_) => cmd::HANDSHAKE_RSP,
            Message::InitUpload(_) => cmd::INIT_UPLOAD,
            Message::InitUploadResponse(_) => cmd::INIT_UPLOAD_RSP,
            Message::Upload(_) => cmd::UPLOAD,
            Message::UploadResponse(_) => cmd::UPLOAD_RSP,
            Message::UploadContinue(_) => cmd::UPLOAD_CONTINUE,
            Message::UploadComplete(_) => cmd::UPLOAD_COMPLETE,
            Message::UploadCompleteResponse(_) => cmd::UPLOAD_COMPLETE_RSP,
            Message::Heartbeat => cmd::HEARTBEAT,
            Message::SystemUsage(_) => cmd::SYS_USAGE,
        }
    }
}

/// chunk_count = ceil(size / chunk_size)
pub fn chunk_count(content_length: u64, chunk_size: u64) -> u32 {
    ((content_length + chunk_size - 1) / chunk_size) as u32
}
