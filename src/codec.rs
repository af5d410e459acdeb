//! Frame codec: length-prefixed, command-tagged binary frames.
//!
//! Whole frames only - nothing above this layer ever sees a partial frame.
//! An unrecognized command byte or an undecodable body is an error fatal to
//! the connection that produced it, never to the process.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

use crate::protocol::{cmd, Message, MAX_FRAME_SIZE};

/// Encode a message into a complete frame including the length prefix.
pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    let body = match msg {
        Message::Handshake(m) => bincode::serialize(m)?,
        Message::HandshakeResponse(m) => bincode::serialize(m)?,
        Message::InitUpload(m) => bincode::serialize(m)?,
        Message::InitUploadResponse(m) => bincode::serialize(m)?,
        Message::Upload(m) => bincode::serialize(m)?,
        Message::UploadResponse(m) => bincode::serialize(m)?,
        Message::UploadContinue(m) => bincode::serialize(m)?,
        Message::UploadComplete(m) => bincode::serialize(m)?,
        Message::UploadCompleteResponse(m) => bincode::serialize(m)?,
        Message::Heartbeat => Vec::new(),
        Message::SystemUsage(m) => bincode::serialize(m)?,
    };

    let payload_len = 1 + body.len();
    if payload_len > MAX_FRAME_SIZE {
        bail!(
            "frame payload too large: {} bytes (max: {})",
            payload_len,
            MAX_FRAME_SIZE
        );
    }

    let mut frame = Vec::with_capacity(4 + payload_len);
    frame.extend_from_slice(&(payload_len as u32).to_be_bytes());
    frame.push(msg.command());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a frame payload (command byte plus body, length prefix stripped).
pub fn decode(payload: &[u8]) -> Result<Message> {
    if payload.is_empty() {
        bail!("empty frame payload");
    }
    let command = payload[0];
    let body = &payload[1..];

    let msg = match command {
        cmd::HANDSHAKE => Message::Handshake(bincode::deserialize(body)?),
        cmd::HANDSHAKE_RSP => Message::HandshakeResponse(bincode::deserialize(body)?),
        cmd::INIT_UPLOAD => Message::InitUpload(bincode::deserialize(body)?),
        cmd::INIT_UPLOAD_RSP => Message::InitUploadResponse(bincode::deserialize(body)?),
        cmd::UPLOAD => Message::Upload(bincode::deserialize(body)?),
        cmd::UPLOAD_RSP => Message::UploadResponse(bincode::deserialize(body)?),
        cmd::UPLOAD_CONTINUE => Message::UploadContinue(bincode::deserialize(body)?),
        cmd::UPLOAD_COMPLETE => Message::UploadComplete(bincode::deserialize(body)?),
        cmd::UPLOAD_COMPLETE_RSP => {
            Message::UploadCompleteResponse(bincode::deserialize(body)?)
        }
        cmd::HEARTBEAT => Message::Heartbeat,
        cmd::SYS_USAGE => Message::SystemUsage(bincode::deserialize(body)?),
        other => bail!("unsupported command: {}", other),
    };
    Ok(msg)
}

/// Write one complete frame to the stream.
pub async fn write_frame<W>(stream: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(msg)?;
    stream.write_all(&frame).await.context("frame write")?;
    stream.flush().await.context("frame flush")?;
    Ok(())
}

pub async fn write_frame_timed<W>(stream: &mut W, msg: &Message, dur: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match timeout(dur, write_frame(stream, msg)).await {
        Ok(res) => res,
        Err(_) => bail!("frame write timeout ({} ms)", dur.as_millis()),
    }
}

/// Read one complete frame from the stream and decode it.
pub async fn read_frame<R>(stream: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .context("frame length read")?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        bail!("zero-length frame");
    }
    if len > MAX_FRAME_SIZE {
        bail!("frame too large: {} bytes (max: {})", len, MAX_FRAME_SIZE);
    }

    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .context("frame payload read")?;
    decode(&payload)
}

pub async fn read_frame_timed<R>(stream: &mut R, dur: Duration) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    match timeout(dur, read_frame(stream)).await {
        Ok(res) => res,
        Err(_) => bail!("frame read timeout ({} ms)", dur.as_millis()),
    }
}
