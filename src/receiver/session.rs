//! Per-connection session: authenticates the remote device and dispatches
//! protocol messages to the reassembly table.

use std::sync::Arc;

use anyhow::{bail, Result};
use log::{debug, info, warn};

use crate::config::ServerCfg;
use crate::protocol::{
    Code, Handshake, HandshakeResponse, InitUpload, InitUploadResponse, Message,
    SystemUsageReport, Upload, UploadComplete, UploadCompleteResponse, UploadContinue,
    UploadResponse,
};
use crate::reassembly::FileTable;
use crate::store::Directory;

/// What the dispatch loop should do after handling one message.
pub enum Outcome {
    Reply(Message),
    /// Answer, then terminate the session: the peer sent something a
    /// well-behaved client cannot produce.
    ReplyThenClose(Message),
    Silent,
}

pub struct Session {
    addr: String,
    /// Bound by a successful handshake; labels the downstream handoff.
    owner_id: Option<u64>,
    device_id: Option<String>,
    cfg: ServerCfg,
    table: Arc<FileTable>,
    directory: Arc<dyn Directory>,
}

impl Session {
    pub fn new(
        addr: String,
        cfg: ServerCfg,
        table: Arc<FileTable>,
        directory: Arc<dyn Directory>,
    ) -> Self {
        Self {
            addr,
            owner_id: None,
            device_id: None,
            cfg,
            table,
            directory,
        }
    }

    pub async fn on_req(&mut self, msg: Message) -> Result<Outcome> {
        match msg {
            Message::Handshake(req) => self.handshake(req),
            Message::InitUpload(req) => Ok(self.init_upload(req)),
            Message::Upload(req) => Ok(self.upload(req)),
            Message::UploadContinue(req) => Ok(self.upload_continue(req)),
            Message::UploadComplete(req) => Ok(self.upload_complete(req).await),
            Message::Heartbeat => Ok(Outcome::Reply(Message::Heartbeat)),
            Message::SystemUsage(report) => Ok(self.system_usage(report)),
            other => {
                warn!(
                    "net: {} sent unexpected message (cmd {})",
                    self.addr,
                    other.command()
                );
                Ok(Outcome::Silent)
            }
        }
    }

    /// Resolve the device against the directory. An unknown device fails
    /// the handshake outright and the connection is dropped by the caller.
    fn handshake(&mut self, req: Handshake) -> Result<Outcome> {
        let identity = match self.directory.resolve(&req.device_id)? {
            Some(identity) => identity,
            None => bail!("cannot determine owner for device {}", req.device_id),
        };
        self.owner_id = Some(identity.owner_id);
        self.device_id = Some(req.device_id.clone());
        Ok(Outcome::Reply(Message::HandshakeResponse(
            HandshakeResponse {
                owner_id: identity.owner_id,
                device_id: req.device_id,
                device_profiles: identity.profiles,
            },
        )))
    }

    /// Pure bookkeeping once the declared dimensions pass the configured
    /// bounds; wire values are never trusted unchecked.
    fn init_upload(&mut self, req: InitUpload) -> Outcome {
        let seq = req.seq;
        if req.chunk_count == 0
            || req.chunk_count > self.cfg.max_chunk_count
            || req.content_length == 0
            || req.content_length > self.cfg.max_content_length
        {
            warn!(
                "net: {} init upload out of bounds: {} bytes, {} chunks",
                self.addr, req.content_length, req.chunk_count
            );
            return Outcome::ReplyThenClose(Message::InitUploadResponse(InitUploadResponse {
                seq,
                upload_id: 0,
                code: Code::InvalidChunkIndex,
            }));
        }
        let upload_id = self.table.add_file(req);
        Outcome::Reply(Message::InitUploadResponse(InitUploadResponse {
            seq,
            upload_id,
            code: Code::Success,
        }))
    }

    fn upload(&mut self, req: Upload) -> Outcome {
        let upload_id = req.upload_id;
        let index = req.index;
        let code = self.table.append(req);
        let rsp = Message::UploadResponse(UploadResponse {
            upload_id,
            index,
            code,
        });
        if code == Code::InvalidChunkIndex {
            // Unrecoverable protocol defect; fatal to this session only.
            Outcome::ReplyThenClose(rsp)
        } else {
            Outcome::Reply(rsp)
        }
    }

    fn upload_continue(&mut self, req: UploadContinue) -> Outcome {
        match self.table.continue_upload(req.upload_id) {
            Some(index) => Outcome::Reply(Message::UploadResponse(UploadResponse {
                upload_id: req.upload_id,
                index,
                code: Code::Success,
            })),
            None => Outcome::Reply(Message::UploadResponse(UploadResponse {
                upload_id: req.upload_id,
                index: 0,
                code: Code::Missing,
            })),
        }
    }

    async fn upload_complete(&mut self, req: UploadComplete) -> Outcome {
        let code = self.table.complete(req.upload_id).await;
        if code == Code::Success {
            info!(
                "net: {} upload {} stored, device {} owner {}",
                self.addr,
                req.upload_id,
                self.device_id.as_deref().unwrap_or("?"),
                self.owner_id.map_or_else(|| "?".to_string(), |v| v.to_string()),
            );
        }
        Outcome::Reply(Message::UploadCompleteResponse(UploadCompleteResponse {
            upload_id: req.upload_id,
            code,
        }))
    }

    fn system_usage(&self, report: SystemUsageReport) -> Outcome {
        debug!(
            "usage: device {} cpu {}% mem {}% disk {}% load1 {:.2}",
            report.device_id,
            report.cpu_percent,
            report.mem_percent,
            report.disk_percent,
            report.load1
        );
        Outcome::Silent
    }
}
