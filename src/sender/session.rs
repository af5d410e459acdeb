//! Per-file upload session state for the sender.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use log::{debug, error};

use crate::protocol::InitUpload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Preparing,
    Uploading,
    Complete,
}

/// One file working its way through prepare -> upload -> complete. Created
/// when the file is dequeued from the ready queue, destroyed when the
/// server durably acknowledges it (file deleted) or the attempt is
/// abandoned (file kept for a later run).
pub struct UploadSession {
    /// Sender-assigned sequence, correlation key until the server issues an
    /// upload id.
    pub seq: u64,
    /// Server-assigned upload id, zero until the prepare handshake lands.
    pub id: u64,
    pub path: PathBuf,
    pub file: File,
    pub init: InitUpload,
    /// Destination address this attempt is pinned to.
    pub dest: String,
    pub step: Step,
    /// Next chunk index to read and send; only regresses via an explicit
    /// resume correction from the server.
    pub next_index: i64,
    pub retries: u32,
}

impl UploadSession {
    pub fn new(path: PathBuf, file: File, init: InitUpload, dest: String) -> Self {
        Self {
            seq: init.seq,
            id: 0,
            path,
            file,
            init,
            dest,
            step: Step::Preparing,
            next_index: 0,
            retries: 0,
        }
    }

    /// Read the chunk at `next_index` and advance. Seek-based so a resume
    /// correction can move the cursor anywhere.
    pub fn read_chunk(&mut self, chunk_size: u64) -> Result<(Vec<u8>, i64)> {
        let idx = self.next_index;
        let offset = idx as u64 * chunk_size;
        self.file
            .seek(SeekFrom::Start(offset))
            .with_context(|| format!("seek {} in {:?}", offset, self.path))?;
        let mut data = vec![0u8; chunk_size as usize];
        let mut read = 0;
        while read < data.len() {
            let n = self
                .file
                .read(&mut data[read..])
                .with_context(|| format!("read chunk {} of {:?}", idx, self.path))?;
            if n == 0 {
                break;
            }
            read += n;
        }
        data.truncate(read);
        self.next_index += 1;
        Ok((data, idx))
    }

    /// Apply the server's acknowledged position: `idx` is the next index it
    /// expects. Equal means in step; smaller is a resume correction; larger
    /// would mean the server acknowledged a chunk we never sent.
    pub fn adjust_next_index(&mut self, idx: i64) -> Result<()> {
        if idx == self.next_index {
            return Ok(());
        }
        if idx > self.next_index {
            bail!(
                "bug: acked chunk idx {}, expect <= {}",
                idx,
                self.next_index
            );
        }
        debug!(
            "upload: {:?} resume correction {} -> {}",
            self.path, self.next_index, idx
        );
        self.next_index = idx;
        Ok(())
    }

    /// Every chunk has been read and acknowledged up to the declared count.
    pub fn is_complete(&self) -> bool {
        self.next_index == self.init.chunk_count as i64
    }

    /// Drop the session's file handle, deleting the local file when the
    /// upload was durably acknowledged.
    pub fn close(&self, remove: bool) {
        debug!("fd closed {:?}", self.path);
        if remove {
            if let Err(err) = std::fs::remove_file(&self.path) {
                error!("remove {:?} failed, errors: {}", self.path, err);
            } else {
                debug!("removed {:?}", self.path);
            }
        }
    }
}
