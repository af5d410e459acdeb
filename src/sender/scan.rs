//! Directory scanning and batch gating.
//!
//! The watch directory is flat: each ready capture is a regular file at the
//! top level. A scan takes at most one batch; the next scan is armed only
//! after every file in the current batch reaches a terminal outcome, which
//! bounds in-flight uploads and prevents duplicate uploads of the same
//! listing.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use tokio::sync::Notify;

/// Reserved bookkeeping file name inside the watch directory.
pub const LAST_FILE_NAME: &str = ".last";

/// List up to `batch` ready files: regular files only, top level only,
/// skipping the reserved bookkeeping name.
pub fn fetch_ready(dir: &Path, batch: usize) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries = std::fs::read_dir(dir).with_context(|| format!("read dir {:?}", dir))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() {
            continue;
        }
        if path.file_name().and_then(|n| n.to_str()) == Some(LAST_FILE_NAME) {
            continue;
        }
        if files.len() < batch {
            files.push(path);
        } else {
            break;
        }
    }
    Ok(files)
}

/// Countdown latch: one per in-flight batch. Every file signals `done`
/// exactly once on its terminal outcome; `wait` releases when the whole
/// batch has reported.
pub struct Countdown {
    remaining: AtomicUsize,
    notify: Notify,
}

impl Countdown {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
            notify: Notify::new(),
        }
    }

    pub fn done(&self) {
        let prev = self.remaining.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "countdown underflow");
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.remaining.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}
