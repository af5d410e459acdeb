//! Server-side table of in-flight uploads.
//!
//! Each accepted InitUpload creates a `RemoteFile` sized to its declared
//! chunk count. Chunks land keyed by their own index, so out-of-order and
//! duplicate arrivals are harmless. Completion verifies full coverage,
//! performs a retried durable write, then hands the assembled bytes to the
//! downstream pipeline. A RemoteFile is removed on success or on retry
//! exhaustion - never partially persisted.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{Code, InitUpload, Upload};
use crate::retry::RetryPolicy;
use crate::store::{Directory, IngestRecord, ObjectStore};

/// One in-flight upload owned by the table.
pub struct RemoteFile {
    pub meta: InitUpload,
    chunks: Vec<Option<Vec<u8>>>,
    cursor: usize,
}

impl RemoteFile {
    fn new(meta: InitUpload) -> Self {
        let count = meta.chunk_count as usize;
        Self {
            meta,
            chunks: vec![None; count],
            cursor: 0,
        }
    }

    /// Store one chunk. Duplicate appends of a filled slot are a no-op
    /// success; an out-of-range index or oversized payload is the client's
    /// defect.
    fn append(&mut self, id: u64, index: i64, data: Vec<u8>, max_chunk: u64) -> Code {
        if index < 0 || index as usize >= self.chunks.len() {
            error!("file-{}: append with invalid chunk idx {}", id, index);
            return Code::InvalidChunkIndex;
        }
        if data.len() as u64 > max_chunk {
            error!(
                "file-{}: chunk idx {} payload {} bytes exceeds limit {}",
                id,
                index,
                data.len(),
                max_chunk
            );
            return Code::InvalidChunkIndex;
        }
        let slot = &mut self.chunks[index as usize];
        if slot.is_some() {
            debug!("file-{}: chunk idx {} already appended", id, index);
            return Code::Success;
        }
        debug!("file-{}: append {} bytes at chunk idx {}", id, data.len(), index);
        *slot = Some(data);
        Code::Success
    }

    /// Highest index such that every chunk up to and including it is
    /// present; -1 when nothing has been appended yet. Always safe to
    /// resume after, even if later chunks arrived out of order.
    pub fn last_contiguous(&self) -> i64 {
        self.chunks.iter().take_while(|c| c.is_some()).count() as i64 - 1
    }

    /// True once every declared chunk slot is filled.
    pub fn is_covered(&self) -> bool {
        self.chunks.iter().all(|c| c.is_some())
    }

    /// Rewind the assembled-byte cursor; a failed durable-write attempt
    /// must be retried from the start since the store contract has no
    /// resumable writes.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }
}

impl Read for RemoteFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut read = 0;
        let mut pos = 0;
        for chunk in &self.chunks {
            let data: &[u8] = chunk.as_deref().unwrap_or(&[]);
            pos += data.len();
            if self.cursor < pos {
                let start = data.len() - (pos - self.cursor);
                let n = (buf.len() - read).min(data.len() - start);
                buf[read..read + n].copy_from_slice(&data[start..start + n]);
                read += n;
                self.cursor += n;
                if read == buf.len() {
                    return Ok(read);
                }
            }
        }
        Ok(read)
    }
}

/// Table of in-flight uploads plus the completion pipeline around them.
pub struct FileTable {
    files: RwLock<HashMap<u64, RemoteFile>>,
    /// Monotonic upload-id allocator; never reused while the process runs.
    alloc: AtomicU64,
    max_chunk_size: u64,
    bucket: String,
    retry: RetryPolicy,
    store: Arc<dyn ObjectStore>,
    directory: Arc<dyn Directory>,
    downstream: mpsc::Sender<IngestRecord>,
}

impl FileTable {
    pub fn new(
        bucket: String,
        max_chunk_size: u64,
        retry: RetryPolicy,
        store: Arc<dyn ObjectStore>,
        directory: Arc<dyn Directory>,
        downstream: mpsc::Sender<IngestRecord>,
    ) -> Self {
        Self {
            files: RwLock::new(HashMap::with_capacity(1024)),
            alloc: AtomicU64::new(0),
            max_chunk_size,
            bucket,
            retry,
            store,
            directory,
            downstream,
        }
    }

    /// Register a new upload and hand back its id. Pure bookkeeping; the
    /// session validates declared bounds before calling.
    pub fn add_file(&self, req: InitUpload) -> u64 {
        let id = self.alloc.fetch_add(1, Ordering::Relaxed);
        info!(
            "file-{}: added with {} bytes and {} chunks",
            id, req.content_length, req.chunk_count
        );
        self.files.write().insert(id, RemoteFile::new(req));
        id
    }

    pub fn append(&self, req: Upload) -> Code {
        let mut files = self.files.write();
        match files.get_mut(&req.upload_id) {
            Some(file) => file.append(req.upload_id, req.index, req.data, self.max_chunk_size),
            None => {
                debug!("file-{}: missing", req.upload_id);
                Code::Missing
            }
        }
    }

    /// Resume point for a reconnecting sender: the last contiguously
    /// appended index, or None when the upload id is unknown.
    pub fn continue_upload(&self, id: u64) -> Option<i64> {
        let files = self.files.read();
        let idx = files.get(&id).map(|f| f.last_contiguous());
        if idx.is_none() {
            debug!("file-{}: continue with missing", id);
        }
        idx
    }

    pub fn contains(&self, id: u64) -> bool {
        self.files.read().contains_key(&id)
    }

    /// Finalize an upload: verify coverage, durably write with retry, then
    /// hand off downstream. The RemoteFile leaves the table before any
    /// blocking work so no lock is held across an await.
    pub async fn complete(&self, id: u64) -> Code {
        let mut file = {
            let mut files = self.files.write();
            let file = match files.remove(&id) {
                None => {
                    debug!("file-{}: complete with missing", id);
                    return Code::Missing;
                }
                Some(f) => f,
            };
            if !file.is_covered() {
                // Premature completion: the client declared done with
                // chunk slots still empty. Keep the file so it can
                // still be finished.
                warn!(
                    "file-{}: complete before full coverage (last contiguous {}, declared {})",
                    id,
                    file.last_contiguous(),
                    file.meta.chunk_count
                );
                files.insert(id, file);
                return Code::InvalidChunkIndex;
            }
            file
        };

        let mut backoff = self.retry.backoff();
        let mut times = 0u32;
        loop {
            if times > 0 {
                info!("file-{}: retry the {} times", id, times);
            }
            match self.put_object(id, &mut file) {
                Ok(object_key) => {
                    self.hand_off(id, &mut file, object_key).await;
                    self.remove_logged(id);
                    return Code::Success;
                }
                Err(err) => {
                    error!("file-{}: complete with storage errors: {:#}", id, err);
                }
            }
            match backoff.next() {
                Some(delay) => {
                    times += 1;
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!("file-{}: retry failed in {} times", id, times + 1);
                    self.remove_logged(id);
                    return Code::MaxRetriesExceeded;
                }
            }
        }
    }

    fn put_object(&self, id: u64, file: &mut RemoteFile) -> anyhow::Result<String> {
        let object_key = Uuid::new_v4().to_string();
        file.rewind();
        let size = file.meta.content_length;
        self.store.put(&self.bucket, &object_key, file, size)?;
        info!(
            "file-{}: complete succ with object {}, size {}",
            id, object_key, size
        );
        Ok(object_key)
    }

    /// Resolve the device and push the assembled bytes downstream. A
    /// resolution miss only skips the handoff; the upload still succeeds.
    async fn hand_off(&self, id: u64, file: &mut RemoteFile, object_key: String) {
        let meta = file.meta.clone();
        let identity = match self.directory.resolve(&meta.device_id) {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                warn!("resolve({}) didn't find", meta.device_id);
                return;
            }
            Err(err) => {
                warn!("resolve({}) failed with error {:#}", meta.device_id, err);
                return;
            }
        };

        file.rewind();
        let mut bytes = Vec::with_capacity(meta.content_length as usize);
        if let Err(err) = file.read_to_end(&mut bytes) {
            error!("file-{}: read assembled bytes failed: {}", id, err);
            return;
        }

        let device_profile = identity
            .profiles
            .iter()
            .find(|p| **p == meta.source_label)
            .cloned()
            .unwrap_or_else(|| {
                identity
                    .profiles
                    .first()
                    .cloned()
                    .unwrap_or_else(|| meta.source_label.clone())
            });

        let record = IngestRecord {
            owner_id: identity.owner_id,
            device_profile,
            mod_time: meta.mod_time,
            object_key,
            bytes,
        };
        debug!(
            "got a capture from owner {}, device {}, source {}",
            record.owner_id, meta.device_id, meta.source_label
        );
        if let Err(err) = self.downstream.send(record).await {
            error!("downstream handoff failed: {}", err);
        }
    }

    fn remove_logged(&self, id: u64) {
        // Entry already taken out in complete(); log for lifecycle parity.
        info!("file-{}: removed", id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DeviceIdentity, MemoryStore, StaticDirectory};
    use anyhow::bail;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn init(seq: u64, content_length: u64, chunk_count: u32) -> InitUpload {
        InitUpload {
            seq,
            content_length,
            chunk_count,
            mod_time: 1_700_000_000,
            source_label: "cam-0".into(),
            device_id: "dev-1".into(),
        }
    }

    fn table_with(
        store: Arc<dyn ObjectStore>,
        retry: RetryPolicy,
    ) -> (FileTable, mpsc::Receiver<IngestRecord>) {
        let directory = Arc::new(StaticDirectory::permissive(DeviceIdentity {
            owner_id: 9,
            profiles: vec!["cam-0".into(), "cam-1".into()],
        }));
        let (tx, rx) = mpsc::channel(8);
        let table = FileTable::new("captures".into(), 1024, retry, store, directory, tx);
        (table, rx)
    }

    fn upload(id: u64, index: i64, data: Vec<u8>) -> Upload {
        Upload {
            upload_id: id,
            index,
            data,
        }
    }

    #[test]
    fn test_append_idempotent() {
        let (table, _rx) = table_with(Arc::new(MemoryStore::new()), RetryPolicy::default());
        let id = table.add_file(init(1, 6, 2));
        assert_eq!(table.append(upload(id, 0, vec![1, 2, 3])), Code::Success);
        // Same index again: no-op success, state unchanged.
        assert_eq!(table.append(upload(id, 0, vec![9, 9, 9])), Code::Success);
        assert_eq!(table.append(upload(id, 1, vec![4, 5, 6])), Code::Success);
        let files = table.files.read();
        let f = files.get(&id).unwrap();
        assert_eq!(f.chunks[0].as_deref().unwrap(), &[1, 2, 3]);
        assert!(f.is_covered());
    }

    #[test]
    fn test_append_bounds() {
        let (table, _rx) = table_with(Arc::new(MemoryStore::new()), RetryPolicy::default());
        let id = table.add_file(init(1, 10, 2));
        assert_eq!(
            table.append(upload(id, 2, vec![0])),
            Code::InvalidChunkIndex
        );
        assert_eq!(
            table.append(upload(id, -1, vec![0])),
            Code::InvalidChunkIndex
        );
        // Payload above the configured chunk bound is rejected too.
        assert_eq!(
            table.append(upload(id, 0, vec![0; 2048])),
            Code::InvalidChunkIndex
        );
        assert_eq!(table.append(upload(99, 0, vec![0])), Code::Missing);
    }

    #[test]
    fn test_continue_reports_contiguous_prefix() {
        let (table, _rx) = table_with(Arc::new(MemoryStore::new()), RetryPolicy::default());
        let id = table.add_file(init(1, 40, 4));
        assert_eq!(table.continue_upload(id), Some(-1));
        table.append(upload(id, 0, vec![0; 10]));
        table.append(upload(id, 1, vec![1; 10]));
        // Out-of-order arrival beyond a gap does not advance the prefix.
        table.append(upload(id, 3, vec![3; 10]));
        assert_eq!(table.continue_upload(id), Some(1));
        table.append(upload(id, 2, vec![2; 10]));
        assert_eq!(table.continue_upload(id), Some(3));
        assert_eq!(table.continue_upload(12345), None);
    }

    #[test]
    fn test_reader_walks_chunks_in_order() {
        let mut file = RemoteFile::new(init(1, 25, 3));
        file.append(0, 0, vec![b'a'; 10], 1024);
        file.append(0, 2, vec![b'c'; 5], 1024);
        file.append(0, 1, vec![b'b'; 10], 1024);
        let mut out = Vec::new();
        file.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 25);
        assert_eq!(&out[..10], &[b'a'; 10]);
        assert_eq!(&out[10..20], &[b'b'; 10]);
        assert_eq!(&out[20..], &[b'c'; 5]);

        // Rewind restarts the stream in full.
        file.rewind();
        let mut again = Vec::new();
        file.read_to_end(&mut again).unwrap();
        assert_eq!(out, again);
    }

    #[tokio::test]
    async fn test_complete_requires_full_coverage() {
        let store = Arc::new(MemoryStore::new());
        let (table, mut rx) = table_with(store.clone(), RetryPolicy::default());
        let id = table.add_file(init(1, 20, 2));
        table.append(upload(id, 0, vec![0; 10]));

        assert_eq!(table.complete(id).await, Code::InvalidChunkIndex);
        assert!(store.is_empty());
        assert!(rx.try_recv().is_err());
        // The file survives a premature complete and can still finish.
        table.append(upload(id, 1, vec![1; 10]));
        assert_eq!(table.complete(id).await, Code::Success);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_complete_success_hands_off_downstream() {
        let store = Arc::new(MemoryStore::new());
        let (table, mut rx) = table_with(store.clone(), RetryPolicy::default());
        let id = table.add_file(init(1, 15, 2));
        table.append(upload(id, 0, vec![5; 10]));
        table.append(upload(id, 1, vec![6; 5]));

        assert_eq!(table.complete(id).await, Code::Success);
        let record = rx.recv().await.unwrap();
        assert_eq!(record.owner_id, 9);
        assert_eq!(record.device_profile, "cam-0");
        assert_eq!(record.bytes.len(), 15);
        let stored = store.get("captures", &record.object_key).unwrap();
        assert_eq!(stored, record.bytes);
        // Gone from the table: a second complete reports Missing.
        assert_eq!(table.complete(id).await, Code::Missing);
    }

    struct FailingStore {
        attempts: Mutex<u32>,
        succeed_after: u32,
    }

    impl ObjectStore for FailingStore {
        fn put(
            &self,
            _bucket: &str,
            _key: &str,
            reader: &mut dyn Read,
            size: u64,
        ) -> anyhow::Result<()> {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            assert_eq!(buf.len() as u64, size, "retry must rewind to a full stream");
            let mut attempts = self.attempts.lock();
            *attempts += 1;
            if *attempts > self.succeed_after {
                Ok(())
            } else {
                bail!("store unavailable")
            }
        }
    }

    #[tokio::test]
    async fn test_complete_retries_then_succeeds() {
        let store = Arc::new(FailingStore {
            attempts: Mutex::new(0),
            succeed_after: 2,
        });
        let retry = RetryPolicy::new(4, Duration::from_millis(1), 2);
        let (table, _rx) = table_with(store.clone(), retry);
        let id = table.add_file(init(1, 4, 1));
        table.append(upload(id, 0, vec![1, 2, 3, 4]));
        assert_eq!(table.complete(id).await, Code::Success);
        assert_eq!(*store.attempts.lock(), 3);
    }

    #[tokio::test]
    async fn test_complete_exhausts_retries() {
        let store = Arc::new(FailingStore {
            attempts: Mutex::new(0),
            succeed_after: u32::MAX,
        });
        let retry = RetryPolicy::new(3, Duration::from_millis(1), 2);
        let (table, mut rx) = table_with(store.clone(), retry);
        let id = table.add_file(init(1, 4, 1));
        table.append(upload(id, 0, vec![1, 2, 3, 4]));
        assert_eq!(table.complete(id).await, Code::MaxRetriesExceeded);
        assert_eq!(*store.attempts.lock(), 3);
        // Discarded, never partially persisted, nothing ingested.
        assert!(!table.contains(id));
        assert!(rx.try_recv().is_err());
    }
}
