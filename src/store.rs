//! Collaborator contracts: durable blob storage, the device directory, and
//! the downstream ingest handoff. The collector consumes these; concrete
//! backends (MinIO, the CMDB registry, the identity pipeline) live outside
//! this crate.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use parking_lot::Mutex;

/// Durable blob storage. A put either stores the whole object or fails;
/// there are no resumable writes, so callers rewind and retry in full.
pub trait ObjectStore: Send + Sync {
    fn put(&self, bucket: &str, key: &str, reader: &mut dyn Read, size: u64) -> Result<()>;
}

/// Resolved identity for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    pub owner_id: u64,
    pub profiles: Vec<String>,
}

/// Device identity/metadata directory. `Ok(None)` means the device is
/// unknown, which fails the handshake outright.
pub trait Directory: Send + Sync {
    fn resolve(&self, device_id: &str) -> Result<Option<DeviceIdentity>>;
}

/// One finalized upload handed to the downstream pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestRecord {
    pub owner_id: u64,
    pub device_profile: String,
    pub mod_time: i64,
    pub object_key: String,
    pub bytes: Vec<u8>,
}

/// Object store writing each object as a flat file under a root directory.
/// The stand-in backend for the daemon when no real blob store is wired.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl ObjectStore for FsObjectStore {
    fn put(&self, bucket: &str, key: &str, reader: &mut dyn Read, size: u64) -> Result<()> {
        let dir = self.root.join(bucket);
        fs::create_dir_all(&dir).with_context(|| format!("create bucket dir {:?}", dir))?;
        let mut buf = Vec::with_capacity(size as usize);
        reader.read_to_end(&mut buf).context("read object bytes")?;
        anyhow::ensure!(
            buf.len() as u64 == size,
            "object size mismatch: got {}, declared {}",
            buf.len(),
            size
        );
        let path = dir.join(key);
        fs::write(&path, &buf).with_context(|| format!("write object {:?}", path))?;
        Ok(())
    }
}

/// In-memory object store, keyed by `bucket/key`.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(&format!("{}/{}", bucket, key)).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }
}

impl ObjectStore for MemoryStore {
    fn put(&self, bucket: &str, key: &str, reader: &mut dyn Read, size: u64) -> Result<()> {
        let mut buf = Vec::with_capacity(size as usize);
        reader.read_to_end(&mut buf)?;
        anyhow::ensure!(
            buf.len() as u64 == size,
            "object size mismatch: got {}, declared {}",
            buf.len(),
            size
        );
        self.objects
            .lock()
            .insert(format!("{}/{}", bucket, key), buf);
        Ok(())
    }
}

/// Fixed-table directory with an optional catch-all identity for unknown
/// devices.
pub struct StaticDirectory {
    entries: HashMap<String, DeviceIdentity>,
    fallback: Option<DeviceIdentity>,
}

impl StaticDirectory {
    pub fn new(entries: HashMap<String, DeviceIdentity>) -> Self {
        Self {
            entries,
            fallback: None,
        }
    }

    /// Resolve every device, mapping unknowns to the given identity.
    pub fn permissive(fallback: DeviceIdentity) -> Self {
        Self {
            entries: HashMap::new(),
            fallback: Some(fallback),
        }
    }
}

impl Directory for StaticDirectory {
    fn resolve(&self, device_id: &str) -> Result<Option<DeviceIdentity>> {
        if let Some(identity) = self.entries.get(device_id) {
            return Ok(Some(identity.clone()));
        }
        Ok(self.fallback.clone())
    }
}
