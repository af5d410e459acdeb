//! Destination server list: discovery-refreshed with a static fallback,
//! selected round-robin from a snapshot so a concurrent refresh never
//! blocks selection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use log::{debug, warn};
use parking_lot::RwLock;

/// Discovery-service lookup of the current collector addresses. External
/// collaborator; absence or failure falls back to the static backup list.
pub trait Discovery: Send + Sync {
    fn servers(&self) -> Result<Vec<String>>;
}

pub struct ServerList {
    servers: RwLock<Vec<String>>,
    idx: AtomicU64,
    backups: Vec<String>,
    discovery: Option<Arc<dyn Discovery>>,
}

impl ServerList {
    pub fn new(backups: Vec<String>, discovery: Option<Arc<dyn Discovery>>) -> Self {
        let list = Self {
            servers: RwLock::new(Vec::new()),
            idx: AtomicU64::new(0),
            backups,
            discovery,
        };
        list.refresh();
        list
    }

    /// Re-resolve the server list. Safe to call concurrently with
    /// selection; selection reads whichever snapshot is current.
    pub fn refresh(&self) {
        debug!("task-refresh: do");
        let next = match &self.discovery {
            None => {
                debug!("task-refresh: discovery is not set, use backup servers");
                self.backups.clone()
            }
            Some(discovery) => match discovery.servers() {
                Ok(list) if !list.is_empty() => list,
                Ok(_) => {
                    warn!("task-refresh: discovery returned no servers, use backups");
                    self.backups.clone()
                }
                Err(err) => {
                    warn!("task-refresh: discovery failed, use backups, errors: {:#}", err);
                    self.backups.clone()
                }
            },
        };
        *self.servers.write() = next;
        debug!("task-refresh: done");
    }

    /// Round-robin pick over the current snapshot; None when no servers
    /// are known.
    pub fn next_available(&self) -> Option<String> {
        let servers = self.servers.read();
        if servers.is_empty() {
            return None;
        }
        let i = self.idx.fetch_add(1, Ordering::Relaxed) as usize % servers.len();
        Some(servers[i].clone())
    }

    pub fn available(&self) -> usize {
        self.servers.read().len()
    }
}
