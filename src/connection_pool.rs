//! Per-host connection cap shared by every download worker.
//!
//! Acquisition never waits: when all slots for a host are taken the caller
//! gets [`DownloadError::NoFreeConnections`] and decides how to back off.

use crate::DownloadError;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

pub struct HostConnectionPool {
    max_conns_per_host: usize,
    hosts: DashMap<String, Arc<Semaphore>>,
    active_connections: Arc<AtomicUsize>,
}

impl HostConnectionPool {
    pub fn new(max_conns_per_host: usize) -> Self {
        Self {
            max_conns_per_host,
            hosts: DashMap::new(),
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn try_acquire(&self, host: &str) -> Result<ConnectionGuard, DownloadError> {
        let semaphore = self
            .hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_conns_per_host)))
            .clone();

        match semaphore.try_acquire_owned() {
            Ok(permit) => {
                self.active_connections.fetch_add(1, Ordering::Relaxed);
                Ok(ConnectionGuard {
                    _permit: permit,
                    active_connections: self.active_connections.clone(),
                })
            }
            Err(TryAcquireError::NoPermits) => Err(DownloadError::NoFreeConnections(host.to_string())),
            Err(TryAcquireError::Closed) => Err(DownloadError::Cancelled),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn available_for(&self, host: &str) -> usize {
        self.hosts
            .get(host)
            .map(|s| s.available_permits())
            .unwrap_or(self.max_conns_per_host)
    }

    pub fn max_conns_per_host(&self) -> usize {
        self.max_conns_per_host
    }
}

/// Holds one connection slot; the slot frees when this drops.
pub struct ConnectionGuard {
    _permit: OwnedSemaphorePermit,
    active_connections: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}
