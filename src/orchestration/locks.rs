//! Per-process exclusivity.
//!
//! Every mutating operation on a process id runs while holding that id's
//! mutex. Different process ids never contend.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, WorkflowError};

#[derive(Debug)]
pub struct ProcessLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    timeout: Duration,
}

/// Held for the duration of one operation on a process
#[derive(Debug)]
pub struct ProcessGuard {
    process_id: Uuid,
    _guard: OwnedMutexGuard<()>,
}

impl ProcessGuard {
    pub fn process_id(&self) -> Uuid {
        self.process_id
    }
}

impl ProcessLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            timeout,
        }
    }

    /// Wait up to the configured timeout for exclusive access to a process
    pub async fn acquire(&self, process_id: Uuid) -> Result<ProcessGuard> {
        let lock = Arc::clone(self.locks.entry(process_id).or_default().value());
        match tokio::time::timeout(self.timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(ProcessGuard {
                process_id,
                _guard: guard,
            }),
            Err(_) => {
                debug!(process_id = %process_id, timeout_ms = self.timeout.as_millis() as u64, "Process lock timed out");
                Err(WorkflowError::ConcurrencyConflict(format!(
                    "could not obtain exclusive access to process {process_id} within {}ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }

    /// Take the lock only if it is free right now
    pub fn try_acquire(&self, process_id: Uuid) -> Option<ProcessGuard> {
        let lock = Arc::clone(self.locks.entry(process_id).or_default().value());
        lock.try_lock_owned().ok().map(|guard| ProcessGuard {
            process_id,
            _guard: guard,
        })
    }

    /// Drop the table entry of a deleted process
    pub fn remove(&self, process_id: Uuid) {
        self.locks.remove(&process_id);
    }

    /// Drop the entry of a process nobody holds or waits on. Returns whether
    /// it was removed.
    pub fn evict(&self, process_id: Uuid) -> bool {
        self.locks
            .remove_if(&process_id, |_, lock| Arc::strong_count(lock) == 1)
            .is_some()
    }

    /// Drop every entry nobody holds or waits on
    pub fn evict_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.locks.len())
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
