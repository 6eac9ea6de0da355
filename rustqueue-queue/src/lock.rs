//! Per-queue lock table

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lazily grown table of one async mutex per queue name.
///
/// Lock creation goes through `DashMap::entry`, which holds the shard lock
/// while inserting, so two callers racing on a new name always receive the
/// same mutex.
#[derive(Debug, Default)]
pub struct QueueLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl QueueLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the lock for `queue`
    pub fn get(&self, queue: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.get(queue) {
            return Arc::clone(lock.value());
        }
        Arc::clone(self.locks.entry(queue.to_string()).or_default().value())
    }

    /// Acquire the lock for `queue`. The guard must be held across the whole
    /// load-mutate-persist span.
    pub async fn acquire(&self, queue: &str) -> OwnedMutexGuard<()> {
        self.get(queue).lock_owned().await
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.len()
    }
}
