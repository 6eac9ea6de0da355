//! Queue enumeration over the bound storage

use std::sync::Arc;

use crate::storage::{QueueStorage, StorageError};

#[derive(Clone)]
pub struct QueueRegistry {
    storage: Arc<dyn QueueStorage>,
}

impl QueueRegistry {
    pub fn new(storage: Arc<dyn QueueStorage>) -> Self {
        Self { storage }
    }

    /// Known queue names, sorted and de-duplicated
    pub async fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut names = self.storage.list_queues().await?;
        names.sort();
        names.dedup();
        Ok(names)
    }

    pub async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        self.storage.queue_exists(name).await
    }
}
