//! Storage backend traits

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

use crate::record::MessageRecord;

/// Errors from storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// A message to append
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    /// Caller-supplied id; generated when absent
    pub id: Option<String>,
    pub body: Value,
    pub attributes: Map<String, Value>,
}

impl NewMessage {
    pub fn new(body: Value) -> Self {
        Self {
            id: None,
            body,
            attributes: Map::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_attributes(mut self, attributes: Map<String, Value>) -> Self {
        self.attributes = attributes;
        self
    }
}

/// Parameters of a receive call
#[derive(Debug, Clone)]
pub struct ReceiveRequest {
    pub max_messages: usize,
    pub visibility_timeout: Duration,
    /// Skip messages already delivered to this consumer
    pub consumer_id: Option<String>,
    /// Remove messages instead of leasing them
    pub destructive: bool,
    /// Only messages that have never been received
    pub only_new: bool,
}

impl ReceiveRequest {
    pub fn new(max_messages: usize, visibility_timeout: Duration) -> Self {
        Self {
            max_messages,
            visibility_timeout,
            consumer_id: None,
            destructive: false,
            only_new: false,
        }
    }

    pub fn consumer(mut self, consumer_id: impl Into<String>) -> Self {
        self.consumer_id = Some(consumer_id.into());
        self
    }

    pub fn destructive(mut self, destructive: bool) -> Self {
        self.destructive = destructive;
        self
    }

    pub fn only_new(mut self, only_new: bool) -> Self {
        self.only_new = only_new;
        self
    }
}

/// Statistics for a single queue, recomputed on every call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    pub exists: bool,
    pub total_messages: usize,
    pub available_messages: usize,
    pub in_flight_messages: usize,
    /// Approximate on-disk size; not every backend can report one
    pub size_bytes: Option<u64>,
    /// Earliest known timestamp for the queue
    pub created_at: Option<String>,
    /// Latest known timestamp for the queue
    pub last_modified: Option<String>,
    pub attributes: Map<String, Value>,
}

impl QueueStats {
    pub fn missing() -> Self {
        Self::default()
    }
}

/// Abstract queue storage backend.
///
/// Every mutating call behaves as if serialized per queue name.
#[async_trait]
pub trait QueueStorage: Send + Sync {
    /// Short backend identifier for logs
    fn backend_name(&self) -> &'static str;

    /// Append a message. If the caller-supplied id already exists the stored
    /// record is returned unchanged.
    async fn add_message(
        &self,
        queue: &str,
        message: NewMessage,
    ) -> Result<MessageRecord, StorageError>;

    /// Page of available messages in FIFO order, plus the total available count
    async fn get_messages(
        &self,
        queue: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<MessageRecord>, usize), StorageError>;

    /// Sweep expired leases, then lease (or remove) up to `max_messages`
    async fn receive_messages(
        &self,
        queue: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<MessageRecord>, StorageError>;

    /// Delete the in-flight message currently holding `receipt_handle`
    async fn delete_message(&self, queue: &str, receipt_handle: &str)
        -> Result<bool, StorageError>;

    /// Delete a message regardless of status
    async fn delete_message_by_id(&self, queue: &str, id: &str) -> Result<bool, StorageError>;

    /// Replace the body and refresh `created_at`
    async fn update_message(&self, queue: &str, id: &str, body: Value)
        -> Result<bool, StorageError>;

    /// Remove every message, returning how many were removed
    async fn clear_queue(&self, queue: &str) -> Result<usize, StorageError>;

    async fn queue_info(&self, queue: &str) -> Result<QueueStats, StorageError>;

    async fn list_queues(&self) -> Result<Vec<String>, StorageError>;

    async fn queue_exists(&self, queue: &str) -> Result<bool, StorageError>;

    /// Storage reachable and, when named, the queue's data readable
    async fn health_check(&self, queue: Option<&str>) -> bool;
}
