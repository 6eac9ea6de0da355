//! Queue engine
//!
//! Validates requests, delegates to the storage backend bound at startup and
//! converts backend records into typed [`Message`] values. [`Caller`] wraps
//! the engine with a credential and checks capabilities before each call.

use rustqueue_auth::{AllowAll, Authorizer, Capability};
use rustqueue_core::{ApiError, ErrorCode};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::message::Message;
use crate::registry::QueueRegistry;
use crate::storage::{NewMessage, QueueStorage, ReceiveRequest, StorageError};
use crate::time;
use crate::validation::{self, QueueLimits};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Invalid queue name: {0}")]
    InvalidQueueName(String),

    #[error("Message body is {size} bytes, limit is {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("{0}")]
    InvalidParameter(String),

    /// `missing` distinguishes an absent credential from an unknown one
    #[error("API key missing or not recognized")]
    Unauthenticated { missing: bool },

    #[error("Access denied: {capability} on queue {queue}")]
    AccessDenied { queue: String, capability: Capability },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl QueueError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidQueueName(_) => ErrorCode::InvalidQueueName,
            Self::MessageTooLarge { .. } => ErrorCode::MessageTooLarge,
            Self::InvalidParameter(_) => ErrorCode::InvalidParameter,
            Self::Unauthenticated { missing: true } => ErrorCode::MissingApiKey,
            Self::Unauthenticated { missing: false } => ErrorCode::InvalidApiKey,
            Self::AccessDenied { .. } => ErrorCode::AccessDenied,
            Self::Storage(_) => ErrorCode::InternalError,
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        ApiError::new(err.code(), err.to_string())
    }
}

/// Options for [`QueueEngine::receive_messages`]
#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    pub max_messages: usize,
    /// Seconds; the configured default when absent
    pub visibility_timeout: Option<u64>,
    pub consumer_id: Option<String>,
    pub destructive: bool,
    pub only_new: bool,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            max_messages: 1,
            visibility_timeout: None,
            consumer_id: None,
            destructive: false,
            only_new: false,
        }
    }
}

impl ReceiveOptions {
    pub fn new(max_messages: usize) -> Self {
        Self {
            max_messages,
            ..Self::default()
        }
    }

    pub fn visibility_timeout(mut self, seconds: u64) -> Self {
        self.visibility_timeout = Some(seconds);
        self
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

#[derive(Debug, Clone, Serialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    /// Available messages in the queue, ignoring pagination
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueInfo {
    pub name: String,
    pub exists: bool,
    pub total_messages: usize,
    pub available_messages: usize,
    pub in_flight_messages: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    pub created_at: Option<String>,
    pub last_modified: Option<String>,
    pub attributes: Map<String, Value>,
    pub backend: &'static str,
}

fn canonical(text: Option<String>) -> Option<String> {
    text.as_deref()
        .and_then(time::parse_timestamp)
        .map(|ts| time::format_timestamp(&ts))
}

fn to_messages(records: Vec<crate::record::MessageRecord>) -> Result<Vec<Message>, QueueError> {
    records
        .into_iter()
        .map(|r| Message::try_from(r).map_err(QueueError::from))
        .collect()
}

/// Queue operations over one storage backend
#[derive(Clone)]
pub struct QueueEngine {
    storage: Arc<dyn QueueStorage>,
    registry: QueueRegistry,
    limits: QueueLimits,
    authorizer: Arc<dyn Authorizer>,
}

impl QueueEngine {
    pub fn new(storage: Arc<dyn QueueStorage>, limits: QueueLimits) -> Self {
        Self {
            registry: QueueRegistry::new(Arc::clone(&storage)),
            storage,
            limits,
            authorizer: Arc::new(AllowAll),
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn limits(&self) -> &QueueLimits {
        &self.limits
    }

    pub fn backend_name(&self) -> &'static str {
        self.storage.backend_name()
    }

    pub fn registry(&self) -> &QueueRegistry {
        &self.registry
    }

    /// Credential-scoped view of this engine
    pub fn caller<'a>(&'a self, credential: Option<&'a str>) -> Caller<'a> {
        Caller {
            engine: self,
            credential,
        }
    }

    pub async fn add_message(
        &self,
        queue: &str,
        id: Option<String>,
        body: Value,
        attributes: Map<String, Value>,
    ) -> Result<Message, QueueError> {
        validation::queue_name(queue)?;
        self.limits.message_body(&body)?;
        if let Some(id) = &id {
            validation::non_empty("id", id)?;
        }

        let message = NewMessage {
            id,
            body,
            attributes,
        };
        let record = self.storage.add_message(queue, message).await?;
        Ok(Message::try_from(record)?)
    }

    pub async fn get_messages(
        &self,
        queue: &str,
        limit: usize,
        offset: usize,
    ) -> Result<MessagePage, QueueError> {
        validation::queue_name(queue)?;
        self.limits.page_size(limit)?;

        let (records, total) = self.storage.get_messages(queue, limit, offset).await?;
        Ok(MessagePage {
            messages: to_messages(records)?,
            total,
            limit,
            offset,
        })
    }

    pub async fn receive_messages(
        &self,
        queue: &str,
        options: ReceiveOptions,
    ) -> Result<Vec<Message>, QueueError> {
        validation::queue_name(queue)?;
        self.limits.receive_count(options.max_messages)?;
        self.limits.consumer_id(options.consumer_id.as_deref())?;
        let timeout = self.limits.visibility_timeout(options.visibility_timeout)?;

        let request = ReceiveRequest {
            max_messages: options.max_messages,
            visibility_timeout: timeout,
            consumer_id: options.consumer_id,
            destructive: options.destructive,
            only_new: options.only_new,
        };
        let records = self.storage.receive_messages(queue, &request).await?;
        to_messages(records)
    }

    /// Delete by receipt handle. `false` covers unknown, expired and already
    /// used handles alike.
    pub async fn delete_message(&self, queue: &str, receipt_handle: &str) -> Result<bool, QueueError> {
        validation::queue_name(queue)?;
        validation::non_empty("receipt_handle", receipt_handle)?;

        let deleted = self.storage.delete_message(queue, receipt_handle).await?;
        if !deleted {
            debug!(queue = %queue, "Receipt handle did not match a live lease");
        }
        Ok(deleted)
    }

    pub async fn delete_message_by_id(&self, queue: &str, id: &str) -> Result<bool, QueueError> {
        validation::queue_name(queue)?;
        validation::non_empty("id", id)?;
        Ok(self.storage.delete_message_by_id(queue, id).await?)
    }

    /// Replace a message body. The message moves to the back of FIFO order.
    pub async fn update_message(&self, queue: &str, id: &str, body: Value) -> Result<bool, QueueError> {
        validation::queue_name(queue)?;
        validation::non_empty("id", id)?;
        self.limits.message_body(&body)?;
        Ok(self.storage.update_message(queue, id, body).await?)
    }

    pub async fn clear_queue(&self, queue: &str) -> Result<usize, QueueError> {
        validation::queue_name(queue)?;
        Ok(self.storage.clear_queue(queue).await?)
    }

    pub async fn queue_info(&self, queue: &str) -> Result<QueueInfo, QueueError> {
        validation::queue_name(queue)?;
        let stats = self.storage.queue_info(queue).await?;

        Ok(QueueInfo {
            name: queue.to_string(),
            exists: stats.exists,
            total_messages: stats.total_messages,
            available_messages: stats.available_messages,
            in_flight_messages: stats.in_flight_messages,
            size_bytes: stats.size_bytes,
            created_at: canonical(stats.created_at),
            last_modified: canonical(stats.last_modified),
            attributes: stats.attributes,
            backend: self.storage.backend_name(),
        })
    }

    pub async fn list_queues(&self) -> Result<Vec<String>, QueueError> {
        Ok(self.registry.list().await?)
    }

    pub async fn queue_exists(&self, queue: &str) -> Result<bool, QueueError> {
        validation::queue_name(queue)?;
        Ok(self.registry.exists(queue).await?)
    }

    pub async fn health_check(&self, queue: Option<&str>) -> Result<bool, QueueError> {
        if let Some(queue) = queue {
            validation::queue_name(queue)?;
        }
        Ok(self.storage.health_check(queue).await)
    }
}

/// An engine bound to one credential
pub struct Caller<'a> {
    engine: &'a QueueEngine,
    credential: Option<&'a str>,
}

impl Caller<'_> {
    fn authenticate(&self) -> Result<&str, QueueError> {
        let credential = self.credential.unwrap_or("");
        if self.engine.authorizer.authenticate(credential) {
            Ok(credential)
        } else {
            warn!(missing = self.credential.is_none(), "Rejected credential");
            Err(QueueError::Unauthenticated {
                missing: self.credential.is_none(),
            })
        }
    }

    fn require(&self, queue: &str, capability: Capability) -> Result<(), QueueError> {
        validation::queue_name(queue)?;
        let credential = self.authenticate()?;
        if self
            .engine
            .authorizer
            .authorize(credential, queue, capability)
            .is_allowed()
        {
            Ok(())
        } else {
            warn!(queue = %queue, capability = %capability, "Access denied");
            Err(QueueError::AccessDenied {
                queue: queue.to_string(),
                capability,
            })
        }
    }

    pub async fn add_message(
        &self,
        queue: &str,
        id: Option<String>,
        body: Value,
        attributes: Map<String, Value>,
    ) -> Result<Message, QueueError> {
        self.require(queue, Capability::Write)?;
        self.engine.add_message(queue, id, body, attributes).await
    }

    pub async fn get_messages(
        &self,
        queue: &str,
        limit: usize,
        offset: usize,
    ) -> Result<MessagePage, QueueError> {
        self.require(queue, Capability::Read)?;
        self.engine.get_messages(queue, limit, offset).await
    }

    pub async fn receive_messages(
        &self,
        queue: &str,
        options: ReceiveOptions,
    ) -> Result<Vec<Message>, QueueError> {
        self.require(queue, Capability::Read)?;
        self.engine.receive_messages(queue, options).await
    }

    pub async fn delete_message(&self, queue: &str, receipt_handle: &str) -> Result<bool, QueueError> {
        self.require(queue, Capability::Delete)?;
        self.engine.delete_message(queue, receipt_handle).await
    }

    pub async fn delete_message_by_id(&self, queue: &str, id: &str) -> Result<bool, QueueError> {
        self.require(queue, Capability::Delete)?;
        self.engine.delete_message_by_id(queue, id).await
    }

    pub async fn update_message(&self, queue: &str, id: &str, body: Value) -> Result<bool, QueueError> {
        self.require(queue, Capability::Write)?;
        self.engine.update_message(queue, id, body).await
    }

    pub async fn clear_queue(&self, queue: &str) -> Result<usize, QueueError> {
        self.require(queue, Capability::Manage)?;
        self.engine.clear_queue(queue).await
    }

    pub async fn queue_info(&self, queue: &str) -> Result<QueueInfo, QueueError> {
        self.require(queue, Capability::Manage)?;
        self.engine.queue_info(queue).await
    }

    pub async fn health_check(&self, queue: &str) -> Result<bool, QueueError> {
        self.require(queue, Capability::Manage)?;
        self.engine.health_check(Some(queue)).await
    }

    /// Queues this credential may read
    pub async fn list_queues(&self) -> Result<Vec<String>, QueueError> {
        let credential = self.authenticate()?;
        let authorizer = &self.engine.authorizer;
        Ok(self
            .engine
            .list_queues()
            .await?
            .into_iter()
            .filter(|queue| authorizer.authorize(credential, queue, Capability::Read).is_allowed())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageStatus;
    use crate::storage::{FileStorage, SqliteStorage};
    use rustqueue_auth::{ApiKeyAuthorizer, ApiKeyConfig};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn file_engine() -> (QueueEngine, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();
        (QueueEngine::new(Arc::new(storage), QueueLimits::default()), dir)
    }

    async fn add(engine: &QueueEngine, queue: &str, id: &str) -> Message {
        engine
            .add_message(queue, Some(id.to_string()), json!({"id": id}), Map::new())
            .await
            .unwrap()
    }

    async fn fifo_redelivery_scenario(engine: &QueueEngine) {
        for id in ["m1", "m2", "m3"] {
            add(engine, "scenario", id).await;
        }

        let first = engine
            .receive_messages("scenario", ReceiveOptions::new(2).visibility_timeout(1))
            .await
            .unwrap();
        let first_ids: Vec<_> = first.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(first_ids, vec!["m1", "m2"]);
        assert!(first.iter().all(|m| m.status == MessageStatus::InFlight));

        tokio::time::sleep(Duration::from_secs(2)).await;

        let second = engine
            .receive_messages("scenario", ReceiveOptions::new(5))
            .await
            .unwrap();
        let summary: Vec<_> = second.iter().map(|m| (m.id.as_str(), m.receive_count)).collect();
        assert_eq!(summary, vec![("m1", 2), ("m2", 2), ("m3", 1)]);
    }

    #[tokio::test]
    async fn test_redelivery_scenario_file() {
        let (engine, _dir) = file_engine().await;
        fifo_redelivery_scenario(&engine).await;
    }

    #[tokio::test]
    async fn test_redelivery_scenario_sqlite() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let engine = QueueEngine::new(Arc::new(storage), QueueLimits::default());
        fifo_redelivery_scenario(&engine).await;
    }

    #[tokio::test]
    async fn test_destructive_receive_is_final() {
        let (engine, _dir) = file_engine().await;
        add(&engine, "q", "only").await;

        let taken = engine
            .receive_messages("q", ReceiveOptions::new(1).destructive(true))
            .await
            .unwrap();
        assert_eq!(taken[0].status, MessageStatus::Processed);
        assert!(taken[0].receipt_handle.is_none());

        assert_eq!(engine.get_messages("q", 10, 0).await.unwrap().total, 0);
        assert!(engine
            .receive_messages("q", ReceiveOptions::new(10))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_update_keeps_status_and_count() {
        let (engine, _dir) = file_engine().await;
        add(&engine, "q", "m").await;
        let leased = engine
            .receive_messages("q", ReceiveOptions::new(1))
            .await
            .unwrap();

        assert!(engine.update_message("q", "m", json!("new")).await.unwrap());
        let info = engine.queue_info("q").await.unwrap();
        assert_eq!(info.in_flight_messages, 1);

        // still deletable with the handle issued before the update
        let handle = leased[0].receipt_handle.as_deref().unwrap();
        assert!(engine.delete_message("q", handle).await.unwrap());

        add(&engine, "q", "n").await;
        let first = engine
            .receive_messages("q", ReceiveOptions::new(1).visibility_timeout(1))
            .await
            .unwrap();
        assert_eq!(first[0].receive_count, 1);
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(engine.update_message("q", "n", json!("again")).await.unwrap());
        let redelivered = engine
            .receive_messages("q", ReceiveOptions::new(1))
            .await
            .unwrap();
        assert_eq!(redelivered[0].id, "n");
        assert_eq!(redelivered[0].body, json!("again"));
        assert_eq!(redelivered[0].receive_count, 2);
    }

    #[tokio::test]
    async fn test_receive_survives_unreadable_record() {
        let (engine, dir) = file_engine().await;
        let mixed = json!([
            {"id": "bad", "body": "?", "created_at": "not-a-time"},
            {"id": "good", "body": "ok", "created_at": "2024-01-01T00:00:00.000000Z"}
        ]);
        tokio::fs::write(dir.path().join("q.json"), mixed.to_string())
            .await
            .unwrap();

        let received = engine
            .receive_messages("q", ReceiveOptions::new(10))
            .await
            .unwrap();
        let ids: Vec<_> = received.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["good"]);

        let info = engine.queue_info("q").await.unwrap();
        assert_eq!(info.in_flight_messages, 1);
        assert_eq!(info.available_messages, 1);
    }

    #[tokio::test]
    async fn test_validation_precedes_storage() {
        let (engine, dir) = file_engine().await;

        let err = engine
            .add_message("bad name!", None, json!(1), Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidQueueName(_)));
        assert_eq!(err.code(), ErrorCode::InvalidQueueName);

        let big = json!("x".repeat(300 * 1024));
        let err = engine.add_message("q", None, big, Map::new()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MessageTooLarge);

        let err = engine
            .receive_messages("q", ReceiveOptions::new(0))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParameter);

        let err = engine
            .receive_messages("q", ReceiveOptions::new(1).visibility_timeout(50_000))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParameter);

        assert!(engine.get_messages("q", 0, 0).await.is_err());
        assert!(engine.delete_message("q", "").await.is_err());

        let mut entries = std::fs::read_dir(dir.path()).unwrap();
        assert!(entries.next().is_none());
    }

    #[tokio::test]
    async fn test_info_for_missing_queue() {
        let (engine, _dir) = file_engine().await;
        let info = engine.queue_info("ghost").await.unwrap();
        assert!(!info.exists);
        assert_eq!(info.total_messages, 0);
        assert_eq!(info.backend, "file");
    }

    #[tokio::test]
    async fn test_info_timestamps_are_canonical() {
        let (engine, _dir) = file_engine().await;
        let message = add(&engine, "q", "m").await;

        let info = engine.queue_info("q").await.unwrap();
        assert_eq!(
            info.created_at,
            Some(time::format_timestamp(&message.created_at))
        );
        assert!(info.size_bytes.unwrap() > 0);
    }

    fn authorizer() -> Arc<dyn Authorizer> {
        let mut auth = ApiKeyAuthorizer::new();
        auth.insert(
            "reader-key",
            ApiKeyConfig::new("reader").grant("orders", [Capability::Read]),
        )
        .unwrap();
        auth.insert(
            "admin-key",
            ApiKeyConfig::new("admin").grant(
                "*",
                [
                    Capability::Read,
                    Capability::Write,
                    Capability::Delete,
                    Capability::Manage,
                ],
            ),
        )
        .unwrap();
        Arc::new(auth)
    }

    #[tokio::test]
    async fn test_caller_capabilities() {
        let (engine, _dir) = file_engine().await;
        let engine = engine.with_authorizer(authorizer());

        let admin = engine.caller(Some("admin-key"));
        admin
            .add_message("orders", Some("o1".into()), json!(1), Map::new())
            .await
            .unwrap();
        admin
            .add_message("billing", None, json!(2), Map::new())
            .await
            .unwrap();

        let reader = engine.caller(Some("reader-key"));
        assert_eq!(reader.get_messages("orders", 10, 0).await.unwrap().total, 1);

        let err = reader
            .add_message("orders", None, json!(3), Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::AccessDenied { capability: Capability::Write, .. }));
        assert_eq!(err.code().http_status(), 403);

        assert!(reader.clear_queue("orders").await.is_err());
        assert!(reader.get_messages("billing", 10, 0).await.is_err());

        assert_eq!(reader.list_queues().await.unwrap(), vec!["orders"]);
        assert_eq!(admin.list_queues().await.unwrap(), vec!["billing", "orders"]);
    }

    #[tokio::test]
    async fn test_caller_unauthenticated() {
        let (engine, _dir) = file_engine().await;
        let engine = engine.with_authorizer(authorizer());

        let err = engine.caller(None).list_queues().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingApiKey);

        let err = engine
            .caller(Some("wrong"))
            .queue_info("orders")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidApiKey);
        assert_eq!(ApiError::from(err).status(), 401);
    }

    #[tokio::test]
    async fn test_default_authorizer_allows_anonymous() {
        let (engine, _dir) = file_engine().await;
        let caller = engine.caller(None);
        caller
            .add_message("open", None, json!("hi"), Map::new())
            .await
            .unwrap();
        assert!(caller.health_check("open").await.unwrap());
    }
}
