//! File-backed storage: one JSON container per queue
//!
//! Every operation loads the whole container, mutates it in memory and
//! rewrites it. The per-queue lock is held across that entire span. There is
//! no fsync, so a crash mid-write can leave a truncated container, which the
//! next load treats as an empty queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::traits::*;
use crate::lease;
use crate::lock::QueueLocks;
use crate::record::MessageRecord;
use crate::time;

const CONTAINER_EXTENSION: &str = "json";

pub struct FileStorage {
    data_dir: PathBuf,
    locks: QueueLocks,
}

impl FileStorage {
    /// Open (creating if needed) a data directory
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir).await?;
        info!(path = %data_dir.display(), "Opened file queue storage");
        Ok(Self {
            data_dir,
            locks: QueueLocks::new(),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn container_path(&self, queue: &str) -> PathBuf {
        self.data_dir
            .join(format!("{queue}.{CONTAINER_EXTENSION}"))
    }

    /// Load a container. Missing or empty files are an empty queue; so is a
    /// container that fails to parse.
    async fn load(&self, queue: &str) -> Result<Vec<MessageRecord>, StorageError> {
        let path = self.container_path(queue);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        match serde_json::from_slice(&content) {
            Ok(records) => Ok(records),
            Err(e) => {
                warn!(queue = %queue, error = %e, "Malformed queue container, treating as empty");
                Ok(Vec::new())
            }
        }
    }

    /// Lock an existing container. A queue with no container gets no lock
    /// entry, so lookups of unknown names leave the lock table untouched.
    async fn existing_guard(
        &self,
        queue: &str,
    ) -> Result<Option<OwnedMutexGuard<()>>, StorageError> {
        if !tokio::fs::try_exists(self.container_path(queue)).await? {
            return Ok(None);
        }
        Ok(Some(self.locks.acquire(queue).await))
    }

    async fn save(&self, queue: &str, records: &[MessageRecord]) -> Result<(), StorageError> {
        let data = serde_json::to_vec_pretty(records)?;
        tokio::fs::write(self.container_path(queue), data)
            .await
            .map_err(|e| {
                error!(queue = %queue, error = %e, "Failed to write queue container");
                StorageError::from(e)
            })
    }

    async fn file_times(&self, path: &Path) -> (Option<String>, Option<String>) {
        let Ok(metadata) = tokio::fs::metadata(path).await else {
            return (None, None);
        };
        let as_text = |t: std::io::Result<std::time::SystemTime>| {
            t.ok()
                .map(|t| time::format_timestamp(&DateTime::<Utc>::from(t)))
        };
        let modified = as_text(metadata.modified());
        let created = as_text(metadata.created()).or_else(|| modified.clone());
        (created, modified)
    }
}

#[async_trait]
impl QueueStorage for FileStorage {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    async fn add_message(
        &self,
        queue: &str,
        message: NewMessage,
    ) -> Result<MessageRecord, StorageError> {
        let _guard = self.locks.acquire(queue).await;
        let mut records = self.load(queue).await?;

        let id = message.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if let Some(existing) = records.iter().find(|r| r.id == id) {
            warn!(queue = %queue, message_id = %id, "Message already exists");
            return Ok(existing.clone());
        }

        let record = MessageRecord::new(
            id,
            message.body,
            message.attributes,
            time::format_timestamp(&time::now()),
        );
        records.push(record.clone());
        self.save(queue, &records).await?;

        info!(queue = %queue, message_id = %record.id, "Added message");
        Ok(record)
    }

    async fn get_messages(
        &self,
        queue: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<MessageRecord>, usize), StorageError> {
        let Some(_guard) = self.existing_guard(queue).await? else {
            return Ok((Vec::new(), 0));
        };
        let records = self.load(queue).await?;

        let available: Vec<usize> = lease::fifo_order(&records)
            .into_iter()
            .filter(|&i| records[i].is_available())
            .collect();
        let total = available.len();
        let page = available
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|i| records[i].clone())
            .collect();

        Ok((page, total))
    }

    async fn receive_messages(
        &self,
        queue: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let Some(_guard) = self.existing_guard(queue).await? else {
            return Ok(Vec::new());
        };
        let mut records = self.load(queue).await?;

        let now = time::now();
        let released = lease::sweep_expired(&mut records, now);
        if released > 0 {
            debug!(queue = %queue, released, "Released expired leases");
        }

        let selected = lease::select_candidates(&records, request);
        let consumer = request.consumer_id.as_deref();
        let mut received = Vec::with_capacity(selected.len());

        if request.destructive {
            let mut removed = vec![false; records.len()];
            for &i in &selected {
                received.push(lease::finalize(records[i].clone(), consumer));
                removed[i] = true;
            }
            let mut index = 0;
            records.retain(|_| {
                let keep = !removed[index];
                index += 1;
                keep
            });
        } else {
            let deadline = lease::deadline(now, request.visibility_timeout)?;
            for &i in &selected {
                lease::lease(&mut records[i], consumer, deadline);
                received.push(records[i].clone());
            }
        }

        if !received.is_empty() || released > 0 {
            self.save(queue, &records).await?;
        }

        info!(queue = %queue, count = received.len(), destructive = request.destructive, "Received messages");
        Ok(received)
    }

    async fn delete_message(
        &self,
        queue: &str,
        receipt_handle: &str,
    ) -> Result<bool, StorageError> {
        let Some(_guard) = self.existing_guard(queue).await? else {
            return Ok(false);
        };
        let mut records = self.load(queue).await?;

        let now = time::now();
        let Some(index) = records
            .iter()
            .position(|r| lease::holds_lease(r, receipt_handle, now))
        else {
            return Ok(false);
        };

        let record = records.remove(index);
        self.save(queue, &records).await?;

        info!(queue = %queue, message_id = %record.id, "Deleted message by receipt handle");
        Ok(true)
    }

    async fn delete_message_by_id(&self, queue: &str, id: &str) -> Result<bool, StorageError> {
        let Some(_guard) = self.existing_guard(queue).await? else {
            return Ok(false);
        };
        let mut records = self.load(queue).await?;

        let Some(index) = records.iter().position(|r| r.id == id) else {
            return Ok(false);
        };

        records.remove(index);
        self.save(queue, &records).await?;

        info!(queue = %queue, message_id = %id, "Deleted message");
        Ok(true)
    }

    async fn update_message(
        &self,
        queue: &str,
        id: &str,
        body: Value,
    ) -> Result<bool, StorageError> {
        let Some(_guard) = self.existing_guard(queue).await? else {
            return Ok(false);
        };
        let mut records = self.load(queue).await?;

        let Some(record) = records.iter_mut().find(|r| r.id == id) else {
            return Ok(false);
        };

        record.body = body;
        record.created_at = time::format_timestamp(&time::now());
        self.save(queue, &records).await?;

        info!(queue = %queue, message_id = %id, "Updated message");
        Ok(true)
    }

    async fn clear_queue(&self, queue: &str) -> Result<usize, StorageError> {
        let Some(_guard) = self.existing_guard(queue).await? else {
            return Ok(0);
        };

        let count = self.load(queue).await?.len();
        self.save(queue, &[]).await?;

        info!(queue = %queue, count, "Cleared queue");
        Ok(count)
    }

    async fn queue_info(&self, queue: &str) -> Result<QueueStats, StorageError> {
        let Some(_guard) = self.existing_guard(queue).await? else {
            return Ok(QueueStats::missing());
        };
        let path = self.container_path(queue);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(QueueStats::missing()),
            Err(e) => return Err(e.into()),
        };

        let records = self.load(queue).await?;
        let timestamps: Vec<DateTime<Utc>> = records
            .iter()
            .filter_map(|r| time::parse_timestamp(&r.created_at))
            .collect();

        let (created_at, last_modified) = match (timestamps.iter().min(), timestamps.iter().max())
        {
            (Some(min), Some(max)) => (
                Some(time::format_timestamp(min)),
                Some(time::format_timestamp(max)),
            ),
            _ => self.file_times(&path).await,
        };

        Ok(QueueStats {
            exists: true,
            total_messages: records.len(),
            available_messages: records.iter().filter(|r| r.is_available()).count(),
            in_flight_messages: records.iter().filter(|r| r.is_in_flight()).count(),
            size_bytes: Some(metadata.len()),
            created_at,
            last_modified,
            attributes: Map::new(),
        })
    }

    async fn list_queues(&self) -> Result<Vec<String>, StorageError> {
        let mut entries = tokio::fs::read_dir(&self.data_dir).await?;
        let mut queues = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CONTAINER_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                queues.push(stem.to_string());
            }
        }

        queues.sort();
        Ok(queues)
    }

    async fn queue_exists(&self, queue: &str) -> Result<bool, StorageError> {
        Ok(tokio::fs::try_exists(self.container_path(queue)).await?)
    }

    async fn health_check(&self, queue: Option<&str>) -> bool {
        match tokio::fs::metadata(&self.data_dir).await {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => {
                error!(path = %self.data_dir.display(), "Data path is not a directory");
                return false;
            }
            Err(e) => {
                error!(path = %self.data_dir.display(), error = %e, "Data directory unreachable");
                return false;
            }
        }

        let Some(queue) = queue else {
            return true;
        };

        let _guard = match self.existing_guard(queue).await {
            Ok(Some(guard)) => guard,
            Ok(None) => return true,
            Err(e) => {
                error!(queue = %queue, error = %e, "File storage health check failed");
                return false;
            }
        };
        match self.load(queue).await {
            Ok(_) => true,
            Err(e) => {
                error!(queue = %queue, error = %e, "File storage health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_malformed_container_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join("broken.json"), b"[{\"id\": ")
            .await
            .unwrap();

        let (messages, total) = storage.get_messages("broken", 10, 0).await.unwrap();
        assert!(messages.is_empty());
        assert_eq!(total, 0);
        assert!(storage.health_check(Some("broken")).await);
    }

    #[tokio::test]
    async fn test_legacy_container_loads() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();
        let legacy = json!([{
            "id": "old-1",
            "message_id": "old-1",
            "message_body": {"content": "hello"},
            "timestamp": "2024-01-01T10:00:00.123456+00:00",
            "status": "available",
            "receipt_handle": null,
            "visibility_timeout_until": null
        }]);
        tokio::fs::write(dir.path().join("legacy.json"), legacy.to_string())
            .await
            .unwrap();

        let (messages, _) = storage.get_messages("legacy", 10, 0).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "old-1");
        assert_eq!(messages[0].body, json!({"content": "hello"}));
    }

    #[tokio::test]
    async fn test_unreadable_record_is_never_leased() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();
        let mixed = json!([
            {"id": "bad", "body": "?", "created_at": "not-a-time"},
            {"id": "good", "body": "ok", "created_at": "2024-01-01T00:00:00.000000Z"}
        ]);
        tokio::fs::write(dir.path().join("mixed.json"), mixed.to_string())
            .await
            .unwrap();

        let received = storage
            .receive_messages("mixed", &ReceiveRequest::new(10, Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id, "good");

        let (page, total) = storage.get_messages("mixed", 10, 0).await.unwrap();
        assert!(page.is_empty());
        assert_eq!(total, 0);

        let stats = storage.queue_info("mixed").await.unwrap();
        assert_eq!(stats.in_flight_messages, 1);
        assert_eq!(stats.available_messages, 1);

        let raw = tokio::fs::read_to_string(dir.path().join("mixed.json"))
            .await
            .unwrap();
        let stored: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored[0]["id"], "bad");
        assert!(stored[0]["receipt_handle"].is_null());
        assert_eq!(stored[0]["receive_count"], 0);
    }

    #[tokio::test]
    async fn test_unknown_queues_leave_no_locks() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();
        let request = ReceiveRequest::new(1, Duration::from_secs(30));

        for n in 0..20 {
            let queue = format!("ghost_{n}");
            storage.get_messages(&queue, 10, 0).await.unwrap();
            storage.receive_messages(&queue, &request).await.unwrap();
            assert!(!storage.queue_info(&queue).await.unwrap().exists);
            assert!(!storage.delete_message_by_id(&queue, "m").await.unwrap());
            assert_eq!(storage.clear_queue(&queue).await.unwrap(), 0);
            assert!(storage.health_check(Some(&queue)).await);
        }
        assert_eq!(storage.locks.len(), 0);
        assert!(storage.list_queues().await.unwrap().is_empty());

        storage
            .add_message("real", NewMessage::new(json!(1)))
            .await
            .unwrap();
        storage.get_messages("real", 10, 0).await.unwrap();
        assert_eq!(storage.locks.len(), 1);
    }

    #[tokio::test]
    async fn test_container_is_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();
        storage
            .add_message("orders", NewMessage::new(json!({"n": 1})).with_id("m1"))
            .await
            .unwrap();

        let raw = tokio::fs::read_to_string(dir.path().join("orders.json"))
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        let first = &parsed.as_array().unwrap()[0];
        assert_eq!(first["id"], "m1");
        assert_eq!(first["status"], "available");
        assert_eq!(first["receive_count"], 0);
        assert!(first["delivery_history"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), b"hi").await.unwrap();
        tokio::fs::write(dir.path().join("b.json"), b"[]").await.unwrap();
        tokio::fs::write(dir.path().join("a.json"), b"[]").await.unwrap();

        assert_eq!(storage.list_queues().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_health_fails_when_dir_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let storage = FileStorage::open(&path).await.unwrap();
        assert!(storage.health_check(None).await);

        tokio::fs::remove_dir_all(&path).await.unwrap();
        assert!(!storage.health_check(None).await);
    }
}
