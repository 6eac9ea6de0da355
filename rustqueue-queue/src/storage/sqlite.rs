//! SQLite storage: queues and messages as rows
//!
//! A single connection behind a mutex serializes all access; calls run on
//! the blocking pool. Mutations run inside a transaction. The expiry sweep is
//! a conditional UPDATE issued at the start of the receive transaction, so
//! the observable transitions match the file backend's sweep-then-select.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::traits::*;
use crate::lease;
use crate::record::{status, MessageRecord};
use crate::time;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS queues (
        name TEXT PRIMARY KEY,
        created_at TEXT NOT NULL,
        attributes TEXT NOT NULL DEFAULT '{}'
    );

    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        message_id TEXT NOT NULL,
        queue_name TEXT NOT NULL REFERENCES queues(name),
        body TEXT NOT NULL,
        attributes TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'available',
        visibility_deadline TEXT NULL,
        receipt_handle TEXT NULL,
        receive_count INTEGER NOT NULL DEFAULT 0,
        delivery_history TEXT NOT NULL DEFAULT '[]',
        UNIQUE (queue_name, message_id)
    );

    CREATE INDEX IF NOT EXISTS idx_messages_queue_status
        ON messages(queue_name, status);

    CREATE INDEX IF NOT EXISTS idx_messages_visibility
        ON messages(visibility_deadline);
";

/// Columns read for every message query; `id` is the internal row key
const MESSAGE_COLUMNS: &str = "id, message_id, body, attributes, created_at, status, \
     receive_count, receipt_handle, visibility_deadline, delivery_history";

pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (creating if needed) a database file and its schema
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StorageError> {
            let conn = Connection::open(&path)?;
            initialize(&conn)?;
            info!(path = %path.display(), "Opened SQLite queue storage");
            Ok(conn)
        })
        .await
        .map_err(|e| StorageError::Internal(format!("storage task failed: {e}")))??;

        Ok(Self::from_connection(conn))
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        initialize(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `f` against the connection on the blocking pool
    async fn call<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut *conn)
        })
        .await
        .map_err(|e| StorageError::Internal(format!("storage task failed: {e}")))?
    }
}

fn initialize(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Raw column values of one message row
struct MessageRow {
    row_id: String,
    message_id: String,
    body: String,
    attributes: String,
    created_at: String,
    status: String,
    receive_count: i64,
    receipt_handle: Option<String>,
    visibility_deadline: Option<String>,
    delivery_history: String,
}

impl MessageRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            row_id: row.get(0)?,
            message_id: row.get(1)?,
            body: row.get(2)?,
            attributes: row.get(3)?,
            created_at: row.get(4)?,
            status: row.get(5)?,
            receive_count: row.get(6)?,
            receipt_handle: row.get(7)?,
            visibility_deadline: row.get(8)?,
            delivery_history: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<MessageRecord, StorageError> {
        let receive_count = u32::try_from(self.receive_count).map_err(|_| {
            StorageError::Corrupt(format!(
                "message {} has receive_count {}",
                self.message_id, self.receive_count
            ))
        })?;

        Ok(MessageRecord {
            id: self.message_id,
            body: serde_json::from_str(&self.body)?,
            attributes: serde_json::from_str(&self.attributes)?,
            created_at: self.created_at,
            status: self.status,
            receive_count,
            receipt_handle: self.receipt_handle,
            visibility_deadline: self.visibility_deadline,
            delivery_history: serde_json::from_str(&self.delivery_history)?,
        })
    }
}

fn find_message(
    tx: &Transaction<'_>,
    queue: &str,
    message_id: &str,
) -> Result<Option<MessageRecord>, StorageError> {
    tx.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE queue_name = ?1 AND message_id = ?2"),
        params![queue, message_id],
        MessageRow::read,
    )
    .optional()?
    .map(MessageRow::into_record)
    .transpose()
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_usize(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}

#[async_trait]
impl QueueStorage for SqliteStorage {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn add_message(
        &self,
        queue: &str,
        message: NewMessage,
    ) -> Result<MessageRecord, StorageError> {
        let queue = queue.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let now = time::format_timestamp(&time::now());

            tx.execute(
                "INSERT OR IGNORE INTO queues (name, created_at) VALUES (?1, ?2)",
                params![queue, now],
            )?;

            let id = match message.id {
                Some(id) => {
                    if let Some(existing) = find_message(&tx, &queue, &id)? {
                        warn!(queue = %queue, message_id = %id, "Message already exists");
                        return Ok(existing);
                    }
                    id
                }
                None => Uuid::new_v4().to_string(),
            };

            let record = MessageRecord::new(id, message.body, message.attributes, now);
            tx.execute(
                "INSERT INTO messages (
                    id, message_id, queue_name, body, attributes, created_at, status,
                    receive_count, delivery_history
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, '[]')",
                params![
                    Uuid::new_v4().to_string(),
                    record.id,
                    queue,
                    serde_json::to_string(&record.body)?,
                    serde_json::to_string(&record.attributes)?,
                    record.created_at,
                    record.status,
                ],
            )?;
            tx.commit()?;

            info!(queue = %queue, message_id = %record.id, "Added message");
            Ok(record)
        })
        .await
    }

    async fn get_messages(
        &self,
        queue: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<MessageRecord>, usize), StorageError> {
        let queue = queue.to_string();
        self.call(move |conn| {
            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE queue_name = ?1 AND status = ?2",
                params![queue, status::AVAILABLE],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE queue_name = ?1 AND status = ?2
                 ORDER BY created_at ASC, rowid ASC
                 LIMIT ?3 OFFSET ?4"
            ))?;
            let rows = stmt
                .query_map(
                    params![queue, status::AVAILABLE, to_i64(limit), to_i64(offset)],
                    MessageRow::read,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            let mut records = rows
                .into_iter()
                .map(MessageRow::into_record)
                .collect::<Result<Vec<_>, _>>()?;
            records.retain(|record| {
                let readable = record.is_readable();
                if !readable {
                    warn!(
                        queue = %queue,
                        message_id = %record.id,
                        "Skipping unreadable message record"
                    );
                }
                readable
            });

            Ok((records, to_usize(total)))
        })
        .await
    }

    async fn receive_messages(
        &self,
        queue: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let queue = queue.to_string();
        let request = request.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let now = time::now();
            let now_text = time::format_timestamp(&now);

            let released = tx.execute(
                "UPDATE messages
                 SET status = ?1, visibility_deadline = NULL, receipt_handle = NULL
                 WHERE queue_name = ?2 AND status = ?3
                   AND (visibility_deadline IS NULL OR visibility_deadline <= ?4)",
                params![status::AVAILABLE, queue, status::IN_FLIGHT, now_text],
            )?;
            if released > 0 {
                debug!(queue = %queue, released, "Released expired leases");
            }

            let candidates = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE queue_name = ?1 AND status = ?2
                       AND (?3 = 0 OR receive_count = 0)
                       AND (?4 IS NULL OR NOT EXISTS (
                            SELECT 1 FROM json_each(messages.delivery_history)
                            WHERE json_each.value = ?4))
                     ORDER BY created_at ASC, rowid ASC
                     LIMIT ?5"
                ))?;
                let rows = stmt
                    .query_map(
                        params![
                            queue,
                            status::AVAILABLE,
                            request.only_new,
                            request.consumer_id,
                            to_i64(request.max_messages),
                        ],
                        MessageRow::read,
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };

            let consumer = request.consumer_id.as_deref();
            let deadline = lease::deadline(now, request.visibility_timeout)?;
            let mut received = Vec::with_capacity(candidates.len());

            for row in candidates {
                let row_id = row.row_id.clone();
                let mut record = row.into_record()?;
                if !record.is_readable() {
                    warn!(
                        queue = %queue,
                        message_id = %record.id,
                        "Skipping unreadable message record"
                    );
                    continue;
                }

                if request.destructive {
                    tx.execute("DELETE FROM messages WHERE id = ?1", params![row_id])?;
                    received.push(lease::finalize(record, consumer));
                } else {
                    lease::lease(&mut record, consumer, deadline);
                    tx.execute(
                        "UPDATE messages
                         SET status = ?1, visibility_deadline = ?2, receipt_handle = ?3,
                             receive_count = ?4, delivery_history = ?5
                         WHERE id = ?6",
                        params![
                            record.status,
                            record.visibility_deadline,
                            record.receipt_handle,
                            i64::from(record.receive_count),
                            serde_json::to_string(&record.delivery_history)?,
                            row_id,
                        ],
                    )?;
                    received.push(record);
                }
            }

            tx.commit()?;

            info!(queue = %queue, count = received.len(), destructive = request.destructive, "Received messages");
            Ok(received)
        })
        .await
    }

    async fn delete_message(
        &self,
        queue: &str,
        receipt_handle: &str,
    ) -> Result<bool, StorageError> {
        let queue = queue.to_string();
        let receipt_handle = receipt_handle.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let now = time::format_timestamp(&time::now());
            let deleted = tx.execute(
                "DELETE FROM messages
                 WHERE queue_name = ?1 AND receipt_handle = ?2 AND status = ?3
                   AND visibility_deadline > ?4",
                params![queue, receipt_handle, status::IN_FLIGHT, now],
            )?;
            tx.commit()?;

            if deleted > 0 {
                info!(queue = %queue, "Deleted message by receipt handle");
            }
            Ok(deleted > 0)
        })
        .await
    }

    async fn delete_message_by_id(&self, queue: &str, id: &str) -> Result<bool, StorageError> {
        let queue = queue.to_string();
        let id = id.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let deleted = tx.execute(
                "DELETE FROM messages WHERE queue_name = ?1 AND message_id = ?2",
                params![queue, id],
            )?;
            tx.commit()?;

            if deleted > 0 {
                info!(queue = %queue, message_id = %id, "Deleted message");
            }
            Ok(deleted > 0)
        })
        .await
    }

    async fn update_message(
        &self,
        queue: &str,
        id: &str,
        body: Value,
    ) -> Result<bool, StorageError> {
        let queue = queue.to_string();
        let id = id.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let updated = tx.execute(
                "UPDATE messages SET body = ?1, created_at = ?2
                 WHERE queue_name = ?3 AND message_id = ?4",
                params![
                    serde_json::to_string(&body)?,
                    time::format_timestamp(&time::now()),
                    queue,
                    id
                ],
            )?;
            tx.commit()?;

            if updated > 0 {
                info!(queue = %queue, message_id = %id, "Updated message");
            }
            Ok(updated > 0)
        })
        .await
    }

    async fn clear_queue(&self, queue: &str) -> Result<usize, StorageError> {
        let queue = queue.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let count = tx.execute("DELETE FROM messages WHERE queue_name = ?1", params![queue])?;
            tx.commit()?;

            info!(queue = %queue, count, "Cleared queue");
            Ok(count)
        })
        .await
    }

    async fn queue_info(&self, queue: &str) -> Result<QueueStats, StorageError> {
        let queue = queue.to_string();
        self.call(move |conn| {
            let queue_row: Option<(String, String)> = conn
                .query_row(
                    "SELECT created_at, attributes FROM queues WHERE name = ?1",
                    params![queue],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((queue_created, attributes)) = queue_row else {
                return Ok(QueueStats::missing());
            };

            let (total, available, in_flight, earliest, latest): (
                i64,
                i64,
                i64,
                Option<String>,
                Option<String>,
            ) = conn.query_row(
                "SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN status = ?2 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = ?3 THEN 1 ELSE 0 END), 0),
                    MIN(created_at),
                    MAX(created_at)
                 FROM messages WHERE queue_name = ?1",
                params![queue, status::AVAILABLE, status::IN_FLIGHT],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )?;

            let attributes: Map<String, Value> = serde_json::from_str(&attributes)?;
            Ok(QueueStats {
                exists: true,
                total_messages: to_usize(total),
                available_messages: to_usize(available),
                in_flight_messages: to_usize(in_flight),
                size_bytes: None,
                created_at: earliest.or_else(|| Some(queue_created.clone())),
                last_modified: latest.or(Some(queue_created)),
                attributes,
            })
        })
        .await
    }

    async fn list_queues(&self) -> Result<Vec<String>, StorageError> {
        self.call(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM queues ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn queue_exists(&self, queue: &str) -> Result<bool, StorageError> {
        let queue = queue.to_string();
        self.call(move |conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM queues WHERE name = ?1",
                    params![queue],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn health_check(&self, queue: Option<&str>) -> bool {
        let queue = queue.map(str::to_string);
        let result = self
            .call(move |conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
                if let Some(queue) = queue {
                    conn.query_row(
                        "SELECT COUNT(*) FROM messages WHERE queue_name = ?1",
                        params![queue],
                        |row| row.get::<_, i64>(0),
                    )?;
                }
                Ok(())
            })
            .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "SQLite storage health check failed");
                false
            }
        }
    }
}
