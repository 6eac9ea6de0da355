//! Backend-native message records
//!
//! A [`MessageRecord`] carries the same fields as a typed message but keeps
//! status and timestamps as text, exactly as they are persisted. The engine
//! converts records into [`crate::Message`] values.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::time;

/// Persisted status strings
pub mod status {
    pub const AVAILABLE: &str = "available";
    pub const IN_FLIGHT: &str = "in_flight";
    /// Only ever reported by a destructive receive, never persisted
    pub const PROCESSED: &str = "processed";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawRecord")]
pub struct MessageRecord {
    pub id: String,
    pub body: Value,
    pub attributes: Map<String, Value>,
    pub created_at: String,
    pub status: String,
    pub receive_count: u32,
    pub receipt_handle: Option<String>,
    pub visibility_deadline: Option<String>,
    pub delivery_history: Vec<String>,
}

impl MessageRecord {
    /// A fresh, never-received record
    pub fn new(id: String, body: Value, attributes: Map<String, Value>, created_at: String) -> Self {
        Self {
            id,
            body,
            attributes,
            created_at,
            status: status::AVAILABLE.to_string(),
            receive_count: 0,
            receipt_handle: None,
            visibility_deadline: None,
            delivery_history: Vec::new(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == status::AVAILABLE
    }

    pub fn is_in_flight(&self) -> bool {
        self.status == status::IN_FLIGHT
    }

    /// Whether the status and timestamps can be read back. Records that fail
    /// this are never paged or leased.
    pub fn is_readable(&self) -> bool {
        matches!(
            self.status.as_str(),
            status::AVAILABLE | status::IN_FLIGHT | status::PROCESSED
        ) && time::parse_timestamp(&self.created_at).is_some()
            && self
                .visibility_deadline
                .as_deref()
                .map_or(true, |t| time::parse_timestamp(t).is_some())
    }

    /// Return to `available`, dropping the lease
    pub fn release(&mut self) {
        self.status = status::AVAILABLE.to_string();
        self.visibility_deadline = None;
        self.receipt_handle = None;
    }
}

/// Loose on-disk shape, tolerant of containers written by older versions
/// which used different field names and omitted defaults.
#[derive(Deserialize)]
struct RawRecord {
    id: Option<String>,
    message_id: Option<String>,
    body: Option<Value>,
    message_body: Option<Value>,
    attributes: Option<Map<String, Value>>,
    created_at: Option<String>,
    timestamp: Option<String>,
    status: Option<String>,
    receive_count: Option<u32>,
    receipt_handle: Option<String>,
    visibility_deadline: Option<String>,
    visibility_timeout_until: Option<String>,
    visibility_timeout: Option<String>,
    delivery_history: Option<Vec<String>>,
}

impl From<RawRecord> for MessageRecord {
    fn from(raw: RawRecord) -> Self {
        Self {
            id: raw
                .id
                .or(raw.message_id)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            body: raw.body.or(raw.message_body).unwrap_or(Value::Null),
            attributes: raw.attributes.unwrap_or_default(),
            created_at: raw
                .created_at
                .or(raw.timestamp)
                .unwrap_or_else(|| time::format_timestamp(&time::now())),
            status: raw.status.unwrap_or_else(|| status::AVAILABLE.to_string()),
            receive_count: raw.receive_count.unwrap_or(0),
            receipt_handle: raw.receipt_handle,
            visibility_deadline: raw
                .visibility_deadline
                .or(raw.visibility_timeout_until)
                .or(raw.visibility_timeout),
            delivery_history: raw.delivery_history.unwrap_or_default(),
        }
    }
}
