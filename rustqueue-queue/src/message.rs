//! Typed message values returned by the engine

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::record::{status, MessageRecord};
use crate::storage::StorageError;
use crate::time;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Available,
    InFlight,
    /// Reported by a destructive receive; the message no longer exists
    Processed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => status::AVAILABLE,
            Self::InFlight => status::IN_FLIGHT,
            Self::Processed => status::PROCESSED,
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            status::AVAILABLE => Some(Self::Available),
            status::IN_FLIGHT => Some(Self::InFlight),
            status::PROCESSED => Some(Self::Processed),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub id: String,
    pub body: Value,
    pub attributes: Map<String, Value>,
    #[serde(serialize_with = "serialize_timestamp")]
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub receive_count: u32,
    pub receipt_handle: Option<String>,
    #[serde(serialize_with = "serialize_optional_timestamp")]
    pub visibility_deadline: Option<DateTime<Utc>>,
    pub delivery_history: Vec<String>,
}

fn serialize_timestamp<S: serde::Serializer>(
    ts: &DateTime<Utc>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&time::format_timestamp(ts))
}

fn serialize_optional_timestamp<S: serde::Serializer>(
    ts: &Option<DateTime<Utc>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match ts {
        Some(ts) => serializer.serialize_str(&time::format_timestamp(ts)),
        None => serializer.serialize_none(),
    }
}

impl TryFrom<MessageRecord> for Message {
    type Error = StorageError;

    fn try_from(record: MessageRecord) -> Result<Self, Self::Error> {
        let status = MessageStatus::parse(&record.status).ok_or_else(|| {
            StorageError::Corrupt(format!(
                "message {} has unknown status '{}'",
                record.id, record.status
            ))
        })?;

        let created_at = time::parse_timestamp(&record.created_at).ok_or_else(|| {
            StorageError::Corrupt(format!(
                "message {} has unreadable created_at '{}'",
                record.id, record.created_at
            ))
        })?;

        let visibility_deadline = match record.visibility_deadline.as_deref() {
            Some(text) => Some(time::parse_timestamp(text).ok_or_else(|| {
                StorageError::Corrupt(format!(
                    "message {} has unreadable visibility deadline '{text}'",
                    record.id
                ))
            })?),
            None => None,
        };

        Ok(Self {
            id: record.id,
            body: record.body,
            attributes: record.attributes,
            created_at,
            status,
            receive_count: record.receive_count,
            receipt_handle: record.receipt_handle,
            visibility_deadline,
            delivery_history: record.delivery_history,
        })
    }
}
