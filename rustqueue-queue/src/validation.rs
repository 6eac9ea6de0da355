//! Request validation, applied before any storage access

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::engine::QueueError;
use crate::storage::StorageError;

static QUEUE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]{1,80}$").unwrap_or_else(|e| unreachable!("queue name regex: {e}"))
});

pub const MAX_CONSUMER_ID_LEN: usize = 256;

/// Configurable request limits
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueLimits {
    /// Serialized body size in bytes
    pub max_message_size: usize,
    /// Seconds
    pub default_visibility_timeout: u64,
    /// Seconds
    pub max_visibility_timeout: u64,
    pub max_receive_messages: usize,
    pub max_page_size: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_message_size: 256 * 1024,
            default_visibility_timeout: 30,
            max_visibility_timeout: 12 * 60 * 60,
            max_receive_messages: 100,
            max_page_size: 100,
        }
    }
}

pub fn queue_name(name: &str) -> Result<(), QueueError> {
    if QUEUE_NAME.is_match(name) {
        Ok(())
    } else {
        Err(QueueError::InvalidQueueName(name.to_string()))
    }
}

pub fn non_empty(field: &str, value: &str) -> Result<(), QueueError> {
    if value.is_empty() {
        return Err(QueueError::InvalidParameter(format!("{field} must not be empty")));
    }
    Ok(())
}

fn in_range<T>(field: &str, value: T, max: T) -> Result<(), QueueError>
where
    T: Copy + Default + PartialOrd + std::fmt::Display,
{
    if value <= T::default() || value > max {
        return Err(QueueError::InvalidParameter(format!(
            "{field} must be between 1 and {max}, got {value}"
        )));
    }
    Ok(())
}

impl QueueLimits {
    pub fn message_body(&self, body: &Value) -> Result<(), QueueError> {
        let size = serde_json::to_vec(body).map_err(StorageError::from)?.len();
        if size > self.max_message_size {
            return Err(QueueError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        Ok(())
    }

    pub fn page_size(&self, limit: usize) -> Result<(), QueueError> {
        in_range("max_messages", limit, self.max_page_size)
    }

    pub fn receive_count(&self, max_messages: usize) -> Result<(), QueueError> {
        in_range("max_messages", max_messages, self.max_receive_messages)
    }

    /// Validate an optional timeout in seconds, applying the default
    pub fn visibility_timeout(&self, seconds: Option<u64>) -> Result<Duration, QueueError> {
        let seconds = seconds.unwrap_or(self.default_visibility_timeout);
        in_range("visibility_timeout", seconds, self.max_visibility_timeout)?;
        Ok(Duration::from_secs(seconds))
    }

    pub fn consumer_id(&self, consumer_id: Option<&str>) -> Result<(), QueueError> {
        let Some(consumer_id) = consumer_id else {
            return Ok(());
        };
        non_empty("consumer_id", consumer_id)?;
        if consumer_id.chars().count() > MAX_CONSUMER_ID_LEN {
            return Err(QueueError::InvalidParameter(format!(
                "consumer_id must be at most {MAX_CONSUMER_ID_LEN} characters"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_queue_names() {
        for ok in ["orders", "a", "Orders_2024-q1", "x".repeat(80).as_str()] {
            assert!(queue_name(ok).is_ok(), "{ok}");
        }
        for bad in ["", "has space", "dots.not.allowed", "../etc", "x".repeat(81).as_str()] {
            assert!(
                matches!(queue_name(bad), Err(QueueError::InvalidQueueName(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_body_size_limit() {
        let limits = QueueLimits {
            max_message_size: 16,
            ..QueueLimits::default()
        };
        assert!(limits.message_body(&json!("short")).is_ok());
        assert!(matches!(
            limits.message_body(&json!("this one is far too long")),
            Err(QueueError::MessageTooLarge { max: 16, .. })
        ));
    }

    #[test]
    fn test_visibility_timeout_default_and_bounds() {
        let limits = QueueLimits::default();
        assert_eq!(
            limits.visibility_timeout(None).unwrap(),
            Duration::from_secs(30)
        );
        assert!(limits.visibility_timeout(Some(0)).is_err());
        assert!(limits.visibility_timeout(Some(43_200)).is_ok());
        assert!(limits.visibility_timeout(Some(43_201)).is_err());
    }

    #[test]
    fn test_counts() {
        let limits = QueueLimits::default();
        assert!(limits.receive_count(0).is_err());
        assert!(limits.receive_count(100).is_ok());
        assert!(limits.receive_count(101).is_err());
        assert!(limits.page_size(1).is_ok());
        assert!(limits.page_size(101).is_err());
    }

    #[test]
    fn test_consumer_id() {
        let limits = QueueLimits::default();
        assert!(limits.consumer_id(None).is_ok());
        assert!(limits.consumer_id(Some("worker-1")).is_ok());
        assert!(limits.consumer_id(Some("")).is_err());
        assert!(limits.consumer_id(Some(&"w".repeat(257))).is_err());
    }

    #[test]
    fn test_limits_deserialize_partial() {
        let limits: QueueLimits = serde_json::from_value(json!({"max_page_size": 10})).unwrap();
        assert_eq!(limits.max_page_size, 10);
        assert_eq!(limits.max_receive_messages, 100);
    }
}
