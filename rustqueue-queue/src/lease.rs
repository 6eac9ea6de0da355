//! Message state machine and visibility-timeout leasing
//!
//! `available -> in_flight` on receive, `in_flight -> available` when a lease
//! expires (detected lazily by [`sweep_expired`]), and removal on delete or
//! destructive receive. These functions operate on in-memory records; the
//! SQLite backend expresses the same transitions in SQL.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::record::{status, MessageRecord};
use crate::storage::{ReceiveRequest, StorageError};
use crate::time;

pub fn new_receipt_handle() -> String {
    format!("receipt_{}", Uuid::new_v4().simple())
}

/// Deadline for a lease granted at `now`
pub fn deadline(now: DateTime<Utc>, timeout: Duration) -> Result<DateTime<Utc>, StorageError> {
    let timeout = chrono::Duration::from_std(timeout)
        .map_err(|e| StorageError::Internal(format!("visibility timeout out of range: {e}")))?;
    now.checked_add_signed(timeout)
        .ok_or_else(|| StorageError::Internal("visibility deadline overflow".to_string()))
}

/// An in-flight record whose deadline has passed. A deadline that cannot be
/// parsed counts as passed.
pub fn is_expired(record: &MessageRecord, now: DateTime<Utc>) -> bool {
    record.is_in_flight()
        && record
            .visibility_deadline
            .as_deref()
            .and_then(time::parse_timestamp)
            .map_or(true, |deadline| deadline <= now)
}

/// Return every expired lease to `available`
pub fn sweep_expired(records: &mut [MessageRecord], now: DateTime<Utc>) -> usize {
    let mut released = 0;
    for record in records.iter_mut().filter(|r| is_expired(r, now)) {
        record.release();
        released += 1;
    }
    released
}

/// Whether the receive described by `request` may pick this record
pub fn is_eligible(record: &MessageRecord, request: &ReceiveRequest) -> bool {
    if !record.is_available() {
        return false;
    }
    if request.only_new && record.receive_count > 0 {
        return false;
    }
    match &request.consumer_id {
        Some(consumer) => !record.delivery_history.iter().any(|c| c == consumer),
        None => true,
    }
}

/// Indices of readable `records` in ascending `created_at` order, ties kept
/// in storage order. Unreadable records are skipped with a warning.
pub fn fifo_order(records: &[MessageRecord]) -> Vec<usize> {
    let mut order: Vec<(DateTime<Utc>, usize)> = records
        .iter()
        .enumerate()
        .filter_map(|(i, record)| {
            if !record.is_readable() {
                warn!(
                    message_id = %record.id,
                    status = %record.status,
                    created_at = %record.created_at,
                    "Skipping unreadable message record"
                );
                return None;
            }
            time::parse_timestamp(&record.created_at).map(|ts| (ts, i))
        })
        .collect();
    order.sort_by_key(|&(ts, _)| ts);
    order.into_iter().map(|(_, i)| i).collect()
}

/// Up to `max_messages` eligible records, oldest first
pub fn select_candidates(records: &[MessageRecord], request: &ReceiveRequest) -> Vec<usize> {
    fifo_order(records)
        .into_iter()
        .filter(|&i| is_eligible(&records[i], request))
        .take(request.max_messages)
        .collect()
}

fn record_delivery(record: &mut MessageRecord, consumer_id: Option<&str>) {
    record.receive_count += 1;
    if let Some(consumer) = consumer_id {
        record.delivery_history.push(consumer.to_string());
    }
}

/// `available -> in_flight` with a fresh receipt handle
pub fn lease(record: &mut MessageRecord, consumer_id: Option<&str>, deadline: DateTime<Utc>) {
    record_delivery(record, consumer_id);
    record.status = status::IN_FLIGHT.to_string();
    record.visibility_deadline = Some(time::format_timestamp(&deadline));
    record.receipt_handle = Some(new_receipt_handle());
}

/// Snapshot reported by a destructive receive; the caller removes the
/// stored record
pub fn finalize(mut record: MessageRecord, consumer_id: Option<&str>) -> MessageRecord {
    record_delivery(&mut record, consumer_id);
    record.status = status::PROCESSED.to_string();
    record.visibility_deadline = None;
    record.receipt_handle = None;
    record
}

/// Whether `receipt_handle` currently owns an unexpired lease on `record`
pub fn holds_lease(record: &MessageRecord, receipt_handle: &str, now: DateTime<Utc>) -> bool {
    record.is_in_flight()
        && record.receipt_handle.as_deref() == Some(receipt_handle)
        && !is_expired(record, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::{Map, Value};

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, secs).unwrap()
    }

    fn record(id: &str, created: DateTime<Utc>) -> MessageRecord {
        MessageRecord::new(
            id.to_string(),
            Value::Null,
            Map::new(),
            time::format_timestamp(&created),
        )
    }

    fn request(max: usize) -> ReceiveRequest {
        ReceiveRequest::new(max, Duration::from_secs(30))
    }

    #[test]
    fn test_lease_sets_handle_and_deadline() {
        let mut r = record("m1", at(0));
        lease(&mut r, None, at(30));

        assert!(r.is_in_flight());
        assert_eq!(r.receive_count, 1);
        assert!(r.receipt_handle.as_deref().unwrap().starts_with("receipt_"));
        assert_eq!(
            r.visibility_deadline.as_deref(),
            Some("2024-01-01T00:00:30.000000Z")
        );
    }

    #[test]
    fn test_handles_are_unique() {
        assert_ne!(new_receipt_handle(), new_receipt_handle());
    }

    #[test]
    fn test_sweep_releases_only_expired() {
        let mut records = vec![record("a", at(0)), record("b", at(1)), record("c", at(2))];
        lease(&mut records[0], None, at(10));
        lease(&mut records[1], None, at(40));

        let released = sweep_expired(&mut records, at(20));
        assert_eq!(released, 1);
        assert!(records[0].is_available());
        assert!(records[0].receipt_handle.is_none());
        assert_eq!(records[0].receive_count, 1);
        assert!(records[1].is_in_flight());
        assert!(records[2].is_available());
    }

    #[test]
    fn test_deadline_equal_to_now_is_expired() {
        let mut r = record("a", at(0));
        lease(&mut r, None, at(10));
        assert!(is_expired(&r, at(10)));
    }

    #[test]
    fn test_unparseable_deadline_is_expired() {
        let mut r = record("a", at(0));
        lease(&mut r, None, at(10));
        r.visibility_deadline = Some("not a time".to_string());
        assert!(is_expired(&r, at(0)));
    }

    #[test]
    fn test_select_fifo_by_created_at() {
        let records = vec![record("late", at(5)), record("early", at(1)), record("mid", at(3))];
        let picked: Vec<&str> = select_candidates(&records, &request(2))
            .into_iter()
            .map(|i| records[i].id.as_str())
            .collect();
        assert_eq!(picked, vec!["early", "mid"]);
    }

    #[test]
    fn test_select_ties_keep_storage_order() {
        let records = vec![record("first", at(1)), record("second", at(1))];
        assert_eq!(select_candidates(&records, &request(10)), vec![0, 1]);
    }

    #[test]
    fn test_select_skips_unreadable_records() {
        let mut bad_time = record("bad-time", at(0));
        bad_time.created_at = "not-a-time".to_string();
        let mut bad_status = record("bad-status", at(0));
        bad_status.status = "lost".to_string();
        let records = vec![bad_time, bad_status, record("good", at(2))];

        assert_eq!(select_candidates(&records, &request(10)), vec![2]);
        assert_eq!(fifo_order(&records), vec![2]);
    }

    #[test]
    fn test_select_only_new() {
        let mut records = vec![record("seen", at(0)), record("fresh", at(1))];
        records[0].receive_count = 1;

        let picked = select_candidates(&records, &request(10).only_new(true));
        assert_eq!(picked, vec![1]);
    }

    #[test]
    fn test_select_consumer_dedup() {
        let mut records = vec![record("a", at(0)), record("b", at(1))];
        records[0].delivery_history.push("worker-1".to_string());

        assert_eq!(
            select_candidates(&records, &request(10).consumer("worker-1")),
            vec![1]
        );
        assert_eq!(
            select_candidates(&records, &request(10).consumer("worker-2")),
            vec![0, 1]
        );
    }

    #[test]
    fn test_finalize_reports_processed() {
        let r = finalize(record("a", at(0)), Some("w"));
        assert_eq!(r.status, status::PROCESSED);
        assert_eq!(r.receive_count, 1);
        assert!(r.receipt_handle.is_none());
        assert_eq!(r.delivery_history, vec!["w".to_string()]);
    }

    #[test]
    fn test_holds_lease() {
        let mut r = record("a", at(0));
        lease(&mut r, None, at(30));
        let handle = r.receipt_handle.clone().unwrap();

        assert!(holds_lease(&r, &handle, at(10)));
        assert!(!holds_lease(&r, "receipt_other", at(10)));
        assert!(!holds_lease(&r, &handle, at(30)));
    }
}
