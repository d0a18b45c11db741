//! Normalization of loosely-shaped platform JSON into gateway types.
//!
//! The bridge API mirrors the platform's private responses, which vary by
//! endpoint and client version: ids arrive as `id`, `item_id`, `pk`, or
//! `uuid`; text as `text`, `message`, or `content`; timestamps as seconds,
//! milliseconds, or microseconds. Everything here is defensive lookups over
//! `serde_json::Value`.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::debug;

use super::{InboxMessage, SendOutcome, ThreadStub};

/// First present-and-non-null value among the aliased keys.
pub fn pick<'a>(record: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    let map = record.as_object()?;
    keys.iter()
        .filter_map(|k| map.get(*k))
        .find(|v| !v.is_null())
}

/// Like [`pick`], but stringifies scalars: numbers become their decimal
/// representation, so numeric ids and string ids normalize identically.
pub fn pick_str(record: &Value, keys: &[&str]) -> Option<String> {
    match pick(record, keys)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

const ID_KEYS: &[&str] = &["id", "item_id", "pk", "uuid"];
const TEXT_KEYS: &[&str] = &["text", "message", "content"];
const TIMESTAMP_KEYS: &[&str] = &["timestamp", "created_at", "time"];
const SENDER_ID_KEYS: &[&str] = &["user_id", "sender_id", "from_user_id"];
const THREAD_ID_KEYS: &[&str] = &["thread_id", "id", "pk"];
const USERNAME_KEYS: &[&str] = &["username", "sender_username", "handle"];

/// Interpret a raw numeric timestamp by magnitude: microseconds above 1e14,
/// milliseconds above 1e11, seconds otherwise.
pub fn parse_timestamp(raw: i64) -> Option<DateTime<Utc>> {
    let (secs, nanos) = if raw > 100_000_000_000_000 {
        debug!(raw, "Interpreting timestamp as microseconds");
        (raw / 1_000_000, (raw % 1_000_000) * 1_000)
    } else if raw > 100_000_000_000 {
        debug!(raw, "Interpreting timestamp as milliseconds");
        (raw / 1_000, (raw % 1_000) * 1_000_000)
    } else {
        (raw, 0)
    };
    Utc.timestamp_opt(secs, nanos as u32).single()
}

fn timestamp_of(record: &Value) -> Option<DateTime<Utc>> {
    match pick(record, TIMESTAMP_KEYS)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(parse_timestamp),
        Value::String(s) => {
            if let Ok(raw) = s.parse::<i64>() {
                parse_timestamp(raw)
            } else {
                DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            }
        }
        _ => None,
    }
}

fn username_of(record: &Value) -> Option<String> {
    if let Some(name) = pick_str(record, USERNAME_KEYS) {
        return Some(name);
    }
    // Some shapes nest the sender under a user object.
    for key in ["user", "sender", "from_user"] {
        if let Some(nested) = record.get(key) {
            if let Some(name) = pick_str(nested, USERNAME_KEYS) {
                return Some(name);
            }
        }
    }
    None
}

/// Normalize one message record. Records without any recognizable id are
/// dropped by the caller.
pub fn message_from_value(record: &Value) -> InboxMessage {
    InboxMessage {
        item_id: pick_str(record, ID_KEYS).unwrap_or_default(),
        sender_id: pick_str(record, SENDER_ID_KEYS).unwrap_or_default(),
        sender_username: username_of(record),
        text: pick_str(record, TEXT_KEYS).unwrap_or_default(),
        sent_at: timestamp_of(record),
    }
}

pub fn thread_from_value(record: &Value, pending: bool) -> Option<ThreadStub> {
    Some(ThreadStub {
        thread_id: pick_str(record, THREAD_ID_KEYS)?,
        pending,
    })
}

/// Extract the thread list from an inbox response. Accepts a bare list,
/// `{threads: [...]}`, or `{inbox: {threads: [...]}}`.
pub fn threads_from_inbox_value(body: &Value, pending: bool) -> Vec<ThreadStub> {
    let list = if let Some(list) = body.as_array() {
        list
    } else if let Some(list) = body.get("threads").and_then(Value::as_array) {
        list
    } else if let Some(list) = body
        .get("inbox")
        .and_then(|inbox| inbox.get("threads"))
        .and_then(Value::as_array)
    {
        list
    } else {
        return Vec::new();
    };
    list.iter()
        .filter_map(|record| thread_from_value(record, pending))
        .collect()
}

/// Extract message records from a thread response. Accepts a bare list,
/// `{items: [...]}`, or `{thread: {items: [...]}}`.
pub fn items_from_thread_value(body: &Value) -> Vec<InboxMessage> {
    let list = if let Some(list) = body.as_array() {
        list
    } else if let Some(list) = body.get("items").and_then(Value::as_array) {
        list
    } else if let Some(list) = body
        .get("thread")
        .and_then(|thread| thread.get("items"))
        .and_then(Value::as_array)
    {
        list
    } else {
        return Vec::new();
    };
    list.iter()
        .map(message_from_value)
        .filter(|msg| !msg.item_id.is_empty())
        .collect()
}

pub fn send_outcome_from_value(body: &Value) -> SendOutcome {
    let success = body
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or_else(|| pick_str(body, &["status"]).as_deref() == Some("ok"));
    SendOutcome {
        success,
        thread_id: pick_str(body, THREAD_ID_KEYS),
        item_id: pick_str(body, &["item_id", "message_id"]),
        error: pick_str(body, &["error", "message"]).filter(|_| !success),
    }
}
