//! MessageStore — durable log of every inbound/outbound thread message.
//!
//! This is both the audit trail and the source of conversational context for
//! reply generation. Ingestion is idempotent: (account, thread, item) is
//! unique and re-fetching the same window never duplicates rows.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use super::db::Database;
use super::{parse_datetime, parse_optional_datetime};
use crate::error::StoreError;

/// Message direction relative to the owning account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }

    fn from_str(s: &str) -> Self {
        if s == "out" {
            Direction::Out
        } else {
            Direction::In
        }
    }
}

/// One message observed in a conversation thread.
#[derive(Debug, Clone)]
pub struct ThreadMessage {
    pub id: String,
    pub account_id: String,
    pub thread_id: String,
    pub item_id: String,
    pub direction: Direction,
    pub sender_id: String,
    pub sender_username: Option<String>,
    pub text: String,
    pub sent_at: Option<DateTime<Utc>>,
    pub processed: bool,
    pub reply_text: Option<String>,
    pub replied_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a new row.
#[derive(Debug, Clone)]
pub struct NewThreadMessage<'a> {
    pub account_id: &'a str,
    pub thread_id: &'a str,
    pub item_id: &'a str,
    pub direction: Direction,
    pub sender_id: &'a str,
    pub sender_username: Option<&'a str>,
    pub text: &'a str,
    pub sent_at: Option<DateTime<Utc>>,
}

pub struct MessageStore {
    db: Arc<Database>,
}

impl MessageStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a message if the (account, thread, item) key is not already
    /// present. Returns true when a new row was written.
    pub fn insert_if_absent(&self, msg: &NewThreadMessage<'_>) -> Result<bool, StoreError> {
        if msg.item_id.is_empty() {
            // Rows without a platform id cannot be deduplicated; skip them.
            return Ok(false);
        }
        let conn = self.db.conn();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO thread_messages
                (id, account_id, thread_id, item_id, direction, sender_id,
                 sender_username, text, sent_at, processed, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                msg.account_id,
                msg.thread_id,
                msg.item_id,
                msg.direction.as_str(),
                msg.sender_id,
                msg.sender_username,
                msg.text,
                msg.sent_at.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Insert an already-processed outbound row (a reply we just sent).
    pub fn insert_outbound(&self, msg: &NewThreadMessage<'_>) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT OR IGNORE INTO thread_messages
                (id, account_id, thread_id, item_id, direction, sender_id,
                 sender_username, text, sent_at, processed, created_at)
             VALUES (?1, ?2, ?3, ?4, 'out', ?5, ?6, ?7, ?8, 1, ?9)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                msg.account_id,
                msg.thread_id,
                msg.item_id,
                msg.sender_id,
                msg.sender_username,
                msg.text,
                msg.sent_at.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        debug!(
            account = msg.account_id,
            thread = msg.thread_id,
            "Outbound message recorded"
        );
        Ok(())
    }

    /// Most recent `limit` messages for a thread, chronological (oldest first).
    pub fn recent_history(
        &self,
        account_id: &str,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<ThreadMessage>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM (
                 SELECT id, account_id, thread_id, item_id, direction, sender_id,
                        sender_username, text, sent_at, processed, reply_text,
                        replied_at, created_at
                 FROM thread_messages
                 WHERE account_id = ?1 AND thread_id = ?2
                 ORDER BY created_at DESC LIMIT ?3
             ) ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![account_id, thread_id, limit as i64],
            row_to_message,
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    /// Most recent inbound row not yet answered, if any. Used as a fallback
    /// for pending threads whose cursor was already advanced defensively.
    pub fn latest_unprocessed_inbound(
        &self,
        account_id: &str,
        thread_id: &str,
    ) -> Result<Option<ThreadMessage>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, thread_id, item_id, direction, sender_id,
                    sender_username, text, sent_at, processed, reply_text,
                    replied_at, created_at
             FROM thread_messages
             WHERE account_id = ?1 AND thread_id = ?2
               AND direction = 'in' AND processed = 0
             ORDER BY created_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(rusqlite::params![account_id, thread_id], row_to_message)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Mark the inbound message that triggered a reply as processed.
    pub fn mark_processed(
        &self,
        account_id: &str,
        thread_id: &str,
        item_id: &str,
        reply_text: &str,
        replied_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE thread_messages
             SET processed = 1, reply_text = ?1, replied_at = ?2
             WHERE account_id = ?3 AND thread_id = ?4 AND item_id = ?5",
            rusqlite::params![
                reply_text,
                replied_at.to_rfc3339(),
                account_id,
                thread_id,
                item_id
            ],
        )?;
        Ok(())
    }

    /// Count auto-replies sent since `day_start` (daily cap input). Only
    /// inbound rows marked processed with a `replied_at` stamp count, so
    /// outreach sends mirrored into the log never consume reply budget.
    pub fn count_replies_since(
        &self,
        account_id: &str,
        day_start: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let conn = self.db.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM thread_messages
             WHERE account_id = ?1 AND replied_at >= ?2",
            rusqlite::params![account_id, day_start.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    /// True if any inbound message with text arrived after `after`.
    /// Drives the outreach stop-on-reply check.
    pub fn has_inbound_after(
        &self,
        account_id: &str,
        thread_id: &str,
        after: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.db.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM thread_messages
             WHERE account_id = ?1 AND thread_id = ?2 AND direction = 'in'
               AND sent_at IS NOT NULL AND sent_at > ?3 AND text != ''",
            rusqlite::params![account_id, thread_id, after.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<ThreadMessage, rusqlite::Error> {
    let direction: String = row.get(4)?;
    let sent_at: Option<String> = row.get(8)?;
    let replied_at: Option<String> = row.get(11)?;
    let created_at: String = row.get(12)?;
    Ok(ThreadMessage {
        id: row.get(0)?,
        account_id: row.get(1)?,
        thread_id: row.get(2)?,
        item_id: row.get(3)?,
        direction: Direction::from_str(&direction),
        sender_id: row.get(5)?,
        sender_username: row.get(6)?,
        text: row.get(7)?,
        sent_at: parse_optional_datetime(&sent_at),
        processed: row.get::<_, i64>(9)? != 0,
        reply_text: row.get(10)?,
        replied_at: parse_optional_datetime(&replied_at),
        created_at: parse_datetime(&created_at),
    })
}
