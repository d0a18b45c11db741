//! RecipientStore and SendLog — per-contact drip progression state and the
//! append-only record of outreach send attempts.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::db::Database;
use super::{parse_datetime, parse_optional_datetime};
use crate::error::StoreError;

/// Lifecycle of an enrolled recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientStatus {
    /// Still progressing through the steps.
    Active,
    /// Contact replied; no further steps will be sent.
    Stopped,
    /// Every step has been sent (or skipped).
    Completed,
}

impl RecipientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientStatus::Active => "active",
            RecipientStatus::Stopped => "stopped",
            RecipientStatus::Completed => "completed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "stopped" => RecipientStatus::Stopped,
            "completed" => RecipientStatus::Completed,
            _ => RecipientStatus::Active,
        }
    }
}

/// One contact enrolled into an account's drip program.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub id: String,
    pub account_id: String,
    pub username: String,
    pub contact_user_id: Option<String>,
    pub status: RecipientStatus,
    pub current_step: u32,
    pub thread_id: Option<String>,
    pub last_outbound_at: Option<DateTime<Utc>>,
    pub last_inbound_at: Option<DateTime<Utc>>,
    pub enrolled_at: DateTime<Utc>,
    pub next_send_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub struct RecipientStore {
    db: Arc<Database>,
}

const RECIPIENT_COLUMNS: &str = "id, account_id, username, contact_user_id, status, \
     current_step, thread_id, last_outbound_at, last_inbound_at, enrolled_at, \
     next_send_at, completed_at, last_error";

impl RecipientStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Enroll a contact at step zero, due immediately. Idempotent: a contact
    /// already enrolled for this account keeps its existing row.
    pub fn enroll(
        &self,
        account_id: &str,
        username: &str,
        contact_user_id: Option<&str>,
    ) -> Result<Recipient, StoreError> {
        let now = Utc::now().to_rfc3339();
        {
            let conn = self.db.conn();
            conn.execute(
                "INSERT OR IGNORE INTO outreach_recipients
                    (id, account_id, username, contact_user_id, status,
                     current_step, enrolled_at, next_send_at)
                 VALUES (?1, ?2, ?3, ?4, 'active', 0, ?5, ?5)",
                rusqlite::params![
                    Uuid::new_v4().to_string(),
                    account_id,
                    username,
                    contact_user_id,
                    now,
                ],
            )?;
        }
        match self.get(account_id, username)? {
            Some(recipient) => Ok(recipient),
            None => Err(StoreError::Query(format!(
                "enrollment row missing for {username}"
            ))),
        }
    }

    pub fn get(&self, account_id: &str, username: &str) -> Result<Option<Recipient>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECIPIENT_COLUMNS} FROM outreach_recipients
             WHERE account_id = ?1 AND username = ?2"
        ))?;
        let mut rows = stmt.query_map(rusqlite::params![account_id, username], row_to_recipient)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// The active recipient with the earliest due `next_send_at` at or before
    /// `now`, if any.
    pub fn next_due(
        &self,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Recipient>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECIPIENT_COLUMNS} FROM outreach_recipients
             WHERE account_id = ?1 AND status = 'active'
               AND next_send_at IS NOT NULL AND next_send_at <= ?2
             ORDER BY next_send_at ASC LIMIT 1"
        ))?;
        let mut rows = stmt.query_map(
            rusqlite::params![account_id, now.to_rfc3339()],
            row_to_recipient,
        )?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Contact replied: freeze the drip.
    pub fn mark_stopped(&self, id: &str, inbound_at: Option<DateTime<Utc>>) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE outreach_recipients
             SET status = 'stopped', next_send_at = NULL, completed_at = ?1,
                 last_inbound_at = COALESCE(?2, last_inbound_at)
             WHERE id = ?3",
            rusqlite::params![
                Utc::now().to_rfc3339(),
                inbound_at.map(|t| t.to_rfc3339()),
                id
            ],
        )?;
        Ok(())
    }

    pub fn mark_completed(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE outreach_recipients
             SET status = 'completed', next_send_at = NULL, completed_at = ?1
             WHERE id = ?2",
            rusqlite::params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Record a successful step send and schedule the next step, or complete
    /// the recipient when no step remains.
    pub fn record_success(
        &self,
        id: &str,
        thread_id: Option<&str>,
        next_step: u32,
        next_send_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.db.conn();
        match next_send_at {
            Some(due) => {
                conn.execute(
                    "UPDATE outreach_recipients
                     SET current_step = ?1, thread_id = COALESCE(?2, thread_id),
                         last_outbound_at = ?3, next_send_at = ?4, last_error = NULL
                     WHERE id = ?5",
                    rusqlite::params![next_step, thread_id, now, due.to_rfc3339(), id],
                )?;
            }
            None => {
                conn.execute(
                    "UPDATE outreach_recipients
                     SET current_step = ?1, thread_id = COALESCE(?2, thread_id),
                         last_outbound_at = ?3, next_send_at = NULL, last_error = NULL,
                         status = 'completed', completed_at = ?3
                     WHERE id = ?4",
                    rusqlite::params![next_step, thread_id, now, id],
                )?;
            }
        }
        Ok(())
    }

    /// Record a failed send attempt and back the recipient off until `retry_at`.
    pub fn record_failure(
        &self,
        id: &str,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE outreach_recipients
             SET last_error = ?1, next_send_at = ?2
             WHERE id = ?3",
            rusqlite::params![error, retry_at.to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Advance the step pointer without sending (blank template step).
    pub fn skip_step(
        &self,
        id: &str,
        next_step: u32,
        next_send_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let conn = self.db.conn();
        match next_send_at {
            Some(due) => {
                conn.execute(
                    "UPDATE outreach_recipients
                     SET current_step = ?1, next_send_at = ?2 WHERE id = ?3",
                    rusqlite::params![next_step, due.to_rfc3339(), id],
                )?;
                Ok(())
            }
            None => self.mark_completed(id),
        }
    }
}

fn row_to_recipient(row: &rusqlite::Row<'_>) -> Result<Recipient, rusqlite::Error> {
    let status: String = row.get(4)?;
    let last_outbound_at: Option<String> = row.get(7)?;
    let last_inbound_at: Option<String> = row.get(8)?;
    let enrolled_at: String = row.get(9)?;
    let next_send_at: Option<String> = row.get(10)?;
    let completed_at: Option<String> = row.get(11)?;
    Ok(Recipient {
        id: row.get(0)?,
        account_id: row.get(1)?,
        username: row.get(2)?,
        contact_user_id: row.get(3)?,
        status: RecipientStatus::parse(&status),
        current_step: row.get::<_, i64>(5)? as u32,
        thread_id: row.get(6)?,
        last_outbound_at: parse_optional_datetime(&last_outbound_at),
        last_inbound_at: parse_optional_datetime(&last_inbound_at),
        enrolled_at: parse_datetime(&enrolled_at),
        next_send_at: parse_optional_datetime(&next_send_at),
        completed_at: parse_optional_datetime(&completed_at),
        last_error: row.get(12)?,
    })
}

// ── Send log ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    Failed,
}

impl SendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendStatus::Sent => "sent",
            SendStatus::Failed => "failed",
        }
    }
}

/// One attempted outreach send, successful or not.
#[derive(Debug, Clone)]
pub struct OutreachSend {
    pub id: String,
    pub account_id: String,
    pub username: String,
    pub thread_id: Option<String>,
    pub step_index: u32,
    pub text: String,
    pub status: String,
    pub error: Option<String>,
    pub sent_at: DateTime<Utc>,
}

pub struct SendLog {
    db: Arc<Database>,
}

impl SendLog {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn record(
        &self,
        account_id: &str,
        username: &str,
        contact_user_id: Option<&str>,
        thread_id: Option<&str>,
        step_index: u32,
        text: &str,
        status: SendStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO outreach_sends
                (id, account_id, username, contact_user_id, thread_id,
                 step_index, text, status, error, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                account_id,
                username,
                contact_user_id,
                thread_id,
                step_index,
                text,
                status.as_str(),
                error,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Successful sends at or after `since`, for daily-cap accounting.
    pub fn count_sent_since(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let conn = self.db.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM outreach_sends
             WHERE account_id = ?1 AND status = 'sent' AND sent_at >= ?2",
            rusqlite::params![account_id, since.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    pub fn recent(&self, account_id: &str, limit: u32) -> Result<Vec<OutreachSend>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, username, thread_id, step_index, text,
                    status, error, sent_at
             FROM outreach_sends
             WHERE account_id = ?1
             ORDER BY sent_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![account_id, limit], |row| {
            let sent_at: String = row.get(8)?;
            Ok(OutreachSend {
                id: row.get(0)?,
                account_id: row.get(1)?,
                username: row.get(2)?,
                thread_id: row.get(3)?,
                step_index: row.get::<_, i64>(4)? as u32,
                text: row.get(5)?,
                status: row.get(6)?,
                error: row.get(7)?,
                sent_at: parse_datetime(&sent_at),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }
}
