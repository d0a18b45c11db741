//! CursorStore — per (account, thread) last-seen message marker.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use super::db::Database;
use super::parse_optional_datetime;
use crate::error::StoreError;

/// The last processed message marker for a thread.
///
/// An empty `last_seen_item_id` means "treat the newest fetched message as
/// new" — the state a first-sighted thread is put into when an immediate
/// reply is allowed.
#[derive(Debug, Clone)]
pub struct ThreadCursor {
    pub last_seen_item_id: String,
    pub last_seen_at: Option<DateTime<Utc>>,
}

pub struct CursorStore {
    db: Arc<Database>,
}

impl CursorStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn get(
        &self,
        account_id: &str,
        thread_id: &str,
    ) -> Result<Option<ThreadCursor>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT last_seen_item_id, last_seen_at FROM thread_cursors
             WHERE account_id = ?1 AND thread_id = ?2",
        )?;
        let mut rows = stmt.query_map(rusqlite::params![account_id, thread_id], |row| {
            let last_seen_at: Option<String> = row.get(1)?;
            Ok(ThreadCursor {
                last_seen_item_id: row.get(0)?,
                last_seen_at: parse_optional_datetime(&last_seen_at),
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Move the cursor to the given marker. Idempotent and forward-only:
    /// an update whose timestamp is older than the stored one is a no-op,
    /// and an update without a timestamp keeps the stored one, so the
    /// cursor's timestamp is non-decreasing across any poll sequence.
    pub fn advance(
        &self,
        account_id: &str,
        thread_id: &str,
        item_id: &str,
        seen_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        if let (Some(existing), Some(new_at)) = (self.get(account_id, thread_id)?, seen_at) {
            if let Some(stored_at) = existing.last_seen_at {
                if new_at < stored_at {
                    debug!(
                        account = account_id,
                        thread = thread_id,
                        "Cursor advance skipped (older than stored marker)"
                    );
                    return Ok(());
                }
            }
        }

        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO thread_cursors
                (id, account_id, thread_id, last_seen_item_id, last_seen_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(account_id, thread_id) DO UPDATE SET
                last_seen_item_id = excluded.last_seen_item_id,
                last_seen_at = COALESCE(excluded.last_seen_at, last_seen_at),
                updated_at = excluded.updated_at",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                account_id,
                thread_id,
                item_id,
                seen_at.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

/// Compute the messages strictly newer than the cursor within a fetched
/// window, sorted chronologically by the caller.
///
/// - Empty cursor id: only the single newest message counts as new. This
///   prevents blasting replies into an old thread the first time it is seen.
/// - Cursor id present but not found in the window: the window has rotated
///   past the last-seen point; report a lost window (`None`) so the caller
///   resynchronizes to the newest message without replying.
pub fn new_messages_since<'a, T>(
    sorted_window: &'a [T],
    cursor_item_id: &str,
    item_id_of: impl Fn(&T) -> &str,
) -> Option<Vec<&'a T>> {
    if cursor_item_id.is_empty() {
        return Some(sorted_window.last().into_iter().collect());
    }

    let mut passed = false;
    let mut fresh = Vec::new();
    for msg in sorted_window {
        if passed {
            fresh.push(msg);
        } else if item_id_of(msg) == cursor_item_id {
            passed = true;
        }
    }

    if passed {
        Some(fresh)
    } else {
        None
    }
}
