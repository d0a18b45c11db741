//! SQLite database handle — connection wrapper and migrations.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::info;

use crate::error::StoreError;

/// Shared database handle wrapping a SQLite connection behind a Mutex.
///
/// Using `Mutex` (not `RwLock`) because rusqlite `Connection` is `!Sync`.
/// All DB access is serialized — fine for this write-light, single-worker
/// workload. Rows are partitioned by `account_id`, so separate workers for
/// different accounts never contend on the same logical state.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Migration(format!(
                    "failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open(path).map_err(StoreError::from)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        info!(path = %path.display(), "Database opened");
        Ok(db)
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(StoreError::from)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Get a lock on the underlying connection.
    ///
    /// Callers hold the lock for the duration of their DB operation.
    pub fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run all schema migrations. Idempotent.
    fn run_migrations(&self) -> Result<(), StoreError> {
        let conn = self.conn();

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                platform_user_id TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS credentials (
                account_id TEXT PRIMARY KEY
                    REFERENCES accounts(id) ON DELETE CASCADE,
                nonce BLOB NOT NULL,
                ciphertext BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS reply_policies (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL UNIQUE
                    REFERENCES accounts(id) ON DELETE CASCADE,
                enabled INTEGER NOT NULL DEFAULT 0,
                instructions TEXT NOT NULL DEFAULT '',
                language TEXT NOT NULL DEFAULT 'en',
                max_replies_per_day INTEGER NOT NULL DEFAULT 20,
                min_delay_seconds INTEGER NOT NULL DEFAULT 15,
                max_delay_seconds INTEGER NOT NULL DEFAULT 45,
                reply_to_existing INTEGER NOT NULL DEFAULT 0,
                last_run_at TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS thread_cursors (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL
                    REFERENCES accounts(id) ON DELETE CASCADE,
                thread_id TEXT NOT NULL,
                last_seen_item_id TEXT NOT NULL DEFAULT '',
                last_seen_at TEXT,
                updated_at TEXT NOT NULL,
                UNIQUE(account_id, thread_id)
            );

            CREATE TABLE IF NOT EXISTS thread_messages (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL
                    REFERENCES accounts(id) ON DELETE CASCADE,
                thread_id TEXT NOT NULL,
                item_id TEXT NOT NULL,
                direction TEXT NOT NULL,
                sender_id TEXT NOT NULL DEFAULT '',
                sender_username TEXT,
                text TEXT NOT NULL DEFAULT '',
                sent_at TEXT,
                processed INTEGER NOT NULL DEFAULT 0,
                reply_text TEXT,
                replied_at TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(account_id, thread_id, item_id)
            );
            CREATE INDEX IF NOT EXISTS idx_thread_messages_thread
                ON thread_messages(account_id, thread_id);
            CREATE INDEX IF NOT EXISTS idx_thread_messages_direction
                ON thread_messages(account_id, direction);

            CREATE TABLE IF NOT EXISTS outreach_programs (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL UNIQUE
                    REFERENCES accounts(id) ON DELETE CASCADE,
                enabled INTEGER NOT NULL DEFAULT 0,
                audience_segment TEXT NOT NULL DEFAULT 'target',
                audience_group TEXT NOT NULL DEFAULT 'any',
                steps TEXT NOT NULL DEFAULT '[]',
                max_sends_per_day INTEGER NOT NULL DEFAULT 20,
                min_delay_seconds INTEGER NOT NULL DEFAULT 45,
                max_delay_seconds INTEGER NOT NULL DEFAULT 75,
                allowed_start_hour INTEGER NOT NULL DEFAULT 8,
                allowed_end_hour INTEGER NOT NULL DEFAULT 22,
                timezone TEXT NOT NULL DEFAULT 'Europe/Berlin',
                stop_on_reply INTEGER NOT NULL DEFAULT 1,
                last_run_at TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS outreach_recipients (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL
                    REFERENCES accounts(id) ON DELETE CASCADE,
                username TEXT NOT NULL,
                contact_user_id TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                current_step INTEGER NOT NULL DEFAULT 0,
                thread_id TEXT,
                last_outbound_at TEXT,
                last_inbound_at TEXT,
                enrolled_at TEXT NOT NULL,
                next_send_at TEXT,
                completed_at TEXT,
                last_error TEXT,
                UNIQUE(account_id, username)
            );
            CREATE INDEX IF NOT EXISTS idx_outreach_recipients_due
                ON outreach_recipients(account_id, status, next_send_at);

            CREATE TABLE IF NOT EXISTS outreach_sends (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL
                    REFERENCES accounts(id) ON DELETE CASCADE,
                username TEXT NOT NULL,
                contact_user_id TEXT,
                thread_id TEXT,
                step_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                sent_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_outreach_sends_account
                ON outreach_sends(account_id, status, sent_at);

            CREATE TABLE IF NOT EXISTS contacts (
                id TEXT PRIMARY KEY,
                platform_user_id TEXT,
                username TEXT NOT NULL UNIQUE,
                display_name TEXT,
                source_username TEXT,
                is_target INTEGER NOT NULL DEFAULT 0,
                is_region INTEGER NOT NULL DEFAULT 0,
                collected_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_contacts_source
                ON contacts(source_username);",
        )
        .map_err(|e| StoreError::Migration(e.to_string()))?;

        info!("Database migrations complete");
        Ok(())
    }
}
