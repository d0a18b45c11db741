//! AccountStore — connected sender identities.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::db::Database;
use super::parse_datetime;
use crate::error::StoreError;

/// A connected sender identity.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub username: String,
    pub platform_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct AccountStore {
    db: Arc<Database>,
}

impl AccountStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Register a new account. Returns the generated id.
    pub fn insert(
        &self,
        username: &str,
        platform_user_id: Option<&str>,
    ) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO accounts (id, username, platform_user_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![id, username, platform_user_id, Utc::now().to_rfc3339()],
        )?;
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Result<Option<Account>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, username, platform_user_id, created_at
             FROM accounts WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(rusqlite::params![id], row_to_account)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Record the platform-native user id learned at login.
    pub fn set_platform_user_id(&self, id: &str, platform_user_id: &str) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE accounts SET platform_user_id = ?1 WHERE id = ?2",
            rusqlite::params![platform_user_id, id],
        )?;
        Ok(())
    }

    /// Delete an account. All dependent state (messages, cursors, recipients,
    /// sends, credentials, settings) cascades.
    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute("DELETE FROM accounts WHERE id = ?1", rusqlite::params![id])?;
        Ok(())
    }
}

fn row_to_account(row: &rusqlite::Row<'_>) -> Result<Account, rusqlite::Error> {
    let created_str: String = row.get(3)?;
    Ok(Account {
        id: row.get(0)?,
        username: row.get(1)?,
        platform_user_id: row.get(2)?,
        created_at: parse_datetime(&created_str),
    })
}
