//! ContactStore — the shared pool of collected prospects that outreach
//! programs draw candidates from.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::db::Database;
use super::parse_datetime;
use super::settings::{AudienceGroup, AudienceSegment};
use crate::error::StoreError;

/// A collected prospect. `source_username` records which of our accounts the
/// contact was collected through.
#[derive(Debug, Clone)]
pub struct Contact {
    pub id: String,
    pub platform_user_id: Option<String>,
    pub username: String,
    pub display_name: Option<String>,
    pub source_username: Option<String>,
    pub is_target: bool,
    pub is_region: bool,
    pub collected_at: DateTime<Utc>,
}

pub struct ContactStore {
    db: Arc<Database>,
}

impl ContactStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn insert(
        &self,
        username: &str,
        platform_user_id: Option<&str>,
        display_name: Option<&str>,
        source_username: Option<&str>,
        is_target: bool,
        is_region: bool,
    ) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let conn = self.db.conn();
        conn.execute(
            "INSERT OR IGNORE INTO contacts
                (id, platform_user_id, username, display_name, source_username,
                 is_target, is_region, collected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                id,
                platform_user_id,
                username,
                display_name,
                source_username,
                is_target as i64,
                is_region as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    pub fn get(&self, username: &str) -> Result<Option<Contact>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, platform_user_id, username, display_name, source_username,
                    is_target, is_region, collected_at
             FROM contacts WHERE username = ?1",
        )?;
        let mut rows = stmt.query_map(rusqlite::params![username], row_to_contact)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Pick fresh enrollment candidates for an account: newest-collected
    /// first, filtered by audience, excluding contacts already enrolled for
    /// that account.
    pub fn pick_candidates(
        &self,
        account_id: &str,
        account_username: &str,
        segment: AudienceSegment,
        group: AudienceGroup,
        limit: u32,
    ) -> Result<Vec<Contact>, StoreError> {
        let mut sql = String::from(
            "SELECT id, platform_user_id, username, display_name, source_username,
                    is_target, is_region, collected_at
             FROM contacts
             WHERE username NOT IN
                (SELECT username FROM outreach_recipients WHERE account_id = ?1)",
        );
        match segment {
            AudienceSegment::Target => sql.push_str(" AND is_target = 1"),
            AudienceSegment::Region => sql.push_str(" AND is_region = 1"),
            AudienceSegment::All => {}
        }
        match group {
            AudienceGroup::Own => sql.push_str(" AND source_username = ?2"),
            AudienceGroup::New => {
                sql.push_str(" AND (source_username IS NULL OR source_username != ?2)")
            }
            AudienceGroup::Any => {}
        }
        sql.push_str(" ORDER BY collected_at DESC LIMIT ?3");

        let conn = self.db.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params![account_id, account_username, limit],
            row_to_contact,
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }
}

fn row_to_contact(row: &rusqlite::Row<'_>) -> Result<Contact, rusqlite::Error> {
    let collected_at: String = row.get(7)?;
    Ok(Contact {
        id: row.get(0)?,
        platform_user_id: row.get(1)?,
        username: row.get(2)?,
        display_name: row.get(3)?,
        source_username: row.get(4)?,
        is_target: row.get::<_, i64>(5)? != 0,
        is_region: row.get::<_, i64>(6)? != 0,
        collected_at: parse_datetime(&collected_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::messages::tests::test_db_with_account;
    use crate::store::RecipientStore;

    #[test]
    fn candidates_filter_by_segment() {
        let (db, account_id) = test_db_with_account();
        let store = ContactStore::new(db);
        store.insert("t1", None, None, None, true, false).unwrap();
        store.insert("r1", None, None, None, false, true).unwrap();
        store.insert("n1", None, None, None, false, false).unwrap();

        let targets = store
            .pick_candidates(&account_id, "tester", AudienceSegment::Target, AudienceGroup::Any, 25)
            .unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].username, "t1");

        let all = store
            .pick_candidates(&account_id, "tester", AudienceSegment::All, AudienceGroup::Any, 25)
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn candidates_filter_by_group() {
        let (db, account_id) = test_db_with_account();
        let store = ContactStore::new(db);
        store
            .insert("mine", None, None, Some("tester"), false, false)
            .unwrap();
        store
            .insert("theirs", None, None, Some("other_acct"), false, false)
            .unwrap();
        store.insert("orphan", None, None, None, false, false).unwrap();

        let own = store
            .pick_candidates(&account_id, "tester", AudienceSegment::All, AudienceGroup::Own, 25)
            .unwrap();
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].username, "mine");

        let fresh = store
            .pick_candidates(&account_id, "tester", AudienceSegment::All, AudienceGroup::New, 25)
            .unwrap();
        let names: Vec<_> = fresh.iter().map(|c| c.username.as_str()).collect();
        assert!(names.contains(&"theirs"));
        assert!(names.contains(&"orphan"));
        assert!(!names.contains(&"mine"));
    }

    #[test]
    fn enrolled_contacts_are_excluded() {
        let (db, account_id) = test_db_with_account();
        let contacts = ContactStore::new(Arc::clone(&db));
        let recipients = RecipientStore::new(db);
        contacts.insert("fresh", None, None, None, false, false).unwrap();
        contacts.insert("taken", None, None, None, false, false).unwrap();
        recipients.enroll(&account_id, "taken", None).unwrap();

        let picked = contacts
            .pick_candidates(&account_id, "tester", AudienceSegment::All, AudienceGroup::Any, 25)
            .unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].username, "fresh");
    }

    #[test]
    fn duplicate_username_is_ignored() {
        let (db, account_id) = test_db_with_account();
        let store = ContactStore::new(db);
        store.insert("dup", Some("1"), None, None, true, false).unwrap();
        store.insert("dup", Some("2"), None, None, false, false).unwrap();

        let all = store
            .pick_candidates(&account_id, "tester", AudienceSegment::All, AudienceGroup::Any, 25)
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].platform_user_id.as_deref(), Some("1"));
    }
}
