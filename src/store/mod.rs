//! Persistence layer — SQLite-backed storage, one module per aggregate.

pub mod accounts;
pub mod contacts;
pub mod cursors;
pub mod db;
pub mod messages;
pub mod outreach;
pub mod settings;

pub use accounts::{Account, AccountStore};
pub use contacts::{Contact, ContactStore};
pub use cursors::{CursorStore, ThreadCursor};
pub use db::Database;
pub use messages::{Direction, MessageStore, NewThreadMessage, ThreadMessage};
pub use outreach::{OutreachSend, Recipient, RecipientStatus, RecipientStore, SendLog, SendStatus};
pub use settings::{
    AudienceGroup, AudienceSegment, OutreachProgram, ProgramStep, ReplyPolicy, SettingsStore,
};

use chrono::{DateTime, Utc};

/// Parse an rfc3339 TEXT column; unparseable values map to the UTC epoch
/// minimum so they sort first rather than crash the worker.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}
