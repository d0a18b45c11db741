//! SettingsStore — operator-set per-account reply policies and outreach
//! programs, plus the last-run/last-error observability fields the worker
//! stamps every cycle.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::db::Database;
use super::parse_optional_datetime;
use crate::error::StoreError;

/// Auto-reply policy for one account.
#[derive(Debug, Clone)]
pub struct ReplyPolicy {
    pub id: String,
    pub account_id: String,
    pub enabled: bool,
    /// Free-text behavioral instructions passed to the reply generator.
    pub instructions: String,
    /// Target language code for generated replies.
    pub language: String,
    pub max_replies_per_day: u32,
    pub min_delay_seconds: u32,
    pub max_delay_seconds: u32,
    /// Allow replying to threads that existed before the policy was enabled.
    pub reply_to_existing: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Which slice of the contacts pool a program draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudienceSegment {
    Target,
    Region,
    All,
}

impl AudienceSegment {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudienceSegment::Target => "target",
            AudienceSegment::Region => "region",
            AudienceSegment::All => "all",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "region" | "frankfurt" => AudienceSegment::Region,
            "all" => AudienceSegment::All,
            _ => AudienceSegment::Target,
        }
    }
}

/// Whether to contact only fresh prospects, only our own followers, or both.
/// "Own" means the contact was collected from the sending account itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudienceGroup {
    Any,
    New,
    Own,
}

impl AudienceGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudienceGroup::Any => "any",
            AudienceGroup::New => "new",
            AudienceGroup::Own => "own",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "new" | "prospects" => AudienceGroup::New,
            "own" | "mine" | "my" => AudienceGroup::Own,
            _ => AudienceGroup::Any,
        }
    }
}

/// Parse the legacy combined selector form ("target:new") still accepted at
/// the configuration boundary.
pub fn parse_audience(raw: &str) -> (AudienceSegment, AudienceGroup) {
    let raw = raw.trim().to_lowercase();
    match raw.split_once(':') {
        Some((seg, grp)) => (AudienceSegment::parse(seg), AudienceGroup::parse(grp)),
        None => (AudienceSegment::parse(&raw), AudienceGroup::Any),
    }
}

/// One step of a drip program.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgramStep {
    pub template: String,
    /// Hours after enrollment at which this step becomes due.
    #[serde(default)]
    pub offset_hours: u32,
}

/// Multi-step outreach program for one account.
#[derive(Debug, Clone)]
pub struct OutreachProgram {
    pub id: String,
    pub account_id: String,
    pub enabled: bool,
    pub segment: AudienceSegment,
    pub group: AudienceGroup,
    pub steps: Vec<ProgramStep>,
    pub max_sends_per_day: u32,
    pub min_delay_seconds: u32,
    pub max_delay_seconds: u32,
    pub allowed_start_hour: u8,
    pub allowed_end_hour: u8,
    pub timezone: String,
    pub stop_on_reply: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub struct SettingsStore {
    db: Arc<Database>,
}

impl SettingsStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    // ── Reply policies ──────────────────────────────────────────────

    /// Create or replace the reply policy for an account.
    pub fn upsert_reply_policy(&self, policy: &ReplyPolicy) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO reply_policies
                (id, account_id, enabled, instructions, language,
                 max_replies_per_day, min_delay_seconds, max_delay_seconds,
                 reply_to_existing, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
             ON CONFLICT(account_id) DO UPDATE SET
                enabled = excluded.enabled,
                instructions = excluded.instructions,
                language = excluded.language,
                max_replies_per_day = excluded.max_replies_per_day,
                min_delay_seconds = excluded.min_delay_seconds,
                max_delay_seconds = excluded.max_delay_seconds,
                reply_to_existing = excluded.reply_to_existing,
                updated_at = excluded.updated_at",
            rusqlite::params![
                if policy.id.is_empty() {
                    Uuid::new_v4().to_string()
                } else {
                    policy.id.clone()
                },
                policy.account_id,
                policy.enabled as i64,
                policy.instructions,
                policy.language,
                policy.max_replies_per_day,
                policy.min_delay_seconds,
                policy.max_delay_seconds,
                policy.reply_to_existing as i64,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn enabled_reply_policies(&self) -> Result<Vec<ReplyPolicy>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, enabled, instructions, language,
                    max_replies_per_day, min_delay_seconds, max_delay_seconds,
                    reply_to_existing, last_run_at, last_error
             FROM reply_policies WHERE enabled = 1",
        )?;
        let rows = stmt.query_map([], row_to_policy)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    /// Stamp the start of a cycle: set `last_run_at`, clear `last_error`.
    pub fn mark_policy_run(&self, policy_id: &str) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE reply_policies
             SET last_run_at = ?1, last_error = NULL, updated_at = ?1
             WHERE id = ?2",
            rusqlite::params![Utc::now().to_rfc3339(), policy_id],
        )?;
        Ok(())
    }

    pub fn set_policy_error(&self, policy_id: &str, error: &str) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE reply_policies SET last_error = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![error, Utc::now().to_rfc3339(), policy_id],
        )?;
        Ok(())
    }

    pub fn policy_last_error(&self, policy_id: &str) -> Result<Option<String>, StoreError> {
        let conn = self.db.conn();
        conn.query_row(
            "SELECT last_error FROM reply_policies WHERE id = ?1",
            rusqlite::params![policy_id],
            |row| row.get(0),
        )
        .map_err(StoreError::from)
    }

    // ── Outreach programs ───────────────────────────────────────────

    pub fn upsert_program(&self, program: &OutreachProgram) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let steps = serde_json::to_string(&program.steps)?;
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO outreach_programs
                (id, account_id, enabled, audience_segment, audience_group,
                 steps, max_sends_per_day, min_delay_seconds, max_delay_seconds,
                 allowed_start_hour, allowed_end_hour, timezone, stop_on_reply,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
             ON CONFLICT(account_id) DO UPDATE SET
                enabled = excluded.enabled,
                audience_segment = excluded.audience_segment,
                audience_group = excluded.audience_group,
                steps = excluded.steps,
                max_sends_per_day = excluded.max_sends_per_day,
                min_delay_seconds = excluded.min_delay_seconds,
                max_delay_seconds = excluded.max_delay_seconds,
                allowed_start_hour = excluded.allowed_start_hour,
                allowed_end_hour = excluded.allowed_end_hour,
                timezone = excluded.timezone,
                stop_on_reply = excluded.stop_on_reply,
                updated_at = excluded.updated_at",
            rusqlite::params![
                if program.id.is_empty() {
                    Uuid::new_v4().to_string()
                } else {
                    program.id.clone()
                },
                program.account_id,
                program.enabled as i64,
                program.segment.as_str(),
                program.group.as_str(),
                steps,
                program.max_sends_per_day,
                program.min_delay_seconds,
                program.max_delay_seconds,
                program.allowed_start_hour as i64,
                program.allowed_end_hour as i64,
                program.timezone,
                program.stop_on_reply as i64,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn enabled_programs(&self) -> Result<Vec<OutreachProgram>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, enabled, audience_segment, audience_group,
                    steps, max_sends_per_day, min_delay_seconds, max_delay_seconds,
                    allowed_start_hour, allowed_end_hour, timezone, stop_on_reply,
                    last_run_at, last_error
             FROM outreach_programs WHERE enabled = 1",
        )?;
        let rows = stmt.query_map([], row_to_program)?;
        let mut programs = Vec::new();
        for row in rows {
            programs.push(row?);
        }
        Ok(programs)
    }

    pub fn mark_program_run(&self, program_id: &str) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE outreach_programs
             SET last_run_at = ?1, last_error = NULL, updated_at = ?1
             WHERE id = ?2",
            rusqlite::params![Utc::now().to_rfc3339(), program_id],
        )?;
        Ok(())
    }

    pub fn set_program_error(&self, program_id: &str, error: &str) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE outreach_programs SET last_error = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![error, Utc::now().to_rfc3339(), program_id],
        )?;
        Ok(())
    }
}

fn row_to_policy(row: &rusqlite::Row<'_>) -> Result<ReplyPolicy, rusqlite::Error> {
    let last_run_at: Option<String> = row.get(9)?;
    Ok(ReplyPolicy {
        id: row.get(0)?,
        account_id: row.get(1)?,
        enabled: row.get::<_, i64>(2)? != 0,
        instructions: row.get(3)?,
        language: row.get(4)?,
        max_replies_per_day: row.get::<_, i64>(5)? as u32,
        min_delay_seconds: row.get::<_, i64>(6)? as u32,
        max_delay_seconds: row.get::<_, i64>(7)? as u32,
        reply_to_existing: row.get::<_, i64>(8)? != 0,
        last_run_at: parse_optional_datetime(&last_run_at),
        last_error: row.get(10)?,
    })
}

fn row_to_program(row: &rusqlite::Row<'_>) -> Result<OutreachProgram, rusqlite::Error> {
    let segment: String = row.get(3)?;
    let group: String = row.get(4)?;
    let steps_json: String = row.get(5)?;
    let last_run_at: Option<String> = row.get(13)?;
    Ok(OutreachProgram {
        id: row.get(0)?,
        account_id: row.get(1)?,
        enabled: row.get::<_, i64>(2)? != 0,
        segment: AudienceSegment::parse(&segment),
        group: AudienceGroup::parse(&group),
        steps: serde_json::from_str(&steps_json).unwrap_or_default(),
        max_sends_per_day: row.get::<_, i64>(6)? as u32,
        min_delay_seconds: row.get::<_, i64>(7)? as u32,
        max_delay_seconds: row.get::<_, i64>(8)? as u32,
        allowed_start_hour: row.get::<_, i64>(9)? as u8,
        allowed_end_hour: row.get::<_, i64>(10)? as u8,
        timezone: row.get(11)?,
        stop_on_reply: row.get::<_, i64>(12)? != 0,
        last_run_at: parse_optional_datetime(&last_run_at),
        last_error: row.get(14)?,
    })
}
