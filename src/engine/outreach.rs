//! Outreach engine — drip progression for enrolled recipients.
//!
//! One pass per account: stop recipients who replied, send the due step to
//! everyone else, enroll fresh candidates when the due queue runs dry, and
//! respect the daily cap, quiet hours, and pacing floor throughout.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use super::throttle::{clamp_outreach_delays, jittered_delay, within_allowed_hours};
use crate::error::{is_rate_limit_signal, Error, GatewayError};
use crate::gateway::{InboxGateway, SendTarget};
use crate::store::{
    Account, AudienceGroup, ContactStore, Database, MessageStore, NewThreadMessage,
    OutreachProgram, Recipient, RecipientStore, SendLog, SendStatus, SettingsStore,
};

const CANDIDATE_BATCH: u32 = 25;
const FAILURE_BACKOFF_HOURS: i64 = 12;
/// Minimum pacing between sends to cold prospects.
const COLD_AUDIENCE_FLOOR_SECONDS: u32 = 180;
const REPLY_SCAN_LIMIT: u32 = 20;

#[derive(Debug, Default)]
pub struct OutreachReport {
    pub sends: u32,
    pub stopped: u32,
    pub completed: u32,
    pub failed: u32,
}

enum StepOutcome {
    Sent,
    Stopped,
    Completed,
    Skipped,
    Failed,
}

pub struct OutreachEngine {
    recipients: RecipientStore,
    contacts: ContactStore,
    messages: MessageStore,
    send_log: SendLog,
    settings: SettingsStore,
}

impl OutreachEngine {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            recipients: RecipientStore::new(Arc::clone(&db)),
            contacts: ContactStore::new(Arc::clone(&db)),
            messages: MessageStore::new(Arc::clone(&db)),
            send_log: SendLog::new(Arc::clone(&db)),
            settings: SettingsStore::new(db),
        }
    }

    /// Run one outreach pass for an authenticated account.
    pub async fn run_for_account(
        &self,
        account: &Account,
        self_user_id: &str,
        program: &OutreachProgram,
        gateway: &dyn InboxGateway,
    ) -> Result<OutreachReport, Error> {
        let mut report = OutreachReport::default();
        if program.steps.is_empty() {
            debug!(account = %account.username, "Program has no steps, nothing to send");
            return Ok(report);
        }
        let now = Utc::now();
        if !within_allowed_hours(
            program.allowed_start_hour,
            program.allowed_end_hour,
            &program.timezone,
            now,
        ) {
            debug!(account = %account.username, "Outside allowed hours, skipping outreach");
            return Ok(report);
        }

        let sent_today = self.send_log.count_sent_since(&account.id, day_start(now))?;
        let mut remaining = program.max_sends_per_day.saturating_sub(sent_today);
        if remaining == 0 {
            info!(account = %account.username, "Daily send cap reached, skipping outreach");
            return Ok(report);
        }

        let floor = if program.group == AudienceGroup::New {
            COLD_AUDIENCE_FLOOR_SECONDS
        } else {
            0
        };
        let (min_delay, max_delay) =
            clamp_outreach_delays(program.min_delay_seconds, program.max_delay_seconds, floor);

        while remaining > 0 {
            let Some(recipient) = self.next_recipient(account, program)? else {
                break;
            };
            match self
                .advance_recipient(account, self_user_id, program, gateway, &recipient)
                .await
            {
                Ok(StepOutcome::Sent) => {
                    remaining -= 1;
                    report.sends += 1;
                    tokio::time::sleep(jittered_delay(min_delay, max_delay)).await;
                }
                Ok(StepOutcome::Stopped) => report.stopped += 1,
                Ok(StepOutcome::Completed) => report.completed += 1,
                Ok(StepOutcome::Skipped) => {}
                Ok(StepOutcome::Failed) => report.failed += 1,
                Err(Error::Gateway(e)) if e.is_circuit_breaker() => {
                    warn!(account = %account.username, error = %e, "Rate-limit signal, aborting outreach pass");
                    self.settings.set_program_error(&program.id, &e.to_string())?;
                    return Err(Error::Gateway(e));
                }
                Err(e) => {
                    self.settings.set_program_error(&program.id, &e.to_string())?;
                    return Err(e);
                }
            }
        }
        Ok(report)
    }

    /// The recipient to work next: earliest due, enrolling a fresh candidate
    /// batch when the due queue is empty.
    fn next_recipient(
        &self,
        account: &Account,
        program: &OutreachProgram,
    ) -> Result<Option<Recipient>, Error> {
        if let Some(recipient) = self.recipients.next_due(&account.id, Utc::now())? {
            return Ok(Some(recipient));
        }

        let candidates = self.contacts.pick_candidates(
            &account.id,
            &account.username,
            program.segment,
            program.group,
            CANDIDATE_BATCH,
        )?;
        if candidates.is_empty() {
            return Ok(None);
        }
        for candidate in &candidates {
            self.recipients.enroll(
                &account.id,
                &candidate.username,
                candidate.platform_user_id.as_deref(),
            )?;
        }
        info!(account = %account.username, enrolled = candidates.len(), "Enrolled fresh candidates");
        Ok(self.recipients.next_due(&account.id, Utc::now())?)
    }

    async fn advance_recipient(
        &self,
        account: &Account,
        self_user_id: &str,
        program: &OutreachProgram,
        gateway: &dyn InboxGateway,
        recipient: &Recipient,
    ) -> Result<StepOutcome, Error> {
        if program.stop_on_reply {
            if let (Some(thread_id), Some(last_outbound)) =
                (&recipient.thread_id, recipient.last_outbound_at)
            {
                if self
                    .has_reply(account, self_user_id, gateway, thread_id, last_outbound)
                    .await?
                {
                    info!(account = %account.username, recipient = %recipient.username, "Reply received, stopping drip");
                    self.recipients.mark_stopped(&recipient.id, None)?;
                    return Ok(StepOutcome::Stopped);
                }
            }
        }

        let step_index = recipient.current_step as usize;
        if step_index >= program.steps.len() {
            self.recipients.mark_completed(&recipient.id)?;
            return Ok(StepOutcome::Completed);
        }
        let step = &program.steps[step_index];
        let next_index = recipient.current_step + 1;
        let next_due = next_due_at(program, recipient, next_index);

        if step.template.trim().is_empty() {
            debug!(recipient = %recipient.username, step = step_index, "Blank step template, advancing without send");
            self.recipients.skip_step(&recipient.id, next_index, next_due)?;
            return Ok(if next_due.is_some() {
                StepOutcome::Skipped
            } else {
                StepOutcome::Completed
            });
        }

        let display_name = self
            .contacts
            .get(&recipient.username)?
            .and_then(|c| c.display_name);
        let text = render_template(&step.template, &recipient.username, display_name.as_deref());

        let target = match &recipient.thread_id {
            Some(thread_id) => SendTarget::Thread(thread_id.clone()),
            None => SendTarget::Username(recipient.username.clone()),
        };
        let outcome = match gateway.send_message(&target, &text).await {
            Ok(outcome) => outcome,
            Err(e) => {
                return self.handle_send_failure(account, recipient, step_index, &text, &e.to_string())
            }
        };
        if !outcome.success {
            let reason = outcome.error.unwrap_or_else(|| "send rejected".into());
            return self.handle_send_failure(account, recipient, step_index, &text, &reason);
        }

        let thread_id = outcome
            .thread_id
            .as_deref()
            .or(recipient.thread_id.as_deref());
        self.send_log.record(
            &account.id,
            &recipient.username,
            recipient.contact_user_id.as_deref(),
            thread_id,
            recipient.current_step,
            &text,
            SendStatus::Sent,
            None,
        )?;
        if let Some(thread_id) = thread_id {
            // Mirror the send into the thread log so stop-on-reply can work
            // against stored history.
            self.messages.insert_outbound(&NewThreadMessage {
                account_id: &account.id,
                thread_id,
                item_id: &outcome
                    .item_id
                    .unwrap_or_else(|| format!("local_out_{}", Utc::now().timestamp_micros())),
                direction: crate::store::Direction::Out,
                sender_id: self_user_id,
                sender_username: Some(&account.username),
                text: &text,
                sent_at: Some(Utc::now()),
            })?;
        }
        self.recipients
            .record_success(&recipient.id, thread_id, next_index, next_due)?;
        info!(account = %account.username, recipient = %recipient.username, step = step_index, "Outreach step sent");
        Ok(StepOutcome::Sent)
    }

    fn handle_send_failure(
        &self,
        account: &Account,
        recipient: &Recipient,
        step_index: usize,
        text: &str,
        reason: &str,
    ) -> Result<StepOutcome, Error> {
        warn!(account = %account.username, recipient = %recipient.username, reason, "Outreach send failed");
        self.send_log.record(
            &account.id,
            &recipient.username,
            recipient.contact_user_id.as_deref(),
            recipient.thread_id.as_deref(),
            step_index as u32,
            text,
            SendStatus::Failed,
            Some(reason),
        )?;
        self.recipients.record_failure(
            &recipient.id,
            reason,
            Utc::now() + Duration::hours(FAILURE_BACKOFF_HOURS),
        )?;
        if is_rate_limit_signal(reason) {
            return Err(GatewayError::Transport {
                op: "send_message",
                reason: reason.to_string(),
            }
            .into());
        }
        Ok(StepOutcome::Failed)
    }

    /// Whether the contact wrote back after our last outbound message, per
    /// stored history first and a live thread scan as a fallback.
    async fn has_reply(
        &self,
        account: &Account,
        self_user_id: &str,
        gateway: &dyn InboxGateway,
        thread_id: &str,
        last_outbound: DateTime<Utc>,
    ) -> Result<bool, Error> {
        if self
            .messages
            .has_inbound_after(&account.id, thread_id, last_outbound)?
        {
            return Ok(true);
        }
        let items = match gateway.fetch_messages(thread_id, REPLY_SCAN_LIMIT).await {
            Ok(items) => items,
            Err(e) if e.is_circuit_breaker() => return Err(e.into()),
            Err(e) => {
                warn!(thread = thread_id, error = %e, "Live reply scan failed, assuming no reply");
                return Ok(false);
            }
        };
        Ok(items.iter().any(|m| {
            m.sender_id != self_user_id
                && !m.text.trim().is_empty()
                // Inbound items without a parseable timestamp are assumed
                // to postdate our send.
                && m.sent_at.map_or(true, |t| t > last_outbound)
        }))
    }
}

/// Due time for `next_index`, relative to enrollment. `None` when the program
/// has no further step.
fn next_due_at(
    program: &OutreachProgram,
    recipient: &Recipient,
    next_index: u32,
) -> Option<DateTime<Utc>> {
    let step = program.steps.get(next_index as usize)?;
    Some(recipient.enrolled_at + Duration::hours(step.offset_hours as i64))
}

/// Fill `{username}` and `{name}` placeholders. `{name}` prefers the first
/// word of the display name and falls back to the username.
fn render_template(template: &str, username: &str, display_name: Option<&str>) -> String {
    let name = display_name
        .and_then(|n| n.split_whitespace().next())
        .filter(|n| !n.is_empty())
        .unwrap_or(username);
    template
        .replace("{username}", username)
        .replace("{name}", name)
}

fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(now)
}
