//! Reply engine — decides which inbound messages deserve an auto-reply and
//! sends it.
//!
//! The safety rule for threads seen for the first time: never reply into
//! history. A first-sighted thread only gets an immediate reply when its
//! newest message is inbound and recent (or the thread sits in the pending
//! folder), otherwise it is marked seen and only later messages qualify.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, info, warn};

use super::throttle::{clamp_reply_delays, jittered_delay};
use crate::error::{is_rate_limit_signal, Error, GatewayError};
use crate::gateway::{InboxGateway, SendTarget, ThreadStub};
use crate::llm::{ChatTurn, ReplyGenerator, Role};
use crate::store::cursors::new_messages_since;
use crate::store::{
    Account, CursorStore, Database, Direction, MessageStore, NewThreadMessage, ReplyPolicy,
    SettingsStore,
};

const INBOX_LIMIT: u32 = 20;
const PENDING_LIMIT: u32 = 10;
const THREAD_FETCH_LIMIT: u32 = 20;
const HISTORY_WINDOW: usize = 12;
/// How recent the newest inbound message must be for a first-sighted thread
/// to get an immediate reply.
const FIRST_SEEN_REPLY_WINDOW_MINUTES: i64 = 10;

#[derive(Debug, Default)]
pub struct ReplyReport {
    pub threads_seen: u32,
    pub replies_sent: u32,
}

pub struct ReplyEngine {
    messages: MessageStore,
    cursors: CursorStore,
    settings: SettingsStore,
    generator: Arc<dyn ReplyGenerator>,
    auto_approve_pending: bool,
}

impl ReplyEngine {
    pub fn new(
        db: Arc<Database>,
        generator: Arc<dyn ReplyGenerator>,
        auto_approve_pending: bool,
    ) -> Self {
        Self {
            messages: MessageStore::new(Arc::clone(&db)),
            cursors: CursorStore::new(Arc::clone(&db)),
            settings: SettingsStore::new(db),
            generator,
            auto_approve_pending,
        }
    }

    /// Run one reply pass over an authenticated account's inbox.
    ///
    /// Per-thread failures are recorded on the policy and do not stop the
    /// pass; rate-limit signals abort it with an error so the caller can
    /// stand the account down.
    pub async fn run_for_account(
        &self,
        account: &Account,
        self_user_id: &str,
        policy: &ReplyPolicy,
        gateway: &dyn InboxGateway,
    ) -> Result<ReplyReport, Error> {
        let mut report = ReplyReport::default();
        let now = Utc::now();
        let sent_today = self
            .messages
            .count_replies_since(&account.id, day_start(now))?;
        let mut budget = policy.max_replies_per_day.saturating_sub(sent_today);
        if budget == 0 {
            info!(account = %account.username, "Daily reply cap reached, skipping inbox");
            return Ok(report);
        }

        let regular = gateway.list_threads(INBOX_LIMIT).await?;
        let pending = gateway.list_pending_threads(PENDING_LIMIT).await?;
        let threads = merge_threads(regular, pending);
        let (min_delay, max_delay) =
            clamp_reply_delays(policy.min_delay_seconds, policy.max_delay_seconds);

        for thread in threads {
            if budget == 0 {
                break;
            }
            report.threads_seen += 1;
            match self
                .handle_thread(account, self_user_id, policy, gateway, &thread)
                .await
            {
                Ok(true) => {
                    budget -= 1;
                    report.replies_sent += 1;
                    tokio::time::sleep(jittered_delay(min_delay, max_delay)).await;
                }
                Ok(false) => {}
                Err(Error::Gateway(e)) if e.is_circuit_breaker() => {
                    warn!(account = %account.username, error = %e, "Rate-limit signal, aborting inbox pass");
                    self.settings.set_policy_error(&policy.id, &e.to_string())?;
                    return Err(Error::Gateway(e));
                }
                Err(e) => {
                    warn!(account = %account.username, thread = %thread.thread_id, error = %e, "Thread failed");
                    self.settings.set_policy_error(&policy.id, &e.to_string())?;
                }
            }
        }
        Ok(report)
    }

    async fn handle_thread(
        &self,
        account: &Account,
        self_user_id: &str,
        policy: &ReplyPolicy,
        gateway: &dyn InboxGateway,
        thread: &ThreadStub,
    ) -> Result<bool, Error> {
        let thread_id = thread.thread_id.as_str();
        let mut window = gateway.fetch_messages(thread_id, THREAD_FETCH_LIMIT).await?;
        if window.is_empty() {
            return Ok(false);
        }
        window.sort_by_key(|m| m.sent_at);

        // Persist only the newest chunk; the cursor delta below runs over the
        // whole fetched window, so a cursor sitting deeper in it is not
        // mistaken for a lost window.
        let persist_from = window.len().saturating_sub(HISTORY_WINDOW);
        for msg in &window[persist_from..] {
            let direction = if msg.sender_id == self_user_id {
                Direction::Out
            } else {
                Direction::In
            };
            self.messages.insert_if_absent(&NewThreadMessage {
                account_id: &account.id,
                thread_id,
                item_id: &msg.item_id,
                direction,
                sender_id: &msg.sender_id,
                sender_username: msg.sender_username.as_deref(),
                text: &msg.text,
                sent_at: msg.sent_at,
            })?;
        }

        let Some(newest) = window.last() else {
            return Ok(false);
        };

        let cursor_id = match self.cursors.get(&account.id, thread_id)? {
            Some(cursor) => cursor.last_seen_item_id,
            None => {
                if !self.first_sighting_may_reply(policy, thread, newest, self_user_id) {
                    debug!(thread = thread_id, "First sighting outside reply window, marking seen");
                    self.cursors
                        .advance(&account.id, thread_id, &newest.item_id, newest.sent_at)?;
                    return Ok(false);
                }
                // Persist the sighting before replying so a crash here still
                // leaves the thread eligible on the next pass.
                self.cursors
                    .advance(&account.id, thread_id, "", newest.sent_at)?;
                String::new()
            }
        };

        let fresh = match new_messages_since(&window, &cursor_id, |m| m.item_id.as_str()) {
            Some(fresh) => fresh,
            None => {
                warn!(thread = thread_id, "Fetched window rotated past cursor, resyncing");
                self.cursors
                    .advance(&account.id, thread_id, &newest.item_id, newest.sent_at)?;
                return Ok(false);
            }
        };

        let mut trigger_item_id = fresh
            .iter()
            .rev()
            .find(|m| m.sender_id != self_user_id && !m.text.trim().is_empty())
            .map(|m| m.item_id.clone());
        if trigger_item_id.is_none() && thread.pending {
            // A pending thread whose cursor was advanced defensively can
            // still hold an unanswered message from a previous pass.
            trigger_item_id = self
                .messages
                .latest_unprocessed_inbound(&account.id, thread_id)?
                .filter(|m| !m.text.trim().is_empty())
                .map(|m| m.item_id);
        }
        let Some(trigger_item_id) = trigger_item_id else {
            self.cursors
                .advance(&account.id, thread_id, &newest.item_id, newest.sent_at)?;
            return Ok(false);
        };

        let history = self
            .messages
            .recent_history(&account.id, thread_id, HISTORY_WINDOW)?;
        let turns: Vec<ChatTurn> = history
            .iter()
            .filter(|m| !m.text.trim().is_empty())
            .map(|m| ChatTurn {
                role: match m.direction {
                    Direction::Out => Role::Assistant,
                    Direction::In => Role::User,
                },
                content: m.text.clone(),
            })
            .collect();

        let reply = match self
            .generator
            .generate(&policy.instructions, &policy.language, &turns)
            .await
        {
            Ok(reply) => reply.trim().to_string(),
            Err(e) => {
                warn!(thread = thread_id, error = %e, "Reply generation failed, skipping thread");
                self.cursors
                    .advance(&account.id, thread_id, &newest.item_id, newest.sent_at)?;
                return Ok(false);
            }
        };
        if reply.is_empty() {
            debug!(thread = thread_id, "Generator declined to reply");
            self.cursors
                .advance(&account.id, thread_id, &newest.item_id, newest.sent_at)?;
            return Ok(false);
        }

        if thread.pending && self.auto_approve_pending {
            match gateway.approve_pending_thread(thread_id).await {
                Ok(true) => debug!(thread = thread_id, "Pending thread approved"),
                Ok(false) => debug!(thread = thread_id, "Platform declined pending approval"),
                Err(e) => warn!(thread = thread_id, error = %e, "Pending approval failed"),
            }
        }

        let target = SendTarget::Thread(thread.thread_id.clone());
        let outcome = match gateway.send_message(&target, &reply).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_circuit_breaker() => return Err(e.into()),
            Err(e) => {
                self.settings.set_policy_error(&policy.id, &e.to_string())?;
                self.cursors
                    .advance(&account.id, thread_id, &newest.item_id, newest.sent_at)?;
                return Ok(false);
            }
        };
        if !outcome.success {
            let reason = outcome.error.unwrap_or_else(|| "send rejected".into());
            if is_rate_limit_signal(&reason) {
                return Err(GatewayError::Transport {
                    op: "send_message",
                    reason,
                }
                .into());
            }
            self.settings.set_policy_error(&policy.id, &reason)?;
            self.cursors
                .advance(&account.id, thread_id, &newest.item_id, newest.sent_at)?;
            return Ok(false);
        }

        let now = Utc::now();
        let outbound_id = outcome.item_id.unwrap_or_else(synthetic_item_id);
        self.messages.insert_outbound(&NewThreadMessage {
            account_id: &account.id,
            thread_id,
            item_id: &outbound_id,
            direction: Direction::Out,
            sender_id: self_user_id,
            sender_username: Some(&account.username),
            text: &reply,
            sent_at: Some(now),
        })?;
        self.messages
            .mark_processed(&account.id, thread_id, &trigger_item_id, &reply, now)?;
        self.cursors.advance(
            &account.id,
            thread_id,
            &newest.item_id,
            newest.sent_at.or(Some(now)),
        )?;
        info!(account = %account.username, thread = thread_id, "Reply sent");
        Ok(true)
    }

    fn first_sighting_may_reply(
        &self,
        policy: &ReplyPolicy,
        thread: &ThreadStub,
        newest: &crate::gateway::InboxMessage,
        self_user_id: &str,
    ) -> bool {
        if policy.reply_to_existing {
            return true;
        }
        if newest.sender_id == self_user_id || newest.text.trim().is_empty() {
            return false;
        }
        let window = Duration::minutes(FIRST_SEEN_REPLY_WINDOW_MINUTES);
        match newest.sent_at {
            Some(sent_at) => Utc::now().signed_duration_since(sent_at) <= window,
            // Pending requests often arrive without timestamps; the folder
            // itself implies the message is unanswered.
            None => thread.pending,
        }
    }
}

fn merge_threads(regular: Vec<ThreadStub>, pending: Vec<ThreadStub>) -> Vec<ThreadStub> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for thread in regular.into_iter().chain(pending) {
        if seen.insert(thread.thread_id.clone()) {
            merged.push(thread);
        }
    }
    merged
}

fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(now)
}

/// Id for an outbound row when the platform did not echo one back.
fn synthetic_item_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("local_{}_{}", suffix, Utc::now().timestamp())
}
