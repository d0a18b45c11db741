//! End-to-end cycle scenarios against an in-memory database and a scripted
//! bridge: a contact gets the first drip step, writes back, and the next
//! cycle answers them and freezes the drip.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use dripline::engine::Orchestrator;
use dripline::error::{GatewayError, LlmError};
use dripline::gateway::{
    GatewayFactory, InboxGateway, InboxMessage, SendOutcome, SendTarget, SessionInfo, ThreadStub,
};
use dripline::llm::{ChatTurn, ReplyGenerator};
use dripline::secrets::{AccountCredentials, CredentialVault};
use dripline::store::{
    AccountStore, ContactStore, Database, ProgramStep, RecipientStatus, RecipientStore,
    ReplyPolicy, SettingsStore,
};

struct FakeBridge {
    threads: Mutex<Vec<ThreadStub>>,
    messages: Mutex<HashMap<String, Vec<InboxMessage>>>,
    sent: Mutex<Vec<(String, String)>>,
}

impl FakeBridge {
    fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            messages: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    fn add_inbound(&self, thread_id: &str, item_id: &str, text: &str) {
        self.threads.lock().unwrap().retain(|t| t.thread_id != thread_id);
        self.threads.lock().unwrap().push(ThreadStub {
            thread_id: thread_id.into(),
            pending: false,
        });
        self.messages
            .lock()
            .unwrap()
            .entry(thread_id.into())
            .or_default()
            .push(InboxMessage {
                item_id: item_id.into(),
                sender_id: "777".into(),
                sender_username: Some("lead_girl".into()),
                text: text.into(),
                sent_at: Some(Utc::now()),
            });
    }

    fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl InboxGateway for FakeBridge {
    async fn authenticate(
        &self,
        _username: &str,
        _credentials: &AccountCredentials,
    ) -> Result<SessionInfo, GatewayError> {
        Ok(SessionInfo {
            user_id: "5001".into(),
            session: Some("sess-v2".into()),
        })
    }

    async fn list_threads(&self, _limit: u32) -> Result<Vec<ThreadStub>, GatewayError> {
        Ok(self.threads.lock().unwrap().clone())
    }

    async fn list_pending_threads(&self, _limit: u32) -> Result<Vec<ThreadStub>, GatewayError> {
        Ok(Vec::new())
    }

    async fn fetch_messages(
        &self,
        thread_id: &str,
        _limit: u32,
    ) -> Result<Vec<InboxMessage>, GatewayError> {
        Ok(self
            .messages
            .lock()
            .unwrap()
            .get(thread_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(
        &self,
        target: &SendTarget,
        text: &str,
    ) -> Result<SendOutcome, GatewayError> {
        let thread_id = match target {
            SendTarget::Thread(id) => id.clone(),
            SendTarget::Username(name) => format!("t_{name}"),
        };
        let mut sent = self.sent.lock().unwrap();
        sent.push((thread_id.clone(), text.to_string()));
        Ok(SendOutcome {
            success: true,
            thread_id: Some(thread_id),
            item_id: Some(format!("srv{}", sent.len())),
            error: None,
        })
    }

    async fn approve_pending_thread(&self, _thread_id: &str) -> Result<bool, GatewayError> {
        Ok(true)
    }
}

struct FakeFactory {
    bridge: Arc<FakeBridge>,
}

impl GatewayFactory for FakeFactory {
    fn gateway_for(&self, _account_username: &str) -> Arc<dyn InboxGateway> {
        Arc::clone(&self.bridge) as Arc<dyn InboxGateway>
    }
}

struct PlainVault {
    sessions: Mutex<HashMap<String, Option<String>>>,
}

impl CredentialVault for PlainVault {
    fn store(
        &self,
        account_id: &str,
        credentials: &AccountCredentials,
    ) -> Result<(), dripline::error::CredentialError> {
        self.sessions
            .lock()
            .unwrap()
            .insert(account_id.into(), credentials.session.clone());
        Ok(())
    }

    fn load(
        &self,
        account_id: &str,
    ) -> Result<AccountCredentials, dripline::error::CredentialError> {
        let session = self
            .sessions
            .lock()
            .unwrap()
            .get(account_id)
            .cloned()
            .ok_or_else(|| dripline::error::CredentialError::NotFound(account_id.into()))?;
        Ok(AccountCredentials {
            password: "pw".to_string().into(),
            session,
        })
    }

    fn update_session(
        &self,
        account_id: &str,
        session: &str,
    ) -> Result<(), dripline::error::CredentialError> {
        self.sessions
            .lock()
            .unwrap()
            .insert(account_id.into(), Some(session.to_string()));
        Ok(())
    }
}

struct CannedReplies;

#[async_trait]
impl ReplyGenerator for CannedReplies {
    async fn generate(
        &self,
        _instructions: &str,
        _language: &str,
        _turns: &[ChatTurn],
    ) -> Result<String, LlmError> {
        Ok("Thanks for reaching out!".into())
    }
}

#[tokio::test(start_paused = true)]
async fn drip_reply_and_stop_across_two_cycles() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let accounts = AccountStore::new(Arc::clone(&db));
    let account_id = accounts.insert("studio_acct", None).unwrap();

    let settings = SettingsStore::new(Arc::clone(&db));
    settings
        .upsert_reply_policy(&ReplyPolicy {
            id: String::new(),
            account_id: account_id.clone(),
            enabled: true,
            instructions: "Friendly and short.".into(),
            language: "en".into(),
            max_replies_per_day: 20,
            min_delay_seconds: 0,
            max_delay_seconds: 0,
            reply_to_existing: false,
            last_run_at: None,
            last_error: None,
        })
        .unwrap();
    let program = dripline::store::OutreachProgram {
        id: String::new(),
        account_id: account_id.clone(),
        enabled: true,
        segment: dripline::store::AudienceSegment::All,
        group: dripline::store::AudienceGroup::Any,
        steps: vec![
            ProgramStep {
                template: "Hi {name}, saw your profile!".into(),
                offset_hours: 0,
            },
            ProgramStep {
                template: "Still interested?".into(),
                offset_hours: 48,
            },
        ],
        max_sends_per_day: 20,
        min_delay_seconds: 0,
        max_delay_seconds: 0,
        allowed_start_hour: 0,
        allowed_end_hour: 0,
        timezone: "UTC".into(),
        stop_on_reply: true,
        last_run_at: None,
        last_error: None,
    };
    settings.upsert_program(&program).unwrap();

    ContactStore::new(Arc::clone(&db))
        .insert("lead_girl", Some("777"), Some("Mara K"), None, false, false)
        .unwrap();

    let bridge = Arc::new(FakeBridge::new());
    let vault = PlainVault {
        sessions: Mutex::new(HashMap::from([(account_id.clone(), None)])),
    };
    let orchestrator = Orchestrator::new(
        Arc::clone(&db),
        Arc::new(vault),
        Arc::new(FakeFactory {
            bridge: Arc::clone(&bridge),
        }),
        Arc::new(CannedReplies),
        false,
    );

    // Cycle 1: nothing in the inbox yet, first drip step goes out.
    let report = orchestrator.run_once().await.unwrap();
    assert_eq!(report.account_failures, 0);
    assert_eq!(report.replies_sent, 0);
    assert_eq!(report.outreach_sends, 1);
    assert_eq!(bridge.sent_texts(), vec!["Hi Mara, saw your profile!"]);

    let recipients = RecipientStore::new(Arc::clone(&db));
    let recipient = recipients.get(&account_id, "lead_girl").unwrap().unwrap();
    assert_eq!(recipient.current_step, 1);
    assert_eq!(recipient.thread_id.as_deref(), Some("t_lead_girl"));

    // The platform user id learned at login is stored on the account.
    let account = accounts.get(&account_id).unwrap().unwrap();
    assert_eq!(account.platform_user_id.as_deref(), Some("5001"));

    // The contact writes back, and step two comes due.
    bridge.add_inbound("t_lead_girl", "i100", "love it, tell me more!");
    db.conn()
        .execute(
            "UPDATE outreach_recipients SET next_send_at = ?1 WHERE username = 'lead_girl'",
            [Utc::now().to_rfc3339()],
        )
        .unwrap();

    // Cycle 2: the message gets an auto-reply and the drip freezes.
    let report = orchestrator.run_once().await.unwrap();
    assert_eq!(report.replies_sent, 1);
    assert_eq!(report.outreach_sends, 0);
    assert_eq!(report.drips_stopped, 1);

    let texts = bridge.sent_texts();
    assert_eq!(texts.len(), 2);
    assert_eq!(texts[1], "Thanks for reaching out!");

    let recipient = recipients.get(&account_id, "lead_girl").unwrap().unwrap();
    assert_eq!(recipient.status, RecipientStatus::Stopped);
    assert!(recipient.completed_at.is_some());

    // Nothing left to do: a third cycle is a no-op.
    let report = orchestrator.run_once().await.unwrap();
    assert_eq!(report.replies_sent, 0);
    assert_eq!(report.outreach_sends, 0);

    let policy = settings.enabled_reply_policies().unwrap().remove(0);
    assert!(policy.last_run_at.is_some());
    assert!(policy.last_error.is_none());
}
