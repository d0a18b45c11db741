//! Engines — the decision logic that turns stored state plus a live inbox
//! into replies and outreach sends.

pub mod cycle;
pub mod outreach;
pub mod reply;
pub mod throttle;

pub use cycle::{CycleReport, Orchestrator};
pub use outreach::OutreachEngine;
pub use reply::ReplyEngine;

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{Duration, Utc};

    use crate::error::GatewayError;
    use crate::gateway::{
        InboxGateway, InboxMessage, SendOutcome, SendTarget, SessionInfo, ThreadStub,
    };
    use crate::secrets::AccountCredentials;

    /// Scripted inbox for engine tests: fixed thread and message fixtures,
    /// recorded sends and approvals.
    pub(crate) struct ScriptedGateway {
        pub threads: Vec<ThreadStub>,
        pub messages: Mutex<HashMap<String, Vec<InboxMessage>>>,
        pub sent: Mutex<Vec<(String, String)>>,
        pub approved: Mutex<Vec<String>>,
        pub send_error: Option<String>,
        pub auth_error: Option<String>,
        pub user_id: String,
    }

    impl ScriptedGateway {
        pub(crate) fn new() -> Self {
            Self {
                threads: Vec::new(),
                messages: Mutex::new(HashMap::new()),
                sent: Mutex::new(Vec::new()),
                approved: Mutex::new(Vec::new()),
                send_error: None,
                auth_error: None,
                user_id: "42".into(),
            }
        }

        pub(crate) fn with_thread(
            mut self,
            thread_id: &str,
            pending: bool,
            messages: Vec<InboxMessage>,
        ) -> Self {
            self.threads.push(ThreadStub {
                thread_id: thread_id.into(),
                pending,
            });
            self.messages
                .lock()
                .unwrap()
                .insert(thread_id.into(), messages);
            self
        }

        pub(crate) fn sent_texts(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
        }
    }

    /// An inbound message `minutes_ago` minutes old; `None` leaves the
    /// timestamp absent.
    pub(crate) fn inbound_msg(item_id: &str, text: &str, minutes_ago: Option<i64>) -> InboxMessage {
        InboxMessage {
            item_id: item_id.into(),
            sender_id: "999".into(),
            sender_username: Some("visitor".into()),
            text: text.into(),
            sent_at: minutes_ago.map(|m| Utc::now() - Duration::minutes(m)),
        }
    }

    pub(crate) fn outbound_msg(item_id: &str, text: &str, minutes_ago: i64) -> InboxMessage {
        InboxMessage {
            item_id: item_id.into(),
            sender_id: "42".into(),
            sender_username: Some("tester".into()),
            text: text.into(),
            sent_at: Some(Utc::now() - Duration::minutes(minutes_ago)),
        }
    }

    #[async_trait]
    impl InboxGateway for ScriptedGateway {
        async fn authenticate(
            &self,
            _username: &str,
            _credentials: &AccountCredentials,
        ) -> Result<SessionInfo, GatewayError> {
            if let Some(reason) = &self.auth_error {
                return Err(GatewayError::Auth {
                    reason: reason.clone(),
                });
            }
            Ok(SessionInfo {
                user_id: self.user_id.clone(),
                session: Some("scripted-session".into()),
            })
        }

        async fn list_threads(&self, _limit: u32) -> Result<Vec<ThreadStub>, GatewayError> {
            Ok(self.threads.iter().filter(|t| !t.pending).cloned().collect())
        }

        async fn list_pending_threads(&self, _limit: u32) -> Result<Vec<ThreadStub>, GatewayError> {
            Ok(self.threads.iter().filter(|t| t.pending).cloned().collect())
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
            if let Some(reason) = &self.send_error {
                return Err(GatewayError::Transport {
                    op: "send_message",
                    reason: reason.clone(),
                });
            }
            let (label, thread_id) = match target {
                SendTarget::Thread(id) => (id.clone(), id.clone()),
                SendTarget::Username(name) => (name.clone(), format!("t_{name}")),
            };
            let mut sent = self.sent.lock().unwrap();
            sent.push((label, text.to_string()));
            Ok(SendOutcome {
                success: true,
                thread_id: Some(thread_id),
                item_id: Some(format!("srv{}", sent.len())),
                error: None,
            })
        }

        async fn approve_pending_thread(&self, thread_id: &str) -> Result<bool, GatewayError> {
            self.approved.lock().unwrap().push(thread_id.to_string());
            Ok(true)
        }
    }
}
