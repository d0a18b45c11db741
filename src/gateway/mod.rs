//! Inbox gateway — the seam between the engines and the messaging platform.
//!
//! Engines only ever see the [`InboxGateway`] trait, so tests and the HTTP
//! bridge are interchangeable.

pub mod fallback;
pub mod http;
pub mod normalize;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::GatewayError;
use crate::secrets::AccountCredentials;

pub use fallback::{FallbackInbox, InboxTransport};
pub use http::{HttpGatewayFactory, HttpTransport};

/// A thread as listed by the inbox, before its messages are fetched.
#[derive(Debug, Clone)]
pub struct ThreadStub {
    pub thread_id: String,
    /// True when the thread sits in the pending (message-request) folder.
    pub pending: bool,
}

/// One message inside a thread, normalized from whatever shape the platform
/// returned.
#[derive(Debug, Clone)]
pub struct InboxMessage {
    pub item_id: String,
    pub sender_id: String,
    pub sender_username: Option<String>,
    pub text: String,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Result of a send attempt, as reported by the platform.
#[derive(Debug, Clone, Default)]
pub struct SendOutcome {
    pub success: bool,
    pub thread_id: Option<String>,
    pub item_id: Option<String>,
    pub error: Option<String>,
}

/// Session established by [`InboxGateway::authenticate`].
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// The platform-native id of the logged-in account.
    pub user_id: String,
    /// Refreshed serialized session state to persist for the next cycle.
    pub session: Option<String>,
}

/// Where to deliver an outbound message.
#[derive(Debug, Clone)]
pub enum SendTarget {
    Thread(String),
    Username(String),
}

/// A logged-in connection to one account's inbox.
#[async_trait]
pub trait InboxGateway: Send + Sync {
    /// Log in, resuming a stored session when possible.
    async fn authenticate(
        &self,
        username: &str,
        credentials: &AccountCredentials,
    ) -> Result<SessionInfo, GatewayError>;

    async fn list_threads(&self, limit: u32) -> Result<Vec<ThreadStub>, GatewayError>;

    async fn list_pending_threads(&self, limit: u32) -> Result<Vec<ThreadStub>, GatewayError>;

    async fn fetch_messages(
        &self,
        thread_id: &str,
        limit: u32,
    ) -> Result<Vec<InboxMessage>, GatewayError>;

    async fn send_message(
        &self,
        target: &SendTarget,
        text: &str,
    ) -> Result<SendOutcome, GatewayError>;

    /// Move a pending thread into the main inbox. Returns false when the
    /// platform refused without raising an error.
    async fn approve_pending_thread(&self, thread_id: &str) -> Result<bool, GatewayError>;
}

/// Creates a fresh per-account gateway. Each account gets its own instance so
/// session state never leaks across accounts.
pub trait GatewayFactory: Send + Sync {
    fn gateway_for(&self, account_username: &str) -> std::sync::Arc<dyn InboxGateway>;
}
