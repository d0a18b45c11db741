//! Fallback chain over inbox transports.
//!
//! Platform bridges degrade unevenly: an endpoint works on one client
//! version and 404s on another. [`FallbackInbox`] tries each transport in
//! order and moves on when one declines or fails, except for auth failures
//! and anti-automation signals, which are never retried on another transport.

use std::sync::Arc;

use async_trait::async_trait;

use super::{InboxGateway, InboxMessage, SendOutcome, SendTarget, SessionInfo, ThreadStub};
use crate::error::GatewayError;
use crate::secrets::AccountCredentials;

/// One backend in a fallback chain. Every operation defaults to
/// [`GatewayError::Unsupported`] so a transport only implements what it has.
#[async_trait]
pub trait InboxTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn authenticate(
        &self,
        _username: &str,
        _credentials: &AccountCredentials,
    ) -> Result<SessionInfo, GatewayError> {
        Err(self.unsupported("authenticate"))
    }

    async fn list_threads(&self, _limit: u32) -> Result<Vec<ThreadStub>, GatewayError> {
        Err(self.unsupported("list_threads"))
    }

    async fn list_pending_threads(&self, _limit: u32) -> Result<Vec<ThreadStub>, GatewayError> {
        Err(self.unsupported("list_pending_threads"))
    }

    async fn fetch_messages(
        &self,
        _thread_id: &str,
        _limit: u32,
    ) -> Result<Vec<InboxMessage>, GatewayError> {
        Err(self.unsupported("fetch_messages"))
    }

    async fn send_message(
        &self,
        _target: &SendTarget,
        _text: &str,
    ) -> Result<SendOutcome, GatewayError> {
        Err(self.unsupported("send_message"))
    }

    async fn approve_pending_thread(&self, _thread_id: &str) -> Result<bool, GatewayError> {
        Err(self.unsupported("approve_pending_thread"))
    }

    fn unsupported(&self, op: &'static str) -> GatewayError {
        GatewayError::Unsupported {
            transport: self.name().to_string(),
            op,
        }
    }
}

/// An [`InboxGateway`] that delegates each operation to the first transport
/// that can perform it.
pub struct FallbackInbox {
    transports: Vec<Arc<dyn InboxTransport>>,
}

impl FallbackInbox {
    pub fn new(transports: Vec<Arc<dyn InboxTransport>>) -> Self {
        Self { transports }
    }
}

/// Whether a failed operation may be retried on the next transport.
fn may_fall_through(err: &GatewayError) -> bool {
    match err {
        GatewayError::Unsupported { .. } => true,
        GatewayError::Auth { .. } => false,
        GatewayError::Transport { .. } => !err.is_circuit_breaker(),
    }
}

macro_rules! delegate {
    ($self:ident, $method:ident ( $($arg:expr),* )) => {{
        let mut last_err = GatewayError::Transport {
            op: stringify!($method),
            reason: "no transports configured".into(),
        };
        for transport in &$self.transports {
            match transport.$method($($arg),*).await {
                Ok(value) => return Ok(value),
                Err(err) if may_fall_through(&err) => {
                    tracing::debug!(
                        transport = transport.name(),
                        error = %err,
                        "Transport declined operation"
                    );
                    last_err = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }};
}

#[async_trait]
impl InboxGateway for FallbackInbox {
    async fn authenticate(
        &self,
        username: &str,
        credentials: &AccountCredentials,
    ) -> Result<SessionInfo, GatewayError> {
        delegate!(self, authenticate(username, credentials))
    }

    async fn list_threads(&self, limit: u32) -> Result<Vec<ThreadStub>, GatewayError> {
        delegate!(self, list_threads(limit))
    }

    async fn list_pending_threads(&self, limit: u32) -> Result<Vec<ThreadStub>, GatewayError> {
        delegate!(self, list_pending_threads(limit))
    }

    async fn fetch_messages(
        &self,
        thread_id: &str,
        limit: u32,
    ) -> Result<Vec<InboxMessage>, GatewayError> {
        delegate!(self, fetch_messages(thread_id, limit))
    }

    async fn send_message(
        &self,
        target: &SendTarget,
        text: &str,
    ) -> Result<SendOutcome, GatewayError> {
        delegate!(self, send_message(target, text))
    }

    async fn approve_pending_thread(&self, thread_id: &str) -> Result<bool, GatewayError> {
        delegate!(self, approve_pending_thread(thread_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Declines;

    #[async_trait]
    impl InboxTransport for Declines {
        fn name(&self) -> &str {
            "declines"
        }
    }

    struct Lists {
        calls: AtomicU32,
    }

    #[async_trait]
    impl InboxTransport for Lists {
        fn name(&self) -> &str {
            "lists"
        }

        async fn list_threads(&self, _limit: u32) -> Result<Vec<ThreadStub>, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![ThreadStub {
                thread_id: "t1".into(),
                pending: false,
            }])
        }
    }

    struct RateLimited;

    #[async_trait]
    impl InboxTransport for RateLimited {
        fn name(&self) -> &str {
            "rate_limited"
        }

        async fn list_threads(&self, _limit: u32) -> Result<Vec<ThreadStub>, GatewayError> {
            Err(GatewayError::Transport {
                op: "list_threads",
                reason: "please wait a few minutes".into(),
            })
        }
    }

    #[tokio::test]
    async fn falls_through_unsupported_to_working_transport() {
        let lists = Arc::new(Lists {
            calls: AtomicU32::new(0),
        });
        let transports: Vec<Arc<dyn InboxTransport>> = vec![
            Arc::new(Declines),
            Arc::clone(&lists) as Arc<dyn InboxTransport>,
        ];
        let inbox = FallbackInbox::new(transports);
        let threads = inbox.list_threads(20).await.unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(lists.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn circuit_breaker_errors_do_not_fall_through() {
        let lists = Arc::new(Lists {
            calls: AtomicU32::new(0),
        });
        let transports: Vec<Arc<dyn InboxTransport>> = vec![
            Arc::new(RateLimited),
            Arc::clone(&lists) as Arc<dyn InboxTransport>,
        ];
        let inbox = FallbackInbox::new(transports);
        let err = inbox.list_threads(20).await.unwrap_err();
        assert!(err.is_circuit_breaker());
        assert_eq!(lists.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhausted_chain_returns_last_error() {
        let inbox = FallbackInbox::new(vec![Arc::new(Declines)]);
        let err = inbox.list_threads(20).await.unwrap_err();
        assert!(matches!(err, GatewayError::Unsupported { .. }));
    }
}
