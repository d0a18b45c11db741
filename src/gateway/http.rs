//! HTTP bridge transport.
//!
//! Talks to a messaging bridge sidecar that exposes the platform inbox as a
//! small JSON API. Response bodies are passed through [`normalize`] because
//! bridge versions differ in field naming and nesting.

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::normalize;
use super::{
    FallbackInbox, GatewayFactory, InboxGateway, InboxMessage, InboxTransport, SendOutcome,
    SendTarget, SessionInfo, ThreadStub,
};
use crate::error::GatewayError;
use crate::secrets::AccountCredentials;

/// One bridge host. Holds the session token handed out at login.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    session_token: Mutex<Option<String>>,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session_token: Mutex::new(None),
        }
    }

    async fn request(
        &self,
        op: &'static str,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.request(method, &url);
        if let Some(token) = self.session_token.lock().await.as_deref() {
            request = request.header("x-session", token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| GatewayError::Transport {
            op,
            reason: e.to_string(),
        })?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::Transport {
                op,
                reason: e.to_string(),
            })?;

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(GatewayError::Auth { reason: text })
            }
            StatusCode::NOT_FOUND => Err(GatewayError::Unsupported {
                transport: self.name().to_string(),
                op,
            }),
            s if !s.is_success() => Err(GatewayError::Transport {
                op,
                reason: format!("{s}: {text}"),
            }),
            _ => serde_json::from_str(&text).map_err(|e| GatewayError::Transport {
                op,
                reason: format!("invalid JSON body: {e}"),
            }),
        }
    }
}

#[async_trait]
impl InboxTransport for HttpTransport {
    fn name(&self) -> &str {
        &self.base_url
    }

    async fn authenticate(
        &self,
        username: &str,
        credentials: &AccountCredentials,
    ) -> Result<SessionInfo, GatewayError> {
        let body = json!({
            "username": username,
            "password": credentials.password.expose_secret(),
            "session": credentials.session,
        });
        let response = self
            .request("authenticate", reqwest::Method::POST, "/login", Some(body))
            .await?;

        let user_id = normalize::pick_str(&response, &["user_id", "pk", "id"]).ok_or_else(|| {
            GatewayError::Auth {
                reason: "login response carried no user id".into(),
            }
        })?;
        let session = normalize::pick_str(&response, &["session", "session_token"]);
        *self.session_token.lock().await = session.clone();
        let resumed = credentials.session.is_some();
        info!(username, resumed, "Bridge login succeeded");
        Ok(SessionInfo { user_id, session })
    }

    async fn list_threads(&self, limit: u32) -> Result<Vec<ThreadStub>, GatewayError> {
        let body = self
            .request(
                "list_threads",
                reqwest::Method::GET,
                &format!("/inbox?limit={limit}"),
                None,
            )
            .await?;
        Ok(normalize::threads_from_inbox_value(&body, false))
    }

    async fn list_pending_threads(&self, limit: u32) -> Result<Vec<ThreadStub>, GatewayError> {
        let body = self
            .request(
                "list_pending_threads",
                reqwest::Method::GET,
                &format!("/inbox/pending?limit={limit}"),
                None,
            )
            .await?;
        Ok(normalize::threads_from_inbox_value(&body, true))
    }

    async fn fetch_messages(
        &self,
        thread_id: &str,
        limit: u32,
    ) -> Result<Vec<InboxMessage>, GatewayError> {
        let body = self
            .request(
                "fetch_messages",
                reqwest::Method::GET,
                &format!("/threads/{thread_id}/messages?limit={limit}"),
                None,
            )
            .await?;
        Ok(normalize::items_from_thread_value(&body))
    }

    async fn send_message(
        &self,
        target: &SendTarget,
        text: &str,
    ) -> Result<SendOutcome, GatewayError> {
        let (path, body) = match target {
            SendTarget::Thread(thread_id) => (
                format!("/threads/{thread_id}/messages"),
                json!({"text": text}),
            ),
            SendTarget::Username(username) => (
                "/messages".to_string(),
                json!({"username": username, "text": text}),
            ),
        };
        let response = self
            .request("send_message", reqwest::Method::POST, &path, Some(body))
            .await?;
        Ok(normalize::send_outcome_from_value(&response))
    }

    async fn approve_pending_thread(&self, thread_id: &str) -> Result<bool, GatewayError> {
        let response = self
            .request(
                "approve_pending_thread",
                reqwest::Method::POST,
                &format!("/threads/{thread_id}/approve"),
                None,
            )
            .await?;
        Ok(response
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }
}

/// Builds a per-account [`FallbackInbox`] over the configured bridge hosts,
/// primary first.
pub struct HttpGatewayFactory {
    client: reqwest::Client,
    base_urls: Vec<String>,
}

impl HttpGatewayFactory {
    pub fn new(client: reqwest::Client, base_urls: Vec<String>) -> Self {
        Self { client, base_urls }
    }
}

impl GatewayFactory for HttpGatewayFactory {
    fn gateway_for(&self, _account_username: &str) -> Arc<dyn InboxGateway> {
        let transports: Vec<Arc<dyn InboxTransport>> = self
            .base_urls
            .iter()
            .map(|url| {
                Arc::new(HttpTransport::new(self.client.clone(), url.clone()))
                    as Arc<dyn InboxTransport>
            })
            .collect();
        Arc::new(FallbackInbox::new(transports))
    }
}
