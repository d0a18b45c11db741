//! Error types for dripline.

/// Top-level error type for the worker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(inner, _)
                if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Constraint(e.to_string())
            }
            _ => StoreError::Query(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Credential vault errors. Fatal for the current account's cycle.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("decrypt_failed: {0}")]
    DecryptFailed(String),

    #[error("No credentials stored for account {0}")]
    NotFound(String),

    #[error("Vault key error: {0}")]
    Key(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Remote inbox gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("login_failed: {reason}")]
    Auth { reason: String },

    #[error("Operation {op} not supported by transport {transport}")]
    Unsupported { transport: String, op: &'static str },

    #[error("Operation {op} failed: {reason}")]
    Transport { op: &'static str, reason: String },
}

impl GatewayError {
    /// True when the error text looks like a platform rate-limit or
    /// anti-automation signal. These abort the rest of the account's cycle.
    pub fn is_circuit_breaker(&self) -> bool {
        let text = self.to_string();
        is_rate_limit_signal(&text)
    }
}

/// Substring match on platform error text for rate-limit / feedback signals.
pub fn is_rate_limit_signal(text: &str) -> bool {
    let lower = text.to_lowercase();
    ["rate_limit", "feedback_required", "challenge", "please wait"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Reply generator errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Completion request failed: {reason}")]
    RequestFailed { reason: String },

    #[error("Invalid completion response: {reason}")]
    InvalidResponse { reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for the worker.
pub type Result<T> = std::result::Result<T, Error>;
