//! Worker configuration, read from the environment.

use secrecy::SecretString;

use crate::error::ConfigError;

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_DB_PATH: &str = "./data/dripline.db";
const DEFAULT_LOOP_SECONDS: u64 = 300;
const MIN_LOOP_SECONDS: u64 = 10;

#[derive(Debug)]
pub struct Config {
    /// SQLite database path.
    pub db_path: String,
    /// Bridge hosts to try in order, primary first.
    pub bridge_urls: Vec<String>,
    /// OpenAI API key for reply generation.
    pub openai_api_key: SecretString,
    /// Completion model name.
    pub model: String,
    /// Seconds between cycles.
    pub loop_seconds: u64,
    /// Approve pending message requests before replying to them.
    pub auto_approve_pending: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENAI_API_KEY".into()))?;

        let bridge_urls: Vec<String> = std::env::var("DRIPLINE_BRIDGE_URLS")
            .map_err(|_| ConfigError::MissingEnvVar("DRIPLINE_BRIDGE_URLS".into()))?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if bridge_urls.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "DRIPLINE_BRIDGE_URLS".into(),
                message: "expected a comma-separated list of URLs".into(),
            });
        }

        let loop_seconds = match std::env::var("DRIPLINE_LOOP_SECONDS") {
            Ok(raw) => raw
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue {
                    key: "DRIPLINE_LOOP_SECONDS".into(),
                    message: format!("not a number: {raw}"),
                })?
                .max(MIN_LOOP_SECONDS),
            Err(_) => DEFAULT_LOOP_SECONDS,
        };

        Ok(Self {
            db_path: std::env::var("DRIPLINE_DB_PATH")
                .unwrap_or_else(|_| DEFAULT_DB_PATH.to_string()),
            bridge_urls,
            openai_api_key: SecretString::from(openai_api_key),
            model: std::env::var("DRIPLINE_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            loop_seconds,
            auto_approve_pending: flag("DRIPLINE_AUTO_APPROVE_PENDING"),
        })
    }
}

fn flag(key: &str) -> bool {
    matches!(
        std::env::var(key).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}
