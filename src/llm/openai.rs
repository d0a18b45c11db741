//! OpenAI chat-completions backed [`ReplyGenerator`].

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{ChatTurn, ReplyGenerator};
use crate::error::LlmError;

const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";

pub struct OpenAiGenerator {
    client: reqwest::Client,
    api_url: String,
    api_key: SecretString,
    model: String,
}

impl OpenAiGenerator {
    pub fn new(client: reqwest::Client, api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            client,
            api_url: DEFAULT_API_URL.to_string(),
            api_key,
            model: model.into(),
        }
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    fn system_prompt(instructions: &str, language: &str) -> String {
        format!(
            "You write short, natural direct-message replies on behalf of the \
             account owner. Reply in language code '{language}'. Keep it to one \
             or two sentences, no hashtags, no links unless asked. If no reply \
             is appropriate, respond with an empty message.\n\n\
             Owner instructions:\n{instructions}"
        )
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[async_trait]
impl ReplyGenerator for OpenAiGenerator {
    async fn generate(
        &self,
        instructions: &str,
        language: &str,
        turns: &[ChatTurn],
    ) -> Result<String, LlmError> {
        let mut messages = vec![json!({
            "role": "system",
            "content": Self::system_prompt(instructions, language),
        })];
        for turn in turns {
            messages.push(json!({
                "role": turn.role.as_str(),
                "content": turn.content,
            }));
        }

        let body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0.7,
            "max_tokens": 200,
        });

        debug!(model = %self.model, turns = turns.len(), "Requesting completion");
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                reason: e.to_string(),
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| LlmError::RequestFailed {
            reason: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(LlmError::RequestFailed {
                reason: format!("{status}: {text}"),
            });
        }

        let completion: CompletionResponse = serde_json::from_str(&text)?;
        let reply = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::InvalidResponse {
                reason: "completion carried no choices".into(),
            })?;
        Ok(reply.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_carries_language_and_instructions() {
        let prompt = OpenAiGenerator::system_prompt("Mention the studio.", "de");
        assert!(prompt.contains("'de'"));
        assert!(prompt.contains("Mention the studio."));
    }

    #[test]
    fn completion_response_parses() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":" Hi! "}}]}"#;
        let parsed: CompletionResponse = serde_json::from_str(body).unwrap();
        assert_eq!(
            parsed.choices[0].message.content.as_deref(),
            Some(" Hi! ")
        );
    }
}
