//! Reply generation — the conversational model behind auto-replies.

pub mod openai;

use async_trait::async_trait;

use crate::error::LlmError;

pub use openai::OpenAiGenerator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One turn of conversation context, oldest first.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

/// Produces a reply for a conversation. An empty string means "nothing worth
/// saying"; callers skip the thread without consuming reply quota.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(
        &self,
        instructions: &str,
        language: &str,
        turns: &[ChatTurn],
    ) -> Result<String, LlmError>;
}
