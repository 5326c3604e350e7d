use async_trait::async_trait;
use relaydesk_common::{Result, SenderRole};
use serde::{Deserialize, Serialize};
use tracing::info;

/// A chat-completion backend that agents reply through.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn provider_id(&self) -> &str;

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse>;

    /// Model used when a request leaves `model` empty.
    fn configured_model(&self) -> Option<&str> {
        None
    }

    /// One-token completion; any error counts as unhealthy.
    async fn health_check(&self) -> Result<bool> {
        let model = self.configured_model().unwrap_or_default().to_string();
        match self.complete(&LlmRequest::ping(model)).await {
            Ok(_) => Ok(true),
            Err(e) => {
                info!("{} health check failed: {e}", self.provider_id());
                Ok(false)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    /// Empty means the provider's configured model.
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub system: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

impl LlmRequest {
    fn ping(model: String) -> Self {
        Self {
            model,
            messages: vec![ChatMessage::user("ping")],
            system: None,
            max_tokens: Some(1),
            temperature: None,
        }
    }

    /// The request's model, or `fallback` when none was asked for.
    pub fn model_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        if self.model.is_empty() {
            fallback
        } else {
            &self.model
        }
    }

    /// System prompt, if it has any content.
    pub fn system_prompt(&self) -> Option<&str> {
        self.system.as_deref().filter(|s| !s.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    /// Customers and operators speak to the model, agent replies are the
    /// model's own turns. System notes are not part of the chat.
    pub fn for_sender(sender: SenderRole) -> Option<Self> {
        match sender {
            SenderRole::Customer | SenderRole::Operator => Some(Self::User),
            SenderRole::Agent => Some(Self::Assistant),
            SenderRole::System => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub model: String,
    pub usage: Option<TokenUsage>,
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}
