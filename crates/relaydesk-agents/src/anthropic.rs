use async_trait::async_trait;
use relaydesk_common::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::client::ApiEndpoint;
use crate::providers::{LlmProvider, LlmRequest, LlmResponse, TokenUsage};

const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
/// The Messages API requires `max_tokens`; agents normally set their own.
const FALLBACK_MAX_TOKENS: u32 = 1024;

/// Claude through the Messages API.
pub struct AnthropicProvider {
    endpoint: ApiEndpoint,
}

impl AnthropicProvider {
    pub fn new(
        api_key: impl Into<String>,
        model: Option<String>,
        base_url: Option<String>,
    ) -> Self {
        Self {
            endpoint: ApiEndpoint::new(api_key, model, base_url, DEFAULT_MODEL, DEFAULT_BASE_URL),
        }
    }

    fn body<'a>(&'a self, request: &'a LlmRequest) -> MessagesBody<'a> {
        MessagesBody {
            model: request.model_or(&self.endpoint.model),
            max_tokens: request.max_tokens.unwrap_or(FALLBACK_MAX_TOKENS),
            system: request.system_prompt(),
            messages: request
                .messages
                .iter()
                .map(|m| Turn {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            temperature: request.temperature,
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn provider_id(&self) -> &str {
        "anthropic"
    }

    #[instrument(skip(self, request), fields(model))]
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let body = self.body(request);
        tracing::Span::current().record("model", body.model);
        debug!("anthropic: {} turns", body.messages.len());

        let http = self
            .endpoint
            .http
            .post(self.endpoint.url("/v1/messages"))
            .header("x-api-key", &self.endpoint.api_key)
            .header("anthropic-version", API_VERSION);
        let reply: MessagesReply = self.endpoint.call("anthropic", http, &body).await?;
        Ok(reply.into())
    }

    fn configured_model(&self) -> Option<&str> {
        Some(&self.endpoint.model)
    }
}

#[derive(Debug, Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<Turn<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize)]
struct Turn<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesReply {
    content: Vec<ContentBlock>,
    model: String,
    usage: Option<TokenUsage>,
    stop_reason: Option<String>,
}

/// Replies only carry text back to customers; other block kinds are skipped.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

impl From<MessagesReply> for LlmResponse {
    fn from(reply: MessagesReply) -> Self {
        let text = reply
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        Self {
            text,
            model: reply.model,
            usage: reply.usage,
            stop_reason: reply.stop_reason,
        }
    }
}
