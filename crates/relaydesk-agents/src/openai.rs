use async_trait::async_trait;
use relaydesk_common::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::client::ApiEndpoint;
use crate::providers::{LlmProvider, LlmRequest, LlmResponse, TokenUsage};

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Chat Completions API. Any compatible server (Azure, vLLM, Ollama's
/// OpenAI endpoint) works through `base_url`.
pub struct OpenAiProvider {
    endpoint: ApiEndpoint,
}

impl OpenAiProvider {
    pub fn new(
        api_key: impl Into<String>,
        model: Option<String>,
        base_url: Option<String>,
    ) -> Self {
        Self {
            endpoint: ApiEndpoint::new(api_key, model, base_url, DEFAULT_MODEL, DEFAULT_BASE_URL),
        }
    }

    /// The system prompt travels as the first message.
    fn body<'a>(&'a self, request: &'a LlmRequest) -> CompletionBody<'a> {
        let system = request.system_prompt().map(|content| Turn {
            role: "system",
            content,
        });
        let turns = request.messages.iter().map(|m| Turn {
            role: m.role.as_str(),
            content: &m.content,
        });

        CompletionBody {
            model: request.model_or(&self.endpoint.model),
            messages: system.into_iter().chain(turns).collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn provider_id(&self) -> &str {
        "openai"
    }

    #[instrument(skip(self, request), fields(model))]
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let body = self.body(request);
        tracing::Span::current().record("model", body.model);
        debug!("openai: {} messages", body.messages.len());

        let http = self
            .endpoint
            .http
            .post(self.endpoint.url("/v1/chat/completions"))
            .bearer_auth(&self.endpoint.api_key);
        let reply: CompletionReply = self.endpoint.call("openai", http, &body).await?;
        Ok(reply.into())
    }

    fn configured_model(&self) -> Option<&str> {
        Some(&self.endpoint.model)
    }
}

#[derive(Debug, Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: Vec<Turn<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize)]
struct Turn<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionReply {
    choices: Vec<Choice>,
    model: String,
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl From<CompletionReply> for LlmResponse {
    fn from(reply: CompletionReply) -> Self {
        let (text, stop_reason) = reply
            .choices
            .into_iter()
            .next()
            .map(|c| (c.message.content.unwrap_or_default(), c.finish_reason))
            .unwrap_or_default();

        Self {
            text,
            model: reply.model,
            usage: reply.usage.map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            }),
            stop_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ChatMessage;
    use relaydesk_common::Error;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(model: &str) -> LlmRequest {
        LlmRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage::user("hello"),
                ChatMessage::assistant("hi, how can I help?"),
                ChatMessage::user("where is my order?"),
            ],
            system: Some("You are a support agent".to_string()),
            max_tokens: Some(256),
            temperature: Some(0.2),
        }
    }

    #[test]
    fn system_prompt_leads_the_conversation() {
        let provider = OpenAiProvider::new("k", None, None);
        let json = serde_json::to_value(provider.body(&request(""))).unwrap();

        assert_eq!(json["model"], DEFAULT_MODEL);
        let roles: Vec<&str> = json["messages"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|m| m["role"].as_str())
            .collect();
        assert_eq!(roles, ["system", "user", "assistant", "user"]);
    }

    #[test]
    fn agent_model_overrides_configured_one() {
        let provider = OpenAiProvider::new("k", Some("gpt-4o".into()), None);
        assert_eq!(provider.body(&request("o3-mini")).model, "o3-mini");
        assert_eq!(provider.body(&request("")).model, "gpt-4o");
    }

    #[test]
    fn unset_options_are_omitted() {
        let provider = OpenAiProvider::new("k", None, None);
        let mut req = request("");
        req.system = None;
        req.max_tokens = None;
        req.temperature = None;

        let json = serde_json::to_value(provider.body(&req)).unwrap();
        assert!(json.get("max_tokens").is_none());
        assert!(json.get("temperature").is_none());
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[tokio::test]
    async fn complete_reads_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{
                    "message": {"role": "assistant", "content": "It ships tomorrow."},
                    "finish_reason": "stop"
                }],
                "model": "gpt-4o-mini",
                "usage": {"prompt_tokens": 12, "completion_tokens": 5}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new("sk-test", None, Some(server.uri()));
        let response = provider.complete(&request("")).await.unwrap();

        assert_eq!(response.text, "It ships tomorrow.");
        assert_eq!(response.stop_reason.as_deref(), Some("stop"));
        assert_eq!(response.usage.map(|u| u.output_tokens), Some(5));
    }

    #[tokio::test]
    async fn rejected_key_is_a_generation_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new("bad", None, Some(server.uri()));
        let err = provider.complete(&request("")).await.unwrap_err();
        assert!(matches!(err, Error::Generation(ref m) if m.contains("401")));
        assert!(!provider.health_check().await.unwrap());
    }
}
