use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use relaydesk_common::{Error, Result};
use relaydesk_config::AppConfig;
use relaydesk_db::{Agent, StoredMessage};
use tracing::{info, instrument, warn};

use crate::anthropic::AnthropicProvider;
use crate::openai::OpenAiProvider;
use crate::providers::{ChatMessage, ChatRole, LlmProvider, LlmRequest};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_CONTEXT_TOKENS: usize = 100_000;

/// A model reply plus what produced it.
#[derive(Debug, Clone)]
pub struct GeneratedReply {
    pub text: String,
    pub provider: String,
    pub model: String,
    /// Wall time of the provider call.
    pub response_time_ms: u64,
}

/// Routes agent replies to the configured LLM providers.
pub struct AgentRuntime {
    providers: Vec<Arc<dyn LlmProvider>>,
    default_provider: Option<String>,
    timeout: Duration,
    max_context_tokens: usize,
}

impl AgentRuntime {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
            default_provider: None,
            timeout: DEFAULT_TIMEOUT,
            max_context_tokens: DEFAULT_MAX_CONTEXT_TOKENS,
        }
    }

    /// Build a runtime with every usable provider from `config.llm`. With no
    /// `llm` section at all, `ANTHROPIC_API_KEY` and `OPENAI_API_KEY` are
    /// tried in that order.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut runtime = Self::new()
            .with_timeout(Duration::from_secs(config.agent.generation_timeout_secs));

        let mut entries: Vec<_> = config.llm.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        for (name, llm) in entries {
            match llm.provider.as_str() {
                "anthropic" => match resolve_api_key(llm.api_key.as_deref(), "ANTHROPIC_API_KEY") {
                    Some(key) => {
                        runtime.register_provider(Box::new(AnthropicProvider::new(
                            key,
                            llm.model.clone(),
                            llm.base_url.clone(),
                        )));
                        info!("configured anthropic provider: {name}");
                    }
                    None => warn!(
                        "skipping anthropic provider {name}: no API key \
                         (set api_key in config or ANTHROPIC_API_KEY env var)"
                    ),
                },
                "openai" => match resolve_api_key(llm.api_key.as_deref(), "OPENAI_API_KEY") {
                    Some(key) => {
                        runtime.register_provider(Box::new(OpenAiProvider::new(
                            key,
                            llm.model.clone(),
                            llm.base_url.clone(),
                        )));
                        info!("configured openai provider: {name}");
                    }
                    None => warn!(
                        "skipping openai provider {name}: no API key \
                         (set api_key in config or OPENAI_API_KEY env var)"
                    ),
                },
                other => warn!("unknown LLM provider type: {other}, skipping {name}"),
            }
        }

        if config.llm.is_empty() {
            if let Some(key) = resolve_api_key(None, "ANTHROPIC_API_KEY") {
                runtime.register_provider(Box::new(AnthropicProvider::new(key, None, None)));
            }
            if let Some(key) = resolve_api_key(None, "OPENAI_API_KEY") {
                runtime.register_provider(Box::new(OpenAiProvider::new(key, None, None)));
            }
        }

        if runtime.providers.is_empty() {
            warn!("no LLM provider configured; agents will not reply");
        }
        runtime
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_max_context_tokens(&mut self, max_context_tokens: usize) {
        self.max_context_tokens = max_context_tokens;
    }

    pub fn register_provider(&mut self, provider: Box<dyn LlmProvider>) {
        let id = provider.provider_id().to_string();
        info!("registered LLM provider: {}", id);
        if self.default_provider.is_none() {
            self.default_provider = Some(id);
        }
        self.providers.push(Arc::from(provider));
    }

    pub fn get_provider(&self, id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers
            .iter()
            .find(|p| p.provider_id() == id)
            .cloned()
    }

    pub fn default_provider(&self) -> Option<Arc<dyn LlmProvider>> {
        self.default_provider
            .as_deref()
            .and_then(|id| self.get_provider(id))
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.providers
            .iter()
            .map(|p| p.provider_id().to_string())
            .collect()
    }

    /// The agent's own provider when registered, otherwise the default one.
    fn provider_for(&self, agent: &Agent) -> Result<Arc<dyn LlmProvider>> {
        if let Some(id) = agent.provider.as_deref() {
            if let Some(provider) = self.get_provider(id) {
                return Ok(provider);
            }
            warn!(
                "agent {} asks for provider {id}, which is not configured; using the default",
                agent.id
            );
        }
        self.default_provider()
            .ok_or_else(|| Error::Generation("no LLM provider configured".into()))
    }

    /// Generate the agent's next reply for a conversation. `history` is the
    /// stored conversation, oldest first, ending with the message to answer.
    #[instrument(skip(self, agent, history), fields(agent_id = %agent.id, provider))]
    pub async fn generate(
        &self,
        agent: &Agent,
        history: &[StoredMessage],
    ) -> Result<GeneratedReply> {
        let provider = self.provider_for(agent)?;
        tracing::Span::current().record("provider", provider.provider_id());

        let system = Some(agent.system_prompt.clone()).filter(|s| !s.trim().is_empty());
        let mut messages = build_chat_history(history);
        if messages.is_empty() {
            return Err(Error::Generation("nothing to reply to".into()));
        }
        trim_messages_to_budget(&mut messages, &system, self.max_context_tokens);

        let request = LlmRequest {
            model: agent.model.clone().unwrap_or_default(),
            messages,
            system,
            max_tokens: Some(agent.max_tokens),
            temperature: Some(agent.temperature),
        };

        let started = Instant::now();
        let response = tokio::time::timeout(self.timeout, provider.complete(&request))
            .await
            .map_err(|_| {
                Error::Generation(format!(
                    "{} did not answer within {}s",
                    provider.provider_id(),
                    self.timeout.as_secs_f32()
                ))
            })??;
        let response_time_ms = started.elapsed().as_millis() as u64;

        let text = response.text.trim();
        if text.is_empty() {
            return Err(Error::Generation(format!(
                "{} returned an empty reply",
                provider.provider_id()
            )));
        }

        Ok(GeneratedReply {
            text: text.to_string(),
            provider: provider.provider_id().to_string(),
            model: response.model,
            response_time_ms,
        })
    }

    pub async fn health_check_all(&self) -> Result<Vec<(String, bool)>> {
        let checks = self.providers.iter().map(|provider| async {
            let provider_id = provider.provider_id().to_string();
            let ok = provider.health_check().await.unwrap_or(false);
            (provider_id, ok)
        });

        Ok(join_all(checks).await)
    }
}

impl Default for AgentRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Config value first, then the environment.
fn resolve_api_key(config_key: Option<&str>, env_var: &str) -> Option<String> {
    match config_key {
        Some(key) if !key.is_empty() => Some(key.to_string()),
        _ => std::env::var(env_var).ok().filter(|k| !k.is_empty()),
    }
}

/// Map stored messages onto alternating user/assistant turns. Customer and
/// operator text are user turns, agent replies are assistant turns, system
/// notes are dropped. Consecutive turns of one role are merged and the
/// history always opens with a user turn.
fn build_chat_history(history: &[StoredMessage]) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = Vec::new();
    for stored in history {
        let Some(role) = ChatRole::for_sender(stored.sender) else {
            continue;
        };
        if stored.content.trim().is_empty() {
            continue;
        }
        if let Some(last) = messages.last_mut() {
            if last.role == role {
                last.content.push('\n');
                last.content.push_str(&stored.content);
                continue;
            }
        } else if role == ChatRole::Assistant {
            continue;
        }
        messages.push(ChatMessage {
            role,
            content: stored.content.clone(),
        });
    }
    messages
}

/// Rough token estimate: ~4 characters per token.
fn estimate_tokens(messages: &[ChatMessage], system: &Option<String>) -> usize {
    let system_chars = system.as_ref().map_or(0, |s| s.len());
    let message_chars: usize = messages.iter().map(|m| m.content.len()).sum();
    (system_chars + message_chars) / 4
}

/// Drop the oldest turns until the estimate fits the budget. Always keeps
/// the last turn and never leaves an assistant turn first.
fn trim_messages_to_budget(
    messages: &mut Vec<ChatMessage>,
    system: &Option<String>,
    max_tokens: usize,
) {
    while messages.len() > 1 && estimate_tokens(messages, system) > max_tokens {
        messages.remove(0);
        while messages.len() > 1 && messages[0].role == ChatRole::Assistant {
            messages.remove(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::LlmResponse;
    use async_trait::async_trait;
    use chrono::Utc;
    use relaydesk_common::{AgentId, ConversationId, MessageId, SenderRole};
    use std::sync::Mutex;

    struct RecordingProvider {
        id: &'static str,
        reply: &'static str,
        delay: Duration,
        last_request: Mutex<Option<LlmRequest>>,
    }

    impl RecordingProvider {
        fn new(id: &'static str, reply: &'static str) -> Self {
            Self {
                id,
                reply,
                delay: Duration::ZERO,
                last_request: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for RecordingProvider {
        fn provider_id(&self) -> &str {
            self.id
        }

        async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
            *self.last_request.lock().unwrap() = Some(request.clone());
            tokio::time::sleep(self.delay).await;
            Ok(LlmResponse {
                text: self.reply.to_string(),
                model: "mock-model".to_string(),
                usage: None,
                stop_reason: None,
            })
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
    }

    fn agent(provider: Option<&str>) -> Agent {
        Agent {
            id: AgentId(1),
            name: "Ana".into(),
            provider: provider.map(str::to_string),
            model: Some("custom-model".into()),
            temperature: 0.3,
            max_tokens: 300,
            system_prompt: "You answer for Acme.".into(),
            active: true,
            updated_at: Utc::now(),
        }
    }

    fn stored(id: i64, sender: SenderRole, content: &str) -> StoredMessage {
        StoredMessage {
            id: MessageId(id),
            conversation_id: ConversationId(1),
            content: content.into(),
            sender,
            native_message_id: None,
            response_time_ms: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn history_alternates_and_starts_with_user() {
        let history = vec![
            stored(1, SenderRole::Agent, "Welcome!"),
            stored(2, SenderRole::Customer, "hi"),
            stored(3, SenderRole::Customer, "are you there?"),
            stored(4, SenderRole::System, "session reopened"),
            stored(5, SenderRole::Agent, "Yes"),
            stored(6, SenderRole::Operator, "test from dashboard"),
        ];

        let messages = build_chat_history(&history);
        assert_eq!(
            messages,
            vec![
                ChatMessage::user("hi\nare you there?"),
                ChatMessage::assistant("Yes"),
                ChatMessage::user("test from dashboard"),
            ]
        );
    }

    #[test]
    fn trimming_keeps_the_last_turn() {
        let mut messages = vec![
            ChatMessage::user("a".repeat(400)),
            ChatMessage::assistant("b".repeat(400)),
            ChatMessage::user("c".repeat(40)),
        ];
        trim_messages_to_budget(&mut messages, &None, 20);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, ChatRole::User);
    }

    #[tokio::test]
    async fn generate_uses_agent_settings() {
        let mut runtime = AgentRuntime::new();
        runtime.register_provider(Box::new(RecordingProvider::new("mock", "  Sure thing.  ")));

        let reply = runtime
            .generate(&agent(None), &[stored(1, SenderRole::Customer, "help")])
            .await
            .unwrap();
        assert_eq!(reply.text, "Sure thing.");
        assert_eq!(reply.provider, "mock");
        assert_eq!(reply.model, "mock-model");
    }

    #[tokio::test]
    async fn agent_provider_is_preferred_over_default() {
        let mut runtime = AgentRuntime::new();
        runtime.register_provider(Box::new(RecordingProvider::new("first", "from first")));
        runtime.register_provider(Box::new(RecordingProvider::new("second", "from second")));

        let history = [stored(1, SenderRole::Customer, "hi")];
        let reply = runtime.generate(&agent(Some("second")), &history).await.unwrap();
        assert_eq!(reply.text, "from second");

        let reply = runtime.generate(&agent(Some("missing")), &history).await.unwrap();
        assert_eq!(reply.text, "from first");
    }

    #[tokio::test]
    async fn request_carries_prompt_model_and_limits() {
        let provider = Arc::new(RecordingProvider::new("mock", "ok"));
        let runtime = AgentRuntime {
            providers: vec![provider.clone() as Arc<dyn LlmProvider>],
            default_provider: Some("mock".into()),
            timeout: DEFAULT_TIMEOUT,
            max_context_tokens: DEFAULT_MAX_CONTEXT_TOKENS,
        };

        runtime
            .generate(&agent(None), &[stored(1, SenderRole::Customer, "hi")])
            .await
            .unwrap();

        let request = provider.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.model, "custom-model");
        assert_eq!(request.system.as_deref(), Some("You answer for Acme."));
        assert_eq!(request.max_tokens, Some(300));
        assert_eq!(request.temperature, Some(0.3));
        assert_eq!(request.messages, vec![ChatMessage::user("hi")]);
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let mut runtime = AgentRuntime::new().with_timeout(Duration::from_millis(50));
        runtime.register_provider(Box::new(RecordingProvider {
            delay: Duration::from_secs(5),
            ..RecordingProvider::new("slow", "late")
        }));

        let err = runtime
            .generate(&agent(None), &[stored(1, SenderRole::Customer, "hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Generation(ref m) if m.contains("did not answer")));
    }

    #[tokio::test]
    async fn no_provider_and_empty_reply_are_generation_errors() {
        let history = [stored(1, SenderRole::Customer, "hi")];
        let err = AgentRuntime::new().generate(&agent(None), &history).await.unwrap_err();
        assert!(matches!(err, Error::Generation(_)));

        let mut runtime = AgentRuntime::new();
        runtime.register_provider(Box::new(RecordingProvider::new("mock", "   ")));
        let err = runtime.generate(&agent(None), &history).await.unwrap_err();
        assert!(matches!(err, Error::Generation(ref m) if m.contains("empty reply")));
    }

    #[test]
    fn from_config_registers_keyed_providers_in_name_order() {
        let mut config = AppConfig::default();
        config.agent.generation_timeout_secs = 7;
        config.llm = serde_json::from_value(serde_json::json!({
            "b-openai": {"provider": "openai", "api_key": "sk-1"},
            "a-claude": {"provider": "anthropic", "api_key": "sk-2", "model": "claude-haiku"},
            "c-other": {"provider": "mistral", "api_key": "x"}
        }))
        .unwrap();

        let runtime = AgentRuntime::from_config(&config);
        assert_eq!(runtime.provider_ids(), vec!["anthropic", "openai"]);
        assert_eq!(runtime.timeout(), Duration::from_secs(7));
        assert_eq!(
            runtime.default_provider().unwrap().configured_model(),
            Some("claude-haiku")
        );
    }
}
