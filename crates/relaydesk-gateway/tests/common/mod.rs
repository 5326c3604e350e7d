#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use relaydesk_agents::{AgentRuntime, LlmProvider, LlmRequest, LlmResponse};
use relaydesk_channels::{
    ChannelAdapter, ChannelRegistry, ChannelStatus, DeliveryResult, InboundRequest, SendOptions,
};
use relaydesk_common::{ChannelType, Error, NormalizedMessage, Result};
use relaydesk_config::AppConfig;
use relaydesk_db::{Agent, ChannelAccount, NewAgent, NewTenant, Tenant, TenantDatabaseRouter};
use relaydesk_gateway::{AppState, SharedState};
use relaydesk_security::{TokenVerifier, verify_hub_signature};

pub const TOKEN_SECRET: &str = "test-token-secret";
pub const APP_SECRET: &str = "test-app-secret";
pub const PHONE_ID: &str = "1055";

/// LLM provider that answers every request with a fixed text, or fails.
pub struct ScriptedProvider {
    reply: Option<String>,
    pub requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedProvider {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Some(text.to_string()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn provider_id(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        self.requests.lock().unwrap().push(request.clone());
        match &self.reply {
            Some(text) => Ok(LlmResponse {
                text: text.clone(),
                model: "scripted-1".into(),
                usage: None,
                stop_reason: Some("end_turn".into()),
            }),
            None => Err(Error::Generation("scripted provider is down".into())),
        }
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.reply.is_some())
    }
}

/// WhatsApp-shaped adapter that records sends instead of calling the network.
pub struct RecordingAdapter {
    app_secret: Option<String>,
    failing_recipients: Mutex<HashSet<String>>,
    pub sent: Mutex<Vec<(String, String)>>,
}

impl RecordingAdapter {
    pub fn new() -> Self {
        Self {
            app_secret: Some(APP_SECRET.to_string()),
            failing_recipients: Mutex::new(HashSet::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_for(&self, recipient: &str) {
        self.failing_recipients
            .lock()
            .unwrap()
            .insert(recipient.to_string());
    }

    pub fn sent_to(&self, recipient: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| to == recipient)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl ChannelAdapter for RecordingAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::WhatsApp
    }

    fn display_name(&self) -> &str {
        "Recording WhatsApp"
    }

    fn status(&self) -> ChannelStatus {
        ChannelStatus::Connected
    }

    fn verify_challenge(&self, mode: &str, token: &str, challenge: &str) -> Result<String> {
        if mode == "subscribe" && token == "verify-me" {
            Ok(challenge.to_string())
        } else {
            Err(Error::VerificationFailed("verify token mismatch".into()))
        }
    }

    fn verify_inbound(&self, request: &InboundRequest) -> Result<()> {
        match &self.app_secret {
            Some(secret) => verify_hub_signature(
                secret,
                &request.body,
                request.header("x-hub-signature-256"),
            ),
            None => Ok(()),
        }
    }

    fn normalize_inbound(&self, payload: &serde_json::Value) -> Vec<NormalizedMessage> {
        relaydesk_channels::whatsapp::inbound::parse_notification(payload)
    }

    async fn send(
        &self,
        recipient: &str,
        content: &str,
        _options: &SendOptions,
    ) -> Result<DeliveryResult> {
        if self.failing_recipients.lock().unwrap().contains(recipient) {
            return Err(Error::delivery("whatsapp", "recipient unreachable", false));
        }
        self.sent
            .lock()
            .unwrap()
            .push((recipient.to_string(), content.to_string()));
        Ok(DeliveryResult::delivered(Some(format!("wamid.{recipient}"))))
    }
}

pub struct Harness {
    pub state: SharedState,
    pub adapter: Arc<RecordingAdapter>,
    pub tenant: Tenant,
    pub agent: Agent,
    pub token: String,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_provider(ScriptedProvider::replying("Happy to help!"))
    }

    /// One tenant owning the WhatsApp number `PHONE_ID`, served by one agent.
    pub fn with_provider(provider: ScriptedProvider) -> Self {
        let router = Arc::new(TenantDatabaseRouter::in_memory().unwrap());
        let tenant = router
            .provision(&NewTenant::user("shop@example.com", "Shop"))
            .unwrap();
        let agent = router
            .route(tenant.id)
            .unwrap()
            .create_agent(&NewAgent {
                system_prompt: "You answer questions about orders.".into(),
                ..NewAgent::named("Ana")
            })
            .unwrap();
        router
            .shared()
            .upsert_channel_account(&ChannelAccount {
                channel_type: ChannelType::WhatsApp,
                account_id: PHONE_ID.into(),
                tenant_id: tenant.id,
                agent_id: Some(agent.id),
            })
            .unwrap();

        let mut config = AppConfig::default();
        config.storage.in_memory = true;
        config.delivery.max_retries = 0;
        config.delivery.backoff_ms = 1;
        config.hub.metrics_interval_secs = 0;

        let adapter = Arc::new(RecordingAdapter::new());
        let mut channels = ChannelRegistry::new();
        channels.register(adapter.clone());

        let mut agents = AgentRuntime::new();
        agents.register_provider(Box::new(provider));

        let tokens = TokenVerifier::new(TOKEN_SECRET, 3600);
        let token = tokens.issue(tenant.id, "user").unwrap();

        let state = AppState::new(config, router, channels, agents, tokens).into_shared();
        Self {
            state,
            adapter,
            tenant,
            agent,
            token,
        }
    }

    /// Another tenant with its own agent, owning the WhatsApp number `account`.
    pub fn add_tenant(&self, email: &str, account: &str) -> (Tenant, Agent) {
        let router = &self.state.router;
        let tenant = router.provision(&NewTenant::user(email, "Other")).unwrap();
        let agent = router
            .route(tenant.id)
            .unwrap()
            .create_agent(&NewAgent::named("Bo"))
            .unwrap();
        router
            .shared()
            .upsert_channel_account(&ChannelAccount {
                channel_type: ChannelType::WhatsApp,
                account_id: account.into(),
                tenant_id: tenant.id,
                agent_id: Some(agent.id),
            })
            .unwrap();
        (tenant, agent)
    }

    pub fn admin_token(&self) -> String {
        let admin = self
            .state
            .router
            .provision(&NewTenant::admin("ops@example.com", "Ops"))
            .unwrap();
        self.state.tokens.issue(admin.id, "admin").unwrap()
    }
}

/// Inbound WhatsApp text addressed to the harness number.
pub fn inbound(from: &str, text: &str, native_id: &str) -> NormalizedMessage {
    inbound_to(PHONE_ID, from, text, native_id)
}

pub fn inbound_to(account: &str, from: &str, text: &str, native_id: &str) -> NormalizedMessage {
    NormalizedMessage::text(ChannelType::WhatsApp, from, text)
        .with_native_id(native_id)
        .with_recipient_account(account)
}

/// Every frame queued for a hub connection so far.
pub fn drain(rx: &mut tokio::sync::mpsc::Receiver<String>) -> Vec<serde_json::Value> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(serde_json::from_str(&frame).unwrap());
    }
    frames
}

/// Cloud API notification carrying one text message.
pub fn whatsapp_payload(from: &str, text: &str, native_id: &str) -> serde_json::Value {
    serde_json::json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "WABA",
            "changes": [{
                "field": "messages",
                "value": {
                    "messaging_product": "whatsapp",
                    "metadata": { "display_phone_number": "15550000", "phone_number_id": PHONE_ID },
                    "contacts": [{ "profile": { "name": "Jo" }, "wa_id": from }],
                    "messages": [{
                        "from": from,
                        "id": native_id,
                        "timestamp": "1700000000",
                        "type": "text",
                        "text": { "body": text }
                    }]
                }
            }]
        }]
    })
}
