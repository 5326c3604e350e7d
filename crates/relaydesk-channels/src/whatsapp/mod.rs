pub mod api;
pub mod inbound;

use async_trait::async_trait;
use relaydesk_common::{ChannelType, Error, NormalizedMessage, Result};
use relaydesk_config::ChannelConfig;
use relaydesk_security::verify_hub_signature;
use reqwest::Client;

use crate::http::{trim_base, verify_meta_challenge};
use crate::traits::{ChannelAdapter, ChannelStatus, DeliveryResult, InboundRequest, SendOptions};

/// WhatsApp Cloud API adapter (webhook in, Graph API out).
pub struct WhatsAppAdapter {
    client: Client,
    api_base: String,
    access_token: String,
    phone_number_id: String,
    verify_token: Option<String>,
    app_secret: Option<String>,
    display: String,
}

impl WhatsAppAdapter {
    pub fn new(access_token: String, phone_number_id: String) -> Self {
        Self {
            client: Client::new(),
            api_base: api::GRAPH_API_BASE.to_string(),
            access_token,
            phone_number_id,
            verify_token: None,
            app_secret: None,
            display: "WhatsApp".to_string(),
        }
    }

    pub fn from_config(config: &ChannelConfig) -> Result<Self> {
        let access_token = config
            .setting_str("access_token")
            .ok_or_else(|| Error::Config("whatsapp channel requires access_token".into()))?;
        let phone_number_id = config
            .setting_str("phone_number_id")
            .ok_or_else(|| Error::Config("whatsapp channel requires phone_number_id".into()))?;

        let mut adapter = Self::new(access_token.to_string(), phone_number_id.to_string());
        adapter.verify_token = config.setting_str("verify_token").map(str::to_string);
        adapter.app_secret = config.setting_str("app_secret").map(str::to_string);
        if let Some(base) = config.setting_str("api_base") {
            adapter.api_base = trim_base(base);
        }
        Ok(adapter)
    }

    fn graph<'a>(&'a self, phone_number_id: &'a str) -> api::GraphSender<'a> {
        api::GraphSender {
            client: &self.client,
            base_url: &self.api_base,
            token: &self.access_token,
            phone_number_id,
        }
    }

    pub fn with_verify_token(mut self, token: impl Into<String>) -> Self {
        self.verify_token = Some(token.into());
        self
    }

    pub fn with_app_secret(mut self, secret: impl Into<String>) -> Self {
        self.app_secret = Some(secret.into());
        self
    }

    /// Point the Graph API calls somewhere else (tests, proxies).
    pub fn with_api_base(mut self, base: &str) -> Self {
        self.api_base = trim_base(base);
        self
    }

    pub fn phone_number_id(&self) -> &str {
        &self.phone_number_id
    }
}

#[async_trait]
impl ChannelAdapter for WhatsAppAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::WhatsApp
    }

    fn display_name(&self) -> &str {
        &self.display
    }

    fn status(&self) -> ChannelStatus {
        ChannelStatus::Connected
    }

    fn verify_challenge(&self, mode: &str, token: &str, challenge: &str) -> Result<String> {
        verify_meta_challenge(
            ChannelType::WhatsApp,
            self.verify_token.as_deref(),
            mode,
            token,
            challenge,
        )
    }

    fn verifies_inbound(&self) -> bool {
        self.app_secret.is_some()
    }

    fn verify_inbound(&self, request: &InboundRequest) -> Result<()> {
        match self.app_secret.as_deref() {
            Some(secret) => verify_hub_signature(
                secret,
                &request.body,
                request.header("x-hub-signature-256"),
            ),
            None => Ok(()),
        }
    }

    fn normalize_inbound(&self, payload: &serde_json::Value) -> Vec<NormalizedMessage> {
        inbound::parse_notification(payload)
    }

    async fn send(
        &self,
        recipient: &str,
        content: &str,
        options: &SendOptions,
    ) -> Result<DeliveryResult> {
        let from = options.account.as_deref().unwrap_or(&self.phone_number_id);
        let id = self
            .graph(from)
            .send_text(recipient, content, options.reply_to.as_deref())
            .await?;
        Ok(DeliveryResult::delivered(id))
    }

    async fn acknowledge(&self, message: &NormalizedMessage) -> Result<()> {
        let Some(message_id) = message.native_message_id.as_deref() else {
            return Ok(());
        };
        let account = message
            .recipient_account
            .as_deref()
            .unwrap_or(&self.phone_number_id);
        self.graph(account).mark_read(message_id).await
    }
}
