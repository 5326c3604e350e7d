use async_trait::async_trait;
use relaydesk_common::{ChannelType, Error, NormalizedMessage, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Every customer-facing channel (WhatsApp, Telegram, Messenger, Email) implements this trait.
///
/// Adapters are webhook-driven: the gateway hands them raw requests to
/// verify and parse, and calls `send` for replies.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel_type(&self) -> ChannelType;

    /// Human-readable display name.
    fn display_name(&self) -> &str;

    fn status(&self) -> ChannelStatus;

    /// Meta-style GET subscription handshake. Returns the challenge to echo.
    fn verify_challenge(&self, mode: &str, token: &str, challenge: &str) -> Result<String> {
        let _ = (mode, token, challenge);
        Err(Error::VerificationFailed(format!(
            "{} does not support subscription challenges",
            self.channel_type()
        )))
    }

    /// Authenticate an inbound webhook delivery before its body is trusted.
    fn verify_inbound(&self, request: &InboundRequest) -> Result<()>;

    /// False when no webhook secret is configured and `verify_inbound`
    /// lets every request through.
    fn verifies_inbound(&self) -> bool {
        true
    }

    /// Extract the customer messages carried by a webhook payload.
    /// Shapes the adapter does not understand yield an empty vec.
    fn normalize_inbound(&self, payload: &serde_json::Value) -> Vec<NormalizedMessage>;

    async fn send(
        &self,
        recipient: &str,
        content: &str,
        options: &SendOptions,
    ) -> Result<DeliveryResult>;

    /// Provider-side receipt for an accepted inbound message (read marks).
    async fn acknowledge(&self, message: &NormalizedMessage) -> Result<()> {
        let _ = message;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelStatus {
    Connected,
    Disconnected,
    Error(String),
}

/// A webhook request as the adapter sees it: lower-cased headers plus the raw body.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl InboundRequest {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Provider account to send from (phone number id, page, bot, mailbox).
    pub account: Option<String>,
    /// Native id of the message being answered.
    pub reply_to: Option<String>,
    /// Email subject line.
    pub subject: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryResult {
    pub success: bool,
    pub provider_message_id: Option<String>,
}

impl DeliveryResult {
    pub fn delivered(provider_message_id: Option<String>) -> Self {
        Self {
            success: true,
            provider_message_id,
        }
    }
}
