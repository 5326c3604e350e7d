use async_trait::async_trait;
use relaydesk_common::{ChannelType, Error, NormalizedMessage, Result};
use relaydesk_config::ChannelConfig;
use relaydesk_security::verify_hub_signature;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::http::{provider_error, transport_error, trim_base, verify_meta_challenge};
use crate::traits::{ChannelAdapter, ChannelStatus, DeliveryResult, InboundRequest, SendOptions};

pub const GRAPH_API_BASE: &str = "https://graph.facebook.com/v21.0";

/// Facebook Messenger adapter for a single page.
pub struct MessengerAdapter {
    client: Client,
    api_base: String,
    page_access_token: String,
    verify_token: Option<String>,
    app_secret: Option<String>,
    display: String,
}

#[derive(Serialize)]
struct Recipient<'a> {
    id: &'a str,
}

#[derive(Serialize)]
struct TextMessage<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    recipient: Recipient<'a>,
    messaging_type: &'static str,
    message: TextMessage<'a>,
}

#[derive(Deserialize)]
struct SendResponse {
    #[serde(default)]
    message_id: Option<String>,
}

impl MessengerAdapter {
    pub fn new(page_access_token: String) -> Self {
        Self {
            client: Client::new(),
            api_base: GRAPH_API_BASE.to_string(),
            page_access_token,
            verify_token: None,
            app_secret: None,
            display: "Messenger".to_string(),
        }
    }

    pub fn from_config(config: &ChannelConfig) -> Result<Self> {
        let token = config
            .setting_str("page_access_token")
            .ok_or_else(|| Error::Config("messenger channel requires page_access_token".into()))?;
        let mut adapter = Self::new(token.to_string());
        adapter.verify_token = config.setting_str("verify_token").map(str::to_string);
        adapter.app_secret = config.setting_str("app_secret").map(str::to_string);
        if let Some(base) = config.setting_str("api_base") {
            adapter.api_base = trim_base(base);
        }
        Ok(adapter)
    }

    pub fn with_verify_token(mut self, token: impl Into<String>) -> Self {
        self.verify_token = Some(token.into());
        self
    }

    pub fn with_app_secret(mut self, secret: impl Into<String>) -> Self {
        self.app_secret = Some(secret.into());
        self
    }

    pub fn with_api_base(mut self, base: &str) -> Self {
        self.api_base = trim_base(base);
        self
    }
}

#[async_trait]
impl ChannelAdapter for MessengerAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Messenger
    }

    fn display_name(&self) -> &str {
        &self.display
    }

    fn status(&self) -> ChannelStatus {
        ChannelStatus::Connected
    }

    fn verify_challenge(&self, mode: &str, token: &str, challenge: &str) -> Result<String> {
        verify_meta_challenge(
            ChannelType::Messenger,
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

    fn normalize_inbound(&self, payload: &Value) -> Vec<NormalizedMessage> {
        parse_page_event(payload)
    }

    async fn send(
        &self,
        recipient: &str,
        content: &str,
        _options: &SendOptions,
    ) -> Result<DeliveryResult> {
        let body = SendRequest {
            recipient: Recipient { id: recipient },
            messaging_type: "RESPONSE",
            message: TextMessage { text: content },
        };

        let resp = self
            .client
            .post(format!("{}/me/messages", self.api_base))
            .query(&[("access_token", self.page_access_token.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(ChannelType::Messenger, "send_message", e))?;

        if !resp.status().is_success() {
            return Err(provider_error(ChannelType::Messenger, "send_message", resp).await);
        }

        let parsed: SendResponse = resp.json().await.unwrap_or(SendResponse { message_id: None });
        Ok(DeliveryResult::delivered(parsed.message_id))
    }
}

/// `{ "object": "page", "entry": [{ "id": page, "messaging": [event] }] }` where
/// each event carries `sender`, `recipient`, `timestamp` and `message`.
fn parse_page_event(body: &Value) -> Vec<NormalizedMessage> {
    if body.get("object").and_then(|v| v.as_str()) != Some("page") {
        return Vec::new();
    }
    let Some(entries) = body.get("entry").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for entry in entries {
        let page_id = entry.get("id").and_then(|v| v.as_str());
        let Some(events) = entry.get("messaging").and_then(|v| v.as_array()) else {
            continue;
        };

        for event in events {
            let Some(message) = event.get("message") else {
                continue;
            };
            if message.get("is_echo").and_then(|v| v.as_bool()).unwrap_or(false) {
                debug!("messenger: ignoring echo");
                continue;
            }
            let Some(text) = message.get("text").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(sender) = event
                .get("sender")
                .and_then(|s| s.get("id"))
                .and_then(|v| v.as_str())
            else {
                continue;
            };
            if text.trim().is_empty() {
                continue;
            }

            let mut normalized = NormalizedMessage::text(ChannelType::Messenger, sender, text)
                .sent_at_unix(
                    event
                        .get("timestamp")
                        .and_then(|v| v.as_i64())
                        .map(|ms| ms / 1000),
                );
            if let Some(mid) = message.get("mid").and_then(|v| v.as_str()) {
                normalized = normalized.with_native_id(mid);
            }
            let account = event
                .get("recipient")
                .and_then(|r| r.get("id"))
                .and_then(|v| v.as_str())
                .or(page_id);
            if let Some(account) = account {
                normalized = normalized.with_recipient_account(account);
            }
            out.push(normalized);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_page_messages_and_skips_echoes() {
        let body = json!({
            "object": "page",
            "entry": [{
                "id": "PAGE1",
                "time": 1700000000000i64,
                "messaging": [
                    {
                        "sender": {"id": "PSID9"},
                        "recipient": {"id": "PAGE1"},
                        "timestamp": 1700000000123i64,
                        "message": {"mid": "m_1", "text": "need help"}
                    },
                    {
                        "sender": {"id": "PAGE1"},
                        "recipient": {"id": "PSID9"},
                        "message": {"mid": "m_2", "text": "sure", "is_echo": true}
                    },
                    {
                        "sender": {"id": "PSID9"},
                        "recipient": {"id": "PAGE1"},
                        "delivery": {"mids": ["m_2"]}
                    }
                ]
            }]
        });

        let messages = MessengerAdapter::new("t".into()).normalize_inbound(&body);
        assert_eq!(messages.len(), 1);
        let m = &messages[0];
        assert_eq!(m.channel_type, ChannelType::Messenger);
        assert_eq!(m.external_sender_id, "PSID9");
        assert_eq!(m.native_message_id.as_deref(), Some("m_1"));
        assert_eq!(m.recipient_account.as_deref(), Some("PAGE1"));
        assert_eq!(m.timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn non_page_objects_are_ignored() {
        let adapter = MessengerAdapter::new("t".into());
        assert!(adapter.normalize_inbound(&json!({"object": "instagram", "entry": []})).is_empty());
    }

    #[test]
    fn uses_meta_challenge() {
        let adapter = MessengerAdapter::new("t".into()).with_verify_token("v");
        assert_eq!(adapter.verify_challenge("subscribe", "v", "ok").unwrap(), "ok");
        assert!(adapter.verify_challenge("subscribe", "x", "ok").is_err());
    }
}
