use async_trait::async_trait;
use relaydesk_common::{ChannelType, Error, NormalizedMessage, Result};
use relaydesk_config::ChannelConfig;
use relaydesk_security::secrets_match;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::http::{provider_error, transport_error, trim_base};
use crate::traits::{ChannelAdapter, ChannelStatus, DeliveryResult, InboundRequest, SendOptions};

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Telegram Bot API adapter running in webhook mode.
pub struct TelegramAdapter {
    client: Client,
    api_base: String,
    bot_token: String,
    webhook_secret: Option<String>,
    display: String,
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to_message_id: Option<i64>,
}

#[derive(Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<SentMessage>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct SentMessage {
    message_id: i64,
}

impl TelegramAdapter {
    pub fn new(bot_token: String) -> Self {
        Self {
            client: Client::new(),
            api_base: TELEGRAM_API_BASE.to_string(),
            bot_token,
            webhook_secret: None,
            display: "Telegram".to_string(),
        }
    }

    pub fn from_config(config: &ChannelConfig) -> Result<Self> {
        let bot_token = config
            .setting_str("bot_token")
            .ok_or_else(|| Error::Config("telegram channel requires bot_token".into()))?;
        let mut adapter = Self::new(bot_token.to_string());
        adapter.webhook_secret = config.setting_str("webhook_secret").map(str::to_string);
        if let Some(base) = config.setting_str("api_base") {
            adapter.api_base = trim_base(base);
        }
        Ok(adapter)
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    pub fn with_api_base(mut self, base: &str) -> Self {
        self.api_base = trim_base(base);
        self
    }

    /// Numeric bot id, the part of the token before `:`.
    pub fn bot_id(&self) -> Option<&str> {
        self.bot_token.split_once(':').map(|(id, _)| id)
    }
}

#[async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Telegram
    }

    fn display_name(&self) -> &str {
        &self.display
    }

    fn status(&self) -> ChannelStatus {
        ChannelStatus::Connected
    }

    fn verifies_inbound(&self) -> bool {
        self.webhook_secret.is_some()
    }

    fn verify_inbound(&self, request: &InboundRequest) -> Result<()> {
        let Some(expected) = self.webhook_secret.as_deref() else {
            return Ok(());
        };
        if secrets_match(expected, request.header(SECRET_HEADER)) {
            Ok(())
        } else {
            Err(Error::VerificationFailed(
                "telegram secret token mismatch".into(),
            ))
        }
    }

    fn normalize_inbound(&self, payload: &Value) -> Vec<NormalizedMessage> {
        extract_message(payload, self.bot_id())
            .into_iter()
            .collect()
    }

    async fn send(
        &self,
        recipient: &str,
        content: &str,
        options: &SendOptions,
    ) -> Result<DeliveryResult> {
        let body = SendMessageRequest {
            chat_id: recipient,
            text: content,
            reply_to_message_id: options.reply_to.as_deref().and_then(|id| id.parse().ok()),
        };

        let resp = self
            .client
            .post(format!("{}/bot{}/sendMessage", self.api_base, self.bot_token))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(ChannelType::Telegram, "sendMessage", e))?;

        if !resp.status().is_success() {
            return Err(provider_error(ChannelType::Telegram, "sendMessage", resp).await);
        }

        let parsed: ApiResponse = resp.json().await.map_err(|e| {
            Error::delivery("telegram", format!("invalid sendMessage response: {e}"), false)
        })?;
        if !parsed.ok {
            return Err(Error::delivery(
                "telegram",
                parsed.description.unwrap_or_else(|| "sendMessage not ok".into()),
                false,
            ));
        }
        Ok(DeliveryResult::delivered(
            parsed.result.map(|r| r.message_id.to_string()),
        ))
    }
}

/// Pull the text message out of an `Update`. Bot senders, edits and
/// non-text updates yield `None`.
fn extract_message(update: &Value, bot_id: Option<&str>) -> Option<NormalizedMessage> {
    let message = update.get("message")?;
    let text = message.get("text").and_then(|v| v.as_str())?;
    if text.trim().is_empty() {
        return None;
    }

    let from = message.get("from");
    if from
        .and_then(|f| f.get("is_bot"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        debug!("telegram: ignoring message from bot");
        return None;
    }

    let chat_id = message.get("chat").and_then(|c| c.get("id")).and_then(|v| v.as_i64())?;
    let message_id = message.get("message_id").and_then(|v| v.as_i64())?;

    let mut normalized =
        NormalizedMessage::text(ChannelType::Telegram, chat_id.to_string(), text)
            .with_native_id(message_id.to_string())
            .sent_at_unix(message.get("date").and_then(|v| v.as_i64()));

    let name = from.and_then(|f| {
        let first = f.get("first_name").and_then(|v| v.as_str())?;
        Some(match f.get("last_name").and_then(|v| v.as_str()) {
            Some(last) => format!("{first} {last}"),
            None => first.to_string(),
        })
    });
    if let Some(name) = name {
        normalized = normalized.with_contact_name(name);
    }
    if let Some(bot_id) = bot_id {
        normalized = normalized.with_recipient_account(bot_id);
    }
    Some(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn channel_type_is_telegram() {
        let adapter = TelegramAdapter::new("123:abc".into());
        assert_eq!(adapter.channel_type(), ChannelType::Telegram);
        assert_eq!(adapter.display_name(), "Telegram");
        assert_eq!(adapter.bot_id(), Some("123"));
    }

    #[test]
    fn extract_private_message() {
        let update = json!({
            "update_id": 10,
            "message": {
                "message_id": 77,
                "date": 1700000000,
                "chat": {"id": 4242, "type": "private"},
                "from": {"id": 4242, "is_bot": false, "first_name": "Ana", "last_name": "Lima"},
                "text": "hello"
            }
        });

        let adapter = TelegramAdapter::new("123:abc".into());
        let messages = adapter.normalize_inbound(&update);
        assert_eq!(messages.len(), 1);
        let m = &messages[0];
        assert_eq!(m.external_sender_id, "4242");
        assert_eq!(m.native_message_id.as_deref(), Some("77"));
        assert_eq!(m.contact_name.as_deref(), Some("Ana Lima"));
        assert_eq!(m.recipient_account.as_deref(), Some("123"));
    }

    #[test]
    fn bot_messages_and_non_text_updates_are_ignored() {
        let adapter = TelegramAdapter::new("123:abc".into());
        let from_bot = json!({
            "message": {
                "message_id": 1,
                "chat": {"id": 1},
                "from": {"id": 9, "is_bot": true, "first_name": "B"},
                "text": "beep"
            }
        });
        let photo = json!({
            "message": {"message_id": 2, "chat": {"id": 1}, "photo": [{"file_id": "x"}]}
        });
        let callback = json!({"callback_query": {"id": "1"}});

        assert!(adapter.normalize_inbound(&from_bot).is_empty());
        assert!(adapter.normalize_inbound(&photo).is_empty());
        assert!(adapter.normalize_inbound(&callback).is_empty());
    }

    #[test]
    fn secret_token_header_is_required_when_configured() {
        let adapter = TelegramAdapter::new("1:x".into()).with_webhook_secret("s3cret");
        let header = "X-Telegram-Bot-Api-Secret-Token";
        let good = InboundRequest::new("{}").with_header(header, "s3cret");
        let bad = InboundRequest::new("{}").with_header(header, "guess");
        assert!(adapter.verify_inbound(&good).is_ok());
        assert!(adapter.verify_inbound(&bad).is_err());
        assert!(adapter.verify_inbound(&InboundRequest::new("{}")).is_err());
    }

    #[test]
    fn challenge_is_not_supported() {
        let adapter = TelegramAdapter::new("1:x".into());
        assert!(matches!(
            adapter.verify_challenge("subscribe", "t", "c"),
            Err(Error::VerificationFailed(_))
        ));
    }
}
