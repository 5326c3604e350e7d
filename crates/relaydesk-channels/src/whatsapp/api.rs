use relaydesk_common::{ChannelType, Result};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

use crate::http::{provider_error, transport_error};

pub const GRAPH_API_BASE: &str = "https://graph.facebook.com/v21.0";

/// Graph API calls made on behalf of one business phone number.
pub struct GraphSender<'a> {
    pub client: &'a Client,
    pub base_url: &'a str,
    pub token: &'a str,
    pub phone_number_id: &'a str,
}

#[derive(Deserialize, Default)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Deserialize)]
struct SentMessage {
    id: String,
}

impl GraphSender<'_> {
    async fn post(&self, op: &str, body: &Value) -> Result<Response> {
        self.client
            .post(format!("{}/{}/messages", self.base_url, self.phone_number_id))
            .bearer_auth(self.token)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(ChannelType::WhatsApp, op, e))
    }

    /// Text message to one user, quoting `reply_to` when given. Returns the
    /// `wamid` Meta assigned, if the response carried one.
    pub async fn send_text(
        &self,
        to: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<Option<String>> {
        let mut body = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": { "body": text },
        });
        if let Some(id) = reply_to {
            body["context"] = json!({ "message_id": id });
        }

        let resp = self.post("send_text", &body).await?;
        if !resp.status().is_success() {
            return Err(provider_error(ChannelType::WhatsApp, "send_text", resp).await);
        }

        let sent: SendResponse = resp.json().await.unwrap_or_default();
        Ok(sent.messages.into_iter().next().map(|m| m.id))
    }

    /// Blue ticks. A rejected receipt is logged, never an error.
    pub async fn mark_read(&self, message_id: &str) -> Result<()> {
        let body = json!({
            "messaging_product": "whatsapp",
            "status": "read",
            "message_id": message_id,
        });

        let resp = self.post("mark_read", &body).await?;
        if !resp.status().is_success() {
            let status = resp.status();
            warn!(
                "whatsapp: read receipt for {message_id} rejected ({status}): {}",
                resp.text().await.unwrap_or_default()
            );
        }
        Ok(())
    }
}
