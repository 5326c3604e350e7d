use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use relaydesk_common::{ChannelType, Error, NormalizedMessage, Result};
use relaydesk_config::ChannelConfig;
use relaydesk_security::secrets_match;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::traits::{ChannelAdapter, ChannelStatus, DeliveryResult, InboundRequest, SendOptions};

const TOKEN_HEADER: &str = "x-webhook-token";
const DEFAULT_SMTP_PORT: u16 = 587;

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpSecurity {
    /// Implicit TLS (port 465).
    Tls,
    StartTls,
    /// Unencrypted; local relays and tests only.
    Plain,
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub security: SmtpSecurity,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Email adapter: inbound-parse webhook JSON in, SMTP out.
pub struct EmailAdapter {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    webhook_token: Option<String>,
    display: String,
}

impl EmailAdapter {
    pub fn new(smtp: &SmtpSettings, from_address: &str) -> Result<Self> {
        let from: Mailbox = from_address
            .parse()
            .map_err(|e| Error::Config(format!("invalid email from_address: {e}")))?;

        let builder = match smtp.security {
            SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host)
                .map_err(|e| Error::Config(format!("SMTP relay error: {e}")))?,
            SmtpSecurity::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)
                    .map_err(|e| Error::Config(format!("SMTP relay error: {e}")))?
            }
            SmtpSecurity::Plain => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
            }
        };
        let mut builder = builder.port(smtp.port);
        if let (Some(user), Some(pass)) = (&smtp.username, &smtp.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            mailer: builder.build(),
            from,
            webhook_token: None,
            display: "Email".to_string(),
        })
    }

    pub fn from_config(config: &ChannelConfig) -> Result<Self> {
        let host = config
            .setting_str("smtp_host")
            .ok_or_else(|| Error::Config("email channel requires smtp_host".into()))?;
        let from_address = config
            .setting_str("from_address")
            .ok_or_else(|| Error::Config("email channel requires from_address".into()))?;

        let security = match config.setting_str("smtp_security").unwrap_or("starttls") {
            "tls" => SmtpSecurity::Tls,
            "starttls" => SmtpSecurity::StartTls,
            "plain" => SmtpSecurity::Plain,
            other => {
                return Err(Error::Config(format!(
                    "unknown smtp_security {other:?} (expected tls, starttls or plain)"
                )));
            }
        };
        let port = config
            .setting_u64("smtp_port")
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(DEFAULT_SMTP_PORT);

        let settings = SmtpSettings {
            host: host.to_string(),
            port,
            security,
            username: config.setting_str("smtp_username").map(str::to_string),
            password: config.setting_str("smtp_password").map(str::to_string),
        };

        let mut adapter = Self::new(&settings, from_address)?;
        adapter.webhook_token = config.setting_str("webhook_token").map(str::to_string);
        Ok(adapter)
    }

    pub fn with_webhook_token(mut self, token: impl Into<String>) -> Self {
        self.webhook_token = Some(token.into());
        self
    }

    pub fn from_address(&self) -> &str {
        self.from.email.as_ref()
    }

    fn build_message(
        &self,
        recipient: &str,
        content: &str,
        options: &SendOptions,
    ) -> Result<(Message, String)> {
        let to: Mailbox = recipient.parse().map_err(|e| {
            Error::delivery("email", format!("invalid recipient {recipient:?}: {e}"), false)
        })?;
        let domain = self.from.email.domain().to_string();
        let message_id = format!("<{}@{domain}>", Uuid::new_v4());

        let mut builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(options.subject.clone().unwrap_or_else(|| "Re: your message".to_string()))
            .message_id(Some(message_id.clone()))
            .header(ContentType::TEXT_PLAIN);
        if let Some(reply_to) = &options.reply_to {
            builder = builder
                .in_reply_to(reply_to.clone())
                .references(reply_to.clone());
        }

        let message = builder
            .body(content.to_string())
            .map_err(|e| Error::delivery("email", format!("failed to build message: {e}"), false))?;
        Ok((message, message_id))
    }
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Email
    }

    fn display_name(&self) -> &str {
        &self.display
    }

    fn status(&self) -> ChannelStatus {
        ChannelStatus::Connected
    }

    fn verifies_inbound(&self) -> bool {
        self.webhook_token.is_some()
    }

    fn verify_inbound(&self, request: &InboundRequest) -> Result<()> {
        let Some(expected) = self.webhook_token.as_deref() else {
            return Ok(());
        };
        if secrets_match(expected, request.header(TOKEN_HEADER)) {
            Ok(())
        } else {
            Err(Error::VerificationFailed("email webhook token mismatch".into()))
        }
    }

    fn normalize_inbound(&self, payload: &Value) -> Vec<NormalizedMessage> {
        parse_inbound_email(payload).into_iter().collect()
    }

    async fn send(
        &self,
        recipient: &str,
        content: &str,
        options: &SendOptions,
    ) -> Result<DeliveryResult> {
        let (message, message_id) = self.build_message(recipient, content, options)?;
        self.mailer.send(message).await.map_err(|e| {
            Error::delivery("email", format!("SMTP send failed: {e}"), !e.is_permanent())
        })?;
        info!("email: sent reply {message_id}");
        Ok(DeliveryResult::delivered(Some(message_id)))
    }
}

/// ```json
/// { "from": "Ana <ana@example.com>", "to": "support@acme.test",
///   "subject": "...", "text": "...", "message_id": "<...>" }
/// ```
fn parse_inbound_email(payload: &Value) -> Option<NormalizedMessage> {
    let from_raw = payload.get("from").and_then(|v| v.as_str())?;
    let from: Mailbox = match from_raw.parse() {
        Ok(m) => m,
        Err(e) => {
            debug!("email: unparseable sender {from_raw:?}: {e}");
            return None;
        }
    };

    let text = payload
        .get("text")
        .or_else(|| payload.get("body"))
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|t| !t.is_empty())?;

    let address = from.email.to_string().to_ascii_lowercase();
    let mut normalized = NormalizedMessage::text(ChannelType::Email, address, text);
    if let Some(name) = from.name.filter(|n| !n.is_empty()) {
        normalized = normalized.with_contact_name(name);
    }
    if let Some(id) = payload.get("message_id").and_then(|v| v.as_str()) {
        normalized = normalized.with_native_id(id);
    }
    let subject = payload
        .get("subject")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    if let Some(subject) = subject {
        normalized = normalized.with_subject(subject);
    }
    let to = payload
        .get("to")
        .and_then(|v| v.as_str())
        .and_then(|raw| raw.parse::<Mailbox>().ok());
    if let Some(to) = to {
        normalized = normalized.with_recipient_account(to.email.to_string().to_ascii_lowercase());
    }
    Some(normalized)
}
