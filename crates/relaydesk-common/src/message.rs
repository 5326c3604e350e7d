use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// External messaging surface a customer talks to us through.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    WhatsApp,
    Telegram,
    Messenger,
    Email,
}

impl ChannelType {
    pub const ALL: [ChannelType; 4] = [
        ChannelType::WhatsApp,
        ChannelType::Telegram,
        ChannelType::Messenger,
        ChannelType::Email,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WhatsApp => "whatsapp",
            Self::Telegram => "telegram",
            Self::Messenger => "messenger",
            Self::Email => "email",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "whatsapp" => Ok(Self::WhatsApp),
            "telegram" => Ok(Self::Telegram),
            "messenger" | "facebook" => Ok(Self::Messenger),
            "email" => Ok(Self::Email),
            other => Err(Error::Channel(format!("unknown channel type: {other}"))),
        }
    }
}

/// Who authored a persisted message.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    Customer,
    Agent,
    /// A dashboard operator typing into the conversation.
    Operator,
    System,
}

impl SenderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Agent => "agent",
            Self::Operator => "operator",
            Self::System => "system",
        }
    }
}

impl FromStr for SenderRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customer" => Ok(Self::Customer),
            "agent" => Ok(Self::Agent),
            "operator" => Ok(Self::Operator),
            "system" => Ok(Self::System),
            other => Err(Error::Database(format!("unknown sender role: {other}"))),
        }
    }
}

/// Channel-independent shape of one inbound customer message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedMessage {
    pub channel_type: ChannelType,
    /// Phone number, chat id, page-scoped user id or email address of the customer.
    pub external_sender_id: String,
    pub text: String,
    /// Provider-assigned id, used to drop redelivered webhooks.
    pub native_message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub contact_name: Option<String>,
    /// Provider-side account the message was addressed to (phone number id,
    /// page id, bot id, inbox address).
    pub recipient_account: Option<String>,
    /// Email subject line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

impl NormalizedMessage {
    pub fn text(
        channel_type: ChannelType,
        external_sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            channel_type,
            external_sender_id: external_sender_id.into(),
            text: text.into(),
            native_message_id: None,
            timestamp: Utc::now(),
            contact_name: None,
            recipient_account: None,
            subject: None,
        }
    }

    pub fn with_native_id(mut self, id: impl Into<String>) -> Self {
        self.native_message_id = Some(id.into());
        self
    }

    pub fn with_recipient_account(mut self, account: impl Into<String>) -> Self {
        self.recipient_account = Some(account.into());
        self
    }

    pub fn with_contact_name(mut self, name: impl Into<String>) -> Self {
        self.contact_name = Some(name.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Subject for an answer in the same thread: `Re: <subject>`, without
    /// stacking prefixes.
    pub fn reply_subject(&self) -> Option<String> {
        let subject = self.subject.as_deref()?.trim();
        if subject.is_empty() {
            return None;
        }
        let prefixed = subject
            .get(..3)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("re:"));
        Some(if prefixed {
            subject.to_string()
        } else {
            format!("Re: {subject}")
        })
    }

    /// Use the provider's send time when it is a valid unix timestamp.
    pub fn sent_at_unix(mut self, secs: Option<i64>) -> Self {
        if let Some(at) = secs.and_then(|s| DateTime::from_timestamp(s, 0)) {
            self.timestamp = at;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_type_parses_facebook_alias() {
        assert_eq!("facebook".parse::<ChannelType>().unwrap(), ChannelType::Messenger);
        assert_eq!("whatsapp".parse::<ChannelType>().unwrap(), ChannelType::WhatsApp);
        assert!("sms".parse::<ChannelType>().is_err());
    }

    #[test]
    fn reply_subject_prefixes_once() {
        let email = |subject: &str| {
            NormalizedMessage::text(ChannelType::Email, "ana@example.com", "hi")
                .with_subject(subject)
        };
        assert_eq!(email("Order 118").reply_subject().as_deref(), Some("Re: Order 118"));
        assert_eq!(email("RE: Order 118").reply_subject().as_deref(), Some("RE: Order 118"));
        assert_eq!(email("   ").reply_subject(), None);
        let plain = NormalizedMessage::text(ChannelType::Telegram, "42", "hi");
        assert_eq!(plain.reply_subject(), None);
    }

    #[test]
    fn channel_type_serializes_lowercase() {
        let json = serde_json::to_string(&ChannelType::WhatsApp).unwrap();
        assert_eq!(json, "\"whatsapp\"");
    }
}
