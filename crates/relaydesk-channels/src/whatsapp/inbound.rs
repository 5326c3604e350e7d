use relaydesk_common::{ChannelType, NormalizedMessage};
use serde_json::Value;
use tracing::debug;

/// Flatten a Cloud API notification into text messages.
///
/// Shape: `{ "entry": [{ "changes": [{ "value": {...} }] }] }`, the value
/// holding `metadata`, `contacts` and `messages`.
/// Status updates and non-text messages are skipped.
pub fn parse_notification(body: &Value) -> Vec<NormalizedMessage> {
    let Some(entries) = body.get("entry").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for entry in entries {
        let Some(changes) = entry.get("changes").and_then(|v| v.as_array()) else {
            continue;
        };

        for change in changes {
            let Some(value) = change.get("value") else {
                continue;
            };

            let phone_number_id = value
                .get("metadata")
                .and_then(|m| m.get("phone_number_id"))
                .and_then(|v| v.as_str());

            let Some(messages) = value.get("messages").and_then(|v| v.as_array()) else {
                continue;
            };
            let contacts = value.get("contacts").and_then(|v| v.as_array());

            for msg in messages {
                if let Some(normalized) = parse_message(msg, contacts, phone_number_id) {
                    out.push(normalized);
                }
            }
        }
    }
    out
}

fn parse_message(
    msg: &Value,
    contacts: Option<&Vec<Value>>,
    phone_number_id: Option<&str>,
) -> Option<NormalizedMessage> {
    let msg_type = msg.get("type").and_then(|v| v.as_str()).unwrap_or("");
    if msg_type != "text" {
        debug!("whatsapp: skipping {msg_type} message");
        return None;
    }

    let from = msg.get("from").and_then(|v| v.as_str())?;
    let text = msg
        .get("text")
        .and_then(|v| v.get("body"))
        .and_then(|v| v.as_str())?;
    if from.is_empty() || text.trim().is_empty() {
        return None;
    }

    let mut normalized = NormalizedMessage::text(ChannelType::WhatsApp, from, text).sent_at_unix(
        msg.get("timestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok()),
    );
    if let Some(id) = msg.get("id").and_then(|v| v.as_str()) {
        normalized = normalized.with_native_id(id);
    }
    if let Some(account) = phone_number_id {
        normalized = normalized.with_recipient_account(account);
    }

    let profile_name = contacts.and_then(|c| {
        c.iter().find_map(|contact| {
            let wa_id = contact.get("wa_id").and_then(|v| v.as_str())?;
            if wa_id != from {
                return None;
            }
            contact
                .get("profile")
                .and_then(|p| p.get("name"))
                .and_then(|v| v.as_str())
        })
    });
    if let Some(name) = profile_name {
        normalized = normalized.with_contact_name(name);
    }

    Some(normalized)
}
