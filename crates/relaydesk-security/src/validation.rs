use regex::Regex;
use relaydesk_common::{Error, Result};
use serde_json::Value;
use std::sync::LazyLock;

const REDACTED: &str = "[redacted]";
const MAX_EXTERNAL_ID_LEN: usize = 256;
const MAX_MESSAGE_LEN: usize = 16 * 1024;

/// Object keys whose values never reach the logs.
const SECRET_KEYS: &[&str] = &[
    "access_token",
    "api_key",
    "app_secret",
    "authorization",
    "bot_token",
    "page_access_token",
    "password",
    "secret",
    "smtp_password",
    "token",
    "verify_token",
];

static BEARER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/=-]+").ok());

/// Input validation, sanitization and log redaction.
pub struct InputValidator;

impl InputValidator {
    /// Check for potential prompt injection patterns.
    pub fn check_prompt_injection(input: &str) -> bool {
        let patterns = [
            "ignore previous instructions",
            "ignore all previous",
            "disregard your instructions",
            "you are now",
            "new instructions:",
            "system prompt:",
        ];

        let lower = input.to_lowercase();
        patterns.iter().any(|p| lower.contains(p))
    }

    /// Strip control characters and cap the length of inbound text.
    pub fn sanitize(input: &str) -> String {
        input
            .chars()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
            .take(MAX_MESSAGE_LEN)
            .collect()
    }

    /// Validate a channel-side sender id (phone number, chat id, PSID, address).
    pub fn validate_external_id(id: &str) -> Result<()> {
        if id.trim().is_empty() {
            return Err(Error::Channel("external id cannot be empty".into()));
        }
        if id.len() > MAX_EXTERNAL_ID_LEN {
            return Err(Error::Channel("external id too long".into()));
        }
        if id.chars().any(char::is_control) {
            return Err(Error::Channel("external id contains control characters".into()));
        }
        Ok(())
    }

    /// Copy of `value` with secret-looking fields and bearer tokens masked.
    pub fn redact(value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| {
                        let masked = if is_secret_key(k) {
                            Value::String(REDACTED.to_string())
                        } else {
                            Self::redact(v)
                        };
                        (k.clone(), masked)
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(Self::redact).collect()),
            Value::String(s) => Value::String(Self::redact_str(s)),
            other => other.clone(),
        }
    }

    pub fn redact_str(input: &str) -> String {
        match BEARER.as_ref() {
            Some(re) => re.replace_all(input, "Bearer [redacted]").into_owned(),
            None => input.to_string(),
        }
    }
}

fn is_secret_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SECRET_KEYS.iter().any(|k| lower == *k || lower.ends_with(&format!("_{k}")))
}
