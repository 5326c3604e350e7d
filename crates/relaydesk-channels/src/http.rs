use relaydesk_common::{ChannelType, Error};
use reqwest::{Response, StatusCode};
use tracing::{info, warn};

/// 429 and 5xx may succeed on retry; other 4xx will not.
pub(crate) fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

pub(crate) fn transport_error(channel: ChannelType, op: &str, e: reqwest::Error) -> Error {
    Error::delivery(channel.as_str(), format!("{op} failed: {e}"), true)
}

/// Turn a non-2xx provider response into a `Delivery` error carrying its body.
pub(crate) async fn provider_error(channel: ChannelType, op: &str, resp: Response) -> Error {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    warn!("{channel} {op} error {status}: {body}");
    Error::delivery(
        channel.as_str(),
        format!("{op} returned {status}: {body}"),
        is_transient_status(status),
    )
}

/// Base URLs end up joined with `/path`, so drop any trailing slash.
pub(crate) fn trim_base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

/// Meta `hub.*` subscription handshake shared by WhatsApp and Messenger.
pub(crate) fn verify_meta_challenge(
    channel: ChannelType,
    expected: Option<&str>,
    mode: &str,
    token: &str,
    challenge: &str,
) -> relaydesk_common::Result<String> {
    if mode != "subscribe" {
        return Err(Error::VerificationFailed("invalid hub.mode".into()));
    }
    let Some(expected) = expected else {
        return Err(Error::VerificationFailed(
            "no verify token configured".into(),
        ));
    };
    if !relaydesk_security::secrets_match(expected, Some(token)) {
        warn!("{channel}: webhook verification failed, token mismatch");
        return Err(Error::VerificationFailed("invalid verify token".into()));
    }
    info!("{channel}: webhook verified");
    Ok(challenge.to_string())
}
