use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use relaydesk_channels::{ChannelAdapter, InboundRequest};
use relaydesk_common::{ChannelType, Error};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::ingest;
use crate::state::SharedState;

/// Query string of a Meta subscription handshake.
#[derive(Debug, Deserialize)]
pub struct VerifyParams {
    #[serde(rename = "hub.mode", default)]
    pub mode: String,
    #[serde(rename = "hub.verify_token", default)]
    pub verify_token: String,
    #[serde(rename = "hub.challenge", default)]
    pub challenge: String,
}

/// GET /webhooks/{channel}: echo the challenge when the verify token matches.
pub async fn verify_webhook(
    State(state): State<SharedState>,
    Path(channel): Path<String>,
    Query(params): Query<VerifyParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let adapter = adapter_for(&state, &channel)?;

    match adapter.verify_challenge(&params.mode, &params.verify_token, &params.challenge) {
        Ok(challenge) => {
            info!("{channel} webhook subscription verified");
            Ok((StatusCode::OK, challenge).into_response())
        }
        Err(e) => {
            let (ip, ua) = client_info(&headers);
            state.audit.webhook_rejected(adapter.channel_type().as_str(), &e.to_string(), ip, ua);
            Err(e.into())
        }
    }
}

/// POST /webhooks/{channel}: authenticate, acknowledge with 200 and process
/// the carried messages in the background.
pub async fn receive_webhook(
    State(state): State<SharedState>,
    Path(channel): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let adapter = adapter_for(&state, &channel)?;

    let mut request = InboundRequest::new(body.to_vec());
    for (name, value) in &headers {
        if let Ok(value) = value.to_str() {
            request = request.with_header(name.as_str(), value);
        }
    }

    if let Err(e) = adapter.verify_inbound(&request) {
        let (ip, ua) = client_info(&headers);
        state.audit.webhook_rejected(adapter.channel_type().as_str(), &e.to_string(), ip, ua);
        return Err(e.into());
    }

    let payload: serde_json::Value = match serde_json::from_slice(&request.body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("{channel} webhook body is not JSON, ignoring: {e}");
            return Ok(StatusCode::OK);
        }
    };

    let messages = adapter.normalize_inbound(&payload);
    if messages.is_empty() {
        debug!("{channel} webhook carried no customer messages");
        return Ok(StatusCode::OK);
    }

    debug!("{channel} webhook carried {} message(s)", messages.len());
    tokio::spawn(ingest::process_batch(Arc::clone(&state), messages));
    Ok(StatusCode::OK)
}

fn adapter_for(state: &SharedState, channel: &str) -> Result<Arc<dyn ChannelAdapter>, ApiError> {
    let channel_type: ChannelType = channel.parse()?;
    state
        .channels
        .get(channel_type)
        .ok_or_else(|| Error::NotFound(format!("channel {channel_type} is not configured")).into())
}

/// Caller address and user agent for audit entries.
pub(crate) fn client_info(headers: &HeaderMap) -> (Option<String>, Option<String>) {
    let ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        });
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    (ip, user_agent)
}
