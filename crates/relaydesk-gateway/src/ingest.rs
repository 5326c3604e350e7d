use std::sync::Arc;

use relaydesk_channels::{SendOptions, send_with_retry};
use relaydesk_common::{
    AgentId, ChannelType, ConversationId, Error, NormalizedMessage, Result, SenderRole, TenantId,
};
use relaydesk_db::{Agent, Alert, NewAlert, NewMessage, Severity, StoredMessage, TenantDb};
use relaydesk_security::InputValidator;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::audit::FailureKind;
use crate::state::{AppState, SharedState};

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Could not be routed or stored.
    Dropped,
    /// Already processed once.
    Duplicate,
    /// Stored without an agent reply.
    Stored,
    /// An agent reply was stored; `delivered` tells whether the channel took it.
    Replied { delivered: bool },
}

/// Run every message of a webhook delivery in its own task. A failure in one
/// never affects the others.
pub async fn process_batch(
    state: SharedState,
    messages: Vec<NormalizedMessage>,
) -> Vec<IngestOutcome> {
    let handles: Vec<_> = messages
        .into_iter()
        .map(|message| {
            let state = Arc::clone(&state);
            tokio::spawn(async move { process(&state, message).await })
        })
        .collect();

    futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| {
            joined.unwrap_or_else(|e| {
                error!("ingest task panicked: {e}");
                IngestOutcome::Dropped
            })
        })
        .collect()
}

/// Route, store, answer and deliver one inbound message. Errors are logged,
/// counted and alerted here; nothing propagates to the caller.
#[instrument(skip(state, inbound), fields(channel = %inbound.channel_type))]
pub async fn process(state: &AppState, inbound: NormalizedMessage) -> IngestOutcome {
    let resolution = match state.resolver.resolve(&inbound) {
        Ok(resolution) => resolution,
        Err(e) => {
            let payload = serde_json::to_value(&inbound)
                .map(|v| InputValidator::redact(&v))
                .unwrap_or_default();
            error!("failed to resolve inbound message: {e}; payload={payload}");
            if matches!(e, Error::Database(_)) {
                state.audit.raise_alert(NewAlert {
                    alert_type: "ingest_failure".into(),
                    severity: Severity::Error,
                    title: format!("Inbound {} message could not be stored", inbound.channel_type),
                    message: e.to_string(),
                    metadata: json!({ "channel": inbound.channel_type }),
                });
            }
            return IngestOutcome::Dropped;
        }
    };

    let tenant_id = resolution.tenant_id;
    if resolution.duplicate {
        debug!("dropping redelivered message {:?}", inbound.native_message_id);
        return IngestOutcome::Duplicate;
    }
    state.hub.emit_new_message(tenant_id, &resolution.message);

    let adapter = state.channels.get(inbound.channel_type);
    if let Some(adapter) = &adapter {
        if let Err(e) = adapter.acknowledge(&inbound).await {
            debug!("acknowledge failed on {}: {e}", inbound.channel_type);
        }
    }

    let db = match state.router.route(tenant_id) {
        Ok(db) => db,
        Err(e) => {
            error!("tenant {tenant_id} database unavailable: {e}");
            return IngestOutcome::Stored;
        }
    };

    let agent = match active_agent(&db, resolution.agent_id) {
        Ok(Some(agent)) => agent,
        Ok(None) => {
            debug!("conversation {} has no active agent", resolution.conversation_id);
            return IngestOutcome::Stored;
        }
        Err(e) => {
            error!("failed to load agent for tenant {tenant_id}: {e}");
            return IngestOutcome::Stored;
        }
    };

    let conversation_id = resolution.conversation_id;
    let reply = match generate_reply(state, tenant_id, &db, &agent, conversation_id).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!("no reply for conversation {conversation_id}: {e}");
            return IngestOutcome::Stored;
        }
    };
    state.hub.emit_new_message(tenant_id, &reply);

    let delivered = deliver(state, tenant_id, &inbound, &reply.content).await;
    IngestOutcome::Replied { delivered }
}

fn active_agent(db: &TenantDb, agent_id: Option<AgentId>) -> Result<Option<Agent>> {
    let Some(agent_id) = agent_id else {
        return Ok(None);
    };
    Ok(db.get_agent(agent_id)?.filter(|a| a.active))
}

/// Generate `agent`'s answer to the conversation and store it. A generation
/// failure is counted and replaced by the configured fallback text when there
/// is one; otherwise the error is returned.
pub(crate) async fn generate_reply(
    state: &AppState,
    tenant_id: TenantId,
    db: &TenantDb,
    agent: &Agent,
    conversation_id: ConversationId,
) -> Result<StoredMessage> {
    let history = db.list_messages(conversation_id, state.config.routing.history_limit)?;

    let (content, response_time_ms) = match state.agents.generate(agent, &history).await {
        Ok(reply) => {
            debug!(
                "{} ({}) answered in {}ms",
                reply.provider, reply.model, reply.response_time_ms
            );
            (reply.text, Some(reply.response_time_ms))
        }
        Err(e) => {
            let scope = agent.provider.as_deref().unwrap_or("default");
            if let Some(alert) =
                state
                    .failures
                    .record(tenant_id, FailureKind::Generation, scope, &e.to_string())
            {
                notify_alert(state, tenant_id, &alert);
            }
            match state.config.agent.fallback_reply.clone() {
                Some(fallback) => (fallback, None),
                None => return Err(e),
            }
        }
    };

    let mut new = NewMessage::new(conversation_id, SenderRole::Agent, content);
    new.response_time_ms = response_time_ms;
    Ok(db.insert_message(&new)?.into_message())
}

async fn deliver(
    state: &AppState,
    tenant_id: TenantId,
    inbound: &NormalizedMessage,
    content: &str,
) -> bool {
    let channel = inbound.channel_type;
    let Some(adapter) = state.channels.get(channel) else {
        record_delivery_failure(state, tenant_id, channel, "no adapter configured");
        return false;
    };

    let options = send_options(inbound);
    match send_with_retry(
        adapter.as_ref(),
        &inbound.external_sender_id,
        content,
        &options,
        &state.retry,
    )
    .await
    {
        Ok(result) => {
            info!(
                "delivered reply on {channel} for tenant {tenant_id} ({:?})",
                result.provider_message_id
            );
            true
        }
        Err(e) => {
            error!("delivery on {channel} failed for tenant {tenant_id}: {e}");
            record_delivery_failure(state, tenant_id, channel, &e.to_string());
            false
        }
    }
}

/// Reply from the account the customer wrote to, threaded on their message.
fn send_options(inbound: &NormalizedMessage) -> SendOptions {
    SendOptions {
        account: inbound.recipient_account.clone(),
        reply_to: inbound.native_message_id.clone(),
        subject: inbound.reply_subject(),
    }
}

fn record_delivery_failure(
    state: &AppState,
    tenant_id: TenantId,
    channel: ChannelType,
    detail: &str,
) {
    if let Some(alert) = state
        .failures
        .record(tenant_id, FailureKind::Delivery, channel.as_str(), detail)
    {
        notify_alert(state, tenant_id, &alert);
    }
}

fn notify_alert(state: &AppState, tenant_id: TenantId, alert: &Alert) {
    state.hub.emit_notification(
        tenant_id,
        json!({
            "type": "alert",
            "alert": alert,
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_reply_keeps_the_thread_subject() {
        let inbound = NormalizedMessage::text(ChannelType::Email, "ana@example.com", "Where?")
            .with_native_id("<abc@example.com>")
            .with_recipient_account("support@acme.test")
            .with_subject("Order 118");

        let options = send_options(&inbound);
        assert_eq!(options.subject.as_deref(), Some("Re: Order 118"));
        assert_eq!(options.reply_to.as_deref(), Some("<abc@example.com>"));
        assert_eq!(options.account.as_deref(), Some("support@acme.test"));
    }

    #[test]
    fn chat_replies_carry_no_subject() {
        let inbound = NormalizedMessage::text(ChannelType::WhatsApp, "15550001", "hi");
        assert!(send_options(&inbound).subject.is_none());
    }
}
