//! Dashboard WebSocket.
//!
//! Every frame in both directions is a JSON text frame:
//! ```json
//! {"event": "join_conversation", "data": {"conversation_id": 12}}
//! ```
//! A connection must send `authenticate` before anything else is accepted.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use relaydesk_common::{
    AgentId, ConnectionId, ConversationId, Error, Result, SenderRole, TenantId,
};
use relaydesk_db::{Conversation, NewMessage, TenantDb};
use relaydesk_security::InputValidator;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::hub::events;
use crate::ingest;
use crate::state::{AppState, SharedState, today_start};
use crate::webhooks::client_info;

const OUTBOUND_QUEUE: usize = 64;
const DEFAULT_PAGE: usize = 50;

/// Client -> server frame.
#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct AuthenticatePayload {
    user_id: i64,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ConversationPayload {
    conversation_id: i64,
}

#[derive(Debug, Deserialize)]
struct SendMessagePayload {
    conversation_id: i64,
    #[serde(alias = "content")]
    text: String,
    #[serde(default)]
    agent_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct MessagesPayload {
    conversation_id: i64,
    #[serde(default)]
    limit: Option<usize>,
}

/// Where a socket connected from, for the audit trail.
#[derive(Debug, Clone, Default)]
struct Peer {
    ip_address: Option<String>,
    user_agent: Option<String>,
}

/// GET /ws
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Response {
    let (ip_address, user_agent) = client_info(&headers);
    let peer = Peer {
        ip_address,
        user_agent,
    };
    ws.on_upgrade(|socket| handle_socket(socket, state, peer))
}

async fn handle_socket(socket: WebSocket, state: SharedState, peer: Peer) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    let conn = state.hub.register(tx);
    info!("dashboard connected: {conn}");

    let sender_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    state
        .hub
        .send_to(&conn, events::CONNECTED, json!({ "connection_id": conn.as_str() }));

    // One event at a time per connection.
    while let Some(Ok(msg)) = ws_receiver.next().await {
        match msg {
            Message::Text(text) => {
                let envelope: Envelope = match serde_json::from_str(text.as_str()) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!("invalid WebSocket frame from {conn}: {e}");
                        emit_error(&state, &conn, "invalid frame");
                        continue;
                    }
                };
                handle_event(&state, &conn, &peer, envelope).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.hub.disconnect(&conn);
    sender_task.abort();
    info!("dashboard disconnected: {conn}");
}

async fn handle_event(state: &AppState, conn: &ConnectionId, peer: &Peer, envelope: Envelope) {
    debug!("ws event {} from {conn}", envelope.event);

    if envelope.event == "authenticate" {
        authenticate(state, conn, peer, envelope.data);
        return;
    }

    let Some(tenant) = state.hub.tenant_of(conn) else {
        emit_error(state, conn, "authentication required");
        return;
    };

    let result = match envelope.event.as_str() {
        "join_conversation" => join_conversation(state, conn, tenant, envelope.data),
        "leave_conversation" => leave_conversation(state, conn, envelope.data),
        "send_message" => send_message(state, conn, tenant, envelope.data).await,
        "typing_start" => typing(state, conn, tenant, envelope.data, true),
        "typing_stop" => typing(state, conn, tenant, envelope.data, false),
        "get_conversation_messages" => conversation_messages(state, conn, tenant, envelope.data),
        "get_real_time_metrics" => real_time_metrics(state, conn, tenant),
        other => Err(Error::Gateway(format!("unknown event: {other}"))),
    };

    if let Err(e) = result {
        debug!("ws event {} failed for {conn}: {e}", envelope.event);
        emit_error(state, conn, &e.to_string());
    }
}

fn authenticate(state: &AppState, conn: &ConnectionId, peer: &Peer, data: Value) {
    match check_credentials(state, data) {
        Ok(tenant) => {
            state.hub.bind_tenant(conn, tenant);
            info!("{conn} authenticated as tenant {tenant}");
            state.audit.login(
                tenant,
                "websocket",
                peer.ip_address.clone(),
                peer.user_agent.clone(),
            );
            state
                .hub
                .send_to(conn, events::AUTHENTICATED, json!({ "user_id": tenant }));
        }
        Err(e) => {
            state.audit.authentication_failed(
                "websocket",
                &e.to_string(),
                peer.ip_address.clone(),
                peer.user_agent.clone(),
            );
            state.hub.send_to(
                conn,
                events::AUTHENTICATION_ERROR,
                json!({ "message": "invalid credentials" }),
            );
        }
    }
}

fn check_credentials(state: &AppState, data: Value) -> Result<TenantId> {
    let payload: AuthenticatePayload = parse(data)?;
    let claims = state.tokens.verify(&payload.token)?;
    if claims.sub != TenantId(payload.user_id) {
        return Err(Error::Authentication("token does not belong to this user".into()));
    }
    let tenant = state.router.get_tenant(claims.sub)?;
    if !tenant.active {
        return Err(Error::Authentication(format!("tenant {} is inactive", tenant.id)));
    }
    Ok(tenant.id)
}

fn join_conversation(
    state: &AppState,
    conn: &ConnectionId,
    tenant: TenantId,
    data: Value,
) -> Result<()> {
    let payload: ConversationPayload = parse(data)?;
    let conversation = ConversationId(payload.conversation_id);
    let db = state.router.route(tenant)?;
    require_conversation(&db, conversation)?;
    state.hub.join(conn, conversation);
    debug!("{conn} joined conversation {conversation}");
    Ok(())
}

fn leave_conversation(state: &AppState, conn: &ConnectionId, data: Value) -> Result<()> {
    let payload: ConversationPayload = parse(data)?;
    state.hub.leave(conn, ConversationId(payload.conversation_id));
    Ok(())
}

/// Store the operator's text, then answer it with the agent, emitting both
/// messages to the room in that order.
async fn send_message(
    state: &AppState,
    conn: &ConnectionId,
    tenant: TenantId,
    data: Value,
) -> Result<()> {
    let payload: SendMessagePayload = parse(data)?;
    let conversation_id = ConversationId(payload.conversation_id);
    let text = InputValidator::sanitize(&payload.text);
    if text.trim().is_empty() {
        return Err(Error::Gateway("message text is empty".into()));
    }

    let db = state.router.route(tenant)?;
    let conversation = require_conversation(&db, conversation_id)?;
    if !state.hub.in_room(conn, conversation_id) {
        state.hub.join(conn, conversation_id);
    }

    let operator_message = db
        .insert_message(&NewMessage::new(conversation_id, SenderRole::Operator, text))?
        .into_message();
    state.hub.emit_new_message(tenant, &operator_message);

    let agent_id = payload
        .agent_id
        .map(AgentId)
        .or(conversation.agent_id);
    let agent = match agent_id {
        Some(id) => db.get_agent(id)?,
        None => db.default_agent()?,
    }
    .filter(|a| a.active)
    .ok_or_else(|| Error::NotFound("no active agent for this conversation".into()))?;

    let reply = ingest::generate_reply(state, tenant, &db, &agent, conversation_id).await?;
    state.hub.emit_new_message(tenant, &reply);
    Ok(())
}

fn typing(
    state: &AppState,
    conn: &ConnectionId,
    tenant: TenantId,
    data: Value,
    is_typing: bool,
) -> Result<()> {
    let payload: ConversationPayload = parse(data)?;
    let conversation = ConversationId(payload.conversation_id);
    state.hub.emit_to_conversation(
        tenant,
        conversation,
        events::USER_TYPING,
        json!({
            "conversation_id": conversation,
            "user_id": tenant,
            "is_typing": is_typing,
        }),
        Some(conn),
    );
    Ok(())
}

fn conversation_messages(
    state: &AppState,
    conn: &ConnectionId,
    tenant: TenantId,
    data: Value,
) -> Result<()> {
    let payload: MessagesPayload = parse(data)?;
    let conversation_id = ConversationId(payload.conversation_id);
    let db = state.router.route(tenant)?;
    require_conversation(&db, conversation_id)?;

    let limit = payload.limit.unwrap_or(DEFAULT_PAGE).clamp(1, 500);
    let messages = db.list_messages(conversation_id, limit)?;
    state.hub.send_to(
        conn,
        events::CONVERSATION_MESSAGES,
        json!({ "conversation_id": conversation_id, "messages": messages }),
    );
    Ok(())
}

fn real_time_metrics(state: &AppState, conn: &ConnectionId, tenant: TenantId) -> Result<()> {
    let metrics = state.router.route(tenant)?.metrics(today_start())?;
    state.hub.send_to(conn, events::REAL_TIME_METRICS, json!(metrics));
    Ok(())
}

fn require_conversation(db: &TenantDb, id: ConversationId) -> Result<Conversation> {
    db.get_conversation(id)?
        .ok_or_else(|| Error::NotFound(format!("conversation {id}")))
}

fn parse<T: DeserializeOwned>(data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| Error::Gateway(format!("invalid payload: {e}")))
}

fn emit_error(state: &AppState, conn: &ConnectionId, message: &str) {
    state
        .hub
        .send_to(conn, events::ERROR, json!({ "message": message }));
}
