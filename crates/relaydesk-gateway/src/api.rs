use axum::Json;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use relaydesk_common::{AgentId, ConversationId, Error, TenantId};
use relaydesk_db::{
    AgentUpdate, ChannelAccount, ConversationStatus, NewAgent, NewAuditEntry, NewTenant, Tenant,
};
use relaydesk_security::Claims;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::error::ApiError;
use crate::state::{AppState, SharedState};
use crate::webhooks::client_info;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

/// Caller identity taken from a verified `Authorization: Bearer` token.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub claims: Claims,
    ip_address: Option<String>,
    user_agent: Option<String>,
}

impl FromRequestParts<SharedState> for AuthContext {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let (ip_address, user_agent) = client_info(&parts.headers);
        let verified = bearer_token(&parts.headers)
            .ok_or_else(|| Error::Authentication("missing bearer token".into()))
            .and_then(|token| state.tokens.verify(token));

        match verified {
            Ok(claims) => Ok(Self {
                claims,
                ip_address,
                user_agent,
            }),
            Err(e) => {
                state.audit.authentication_failed("rest", &e.to_string(), ip_address, user_agent);
                Err(e.into())
            }
        }
    }
}

impl AuthContext {
    /// The caller's tenant, which must be an active, non-admin account.
    fn tenant(&self, state: &AppState) -> Result<TenantId, ApiError> {
        let tenant = self.current(state)?;
        if tenant.is_admin() {
            return Err(ApiError::Forbidden("admins have no tenant data".into()));
        }
        Ok(tenant.id)
    }

    fn require_admin(&self, state: &AppState) -> Result<TenantId, ApiError> {
        let tenant = self.current(state)?;
        if !tenant.is_admin() {
            return Err(ApiError::Forbidden("admin role required".into()));
        }
        Ok(tenant.id)
    }

    fn current(&self, state: &AppState) -> Result<Tenant, ApiError> {
        let tenant = state
            .router
            .get_tenant(self.claims.sub)
            .map_err(|e| match e {
                Error::TenantNotFound(_) => Error::Authentication("unknown account".into()),
                other => other,
            })?;
        if !tenant.active {
            return Err(ApiError::Forbidden("account is deactivated".into()));
        }
        Ok(tenant)
    }

    fn audit(&self, state: &AppState, entry: NewAuditEntry) {
        let mut entry = entry.actor(self.claims.sub);
        entry.ip_address = self.ip_address.clone();
        entry.user_agent = self.user_agent.clone();
        state.audit.record(entry);
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub status: Option<ConversationStatus>,
    #[serde(default)]
    pub unresolved: Option<bool>,
}

impl ListParams {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

// --- Tenant endpoints ---

/// GET /api/agents
pub async fn list_agents(
    State(state): State<SharedState>,
    auth: AuthContext,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = auth.tenant(&state)?;
    let agents = state.router.route(tenant)?.list_agents()?;
    Ok(Json(json!({ "agents": agents })))
}

/// POST /api/agents
pub async fn create_agent(
    State(state): State<SharedState>,
    auth: AuthContext,
    Json(body): Json<NewAgent>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = auth.tenant(&state)?;
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("agent name is required".into()));
    }

    let agent = state.router.route(tenant)?.create_agent(&body)?;
    auth.audit(
        &state,
        NewAuditEntry::new("agent_created", "agent")
            .resource(agent.id)
            .change(None, serde_json::to_value(&agent).ok()),
    );
    state.hub.emit_agent_update(tenant, &agent);
    Ok((StatusCode::CREATED, Json(agent)))
}

/// PUT /api/agents/{id}
pub async fn update_agent(
    State(state): State<SharedState>,
    auth: AuthContext,
    Path(agent_id): Path<i64>,
    Json(body): Json<AgentUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = auth.tenant(&state)?;
    let db = state.router.route(tenant)?;
    let agent_id = AgentId(agent_id);

    let before = db
        .get_agent(agent_id)?
        .ok_or_else(|| Error::NotFound(format!("agent {agent_id}")))?;
    let agent = db
        .update_agent(agent_id, &body)?
        .ok_or_else(|| Error::NotFound(format!("agent {agent_id}")))?;

    auth.audit(
        &state,
        NewAuditEntry::new("agent_updated", "agent")
            .resource(agent_id)
            .change(serde_json::to_value(&before).ok(), serde_json::to_value(&agent).ok()),
    );
    state.hub.emit_agent_update(tenant, &agent);
    Ok(Json(agent))
}

/// GET /api/conversations
pub async fn list_conversations(
    State(state): State<SharedState>,
    auth: AuthContext,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = auth.tenant(&state)?;
    let conversations = state
        .router
        .route(tenant)?
        .list_conversations(params.status, params.limit())?;
    Ok(Json(json!({ "conversations": conversations })))
}

/// GET /api/conversations/{id}/messages
pub async fn conversation_messages(
    State(state): State<SharedState>,
    auth: AuthContext,
    Path(conversation_id): Path<i64>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = auth.tenant(&state)?;
    let db = state.router.route(tenant)?;
    let conversation_id = ConversationId(conversation_id);
    if db.get_conversation(conversation_id)?.is_none() {
        return Err(Error::NotFound(format!("conversation {conversation_id}")).into());
    }
    let messages = db.list_messages(conversation_id, params.limit())?;
    Ok(Json(json!({
        "conversation_id": conversation_id,
        "messages": messages,
    })))
}

/// POST /api/conversations/{id}/archive
pub async fn archive_conversation(
    State(state): State<SharedState>,
    auth: AuthContext,
    Path(conversation_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = auth.tenant(&state)?;
    let db = state.router.route(tenant)?;
    let conversation_id = ConversationId(conversation_id);
    if db.get_conversation(conversation_id)?.is_none() {
        return Err(Error::NotFound(format!("conversation {conversation_id}")).into());
    }

    let archived = db.archive_conversation(conversation_id)?;
    if archived {
        auth.audit(
            &state,
            NewAuditEntry::new("conversation_archived", "conversation").resource(conversation_id),
        );
        state.hub.emit_conversation_updated(
            tenant,
            conversation_id,
            json!({ "status": ConversationStatus::Archived }),
        );
    }
    Ok(Json(json!({ "conversation_id": conversation_id, "archived": archived })))
}

// --- Admin endpoints ---

#[derive(Debug, Serialize)]
pub struct CreatedTenant {
    pub tenant: Tenant,
    pub token: String,
}

/// POST /api/admin/tenants
pub async fn create_tenant(
    State(state): State<SharedState>,
    auth: AuthContext,
    Json(body): Json<NewTenant>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_admin(&state)?;
    if !body.email.contains('@') {
        return Err(ApiError::BadRequest("a valid email is required".into()));
    }

    let tenant = state.router.provision(&body)?;
    let token = state.tokens.issue(tenant.id, tenant.role.as_str())?;
    auth.audit(
        &state,
        NewAuditEntry::new("tenant_created", "tenant")
            .resource(tenant.id)
            .change(None, Some(json!({ "email": tenant.email, "role": tenant.role }))),
    );
    info!("tenant {} provisioned", tenant.id);
    Ok((StatusCode::CREATED, Json(CreatedTenant { tenant, token })))
}

/// POST /api/admin/tenants/{id}/deactivate
pub async fn deactivate_tenant(
    State(state): State<SharedState>,
    auth: AuthContext,
    Path(tenant_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_admin(&state)?;
    let tenant_id = TenantId(tenant_id);
    state.router.deactivate(tenant_id)?;
    auth.audit(
        &state,
        NewAuditEntry::new("tenant_deactivated", "tenant")
            .resource(tenant_id)
            .change(Some(json!({ "active": true })), Some(json!({ "active": false }))),
    );
    Ok(Json(json!({ "tenant_id": tenant_id, "active": false })))
}

/// DELETE /api/admin/tenants/{id}
pub async fn delete_tenant(
    State(state): State<SharedState>,
    auth: AuthContext,
    Path(tenant_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = auth.require_admin(&state)?;
    let tenant_id = TenantId(tenant_id);
    if tenant_id == admin {
        return Err(ApiError::BadRequest("cannot delete your own account".into()));
    }
    state.router.drop_tenant(tenant_id)?;
    auth.audit(&state, NewAuditEntry::new("tenant_deleted", "tenant").resource(tenant_id));
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/admin/channel-accounts
pub async fn provision_channel_account(
    State(state): State<SharedState>,
    auth: AuthContext,
    Json(body): Json<ChannelAccount>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_admin(&state)?;
    if body.account_id.trim().is_empty() {
        return Err(ApiError::BadRequest("account_id is required".into()));
    }

    let owner = state.router.get_tenant(body.tenant_id)?;
    if owner.is_admin() {
        return Err(ApiError::BadRequest("channel accounts belong to user tenants".into()));
    }
    if let Some(agent_id) = body.agent_id {
        if state.router.route(owner.id)?.get_agent(agent_id)?.is_none() {
            return Err(Error::NotFound(format!("agent {agent_id}")).into());
        }
    }

    state.router.shared().upsert_channel_account(&body)?;
    auth.audit(
        &state,
        NewAuditEntry::new("channel_account_provisioned", "channel_account")
            .resource(format!("{}:{}", body.channel_type, body.account_id))
            .change(None, serde_json::to_value(&body).ok()),
    );
    Ok((StatusCode::CREATED, Json(body)))
}

/// GET /api/admin/alerts
pub async fn list_alerts(
    State(state): State<SharedState>,
    auth: AuthContext,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_admin(&state)?;
    let alerts = state
        .router
        .shared()
        .list_alerts(params.unresolved.unwrap_or(false), params.limit())?;
    Ok(Json(json!({ "alerts": alerts })))
}

/// POST /api/admin/alerts/{id}/resolve
pub async fn resolve_alert(
    State(state): State<SharedState>,
    auth: AuthContext,
    Path(alert_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = auth.require_admin(&state)?;
    let alert = state
        .audit
        .resolve_alert(alert_id, admin)?
        .ok_or_else(|| Error::NotFound(format!("alert {alert_id}")))?;
    Ok(Json(alert))
}

/// GET /api/admin/audit-logs
pub async fn audit_logs(
    State(state): State<SharedState>,
    auth: AuthContext,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_admin(&state)?;
    let entries = state.router.shared().list_audit(params.limit())?;
    Ok(Json(json!({ "audit_logs": entries })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_token_requires_scheme() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_none());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));
    }

    #[test]
    fn list_limit_is_clamped() {
        let params = ListParams {
            limit: Some(10_000),
            status: None,
            unresolved: None,
        };
        assert_eq!(params.limit(), MAX_LIMIT);

        let params = ListParams {
            limit: None,
            status: None,
            unresolved: None,
        };
        assert_eq!(params.limit(), DEFAULT_LIMIT);
    }
}
