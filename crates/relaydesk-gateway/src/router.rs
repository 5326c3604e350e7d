use axum::extract::State;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::SharedState;
use crate::{api, webhooks, ws};

/// Build the main application router with all routes.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/ws", get(ws::ws_handler))
        .route(
            "/webhooks/{channel}",
            get(webhooks::verify_webhook).post(webhooks::receive_webhook),
        )
        .route("/api/agents", get(api::list_agents).post(api::create_agent))
        .route("/api/agents/{id}", put(api::update_agent))
        .route("/api/conversations", get(api::list_conversations))
        .route(
            "/api/conversations/{id}/messages",
            get(api::conversation_messages),
        )
        .route(
            "/api/conversations/{id}/archive",
            post(api::archive_conversation),
        )
        .route("/api/admin/tenants", post(api::create_tenant))
        .route(
            "/api/admin/tenants/{id}/deactivate",
            post(api::deactivate_tenant),
        )
        .route("/api/admin/tenants/{id}", delete(api::delete_tenant))
        .route(
            "/api/admin/channel-accounts",
            post(api::provision_channel_account),
        )
        .route("/api/admin/alerts", get(api::list_alerts))
        .route("/api/admin/alerts/{id}/resolve", post(api::resolve_alert))
        .route("/api/admin/audit-logs", get(api::audit_logs))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn status(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let routes = match state.router.shared().count_routes() {
        Ok(count) => Some(count),
        Err(e) => {
            tracing::warn!("status: failed to count routes: {e}");
            None
        }
    };
    Json(serde_json::json!({
        "status": "running",
        "channels": state.channels.list(),
        "providers": state.agents.provider_ids(),
        "connections": state.hub.connection_count(),
        "routes": routes,
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}
