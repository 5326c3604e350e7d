use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use relaydesk_agents::AgentRuntime;
use relaydesk_channels::{ChannelRegistry, RetryPolicy};
use relaydesk_config::AppConfig;
use relaydesk_db::TenantDatabaseRouter;
use relaydesk_security::TokenVerifier;

use crate::audit::{AuditSink, FailureTracker};
use crate::hub::BroadcastHub;
use crate::resolver::ConversationResolver;

/// Shared application state for the gateway.
pub struct AppState {
    pub config: AppConfig,
    pub router: Arc<TenantDatabaseRouter>,
    pub channels: ChannelRegistry,
    pub agents: AgentRuntime,
    pub tokens: TokenVerifier,
    pub hub: BroadcastHub,
    pub audit: AuditSink,
    pub failures: FailureTracker,
    pub retry: RetryPolicy,
    pub resolver: ConversationResolver,
    pub started_at: Instant,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        config: AppConfig,
        router: Arc<TenantDatabaseRouter>,
        channels: ChannelRegistry,
        agents: AgentRuntime,
        tokens: TokenVerifier,
    ) -> Self {
        let audit = AuditSink::new(Arc::clone(router.shared()));
        let failures = FailureTracker::new(audit.clone(), &config.alerts);
        let resolver = ConversationResolver::new(
            Arc::clone(&router),
            config.routing.default_tenant_id.map(Into::into),
        );
        let retry = RetryPolicy::from(&config.delivery);

        Self {
            config,
            router,
            channels,
            agents,
            tokens,
            hub: BroadcastHub::new(),
            audit,
            failures,
            retry,
            resolver,
            started_at: Instant::now(),
        }
    }

    pub fn into_shared(self) -> SharedState {
        Arc::new(self)
    }
}

/// Midnight UTC of the current day, the lower bound for "today" metrics.
pub fn today_start() -> DateTime<Utc> {
    let now = Utc::now();
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now)
}
