use std::time::Duration;

use relaydesk_common::{Error, Result};
use relaydesk_config::AppConfig;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::bootstrap::build_state;
use crate::router::build_router;
use crate::state::{SharedState, today_start};

/// The main gateway server that binds to a port and serves the API, the
/// webhooks and the dashboard WebSocket.
pub struct GatewayServer {
    config: AppConfig,
}

impl GatewayServer {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.gateway.host, self.config.gateway.port);
        let metrics_interval = self.config.hub.metrics_interval_secs;

        let state = build_state(self.config)?;
        match state.resolver.rebuild_index() {
            Ok(count) => info!("routing index ready: {count} routes"),
            Err(e) => warn!("routing index rebuild failed, continuing with stored index: {e}"),
        }

        if metrics_interval > 0 {
            spawn_metrics_push(state.clone(), Duration::from_secs(metrics_interval));
        }

        let app = build_router(state);
        let listener = TcpListener::bind(&addr).await?;
        info!("RelayDesk gateway listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Gateway(format!("server error: {e}")))?;

        info!("gateway stopped");
        Ok(())
    }
}

/// Push a metrics snapshot to every tenant with a live dashboard.
pub fn spawn_metrics_push(state: SharedState, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            push_metrics(&state);
        }
    })
}

pub fn push_metrics(state: &SharedState) {
    let since = today_start();
    for tenant in state.hub.connected_tenants() {
        match state.router.route(tenant).and_then(|db| db.metrics(since)) {
            Ok(metrics) => state.hub.emit_metrics_update(tenant, &metrics),
            Err(e) => debug!("metrics for tenant {tenant} unavailable: {e}"),
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
