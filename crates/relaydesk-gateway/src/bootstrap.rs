use std::sync::Arc;

use relaydesk_agents::AgentRuntime;
use relaydesk_channels::ChannelRegistry;
use relaydesk_common::Result;
use relaydesk_config::{AppConfig, ConfigLoader};
use relaydesk_db::TenantDatabaseRouter;
use relaydesk_security::{TokenVerifier, generate_secret};
use tracing::{info, warn};

use crate::state::{AppState, SharedState};

const TOKEN_SECRET_ENV: &str = "RELAYDESK_TOKEN_SECRET";

/// Resolve the token signing secret: config value, then environment. Without
/// either, a random secret is used and tokens die with the process.
pub fn resolve_token_secret(config: &AppConfig) -> String {
    if let Some(secret) = config.gateway.token_secret.as_deref().filter(|s| !s.is_empty()) {
        return secret.to_string();
    }
    if let Ok(secret) = std::env::var(TOKEN_SECRET_ENV) {
        if !secret.is_empty() {
            return secret;
        }
    }
    warn!(
        "no token secret configured (gateway.token_secret or {TOKEN_SECRET_ENV}); \
         using an ephemeral one"
    );
    generate_secret()
}

/// Open storage according to `config.storage`.
pub fn open_router(config: &AppConfig) -> Result<TenantDatabaseRouter> {
    if config.storage.in_memory {
        info!("using in-memory storage");
        return TenantDatabaseRouter::in_memory();
    }
    let data_dir = config
        .storage
        .data_dir
        .clone()
        .unwrap_or_else(|| ConfigLoader::default_config_dir().join("data"));
    info!("using storage at {}", data_dir.display());
    TenantDatabaseRouter::on_disk(data_dir)
}

/// Build the full gateway state from configuration.
pub fn build_state(config: AppConfig) -> Result<SharedState> {
    let router = Arc::new(open_router(&config)?);
    let channels = ChannelRegistry::from_config(&config);
    if channels.is_empty() {
        warn!("no channels configured; only the dashboard and API are available");
    }
    let agents = AgentRuntime::from_config(&config);
    let tokens = TokenVerifier::new(&resolve_token_secret(&config), config.gateway.token_ttl_secs);

    Ok(AppState::new(config, router, channels, agents, tokens).into_shared())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_secret_wins() {
        let mut config = AppConfig::default();
        config.gateway.token_secret = Some("from-config".into());
        assert_eq!(resolve_token_secret(&config), "from-config");
    }

    #[test]
    fn in_memory_storage_has_no_data_dir() {
        let mut config = AppConfig::default();
        config.storage.in_memory = true;
        let router = open_router(&config).unwrap();
        assert!(router.data_dir().is_none());
    }

    #[test]
    fn on_disk_storage_uses_configured_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.storage.data_dir = Some(dir.path().to_path_buf());
        let router = open_router(&config).unwrap();
        assert_eq!(router.data_dir(), Some(dir.path()));
    }
}
