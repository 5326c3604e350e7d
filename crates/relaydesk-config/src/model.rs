use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub channels: HashMap<String, ChannelConfig>,

    #[serde(default)]
    pub llm: HashMap<String, LlmProviderConfig>,

    #[serde(default)]
    pub agent: AgentDefaults,

    #[serde(default)]
    pub alerts: AlertConfig,

    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            storage: StorageConfig::default(),
            routing: RoutingConfig::default(),
            channels: HashMap::new(),
            llm: HashMap::new(),
            agent: AgentDefaults::default(),
            alerts: AlertConfig::default(),
            hub: HubConfig::default(),
            delivery: DeliveryConfig::default(),
            log_level: Some("info".to_string()),
        }
    }
}

impl AppConfig {
    /// Enabled channel entries, in name order so startup logs are stable.
    pub fn enabled_channels(&self) -> Vec<(&String, &ChannelConfig)> {
        let mut channels: Vec<_> = self
            .channels
            .iter()
            .filter(|(_, ch)| ch.enabled != Some(false))
            .collect();
        channels.sort_by(|a, b| a.0.cmp(b.0));
        channels
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// HMAC key for dashboard/API access tokens. Falls back to
    /// `RELAYDESK_TOKEN_SECRET` when unset.
    #[serde(default)]
    pub token_secret: Option<String>,

    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            token_secret: None,
            token_ttl_secs: default_token_ttl(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_token_ttl() -> u64 {
    12 * 3600
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the shared database and the `tenants/` databases.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Keep every database in memory. Intended for tests and demos.
    #[serde(default)]
    pub in_memory: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Tenant that receives contacts arriving on accounts nobody provisioned.
    /// `None` rejects such messages instead of guessing an owner.
    #[serde(default)]
    pub default_tenant_id: Option<i64>,

    /// How many prior messages are handed to the model as context.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_tenant_id: None,
            history_limit: default_history_limit(),
        }
    }
}

fn default_history_limit() -> usize {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(rename = "type")]
    pub channel_type: String,

    pub enabled: Option<bool>,

    #[serde(flatten)]
    pub settings: HashMap<String, serde_json::Value>,
}

impl ChannelConfig {
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn setting_u64(&self, key: &str) -> Option<u64> {
        self.settings.get(key).and_then(|v| v.as_u64())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    pub provider: String,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,

    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefaults {
    #[serde(default = "default_generation_timeout")]
    pub generation_timeout_secs: u64,

    /// Sent instead of the model reply when generation fails. Silence when unset.
    #[serde(default)]
    pub fallback_reply: Option<String>,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            generation_timeout_secs: default_generation_timeout(),
            fallback_reply: None,
        }
    }
}

fn default_generation_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Failures of one kind for one tenant+channel that raise an error alert.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_window_hours")]
    pub window_hours: u32,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_hours: default_window_hours(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_window_hours() -> u32 {
    24
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Interval between pushed metrics snapshots. 0 disables the push.
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            metrics_interval_secs: default_metrics_interval(),
        }
    }
}

fn default_metrics_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    250
}
