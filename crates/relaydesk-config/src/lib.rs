pub mod loader;
pub mod model;

pub use loader::{ConfigFormat, ConfigLoader};
pub use model::{
    AgentDefaults, AlertConfig, AppConfig, ChannelConfig, DeliveryConfig, GatewayConfig,
    HubConfig, LlmProviderConfig, RoutingConfig, StorageConfig,
};
