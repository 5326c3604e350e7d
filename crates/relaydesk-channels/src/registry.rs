use std::collections::HashMap;
use std::sync::Arc;

use relaydesk_common::{ChannelType, Result};
use relaydesk_config::{AppConfig, ChannelConfig};
use tracing::{info, warn};

use crate::email::EmailAdapter;
use crate::messenger::MessengerAdapter;
use crate::telegram::TelegramAdapter;
use crate::traits::ChannelAdapter;
use crate::whatsapp::WhatsAppAdapter;

/// Central registry of the configured channel adapters, one per channel type.
pub struct ChannelRegistry {
    channels: HashMap<ChannelType, Arc<dyn ChannelAdapter>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }

    /// Build adapters for every enabled channel entry. Entries with bad
    /// settings are skipped with a warning so one channel cannot block startup.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut registry = Self::new();
        for (name, channel) in config.enabled_channels() {
            match build_adapter(channel) {
                Ok(adapter) => registry.register(adapter),
                Err(e) => warn!("channel {name}: not started: {e}"),
            }
        }
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        let channel_type = adapter.channel_type();
        info!("registered channel: {channel_type}");
        if !adapter.verifies_inbound() {
            warn!(
                "{channel_type}: no webhook secret configured, inbound requests are not \
                 authenticated"
            );
        }
        if self.channels.insert(channel_type, adapter).is_some() {
            warn!("channel {channel_type} registered twice; the last one wins");
        }
    }

    pub fn get(&self, channel_type: ChannelType) -> Option<Arc<dyn ChannelAdapter>> {
        self.channels.get(&channel_type).cloned()
    }

    /// Registered channel types in stable order.
    pub fn list(&self) -> Vec<ChannelType> {
        let mut types: Vec<_> = self.channels.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub fn build_adapter(config: &ChannelConfig) -> Result<Arc<dyn ChannelAdapter>> {
    let channel_type: ChannelType = config.channel_type.parse()?;
    let adapter: Arc<dyn ChannelAdapter> = match channel_type {
        ChannelType::WhatsApp => Arc::new(WhatsAppAdapter::from_config(config)?),
        ChannelType::Telegram => Arc::new(TelegramAdapter::from_config(config)?),
        ChannelType::Messenger => Arc::new(MessengerAdapter::from_config(config)?),
        ChannelType::Email => Arc::new(EmailAdapter::from_config(config)?),
    };
    Ok(adapter)
}
