//! Offline administration against the configured storage, for bootstrapping a
//! deployment before the gateway is running.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use relaydesk_common::{AgentId, ChannelType, TenantId};
use relaydesk_config::{AppConfig, ConfigFormat, ConfigLoader};
use relaydesk_db::{ChannelAccount, NewTenant, Tenant, TenantDatabaseRouter};
use relaydesk_gateway::bootstrap::{open_router, resolve_token_secret};
use relaydesk_security::TokenVerifier;
use tracing::info;

pub struct Admin {
    router: TenantDatabaseRouter,
    tokens: TokenVerifier,
}

impl Admin {
    pub fn open(config: &AppConfig) -> Result<Self> {
        if config.storage.in_memory {
            bail!("storage.in_memory is set; offline administration needs on-disk storage");
        }
        let router = open_router(config).context("failed to open storage")?;
        let tokens =
            TokenVerifier::new(&resolve_token_secret(config), config.gateway.token_ttl_secs);
        Ok(Self { router, tokens })
    }

    #[cfg(test)]
    fn with_router(router: TenantDatabaseRouter, secret: &str) -> Self {
        Self {
            router,
            tokens: TokenVerifier::new(secret, 3600),
        }
    }

    pub fn create_tenant(&self, email: &str, name: &str, admin: bool) -> Result<Tenant> {
        let new = if admin {
            NewTenant::admin(email, name)
        } else {
            NewTenant::user(email, name)
        };
        Ok(self.router.provision(&new)?)
    }

    pub fn list_tenants(&self) -> Result<Vec<Tenant>> {
        Ok(self.router.shared().list_tenants()?)
    }

    pub fn set_active(&self, tenant_id: TenantId, active: bool) -> Result<()> {
        if active {
            self.router.reactivate(tenant_id)?;
        } else {
            self.router.deactivate(tenant_id)?;
        }
        Ok(())
    }

    pub fn drop_tenant(&self, tenant_id: TenantId) -> Result<()> {
        Ok(self.router.drop_tenant(tenant_id)?)
    }

    /// Issue a bearer token carrying the tenant's own role.
    pub fn issue_token(&self, tenant_id: TenantId) -> Result<String> {
        let tenant = self.router.get_tenant(tenant_id)?;
        if !tenant.active {
            bail!("tenant {tenant_id} is deactivated");
        }
        let token = self.tokens.issue(tenant.id, tenant.role.as_str())?;
        info!("issued {} token for tenant {tenant_id}", tenant.role.as_str());
        Ok(token)
    }

    pub fn add_channel_account(
        &self,
        channel: &str,
        account_id: &str,
        tenant_id: TenantId,
        agent_id: Option<AgentId>,
    ) -> Result<ChannelAccount> {
        let channel_type: ChannelType = channel.parse()?;
        let tenant = self.router.get_tenant(tenant_id)?;
        if tenant.is_admin() {
            bail!("admin tenants do not own channel accounts");
        }
        if let Some(agent_id) = agent_id {
            let db = self.router.route(tenant_id)?;
            if db.get_agent(agent_id)?.is_none() {
                bail!("agent {agent_id} does not exist for tenant {tenant_id}");
            }
        }

        let account = ChannelAccount {
            channel_type,
            account_id: account_id.to_string(),
            tenant_id,
            agent_id,
        };
        self.router.shared().upsert_channel_account(&account)?;
        info!("{channel_type} account {account_id} now routes to tenant {tenant_id}");
        Ok(account)
    }

    pub fn list_channel_accounts(&self) -> Result<Vec<ChannelAccount>> {
        Ok(self.router.shared().list_channel_accounts()?)
    }
}

/// Write a default `config.yml` unless a config file already exists.
pub fn write_default_config(loader: &ConfigLoader) -> Result<Option<PathBuf>> {
    loader.ensure_dirs()?;
    if loader.config_file_exists() {
        return Ok(None);
    }
    let path = loader.config_dir().join(ConfigFormat::Yaml.file_name());
    let yaml = serde_yaml::to_string(&AppConfig::default())?;
    std::fs::write(&path, yaml).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(Some(path))
}
