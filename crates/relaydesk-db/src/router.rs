use dashmap::DashMap;
use relaydesk_common::{Error, Result, TenantId};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::models::{NewTenant, Tenant};
use crate::shared_store::SharedStore;
use crate::tenant_store::TenantDb;

pub const SHARED_DB_FILE: &str = "relaydesk.db";
pub const TENANT_DIR: &str = "tenants";

#[derive(Debug, Clone)]
pub enum StorageMode {
    /// `<data_dir>/relaydesk.db` plus `<data_dir>/tenants/<db_name>.db`.
    OnDisk { data_dir: PathBuf },
    InMemory,
}

/// Maps tenant ids to their isolated databases and owns provisioning.
///
/// Handles are opened lazily and cached; each tenant has its own connection.
pub struct TenantDatabaseRouter {
    shared: Arc<SharedStore>,
    handles: DashMap<TenantId, Arc<TenantDb>>,
    mode: StorageMode,
}

impl TenantDatabaseRouter {
    pub fn on_disk(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(data_dir.join(TENANT_DIR))?;
        let shared = SharedStore::open(&data_dir.join(SHARED_DB_FILE))?;
        Ok(Self::new(Arc::new(shared), StorageMode::OnDisk { data_dir }))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(
            Arc::new(SharedStore::in_memory()?),
            StorageMode::InMemory,
        ))
    }

    pub fn new(shared: Arc<SharedStore>, mode: StorageMode) -> Self {
        Self {
            shared,
            handles: DashMap::new(),
            mode,
        }
    }

    pub fn shared(&self) -> &Arc<SharedStore> {
        &self.shared
    }

    pub fn mode(&self) -> &StorageMode {
        &self.mode
    }

    fn tenant_db_path(&self, db_name: &str) -> Option<PathBuf> {
        match &self.mode {
            StorageMode::OnDisk { data_dir } => {
                Some(data_dir.join(TENANT_DIR).join(format!("{db_name}.db")))
            }
            StorageMode::InMemory => None,
        }
    }

    fn open_tenant_db(&self, db_name: &str) -> Result<TenantDb> {
        match self.tenant_db_path(db_name) {
            Some(path) => TenantDb::open(&path),
            None => TenantDb::in_memory(),
        }
    }

    /// Create the tenant row and, for non-admins, its database with the full
    /// schema. Either everything exists afterwards or nothing does.
    pub fn provision(&self, new: &NewTenant) -> Result<Tenant> {
        let mut created: Option<(TenantId, String)> = None;

        let result = self.shared.provision_tenant(new, |tenant_id, db_name| {
            created = Some((tenant_id, db_name.to_string()));
            let db = self.open_tenant_db(db_name)?;
            self.handles.insert(tenant_id, Arc::new(db));
            Ok(())
        });

        match result {
            Ok(tenant) => Ok(tenant),
            Err(e) => {
                if let Some((tenant_id, db_name)) = created {
                    warn!("rolling back provisioning of tenant {tenant_id}: {e}");
                    self.handles.remove(&tenant_id);
                    self.remove_db_files(&db_name);
                }
                Err(e)
            }
        }
    }

    /// Handle to the tenant's database. Admins and unknown ids are
    /// `TenantNotFound`.
    pub fn route(&self, tenant_id: TenantId) -> Result<Arc<TenantDb>> {
        if let Some(db) = self.handles.get(&tenant_id) {
            return Ok(Arc::clone(db.value()));
        }

        let tenant = self
            .shared
            .get_tenant(tenant_id)?
            .ok_or_else(|| Error::tenant_not_found(tenant_id))?;
        let db_name = tenant.db_name.ok_or_else(|| Error::tenant_not_found(tenant_id))?;

        let entry = self
            .handles
            .entry(tenant_id)
            .or_try_insert_with(|| self.open_tenant_db(&db_name).map(Arc::new))?;
        Ok(Arc::clone(entry.value()))
    }

    pub fn query(&self, tenant_id: TenantId, sql: &str, params: &[Value]) -> Result<Vec<Value>> {
        self.route(tenant_id)?.query_json(sql, params)
    }

    pub fn execute(&self, tenant_id: TenantId, sql: &str, params: &[Value]) -> Result<usize> {
        self.route(tenant_id)?.execute(sql, params)
    }

    pub fn get_tenant(&self, tenant_id: TenantId) -> Result<Tenant> {
        self.shared
            .get_tenant(tenant_id)?
            .ok_or_else(|| Error::tenant_not_found(tenant_id))
    }

    /// Soft suspend. The database and its handle stay in place.
    pub fn deactivate(&self, tenant_id: TenantId) -> Result<()> {
        if !self.shared.set_tenant_active(tenant_id, false)? {
            return Err(Error::tenant_not_found(tenant_id));
        }
        info!("deactivated tenant {tenant_id}");
        Ok(())
    }

    pub fn reactivate(&self, tenant_id: TenantId) -> Result<()> {
        if !self.shared.set_tenant_active(tenant_id, true)? {
            return Err(Error::tenant_not_found(tenant_id));
        }
        Ok(())
    }

    /// Hard delete of the tenant, its index rows and its database.
    pub fn drop_tenant(&self, tenant_id: TenantId) -> Result<()> {
        let tenant = self.get_tenant(tenant_id)?;
        self.handles.remove(&tenant_id);
        self.shared.delete_tenant(tenant_id)?;
        if let Some(db_name) = tenant.db_name {
            self.remove_db_files(&db_name);
        }
        info!("dropped tenant {tenant_id}");
        Ok(())
    }

    /// Ascending ids of active tenants that own a database.
    pub fn tenant_ids(&self) -> Result<Vec<TenantId>> {
        Ok(self
            .shared
            .list_tenants()?
            .into_iter()
            .filter(|t| t.active && t.db_name.is_some())
            .map(|t| t.id)
            .collect())
    }

    /// Ascending ids of every tenant that owns a database, suspended ones
    /// included.
    pub fn provisioned_ids(&self) -> Result<Vec<TenantId>> {
        Ok(self
            .shared
            .list_tenants()?
            .into_iter()
            .filter(|t| t.db_name.is_some())
            .map(|t| t.id)
            .collect())
    }

    fn remove_db_files(&self, db_name: &str) {
        let Some(path) = self.tenant_db_path(db_name) else {
            return;
        };
        for suffix in ["", "-wal", "-shm"] {
            let file = PathBuf::from(format!("{}{suffix}", path.display()));
            if file.exists() {
                if let Err(e) = std::fs::remove_file(&file) {
                    warn!("failed to remove {}: {e}", file.display());
                }
            }
        }
    }

    pub fn data_dir(&self) -> Option<&Path> {
        match &self.mode {
            StorageMode::OnDisk { data_dir } => Some(data_dir),
            StorageMode::InMemory => None,
        }
    }
}
