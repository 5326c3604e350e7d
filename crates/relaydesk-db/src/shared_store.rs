use chrono::{DateTime, Utc};
use relaydesk_common::{AgentId, ChannelType, Error, Result, SessionId, TenantId};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::migrations::SHARED_SCHEMA_V1;
use crate::models::{
    Alert, AuditEntry, ChannelAccount, ChannelRoute, NewAlert, NewAuditEntry, NewTenant, Severity,
    Tenant, TenantRole, from_db_time, to_db_time,
};
use crate::sql::{conversion_err, db_err, json_column};

const TENANT_COLUMNS: &str =
    "t.id, t.email, t.name, t.role, t.plan, t.active, d.db_name, t.created_at";
const ALERT_COLUMNS: &str = "id, alert_type, severity, title, message, metadata, resolved, \
     resolved_by, resolved_at, created_at";

/// The deployment-wide database. Owns tenants and everything that must be
/// looked up before a tenant is known.
pub struct SharedStore {
    conn: Mutex<Connection>,
}

impl SharedStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening shared store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open shared database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(SHARED_SCHEMA_V1.sql)
            .map_err(|e| Error::Database(format!("shared migration failed: {e}")))?;
        Ok(())
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("shared database lock poisoned".into()))
    }

    // --- Tenants ---

    /// Insert a tenant and, for non-admins, its database mapping in one
    /// transaction. `create_db` runs before commit; its failure rolls the
    /// tenant row back.
    pub fn provision_tenant<F>(&self, new: &NewTenant, create_db: F) -> Result<Tenant>
    where
        F: FnOnce(TenantId, &str) -> Result<()>,
    {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Provisioning(format!("failed to begin transaction: {e}")))?;
        let now = to_db_time(Utc::now());

        tx.execute(
            "INSERT INTO tenants (email, name, role, plan, active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
            params![new.email, new.name, new.role.as_str(), new.plan, now],
        )
        .map_err(|e| Error::Provisioning(format!("failed to insert tenant {}: {e}", new.email)))?;
        let tenant_id = TenantId(tx.last_insert_rowid());

        let db_name = if new.role == TenantRole::Admin {
            None
        } else {
            let db_name = format!("tenant_{tenant_id}");
            tx.execute(
                "INSERT INTO tenant_databases (tenant_id, db_name, created_at) VALUES (?1, ?2, ?3)",
                params![tenant_id.0, db_name, now],
            )
            .map_err(|e| Error::Provisioning(format!("failed to map tenant database: {e}")))?;

            // Dropping `tx` on the error path rolls back the tenant row.
            create_db(tenant_id, &db_name).map_err(|e| match e {
                Error::Provisioning(msg) => Error::Provisioning(msg),
                other => Error::Provisioning(format!("schema creation failed: {other}")),
            })?;
            Some(db_name)
        };

        tx.commit()
            .map_err(|e| Error::Provisioning(format!("failed to commit tenant: {e}")))?;

        info!("provisioned tenant {tenant_id} ({})", new.email);
        Ok(Tenant {
            id: tenant_id,
            email: new.email.clone(),
            name: new.name.clone(),
            role: new.role,
            plan: new.plan.clone(),
            active: true,
            db_name,
            created_at: from_db_time(&now)?,
        })
    }

    pub fn get_tenant(&self, tenant_id: TenantId) -> Result<Option<Tenant>> {
        let conn = self.connection()?;
        conn.query_row(
            &format!(
                "SELECT {TENANT_COLUMNS} FROM tenants t
                 LEFT JOIN tenant_databases d ON d.tenant_id = t.id
                 WHERE t.id = ?1"
            ),
            params![tenant_id.0],
            tenant_from_row,
        )
        .optional()
        .map_err(db_err("failed to load tenant"))
    }

    /// All tenants in ascending id order.
    pub fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TENANT_COLUMNS} FROM tenants t
                 LEFT JOIN tenant_databases d ON d.tenant_id = t.id
                 ORDER BY t.id ASC"
            ))
            .map_err(db_err("failed to prepare tenant listing"))?;
        let rows = stmt
            .query_map([], tenant_from_row)
            .map_err(db_err("failed to list tenants"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("failed to read tenant row"))
    }

    pub fn set_tenant_active(&self, tenant_id: TenantId, active: bool) -> Result<bool> {
        let conn = self.connection()?;
        let changed = conn
            .execute(
                "UPDATE tenants SET active = ?1, updated_at = ?2 WHERE id = ?3",
                params![active, to_db_time(Utc::now()), tenant_id.0],
            )
            .map_err(db_err("failed to update tenant"))?;
        Ok(changed > 0)
    }

    /// Hard delete. Mapping, routes and channel accounts go with the row.
    pub fn delete_tenant(&self, tenant_id: TenantId) -> Result<bool> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction()
            .map_err(db_err("failed to begin transaction"))?;
        tx.execute(
            "DELETE FROM failure_events WHERE tenant_id = ?1",
            params![tenant_id.0],
        )
        .map_err(db_err("failed to delete failure events"))?;
        let deleted = tx
            .execute("DELETE FROM tenants WHERE id = ?1", params![tenant_id.0])
            .map_err(db_err("failed to delete tenant"))?;
        tx.commit().map_err(db_err("failed to commit tenant delete"))?;
        Ok(deleted > 0)
    }

    // --- Channel routing index ---

    pub fn find_route(
        &self,
        external_id: &str,
        channel_type: ChannelType,
    ) -> Result<Option<ChannelRoute>> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT external_id, channel_type, tenant_id, session_id FROM channel_routes
             WHERE external_id = ?1 AND channel_type = ?2",
            params![external_id, channel_type.as_str()],
            route_from_row,
        )
        .optional()
        .map_err(db_err("failed to look up channel route"))
    }

    /// Claim the route for `tenant_id` unless one exists. Returns whichever
    /// route owns the pair afterwards.
    pub fn claim_route(
        &self,
        external_id: &str,
        channel_type: ChannelType,
        tenant_id: TenantId,
    ) -> Result<ChannelRoute> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT OR IGNORE INTO channel_routes
                (external_id, channel_type, tenant_id, session_id, created_at)
             VALUES (?1, ?2, ?3, NULL, ?4)",
            params![
                external_id,
                channel_type.as_str(),
                tenant_id.0,
                to_db_time(Utc::now())
            ],
        )
        .map_err(db_err("failed to claim channel route"))?;

        conn.query_row(
            "SELECT external_id, channel_type, tenant_id, session_id FROM channel_routes
             WHERE external_id = ?1 AND channel_type = ?2",
            params![external_id, channel_type.as_str()],
            route_from_row,
        )
        .map_err(db_err("failed to read claimed channel route"))
    }

    pub fn complete_route(
        &self,
        external_id: &str,
        channel_type: ChannelType,
        tenant_id: TenantId,
        session_id: SessionId,
    ) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "UPDATE channel_routes SET session_id = ?1
             WHERE external_id = ?2 AND channel_type = ?3 AND tenant_id = ?4",
            params![session_id.0, external_id, channel_type.as_str(), tenant_id.0],
        )
        .map_err(db_err("failed to complete channel route"))?;
        Ok(())
    }

    /// Remove a route owned by `tenant_id` (session closed or creation failed).
    pub fn release_route(
        &self,
        external_id: &str,
        channel_type: ChannelType,
        tenant_id: TenantId,
    ) -> Result<bool> {
        let conn = self.connection()?;
        let deleted = conn
            .execute(
                "DELETE FROM channel_routes
                 WHERE external_id = ?1 AND channel_type = ?2 AND tenant_id = ?3",
                params![external_id, channel_type.as_str(), tenant_id.0],
            )
            .map_err(db_err("failed to release channel route"))?;
        Ok(deleted > 0)
    }

    /// Atomically replace the whole index (used by the rebuild scan).
    pub fn replace_routes(&self, routes: &[ChannelRoute]) -> Result<()> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction()
            .map_err(db_err("failed to begin transaction"))?;
        tx.execute("DELETE FROM channel_routes", [])
            .map_err(db_err("failed to clear channel routes"))?;
        let now = to_db_time(Utc::now());
        for route in routes {
            tx.execute(
                "INSERT INTO channel_routes
                    (external_id, channel_type, tenant_id, session_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    route.external_id,
                    route.channel_type.as_str(),
                    route.tenant_id.0,
                    route.session_id.map(|s| s.0),
                    now
                ],
            )
            .map_err(db_err("failed to insert channel route"))?;
        }
        tx.commit().map_err(db_err("failed to commit channel routes"))?;
        Ok(())
    }

    pub fn count_routes(&self) -> Result<u64> {
        let conn = self.connection()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM channel_routes", [], |row| row.get(0))
            .map_err(db_err("failed to count channel routes"))?;
        Ok(count as u64)
    }

    // --- Channel accounts ---

    pub fn upsert_channel_account(&self, account: &ChannelAccount) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO channel_accounts
                (channel_type, account_id, tenant_id, agent_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(channel_type, account_id)
             DO UPDATE SET tenant_id = excluded.tenant_id, agent_id = excluded.agent_id",
            params![
                account.channel_type.as_str(),
                account.account_id,
                account.tenant_id.0,
                account.agent_id.map(|a| a.0),
                to_db_time(Utc::now())
            ],
        )
        .map_err(db_err("failed to save channel account"))?;
        Ok(())
    }

    pub fn find_channel_account(
        &self,
        channel_type: ChannelType,
        account_id: &str,
    ) -> Result<Option<ChannelAccount>> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT channel_type, account_id, tenant_id, agent_id FROM channel_accounts
             WHERE channel_type = ?1 AND account_id = ?2",
            params![channel_type.as_str(), account_id],
            channel_account_from_row,
        )
        .optional()
        .map_err(db_err("failed to look up channel account"))
    }

    pub fn list_channel_accounts(&self) -> Result<Vec<ChannelAccount>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT channel_type, account_id, tenant_id, agent_id FROM channel_accounts
                 ORDER BY channel_type, account_id",
            )
            .map_err(db_err("failed to prepare channel account listing"))?;
        let rows = stmt
            .query_map([], channel_account_from_row)
            .map_err(db_err("failed to list channel accounts"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("failed to read channel account row"))
    }

    // --- Audit log ---

    pub fn append_audit(&self, entry: &NewAuditEntry) -> Result<i64> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO audit_logs
                (action, resource_type, resource_id, actor_id, old_values, new_values,
                 ip_address, user_agent, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.action,
                entry.resource_type,
                entry.resource_id,
                entry.actor_id.map(|a| a.0),
                entry.old_values.as_ref().map(|v| v.to_string()),
                entry.new_values.as_ref().map(|v| v.to_string()),
                entry.ip_address,
                entry.user_agent,
                to_db_time(Utc::now())
            ],
        )
        .map_err(db_err("failed to append audit entry"))?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest first.
    pub fn list_audit(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, action, resource_type, resource_id, actor_id, old_values, new_values,
                        ip_address, user_agent, created_at
                 FROM audit_logs ORDER BY id DESC LIMIT ?1",
            )
            .map_err(db_err("failed to prepare audit listing"))?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let created_at: String = row.get(9)?;
                Ok(AuditEntry {
                    id: row.get(0)?,
                    action: row.get(1)?,
                    resource_type: row.get(2)?,
                    resource_id: row.get(3)?,
                    actor_id: row.get::<_, Option<i64>>(4)?.map(TenantId),
                    old_values: json_column(row.get(5)?)?,
                    new_values: json_column(row.get(6)?)?,
                    ip_address: row.get(7)?,
                    user_agent: row.get(8)?,
                    created_at: from_db_time(&created_at).map_err(conversion_err)?,
                })
            })
            .map_err(db_err("failed to list audit entries"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("failed to read audit row"))
    }

    // --- Alerts ---

    pub fn insert_alert(&self, alert: &NewAlert) -> Result<Alert> {
        let conn = self.connection()?;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO alerts
                (alert_type, severity, title, message, metadata, resolved, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![
                alert.alert_type,
                alert.severity.as_str(),
                alert.title,
                alert.message,
                alert.metadata.to_string(),
                to_db_time(now)
            ],
        )
        .map_err(db_err("failed to insert alert"))?;

        Ok(Alert {
            id: conn.last_insert_rowid(),
            alert_type: alert.alert_type.clone(),
            severity: alert.severity,
            title: alert.title.clone(),
            message: alert.message.clone(),
            metadata: alert.metadata.clone(),
            resolved: false,
            resolved_by: None,
            resolved_at: None,
            created_at: now,
        })
    }

    /// Set the resolved flag. Already-resolved alerts keep their first resolution.
    pub fn resolve_alert(&self, alert_id: i64, resolved_by: TenantId) -> Result<Option<Alert>> {
        {
            let conn = self.connection()?;
            conn.execute(
                "UPDATE alerts SET resolved = 1, resolved_by = ?1, resolved_at = ?2
                 WHERE id = ?3 AND resolved = 0",
                params![resolved_by.0, to_db_time(Utc::now()), alert_id],
            )
            .map_err(db_err("failed to resolve alert"))?;
        }
        self.get_alert(alert_id)
    }

    pub fn get_alert(&self, alert_id: i64) -> Result<Option<Alert>> {
        let conn = self.connection()?;
        conn.query_row(
            &format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = ?1"),
            params![alert_id],
            alert_from_row,
        )
        .optional()
        .map_err(db_err("failed to load alert"))
    }

    /// Newest first.
    pub fn list_alerts(&self, unresolved_only: bool, limit: usize) -> Result<Vec<Alert>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ALERT_COLUMNS} FROM alerts
                 WHERE (?1 = 0 OR resolved = 0) ORDER BY id DESC LIMIT ?2"
            ))
            .map_err(db_err("failed to prepare alert listing"))?;
        let rows = stmt
            .query_map(params![unresolved_only, limit as i64], alert_from_row)
            .map_err(db_err("failed to list alerts"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("failed to read alert row"))
    }

    // --- Failure counters ---

    /// Store one failure event and return how many events of the same
    /// `(tenant, kind, scope)` exist at or after `since`, this one included.
    pub fn record_failure(
        &self,
        tenant_id: TenantId,
        kind: &str,
        scope: &str,
        detail: &str,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO failure_events (tenant_id, kind, scope, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![tenant_id.0, kind, scope, detail, to_db_time(Utc::now())],
        )
        .map_err(db_err("failed to record failure event"))?;

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM failure_events
                 WHERE tenant_id = ?1 AND kind = ?2 AND scope = ?3 AND created_at >= ?4",
                params![tenant_id.0, kind, scope, to_db_time(since)],
                |row| row.get(0),
            )
            .map_err(db_err("failed to count failure events"))?;
        Ok(count as u64)
    }

    // --- Settings ---

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err("failed to read setting"))
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key)
             DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, to_db_time(Utc::now())],
        )
        .map_err(db_err("failed to write setting"))?;
        Ok(())
    }
}

fn tenant_from_row(row: &Row<'_>) -> rusqlite::Result<Tenant> {
    let role: String = row.get(3)?;
    let created_at: String = row.get(7)?;
    Ok(Tenant {
        id: TenantId(row.get(0)?),
        email: row.get(1)?,
        name: row.get(2)?,
        role: TenantRole::from_db(&role).map_err(conversion_err)?,
        plan: row.get(4)?,
        active: row.get(5)?,
        db_name: row.get(6)?,
        created_at: from_db_time(&created_at).map_err(conversion_err)?,
    })
}

fn route_from_row(row: &Row<'_>) -> rusqlite::Result<ChannelRoute> {
    let channel: String = row.get(1)?;
    Ok(ChannelRoute {
        external_id: row.get(0)?,
        channel_type: channel.parse().map_err(conversion_err)?,
        tenant_id: TenantId(row.get(2)?),
        session_id: row.get::<_, Option<i64>>(3)?.map(SessionId),
    })
}

fn channel_account_from_row(row: &Row<'_>) -> rusqlite::Result<ChannelAccount> {
    let channel: String = row.get(0)?;
    Ok(ChannelAccount {
        channel_type: channel.parse().map_err(conversion_err)?,
        account_id: row.get(1)?,
        tenant_id: TenantId(row.get(2)?),
        agent_id: row.get::<_, Option<i64>>(3)?.map(AgentId),
    })
}

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<Alert> {
    let severity: String = row.get(2)?;
    let resolved_at: Option<String> = row.get(8)?;
    let created_at: String = row.get(9)?;
    Ok(Alert {
        id: row.get(0)?,
        alert_type: row.get(1)?,
        severity: Severity::from_db(&severity).map_err(conversion_err)?,
        title: row.get(3)?,
        message: row.get(4)?,
        metadata: json_column(row.get(5)?)?.unwrap_or(serde_json::Value::Null),
        resolved: row.get(6)?,
        resolved_by: row.get::<_, Option<i64>>(7)?.map(TenantId),
        resolved_at: resolved_at
            .as_deref()
            .map(from_db_time)
            .transpose()
            .map_err(conversion_err)?,
        created_at: from_db_time(&created_at).map_err(conversion_err)?,
    })
}
