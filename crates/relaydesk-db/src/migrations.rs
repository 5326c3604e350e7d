/// A named, versioned schema script.
///
/// Every statement is `IF NOT EXISTS`, so applying a script twice is a no-op.
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Shared database: tenants, the tenant -> database mapping, the channel
/// routing index, audit logs, alerts and settings.
pub const SHARED_SCHEMA_V1: Migration = Migration {
    version: 1,
    name: "shared_schema",
    sql: "CREATE TABLE IF NOT EXISTS tenants (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            email TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'user',
            plan TEXT NOT NULL DEFAULT 'free',
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tenant_databases (
            tenant_id INTEGER PRIMARY KEY REFERENCES tenants(id) ON DELETE CASCADE,
            db_name TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS channel_routes (
            external_id TEXT NOT NULL,
            channel_type TEXT NOT NULL,
            tenant_id INTEGER NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
            session_id INTEGER,
            created_at TEXT NOT NULL,
            PRIMARY KEY (external_id, channel_type)
        );

        CREATE INDEX IF NOT EXISTS idx_channel_routes_tenant
            ON channel_routes(tenant_id);

        CREATE TABLE IF NOT EXISTS channel_accounts (
            channel_type TEXT NOT NULL,
            account_id TEXT NOT NULL,
            tenant_id INTEGER NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
            agent_id INTEGER,
            created_at TEXT NOT NULL,
            PRIMARY KEY (channel_type, account_id)
        );

        CREATE TABLE IF NOT EXISTS audit_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            action TEXT NOT NULL,
            resource_type TEXT NOT NULL,
            resource_id TEXT,
            actor_id INTEGER,
            old_values TEXT,
            new_values TEXT,
            ip_address TEXT,
            user_agent TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_logs_created
            ON audit_logs(created_at);

        CREATE TABLE IF NOT EXISTS alerts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            alert_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            resolved INTEGER NOT NULL DEFAULT 0,
            resolved_by INTEGER,
            resolved_at TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS failure_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            scope TEXT NOT NULL,
            detail TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_failure_events_lookup
            ON failure_events(tenant_id, kind, scope, created_at);

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );",
};

/// Per-tenant database: agents, channel sessions, conversations, messages.
pub const TENANT_SCHEMA_V1: Migration = Migration {
    version: 1,
    name: "tenant_schema",
    sql: "CREATE TABLE IF NOT EXISTS agents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            provider TEXT,
            model TEXT,
            temperature REAL NOT NULL DEFAULT 0.7,
            max_tokens INTEGER NOT NULL DEFAULT 1024,
            system_prompt TEXT NOT NULL DEFAULT '',
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS channel_sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_id TEXT NOT NULL,
            channel_type TEXT NOT NULL,
            agent_id INTEGER REFERENCES agents(id) ON DELETE SET NULL,
            status TEXT NOT NULL DEFAULT 'active',
            contact_name TEXT,
            last_activity_at TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_channel_sessions_active
            ON channel_sessions(external_id, channel_type) WHERE status = 'active';

        CREATE TABLE IF NOT EXISTS conversations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER REFERENCES channel_sessions(id),
            agent_id INTEGER REFERENCES agents(id) ON DELETE SET NULL,
            channel_type TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            customer_name TEXT,
            customer_contact TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_active_session
            ON conversations(session_id) WHERE status = 'active' AND session_id IS NOT NULL;

        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            content TEXT NOT NULL,
            sender TEXT NOT NULL,
            native_message_id TEXT,
            response_time_ms INTEGER,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at, id);

        CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_native
            ON messages(conversation_id, native_message_id)
            WHERE native_message_id IS NOT NULL;",
};
