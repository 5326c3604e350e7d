pub mod migrations;
pub mod models;
pub mod router;
pub mod shared_store;
mod sql;
pub mod tenant_store;

pub use models::{
    Agent, AgentUpdate, Alert, AuditEntry, ChannelAccount, ChannelRoute, ChannelSession,
    Conversation, ConversationStatus, InsertOutcome, NewAgent, NewAlert, NewAuditEntry,
    NewConversation, NewMessage, NewTenant, SessionStatus, Severity, StoredMessage, Tenant,
    TenantMetrics, TenantRole,
};
pub use router::{StorageMode, TenantDatabaseRouter};
pub use shared_store::SharedStore;
pub use tenant_store::TenantDb;
