use chrono::{DateTime, SecondsFormat, Utc};
use relaydesk_common::{
    AgentId, ChannelType, ConversationId, Error, MessageId, Result, SenderRole, SessionId,
    TenantId,
};
use serde::{Deserialize, Serialize};

/// Fixed-width RFC 3339 so that text ordering equals time ordering.
pub(crate) fn to_db_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn from_db_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Database(format!("invalid timestamp {value:?}: {e}")))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TenantRole {
    User,
    Admin,
}

impl TenantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }

    pub(crate) fn from_db(value: &str) -> Result<Self> {
        match value {
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            other => Err(Error::Database(format!("unknown tenant role: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub email: String,
    pub name: String,
    pub role: TenantRole,
    pub plan: String,
    pub active: bool,
    /// Logical database name, `None` for admins.
    pub db_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    pub fn is_admin(&self) -> bool {
        self.role == TenantRole::Admin
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTenant {
    pub email: String,
    pub name: String,
    #[serde(default = "default_role")]
    pub role: TenantRole,
    #[serde(default = "default_plan")]
    pub plan: String,
}

fn default_role() -> TenantRole {
    TenantRole::User
}

fn default_plan() -> String {
    "free".to_string()
}

impl NewTenant {
    pub fn user(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: name.into(),
            role: TenantRole::User,
            plan: default_plan(),
        }
    }

    pub fn admin(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            role: TenantRole::Admin,
            ..Self::user(email, name)
        }
    }
}

/// Tenant-owned AI persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub system_prompt: String,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAgent {
    pub name: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub system_prompt: String,
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    1024
}

impl NewAgent {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: None,
            model: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            system_prompt: String::new(),
        }
    }
}

/// Partial update; `None` keeps the stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentUpdate {
    pub name: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }

    pub(crate) fn from_db(value: &str) -> Result<Self> {
        match value {
            "active" => Ok(Self::Active),
            "closed" => Ok(Self::Closed),
            other => Err(Error::Database(format!("unknown session status: {other}"))),
        }
    }
}

/// Binding of an external contact to this tenant (and optionally an agent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSession {
    pub id: SessionId,
    pub external_id: String,
    pub channel_type: ChannelType,
    pub agent_id: Option<AgentId>,
    pub status: SessionStatus,
    pub contact_name: Option<String>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Archived,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }

    pub(crate) fn from_db(value: &str) -> Result<Self> {
        match value {
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            other => Err(Error::Database(format!(
                "unknown conversation status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub session_id: Option<SessionId>,
    pub agent_id: Option<AgentId>,
    pub channel_type: Option<ChannelType>,
    pub status: ConversationStatus,
    pub customer_name: Option<String>,
    pub customer_contact: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Conversation opened from the dashboard rather than by an inbound contact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewConversation {
    pub agent_id: Option<AgentId>,
    pub customer_name: Option<String>,
    pub customer_contact: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub content: String,
    pub sender: SenderRole,
    pub native_message_id: Option<String>,
    pub response_time_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub content: String,
    pub sender: SenderRole,
    pub native_message_id: Option<String>,
    pub response_time_ms: Option<u64>,
}

impl NewMessage {
    pub fn new(
        conversation_id: ConversationId,
        sender: SenderRole,
        content: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id,
            content: content.into(),
            sender,
            native_message_id: None,
            response_time_ms: None,
        }
    }
}

/// Result of an idempotent message insert.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(StoredMessage),
    /// The native id was already stored for this conversation.
    Duplicate(StoredMessage),
}

impl InsertOutcome {
    pub fn message(&self) -> &StoredMessage {
        match self {
            Self::Inserted(m) | Self::Duplicate(m) => m,
        }
    }

    pub fn into_message(self) -> StoredMessage {
        match self {
            Self::Inserted(m) | Self::Duplicate(m) => m,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// Index row: which tenant owns the active session of an external contact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelRoute {
    pub external_id: String,
    pub channel_type: ChannelType,
    pub tenant_id: TenantId,
    /// `None` while the session is being created.
    pub session_id: Option<SessionId>,
}

/// A provider-side number, bot, page or inbox provisioned to a tenant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelAccount {
    pub channel_type: ChannelType,
    pub account_id: String,
    pub tenant_id: TenantId,
    pub agent_id: Option<AgentId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewAuditEntry {
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub actor_id: Option<TenantId>,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl NewAuditEntry {
    pub fn new(action: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            resource_type: resource_type.into(),
            ..Default::default()
        }
    }

    pub fn resource(mut self, id: impl ToString) -> Self {
        self.resource_id = Some(id.to_string());
        self
    }

    pub fn actor(mut self, actor: TenantId) -> Self {
        self.actor_id = Some(actor);
        self
    }

    pub fn change(
        mut self,
        old: Option<serde_json::Value>,
        new: Option<serde_json::Value>,
    ) -> Self {
        self.old_values = old;
        self.new_values = new;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub actor_id: Option<TenantId>,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }

    pub(crate) fn from_db(value: &str) -> Result<Self> {
        match value {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            other => Err(Error::Database(format!("unknown alert severity: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAlert {
    pub alert_type: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub alert_type: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub metadata: serde_json::Value,
    pub resolved: bool,
    pub resolved_by: Option<TenantId>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Aggregate numbers pushed to dashboards.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TenantMetrics {
    pub active_conversations: u64,
    pub total_conversations: u64,
    pub messages_today: u64,
    pub active_agents: u64,
    /// Mean agent latency over today's replies.
    pub avg_response_time_ms: Option<f64>,
}
