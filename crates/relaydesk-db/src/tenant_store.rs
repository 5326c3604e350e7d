use chrono::{DateTime, Utc};
use relaydesk_common::{
    AgentId, ChannelType, ConversationId, Error, MessageId, Result, SenderRole, SessionId,
};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::migrations::TENANT_SCHEMA_V1;
use crate::models::{
    Agent, AgentUpdate, ChannelSession, Conversation, ConversationStatus, InsertOutcome,
    NewAgent, NewConversation, NewMessage, SessionStatus, StoredMessage, TenantMetrics,
    from_db_time, to_db_time,
};
use crate::sql::{conversion_err, db_err, json_to_sql, sql_to_json};

const AGENT_COLUMNS: &str =
    "id, name, provider, model, temperature, max_tokens, system_prompt, active, updated_at";
const SESSION_COLUMNS: &str =
    "id, external_id, channel_type, agent_id, status, contact_name, last_activity_at";
const CONVERSATION_COLUMNS: &str = "id, session_id, agent_id, channel_type, status, \
     customer_name, customer_contact, created_at, updated_at";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, content, sender, native_message_id, response_time_ms, created_at";

/// One tenant's isolated database. Every method takes the connection lock
/// for the duration of a single statement or transaction.
pub struct TenantDb {
    conn: Mutex<Connection>,
}

impl TenantDb {
    pub fn open(db_path: &Path) -> Result<Self> {
        debug!("opening tenant database at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open tenant database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(TENANT_SCHEMA_V1.sql)
            .map_err(|e| Error::Database(format!("tenant migration failed: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("tenant database lock poisoned".into()))
    }

    // --- Agents ---

    pub fn create_agent(&self, new: &NewAgent) -> Result<Agent> {
        let conn = self.connection()?;
        let now = to_db_time(Utc::now());
        conn.execute(
            "INSERT INTO agents
                (name, provider, model, temperature, max_tokens, system_prompt, active,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7)",
            params![
                new.name,
                new.provider,
                new.model,
                new.temperature,
                new.max_tokens,
                new.system_prompt,
                now
            ],
        )
        .map_err(db_err("failed to create agent"))?;
        let id = conn.last_insert_rowid();
        load_agent(&conn, AgentId(id))?
            .ok_or_else(|| Error::Database(format!("agent {id} vanished after insert")))
    }

    pub fn get_agent(&self, agent_id: AgentId) -> Result<Option<Agent>> {
        let conn = self.connection()?;
        load_agent(&conn, agent_id)
    }

    pub fn list_agents(&self) -> Result<Vec<Agent>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY id ASC"))
            .map_err(db_err("failed to prepare agent listing"))?;
        let rows = stmt
            .query_map([], agent_from_row)
            .map_err(db_err("failed to list agents"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("failed to read agent row"))
    }

    /// The lowest-id active agent, used when nothing else assigns one.
    pub fn default_agent(&self) -> Result<Option<Agent>> {
        let conn = self.connection()?;
        conn.query_row(
            &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE active = 1 ORDER BY id ASC LIMIT 1"),
            [],
            agent_from_row,
        )
        .optional()
        .map_err(db_err("failed to load default agent"))
    }

    pub fn update_agent(&self, agent_id: AgentId, update: &AgentUpdate) -> Result<Option<Agent>> {
        let conn = self.connection()?;
        let Some(current) = load_agent(&conn, agent_id)? else {
            return Ok(None);
        };

        conn.execute(
            "UPDATE agents SET name = ?1, provider = ?2, model = ?3, temperature = ?4,
                 max_tokens = ?5, system_prompt = ?6, active = ?7, updated_at = ?8
             WHERE id = ?9",
            params![
                update.name.as_ref().unwrap_or(&current.name),
                update.provider.as_ref().or(current.provider.as_ref()),
                update.model.as_ref().or(current.model.as_ref()),
                update.temperature.unwrap_or(current.temperature),
                update.max_tokens.unwrap_or(current.max_tokens),
                update
                    .system_prompt
                    .as_ref()
                    .unwrap_or(&current.system_prompt),
                update.active.unwrap_or(current.active),
                to_db_time(Utc::now()),
                agent_id.0
            ],
        )
        .map_err(db_err("failed to update agent"))?;
        load_agent(&conn, agent_id)
    }

    // --- Channel sessions ---

    /// Create the active session for a contact, or return the one that
    /// already exists.
    pub fn create_session(
        &self,
        external_id: &str,
        channel_type: ChannelType,
        agent_id: Option<AgentId>,
        contact_name: Option<&str>,
    ) -> Result<ChannelSession> {
        let conn = self.connection()?;
        if let Some(existing) = load_active_session(&conn, external_id, channel_type)? {
            return Ok(existing);
        }

        let now = to_db_time(Utc::now());
        conn.execute(
            "INSERT INTO channel_sessions
                (external_id, channel_type, agent_id, status, contact_name, last_activity_at,
                 created_at)
             VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?5)",
            params![
                external_id,
                channel_type.as_str(),
                agent_id.map(|a| a.0),
                contact_name,
                now
            ],
        )
        .map_err(db_err("failed to create channel session"))?;

        let id = SessionId(conn.last_insert_rowid());
        info!("created {channel_type} session {id} for contact");
        load_session(&conn, id)?
            .ok_or_else(|| Error::Database(format!("session {id} vanished after insert")))
    }

    pub fn get_session(&self, session_id: SessionId) -> Result<Option<ChannelSession>> {
        let conn = self.connection()?;
        load_session(&conn, session_id)
    }

    pub fn find_active_session(
        &self,
        external_id: &str,
        channel_type: ChannelType,
    ) -> Result<Option<ChannelSession>> {
        let conn = self.connection()?;
        load_active_session(&conn, external_id, channel_type)
    }

    /// Active sessions in ascending id order.
    pub fn list_active_sessions(&self) -> Result<Vec<ChannelSession>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM channel_sessions
                 WHERE status = 'active' ORDER BY id ASC"
            ))
            .map_err(db_err("failed to prepare session listing"))?;
        let rows = stmt
            .query_map([], session_from_row)
            .map_err(db_err("failed to list sessions"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("failed to read session row"))
    }

    pub fn touch_session(&self, session_id: SessionId) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "UPDATE channel_sessions SET last_activity_at = ?1 WHERE id = ?2",
            params![to_db_time(Utc::now()), session_id.0],
        )
        .map_err(db_err("failed to touch session"))?;
        Ok(())
    }

    /// Close a session and archive its active conversation.
    pub fn close_session(&self, session_id: SessionId) -> Result<bool> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction()
            .map_err(db_err("failed to begin transaction"))?;
        let now = to_db_time(Utc::now());
        let closed = tx
            .execute(
                "UPDATE channel_sessions SET status = 'closed', last_activity_at = ?1
                 WHERE id = ?2 AND status = 'active'",
                params![now, session_id.0],
            )
            .map_err(db_err("failed to close session"))?;
        tx.execute(
            "UPDATE conversations SET status = 'archived', updated_at = ?1
             WHERE session_id = ?2 AND status = 'active'",
            params![now, session_id.0],
        )
        .map_err(db_err("failed to archive session conversation"))?;
        tx.commit().map_err(db_err("failed to commit session close"))?;
        Ok(closed > 0)
    }

    // --- Conversations ---

    /// Return the session's active conversation, creating it if there is none.
    pub fn find_or_create_conversation(&self, session: &ChannelSession) -> Result<Conversation> {
        let conn = self.connection()?;
        let existing = conn
            .query_row(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations
                     WHERE session_id = ?1 AND status = 'active'"
                ),
                params![session.id.0],
                conversation_from_row,
            )
            .optional()
            .map_err(db_err("failed to look up conversation"))?;
        if let Some(conversation) = existing {
            return Ok(conversation);
        }

        let now = to_db_time(Utc::now());
        conn.execute(
            "INSERT INTO conversations
                (session_id, agent_id, channel_type, status, customer_name, customer_contact,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6, ?6)",
            params![
                session.id.0,
                session.agent_id.map(|a| a.0),
                session.channel_type.as_str(),
                session.contact_name,
                session.external_id,
                now
            ],
        )
        .map_err(db_err("failed to create conversation"))?;
        let id = ConversationId(conn.last_insert_rowid());
        load_conversation(&conn, id)?
            .ok_or_else(|| Error::Database(format!("conversation {id} vanished after insert")))
    }

    /// Dashboard-initiated conversation with no channel session behind it.
    pub fn create_conversation(&self, new: &NewConversation) -> Result<Conversation> {
        let conn = self.connection()?;
        let now = to_db_time(Utc::now());
        conn.execute(
            "INSERT INTO conversations
                (session_id, agent_id, channel_type, status, customer_name, customer_contact,
                 created_at, updated_at)
             VALUES (NULL, ?1, NULL, 'active', ?2, ?3, ?4, ?4)",
            params![
                new.agent_id.map(|a| a.0),
                new.customer_name,
                new.customer_contact,
                now
            ],
        )
        .map_err(db_err("failed to create conversation"))?;
        let id = ConversationId(conn.last_insert_rowid());
        load_conversation(&conn, id)?
            .ok_or_else(|| Error::Database(format!("conversation {id} vanished after insert")))
    }

    pub fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Conversation>> {
        let conn = self.connection()?;
        load_conversation(&conn, conversation_id)
    }

    /// Most recently updated first.
    pub fn list_conversations(
        &self,
        status: Option<ConversationStatus>,
        limit: usize,
    ) -> Result<Vec<Conversation>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY updated_at DESC, id DESC LIMIT ?2"
            ))
            .map_err(db_err("failed to prepare conversation listing"))?;
        let rows = stmt
            .query_map(
                params![status.map(|s| s.as_str()), limit as i64],
                conversation_from_row,
            )
            .map_err(db_err("failed to list conversations"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("failed to read conversation row"))
    }

    pub fn archive_conversation(&self, conversation_id: ConversationId) -> Result<bool> {
        let conn = self.connection()?;
        let changed = conn
            .execute(
                "UPDATE conversations SET status = 'archived', updated_at = ?1
                 WHERE id = ?2 AND status = 'active'",
                params![to_db_time(Utc::now()), conversation_id.0],
            )
            .map_err(db_err("failed to archive conversation"))?;
        Ok(changed > 0)
    }

    // --- Messages ---

    /// Insert a message, keeping per-conversation timestamps monotonic and
    /// native ids unique.
    pub fn insert_message(&self, new: &NewMessage) -> Result<InsertOutcome> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction()
            .map_err(db_err("failed to begin transaction"))?;

        if let Some(native_id) = &new.native_message_id {
            let existing = tx
                .query_row(
                    &format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages
                         WHERE conversation_id = ?1 AND native_message_id = ?2"
                    ),
                    params![new.conversation_id.0, native_id],
                    message_from_row,
                )
                .optional()
                .map_err(db_err("failed to check native message id"))?;
            if let Some(message) = existing {
                debug!(
                    "duplicate native id {native_id} in conversation {}",
                    new.conversation_id
                );
                return Ok(InsertOutcome::Duplicate(message));
            }
        }

        let latest: Option<String> = tx
            .query_row(
                "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1",
                params![new.conversation_id.0],
                |row| row.get(0),
            )
            .map_err(db_err("failed to read latest message time"))?;
        let mut created_at = Utc::now();
        if let Some(latest) = latest {
            let latest = from_db_time(&latest)?;
            if latest > created_at {
                created_at = latest;
            }
        }
        let stamp = to_db_time(created_at);

        tx.execute(
            "INSERT INTO messages
                (conversation_id, content, sender, native_message_id, response_time_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                new.conversation_id.0,
                new.content,
                new.sender.as_str(),
                new.native_message_id,
                new.response_time_ms.map(|ms| ms as i64),
                stamp
            ],
        )
        .map_err(db_err("failed to insert message"))?;
        let id = MessageId(tx.last_insert_rowid());

        let touched = tx
            .execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                params![stamp, new.conversation_id.0],
            )
            .map_err(db_err("failed to touch conversation"))?;
        if touched == 0 {
            return Err(Error::NotFound(format!(
                "conversation {}",
                new.conversation_id
            )));
        }

        tx.commit().map_err(db_err("failed to commit message"))?;

        Ok(InsertOutcome::Inserted(StoredMessage {
            id,
            conversation_id: new.conversation_id,
            content: new.content.clone(),
            sender: new.sender,
            native_message_id: new.native_message_id.clone(),
            response_time_ms: new.response_time_ms,
            created_at: from_db_time(&stamp)?,
        }))
    }

    /// The newest `limit` messages of a conversation, oldest first.
    pub fn list_messages(
        &self,
        conversation_id: ConversationId,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM (
                    SELECT {MESSAGE_COLUMNS} FROM messages
                    WHERE conversation_id = ?1
                    ORDER BY created_at DESC, id DESC
                    LIMIT ?2
                 ) ORDER BY created_at ASC, id ASC"
            ))
            .map_err(db_err("failed to prepare message listing"))?;
        let rows = stmt
            .query_map(params![conversation_id.0, limit as i64], message_from_row)
            .map_err(db_err("failed to list messages"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("failed to read message row"))
    }

    pub fn metrics(&self, since: DateTime<Utc>) -> Result<TenantMetrics> {
        let conn = self.connection()?;
        let since = to_db_time(since);
        conn.query_row(
            "SELECT
                (SELECT COUNT(*) FROM conversations WHERE status = 'active'),
                (SELECT COUNT(*) FROM conversations),
                (SELECT COUNT(*) FROM messages WHERE created_at >= ?1),
                (SELECT COUNT(*) FROM agents WHERE active = 1),
                (SELECT AVG(response_time_ms) FROM messages
                    WHERE sender = 'agent' AND response_time_ms IS NOT NULL AND created_at >= ?1)",
            params![since],
            |row| {
                Ok(TenantMetrics {
                    active_conversations: row.get::<_, i64>(0)? as u64,
                    total_conversations: row.get::<_, i64>(1)? as u64,
                    messages_today: row.get::<_, i64>(2)? as u64,
                    active_agents: row.get::<_, i64>(3)? as u64,
                    avg_response_time_ms: row.get(4)?,
                })
            },
        )
        .map_err(db_err("failed to compute metrics"))
    }

    // --- Raw access ---

    /// Run a parameterized read and return each row as a JSON object.
    pub fn query_json(&self, sql: &str, params: &[Value]) -> Result<Vec<Value>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(sql).map_err(db_err("failed to prepare query"))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut rows = stmt
            .query(params_from_iter(params.iter().map(json_to_sql)))
            .map_err(db_err("failed to run query"))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(db_err("failed to read row"))? {
            let mut object = Map::with_capacity(columns.len());
            for (idx, name) in columns.iter().enumerate() {
                let value = row.get_ref(idx).map_err(db_err("failed to read column"))?;
                object.insert(name.clone(), sql_to_json(value));
            }
            out.push(Value::Object(object));
        }
        Ok(out)
    }

    /// Run a parameterized write and return the number of affected rows.
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        let conn = self.connection()?;
        conn.execute(sql, params_from_iter(params.iter().map(json_to_sql)))
            .map_err(db_err("failed to execute statement"))
    }
}

fn load_agent(conn: &Connection, agent_id: AgentId) -> Result<Option<Agent>> {
    conn.query_row(
        &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"),
        params![agent_id.0],
        agent_from_row,
    )
    .optional()
    .map_err(db_err("failed to load agent"))
}

fn load_session(conn: &Connection, session_id: SessionId) -> Result<Option<ChannelSession>> {
    conn.query_row(
        &format!("SELECT {SESSION_COLUMNS} FROM channel_sessions WHERE id = ?1"),
        params![session_id.0],
        session_from_row,
    )
    .optional()
    .map_err(db_err("failed to load session"))
}

fn load_active_session(
    conn: &Connection,
    external_id: &str,
    channel_type: ChannelType,
) -> Result<Option<ChannelSession>> {
    conn.query_row(
        &format!(
            "SELECT {SESSION_COLUMNS} FROM channel_sessions
             WHERE external_id = ?1 AND channel_type = ?2 AND status = 'active'"
        ),
        params![external_id, channel_type.as_str()],
        session_from_row,
    )
    .optional()
    .map_err(db_err("failed to look up active session"))
}

fn load_conversation(
    conn: &Connection,
    conversation_id: ConversationId,
) -> Result<Option<Conversation>> {
    conn.query_row(
        &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
        params![conversation_id.0],
        conversation_from_row,
    )
    .optional()
    .map_err(db_err("failed to load conversation"))
}

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
    let updated_at: String = row.get(8)?;
    Ok(Agent {
        id: AgentId(row.get(0)?),
        name: row.get(1)?,
        provider: row.get(2)?,
        model: row.get(3)?,
        temperature: row.get(4)?,
        max_tokens: row.get(5)?,
        system_prompt: row.get(6)?,
        active: row.get(7)?,
        updated_at: from_db_time(&updated_at).map_err(conversion_err)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<ChannelSession> {
    let channel: String = row.get(2)?;
    let status: String = row.get(4)?;
    let last_activity_at: String = row.get(6)?;
    Ok(ChannelSession {
        id: SessionId(row.get(0)?),
        external_id: row.get(1)?,
        channel_type: channel.parse().map_err(conversion_err)?,
        agent_id: row.get::<_, Option<i64>>(3)?.map(AgentId),
        status: SessionStatus::from_db(&status).map_err(conversion_err)?,
        contact_name: row.get(5)?,
        last_activity_at: from_db_time(&last_activity_at).map_err(conversion_err)?,
    })
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    let channel: Option<String> = row.get(3)?;
    let status: String = row.get(4)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok(Conversation {
        id: ConversationId(row.get(0)?),
        session_id: row.get::<_, Option<i64>>(1)?.map(SessionId),
        agent_id: row.get::<_, Option<i64>>(2)?.map(AgentId),
        channel_type: channel
            .as_deref()
            .map(str::parse::<ChannelType>)
            .transpose()
            .map_err(conversion_err)?,
        status: ConversationStatus::from_db(&status).map_err(conversion_err)?,
        customer_name: row.get(5)?,
        customer_contact: row.get(6)?,
        created_at: from_db_time(&created_at).map_err(conversion_err)?,
        updated_at: from_db_time(&updated_at).map_err(conversion_err)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let sender: String = row.get(3)?;
    let created_at: String = row.get(6)?;
    Ok(StoredMessage {
        id: MessageId(row.get(0)?),
        conversation_id: ConversationId(row.get(1)?),
        content: row.get(2)?,
        sender: sender.parse::<SenderRole>().map_err(conversion_err)?,
        native_message_id: row.get(4)?,
        response_time_ms: row.get::<_, Option<i64>>(5)?.map(|ms| ms.max(0) as u64),
        created_at: from_db_time(&created_at).map_err(conversion_err)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn db() -> TenantDb {
        TenantDb::in_memory().expect("failed to create in-memory tenant db")
    }

    fn session(db: &TenantDb) -> ChannelSession {
        db.create_session("+5511999", ChannelType::WhatsApp, None, Some("Ana"))
            .expect("session")
    }

    #[test]
    fn create_session_returns_existing_active_session() {
        let db = db();
        let first = session(&db);
        let second = db
            .create_session("+5511999", ChannelType::WhatsApp, None, None)
            .unwrap();
        assert_eq!(first.id, second.id);

        db.close_session(first.id).unwrap();
        let third = db
            .create_session("+5511999", ChannelType::WhatsApp, None, None)
            .unwrap();
        assert_ne!(first.id, third.id);
    }

    #[test]
    fn one_active_conversation_per_session() {
        let db = db();
        let session = session(&db);
        let a = db.find_or_create_conversation(&session).unwrap();
        let b = db.find_or_create_conversation(&session).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.customer_contact.as_deref(), Some("+5511999"));
        assert_eq!(a.channel_type, Some(ChannelType::WhatsApp));

        assert!(db.archive_conversation(a.id).unwrap());
        let c = db.find_or_create_conversation(&session).unwrap();
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn repeated_native_id_is_a_duplicate() {
        let db = db();
        let conversation = db.find_or_create_conversation(&session(&db)).unwrap();

        let mut new = NewMessage::new(conversation.id, SenderRole::Customer, "hi");
        new.native_message_id = Some("wamid.1".into());

        let first = db.insert_message(&new).unwrap();
        let second = db.insert_message(&new).unwrap();
        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());
        assert_eq!(first.message().id, second.message().id);
        assert_eq!(db.list_messages(conversation.id, 50).unwrap().len(), 1);
    }

    #[test]
    fn messages_without_native_id_are_never_deduplicated() {
        let db = db();
        let conversation = db.find_or_create_conversation(&session(&db)).unwrap();
        let new = NewMessage::new(conversation.id, SenderRole::Agent, "ok");
        db.insert_message(&new).unwrap();
        db.insert_message(&new).unwrap();
        assert_eq!(db.list_messages(conversation.id, 50).unwrap().len(), 2);
    }

    #[test]
    fn timestamps_are_clamped_monotonic() {
        let db = db();
        let conversation = db.find_or_create_conversation(&session(&db)).unwrap();

        // Simulate a clock that ran ahead for an earlier writer.
        let future = to_db_time(Utc::now() + Duration::minutes(5));
        db.execute(
            "INSERT INTO messages (conversation_id, content, sender, created_at)
             VALUES (?1, 'early', 'customer', ?2)",
            &[json!(conversation.id.0), json!(future)],
        )
        .unwrap();

        let later = db
            .insert_message(&NewMessage::new(conversation.id, SenderRole::Agent, "reply"))
            .unwrap();
        let messages = db.list_messages(conversation.id, 50).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "early");
        assert_eq!(messages[1].id, later.message().id);
        assert!(messages[1].created_at >= messages[0].created_at);
    }

    #[test]
    fn list_messages_returns_newest_window_in_order() {
        let db = db();
        let conversation = db.find_or_create_conversation(&session(&db)).unwrap();
        for i in 0..5 {
            db.insert_message(&NewMessage::new(
                conversation.id,
                SenderRole::Customer,
                format!("m{i}"),
            ))
            .unwrap();
        }

        let window: Vec<_> = db
            .list_messages(conversation.id, 3)
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(window, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn insert_into_missing_conversation_fails() {
        let db = db();
        let err = db
            .insert_message(&NewMessage::new(ConversationId(99), SenderRole::Customer, "x"))
            .expect_err("should fail");
        assert!(matches!(err, Error::Database(_) | Error::NotFound(_)));
    }

    #[test]
    fn agent_update_keeps_unset_fields() {
        let db = db();
        let mut new = NewAgent::named("Support");
        new.system_prompt = "Be brief.".into();
        let agent = db.create_agent(&new).unwrap();

        let updated = db
            .update_agent(
                agent.id,
                &AgentUpdate {
                    temperature: Some(0.2),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.name, "Support");
        assert_eq!(updated.system_prompt, "Be brief.");
        assert!((updated.temperature - 0.2).abs() < f64::EPSILON);

        assert!(db
            .update_agent(AgentId(404), &AgentUpdate::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn default_agent_skips_inactive() {
        let db = db();
        let first = db.create_agent(&NewAgent::named("A")).unwrap();
        let second = db.create_agent(&NewAgent::named("B")).unwrap();
        db.update_agent(
            first.id,
            &AgentUpdate {
                active: Some(false),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(db.default_agent().unwrap().map(|a| a.id), Some(second.id));
    }

    #[test]
    fn metrics_count_today_and_average_latency() {
        let db = db();
        db.create_agent(&NewAgent::named("A")).unwrap();
        let conversation = db.find_or_create_conversation(&session(&db)).unwrap();
        db.insert_message(&NewMessage::new(conversation.id, SenderRole::Customer, "q"))
            .unwrap();
        for ms in [100, 300] {
            let mut reply = NewMessage::new(conversation.id, SenderRole::Agent, "a");
            reply.response_time_ms = Some(ms);
            db.insert_message(&reply).unwrap();
        }

        let metrics = db.metrics(Utc::now() - Duration::hours(1)).unwrap();
        assert_eq!(metrics.active_conversations, 1);
        assert_eq!(metrics.total_conversations, 1);
        assert_eq!(metrics.messages_today, 3);
        assert_eq!(metrics.active_agents, 1);
        assert_eq!(metrics.avg_response_time_ms, Some(200.0));
    }

    #[test]
    fn query_json_binds_parameters() {
        let db = db();
        db.create_agent(&NewAgent::named("Alpha")).unwrap();
        db.create_agent(&NewAgent::named("Beta")).unwrap();

        let rows = db
            .query_json("SELECT id, name FROM agents WHERE name = ?1", &[json!("Beta")])
            .unwrap();
        assert_eq!(rows, vec![json!({"id": 2, "name": "Beta"})]);

        let injected = db
            .query_json(
                "SELECT id FROM agents WHERE name = ?1",
                &[json!("Alpha' OR '1'='1")],
            )
            .unwrap();
        assert!(injected.is_empty());
    }
}
