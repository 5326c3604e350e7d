use std::collections::HashSet;

use dashmap::DashMap;
use relaydesk_common::{ConnectionId, ConversationId, TenantId};
use relaydesk_db::{Agent, StoredMessage, TenantMetrics};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Server -> client event names.
pub mod events {
    pub const CONNECTED: &str = "connected";
    pub const AUTHENTICATED: &str = "authenticated";
    pub const AUTHENTICATION_ERROR: &str = "authentication_error";
    pub const NEW_MESSAGE: &str = "new_message";
    pub const CONVERSATION_UPDATED: &str = "conversation_updated";
    pub const CONVERSATION_MESSAGES: &str = "conversation_messages";
    pub const USER_TYPING: &str = "user_typing";
    pub const REAL_TIME_METRICS: &str = "real_time_metrics";
    pub const NOTIFICATION: &str = "notification";
    pub const AGENT_UPDATED: &str = "agent_updated";
    pub const ERROR: &str = "error";
}

/// Serialize one wire frame: `{"event": name, "data": data}`.
pub fn frame(event: &str, data: Value) -> String {
    json!({ "event": event, "data": data }).to_string()
}

struct Connection {
    tx: mpsc::Sender<String>,
    tenant: Option<TenantId>,
    rooms: HashSet<ConversationId>,
}

/// Live dashboard connections, the tenant each one authenticated as and the
/// conversation rooms it joined. Every send is fire-and-forget: a full or
/// closed outbound queue drops the event.
#[derive(Default)]
pub struct BroadcastHub {
    connections: DashMap<ConnectionId, Connection>,
    tenants: DashMap<TenantId, HashSet<ConnectionId>>,
    rooms: DashMap<(TenantId, ConversationId), HashSet<ConnectionId>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new, unauthenticated connection whose frames go to `tx`.
    pub fn register(&self, tx: mpsc::Sender<String>) -> ConnectionId {
        let id = ConnectionId::new();
        self.connections.insert(
            id.clone(),
            Connection {
                tx,
                tenant: None,
                rooms: HashSet::new(),
            },
        );
        id
    }

    /// Bind a connection to a tenant and put it in the tenant room. Rebinding
    /// to another tenant drops every room of the previous one.
    pub fn bind_tenant(&self, conn: &ConnectionId, tenant: TenantId) -> bool {
        let previous = {
            let Some(mut entry) = self.connections.get_mut(conn) else {
                return false;
            };
            let previous = entry.tenant.replace(tenant);
            let rooms: Vec<ConversationId> = if previous != Some(tenant) {
                entry.rooms.drain().collect()
            } else {
                Vec::new()
            };
            previous.map(|p| (p, rooms))
        };

        if let Some((old, rooms)) = previous {
            if old != tenant {
                self.remove_member(&self.tenants, &old, conn);
                for room in rooms {
                    self.remove_member(&self.rooms, &(old, room), conn);
                }
            }
        }
        self.tenants.entry(tenant).or_default().insert(conn.clone());
        true
    }

    pub fn tenant_of(&self, conn: &ConnectionId) -> Option<TenantId> {
        self.connections.get(conn).and_then(|c| c.tenant)
    }

    /// Join a conversation room of the tenant the connection is bound to.
    pub fn join(&self, conn: &ConnectionId, conversation: ConversationId) -> bool {
        let tenant = {
            let Some(mut entry) = self.connections.get_mut(conn) else {
                return false;
            };
            let Some(tenant) = entry.tenant else {
                return false;
            };
            entry.rooms.insert(conversation);
            tenant
        };
        self.rooms
            .entry((tenant, conversation))
            .or_default()
            .insert(conn.clone());
        true
    }

    pub fn leave(&self, conn: &ConnectionId, conversation: ConversationId) -> bool {
        let tenant = {
            let Some(mut entry) = self.connections.get_mut(conn) else {
                return false;
            };
            let Some(tenant) = entry.tenant else {
                return false;
            };
            if !entry.rooms.remove(&conversation) {
                return false;
            }
            tenant
        };
        self.remove_member(&self.rooms, &(tenant, conversation), conn);
        true
    }

    pub fn in_room(&self, conn: &ConnectionId, conversation: ConversationId) -> bool {
        self.connections
            .get(conn)
            .is_some_and(|c| c.rooms.contains(&conversation))
    }

    /// Forget a connection everywhere.
    pub fn disconnect(&self, conn: &ConnectionId) {
        let Some((_, entry)) = self.connections.remove(conn) else {
            return;
        };
        if let Some(tenant) = entry.tenant {
            self.remove_member(&self.tenants, &tenant, conn);
            for room in entry.rooms {
                self.remove_member(&self.rooms, &(tenant, room), conn);
            }
        }
        debug!("hub: connection {conn} deregistered");
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Tenants with at least one authenticated connection, ascending.
    pub fn connected_tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self
            .tenants
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| *e.key())
            .collect();
        tenants.sort();
        tenants
    }

    /// Send a frame to one connection.
    pub fn send_to(&self, conn: &ConnectionId, event: &str, data: Value) -> bool {
        let Some(tx) = self.connections.get(conn).map(|c| c.tx.clone()) else {
            return false;
        };
        push(conn, &tx, frame(event, data))
    }

    /// Send to every connection of a tenant. Returns how many were reached.
    pub fn emit_to_tenant(&self, tenant: TenantId, event: &str, data: Value) -> usize {
        let members = self.members(&self.tenants, &tenant);
        self.fan_out(&members, None, frame(event, data))
    }

    /// Send to a conversation room, optionally skipping one member.
    pub fn emit_to_conversation(
        &self,
        tenant: TenantId,
        conversation: ConversationId,
        event: &str,
        data: Value,
        except: Option<&ConnectionId>,
    ) -> usize {
        let members = self.members(&self.rooms, &(tenant, conversation));
        self.fan_out(&members, except, frame(event, data))
    }

    /// `new_message` to the conversation room and `conversation_updated` to
    /// the whole tenant, so dashboards that have not joined still see activity.
    pub fn emit_new_message(&self, tenant: TenantId, message: &StoredMessage) {
        let data = json!({
            "conversation_id": message.conversation_id,
            "message": message,
        });
        self.emit_to_conversation(
            tenant,
            message.conversation_id,
            events::NEW_MESSAGE,
            data,
            None,
        );
        self.emit_conversation_updated(
            tenant,
            message.conversation_id,
            json!({
                "last_message": message.content,
                "sender": message.sender,
                "updated_at": message.created_at,
            }),
        );
    }

    pub fn emit_conversation_updated(
        &self,
        tenant: TenantId,
        conversation: ConversationId,
        changes: Value,
    ) {
        self.emit_to_tenant(
            tenant,
            events::CONVERSATION_UPDATED,
            json!({ "conversation_id": conversation, "changes": changes }),
        );
    }

    pub fn emit_notification(&self, tenant: TenantId, notification: Value) {
        self.emit_to_tenant(tenant, events::NOTIFICATION, notification);
    }

    pub fn emit_agent_update(&self, tenant: TenantId, agent: &Agent) {
        self.emit_to_tenant(tenant, events::AGENT_UPDATED, json!({ "agent": agent }));
    }

    pub fn emit_metrics_update(&self, tenant: TenantId, metrics: &TenantMetrics) {
        self.emit_to_tenant(tenant, events::REAL_TIME_METRICS, json!(metrics));
    }

    fn members<K>(&self, map: &DashMap<K, HashSet<ConnectionId>>, key: &K) -> Vec<ConnectionId>
    where
        K: std::hash::Hash + Eq,
    {
        map.get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn remove_member<K>(
        &self,
        map: &DashMap<K, HashSet<ConnectionId>>,
        key: &K,
        conn: &ConnectionId,
    ) where
        K: std::hash::Hash + Eq,
    {
        if let Some(mut set) = map.get_mut(key) {
            set.remove(conn);
        }
        map.remove_if(key, |_, set| set.is_empty());
    }

    fn fan_out(
        &self,
        members: &[ConnectionId],
        except: Option<&ConnectionId>,
        payload: String,
    ) -> usize {
        let mut reached = 0;
        for conn in members {
            if Some(conn) == except {
                continue;
            }
            let Some(tx) = self.connections.get(conn).map(|c| c.tx.clone()) else {
                continue;
            };
            if push(conn, &tx, payload.clone()) {
                reached += 1;
            }
        }
        reached
    }
}

fn push(conn: &ConnectionId, tx: &mpsc::Sender<String>, payload: String) -> bool {
    match tx.try_send(payload) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("hub: outbound queue of {conn} is full, dropping event");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}
