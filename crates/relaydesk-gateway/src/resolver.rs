use std::collections::HashSet;
use std::sync::Arc;

use relaydesk_common::{
    AgentId, ChannelType, ConversationId, Error, NormalizedMessage, Result, SenderRole, SessionId,
    TenantId,
};
use relaydesk_db::{
    ChannelAccount, ChannelRoute, ChannelSession, NewMessage, SessionStatus, StoredMessage,
    TenantDatabaseRouter, TenantDb,
};
use relaydesk_security::InputValidator;
use tracing::{debug, info, instrument, warn};

/// Where an inbound message landed.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub conversation_id: ConversationId,
    pub agent_id: Option<AgentId>,
    pub message: StoredMessage,
    /// The native id was already stored; nothing new was written.
    pub duplicate: bool,
}

/// Maps an external contact to its tenant, session and conversation, and
/// stores the inbound message there.
pub struct ConversationResolver {
    router: Arc<TenantDatabaseRouter>,
    default_tenant: Option<TenantId>,
}

impl ConversationResolver {
    pub fn new(router: Arc<TenantDatabaseRouter>, default_tenant: Option<TenantId>) -> Self {
        Self {
            router,
            default_tenant,
        }
    }

    #[instrument(skip(self, inbound), fields(channel = %inbound.channel_type))]
    pub fn resolve(&self, inbound: &NormalizedMessage) -> Result<Resolution> {
        InputValidator::validate_external_id(&inbound.external_sender_id)?;

        let (tenant_id, db, session) = self.resolve_session(inbound)?;
        let conversation = db.find_or_create_conversation(&session)?;

        let mut new = NewMessage::new(
            conversation.id,
            SenderRole::Customer,
            InputValidator::sanitize(&inbound.text),
        );
        new.native_message_id = inbound.native_message_id.clone();
        let outcome = db.insert_message(&new)?;
        db.touch_session(session.id)?;

        let duplicate = outcome.is_duplicate();
        if duplicate {
            debug!("duplicate inbound message in conversation {}", conversation.id);
        }

        Ok(Resolution {
            tenant_id,
            session_id: session.id,
            conversation_id: conversation.id,
            agent_id: session.agent_id.or(conversation.agent_id),
            message: outcome.into_message(),
            duplicate,
        })
    }

    fn resolve_session(
        &self,
        inbound: &NormalizedMessage,
    ) -> Result<(TenantId, Arc<TenantDb>, ChannelSession)> {
        let shared = self.router.shared();
        let external_id = inbound.external_sender_id.as_str();
        let channel = inbound.channel_type;

        if let Some(route) = shared.find_route(external_id, channel)? {
            if let Some(found) = self.follow_route(&route, inbound)? {
                return Ok(found);
            }
        }

        let account = self.channel_account(inbound)?;
        let owner = match &account {
            Some(account) => account.tenant_id,
            None => self.default_tenant.ok_or_else(|| {
                Error::TenantNotFound(format!(
                    "no tenant owns {channel} account {}",
                    inbound.recipient_account.as_deref().unwrap_or("(unknown)")
                ))
            })?,
        };
        let tenant = self.router.get_tenant(owner)?;
        if !tenant.active {
            return Err(Error::tenant_not_found(format!("{owner} (inactive)")));
        }

        let route = shared.claim_route(external_id, channel, owner)?;
        if route.tenant_id != owner {
            debug!(
                "route for {channel} contact already claimed by tenant {}",
                route.tenant_id
            );
        }
        let tenant_id = route.tenant_id;
        let db = self.router.route(tenant_id)?;

        let agent_id = match account.and_then(|a| a.agent_id) {
            Some(agent) if tenant_id == owner => Some(agent),
            _ => db.default_agent()?.map(|a| a.id),
        };

        let session = match db.create_session(
            external_id,
            channel,
            agent_id,
            inbound.contact_name.as_deref(),
        ) {
            Ok(session) => session,
            Err(e) => {
                if let Err(release) = shared.release_route(external_id, channel, tenant_id) {
                    warn!("failed to release route after session error: {release}");
                }
                return Err(e);
            }
        };
        shared.complete_route(external_id, channel, tenant_id, session.id)?;
        info!("routed new {channel} contact to tenant {tenant_id}, session {}", session.id);

        Ok((tenant_id, db, session))
    }

    /// Follow an existing index row. `None` means the row was stale and has
    /// been released. A suspended owner keeps its contacts, so the message
    /// is refused rather than re-homed.
    fn follow_route(
        &self,
        route: &ChannelRoute,
        inbound: &NormalizedMessage,
    ) -> Result<Option<(TenantId, Arc<TenantDb>, ChannelSession)>> {
        let shared = self.router.shared();
        let tenant_id = route.tenant_id;
        let db = match self.router.get_tenant(tenant_id) {
            Ok(tenant) if tenant.active => self.router.route(tenant_id)?,
            Ok(_) => {
                debug!("{} contact belongs to suspended tenant {tenant_id}", route.channel_type);
                return Err(Error::tenant_not_found(format!("{tenant_id} (inactive)")));
            }
            Err(Error::TenantNotFound(_)) => {
                shared.release_route(&route.external_id, route.channel_type, tenant_id)?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match route.session_id {
            Some(session_id) => match db.get_session(session_id)? {
                Some(session) if session.status == SessionStatus::Active => {
                    Ok(Some((tenant_id, db, session)))
                }
                _ => {
                    debug!("releasing stale route to session {session_id}");
                    shared.release_route(&route.external_id, route.channel_type, tenant_id)?;
                    Ok(None)
                }
            },
            None => {
                // Claimed by a request that did not finish creating the session.
                let agent_id = db.default_agent()?.map(|a| a.id);
                let session = db.create_session(
                    &route.external_id,
                    route.channel_type,
                    agent_id,
                    inbound.contact_name.as_deref(),
                )?;
                shared.complete_route(
                    &route.external_id,
                    route.channel_type,
                    tenant_id,
                    session.id,
                )?;
                Ok(Some((tenant_id, db, session)))
            }
        }
    }

    fn channel_account(&self, inbound: &NormalizedMessage) -> Result<Option<ChannelAccount>> {
        match inbound.recipient_account.as_deref() {
            Some(account) => self
                .router
                .shared()
                .find_channel_account(inbound.channel_type, account),
            None => Ok(None),
        }
    }

    /// Rebuild the routing index from the tenant databases. Tenants are
    /// scanned in ascending id order, suspended ones included, and the first
    /// active session found for a contact wins. Returns the number of routes
    /// written.
    pub fn rebuild_index(&self) -> Result<usize> {
        let mut seen: HashSet<(String, ChannelType)> = HashSet::new();
        let mut routes = Vec::new();

        for tenant_id in self.router.provisioned_ids()? {
            let db = self.router.route(tenant_id)?;
            for session in db.list_active_sessions()? {
                let key = (session.external_id.clone(), session.channel_type);
                if !seen.insert(key) {
                    warn!(
                        "contact on {} has active sessions in several tenants, keeping the first",
                        session.channel_type
                    );
                    continue;
                }
                routes.push(ChannelRoute {
                    external_id: session.external_id,
                    channel_type: session.channel_type,
                    tenant_id,
                    session_id: Some(session.id),
                });
            }
        }

        self.router.shared().replace_routes(&routes)?;
        info!("routing index rebuilt with {} routes", routes.len());
        Ok(routes.len())
    }
}
