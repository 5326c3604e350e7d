use std::sync::Arc;

use chrono::{Duration, Utc};
use relaydesk_common::{Result, TenantId};
use relaydesk_config::AlertConfig;
use relaydesk_db::{Alert, NewAlert, NewAuditEntry, Severity, SharedStore};
use serde_json::json;
use tracing::{error, warn};

/// Append-only audit log and alert writer. Writes never fail the caller:
/// a storage error is logged and swallowed.
#[derive(Clone)]
pub struct AuditSink {
    shared: Arc<SharedStore>,
}

impl AuditSink {
    pub fn new(shared: Arc<SharedStore>) -> Self {
        Self { shared }
    }

    pub fn record(&self, entry: NewAuditEntry) {
        if let Err(e) = self.shared.append_audit(&entry) {
            error!(
                "audit: failed to record {} on {}: {e}",
                entry.action, entry.resource_type
            );
        }
    }

    pub fn raise_alert(&self, alert: NewAlert) -> Option<Alert> {
        match self.shared.insert_alert(&alert) {
            Ok(stored) => {
                warn!(
                    "alert raised: [{}] {} ({})",
                    stored.severity.as_str(),
                    stored.title,
                    stored.alert_type
                );
                Some(stored)
            }
            Err(e) => {
                error!("audit: failed to raise alert {}: {e}", alert.alert_type);
                None
            }
        }
    }

    /// Mark an alert resolved by `operator`. `Ok(None)` when it does not exist.
    pub fn resolve_alert(&self, alert_id: i64, operator: TenantId) -> Result<Option<Alert>> {
        let resolved = self.shared.resolve_alert(alert_id, operator)?;
        if resolved.is_some() {
            self.record(
                NewAuditEntry::new("alert_resolved", "alert")
                    .resource(alert_id)
                    .actor(operator),
            );
        }
        Ok(resolved)
    }

    /// Accepted credentials. `via` names the surface (`websocket`).
    pub fn login(
        &self,
        tenant: TenantId,
        via: &str,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) {
        let mut entry = NewAuditEntry::new("login", "session")
            .resource(via)
            .actor(tenant);
        entry.ip_address = ip_address;
        entry.user_agent = user_agent;
        self.record(entry);
    }

    /// Refused credentials on the REST API or the dashboard socket.
    pub fn authentication_failed(
        &self,
        via: &str,
        reason: &str,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) {
        warn!("{via}: authentication failed from {ip_address:?}: {reason}");
        let mut entry = NewAuditEntry::new("authentication_failed", "session")
            .resource(via)
            .change(None, Some(json!({ "reason": reason })));
        entry.ip_address = ip_address;
        entry.user_agent = user_agent;
        self.record(entry);
    }

    /// A webhook that failed its signature or token check. Audited and raised
    /// as a warning since it usually means someone is probing the endpoint.
    pub fn webhook_rejected(
        &self,
        channel: &str,
        reason: &str,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Option<Alert> {
        let mut entry = NewAuditEntry::new("webhook_verification_failed", "webhook")
            .resource(channel)
            .change(None, Some(json!({ "reason": reason })));
        entry.ip_address = ip_address.clone();
        entry.user_agent = user_agent;
        self.record(entry);

        self.raise_alert(NewAlert {
            alert_type: "webhook_verification_failed".into(),
            severity: Severity::Warning,
            title: format!("Rejected {channel} webhook"),
            message: reason.to_string(),
            metadata: json!({ "channel": channel, "ip_address": ip_address }),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Delivery,
    Generation,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivery => "delivery",
            Self::Generation => "generation",
        }
    }
}

/// Counts failures per `(tenant, kind, scope)` inside a sliding window and
/// escalates them into alerts.
#[derive(Clone)]
pub struct FailureTracker {
    sink: AuditSink,
    threshold: u64,
    window: Duration,
}

impl FailureTracker {
    pub fn new(sink: AuditSink, config: &AlertConfig) -> Self {
        Self {
            sink,
            threshold: u64::from(config.failure_threshold.max(1)),
            window: Duration::hours(i64::from(config.window_hours.max(1))),
        }
    }

    /// Store one failure and return the alert it triggered, if any.
    ///
    /// Delivery failures alert once, exactly when the count reaches the
    /// threshold. Generation failures also warn on the first failure of the
    /// window; when both conditions hold the error wins.
    pub fn record(
        &self,
        tenant: TenantId,
        kind: FailureKind,
        scope: &str,
        detail: &str,
    ) -> Option<Alert> {
        let since = Utc::now() - self.window;
        let count = match self
            .sink
            .shared
            .record_failure(tenant, kind.as_str(), scope, detail, since)
        {
            Ok(count) => count,
            Err(e) => {
                error!("audit: failed to count {} failure: {e}", kind.as_str());
                return None;
            }
        };

        let severity = if count == self.threshold {
            Severity::Error
        } else if kind == FailureKind::Generation && count == 1 {
            Severity::Warning
        } else {
            return None;
        };

        let (alert_type, title) = match kind {
            FailureKind::Delivery => (
                "delivery_failure",
                format!("{scope} delivery failing for tenant {tenant}"),
            ),
            FailureKind::Generation => (
                "generation_failure",
                format!("AI generation failing for tenant {tenant}"),
            ),
        };

        self.sink.raise_alert(NewAlert {
            alert_type: alert_type.into(),
            severity,
            title,
            message: detail.to_string(),
            metadata: json!({
                "tenant_id": tenant,
                "scope": scope,
                "count": count,
                "window_hours": self.window.num_hours(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(threshold: u32) -> (FailureTracker, Arc<SharedStore>) {
        let shared = Arc::new(SharedStore::in_memory().unwrap());
        let config = AlertConfig {
            failure_threshold: threshold,
            window_hours: 24,
        };
        (
            FailureTracker::new(AuditSink::new(Arc::clone(&shared)), &config),
            shared,
        )
    }

    #[test]
    fn delivery_alert_fires_once_at_threshold() {
        let (tracker, shared) = tracker(3);
        let tenant = TenantId(1);

        assert!(tracker.record(tenant, FailureKind::Delivery, "whatsapp", "503").is_none());
        assert!(tracker.record(tenant, FailureKind::Delivery, "whatsapp", "503").is_none());
        let alert = tracker
            .record(tenant, FailureKind::Delivery, "whatsapp", "503")
            .unwrap();
        assert_eq!(alert.alert_type, "delivery_failure");
        assert_eq!(alert.severity, Severity::Error);
        assert!(tracker.record(tenant, FailureKind::Delivery, "whatsapp", "503").is_none());

        assert_eq!(shared.list_alerts(false, 10).unwrap().len(), 1);
    }

    #[test]
    fn scopes_and_tenants_count_separately() {
        let (tracker, _) = tracker(2);
        tracker.record(TenantId(1), FailureKind::Delivery, "telegram", "x");
        assert!(tracker.record(TenantId(1), FailureKind::Delivery, "email", "x").is_none());
        assert!(tracker.record(TenantId(2), FailureKind::Delivery, "telegram", "x").is_none());
        assert!(tracker.record(TenantId(1), FailureKind::Delivery, "telegram", "x").is_some());
    }

    #[test]
    fn generation_warns_first_then_errors_at_threshold() {
        let (tracker, _) = tracker(3);
        let tenant = TenantId(5);

        let first = tracker.record(tenant, FailureKind::Generation, "openai", "timeout").unwrap();
        assert_eq!(first.severity, Severity::Warning);
        assert!(tracker.record(tenant, FailureKind::Generation, "openai", "timeout").is_none());
        let third = tracker.record(tenant, FailureKind::Generation, "openai", "timeout").unwrap();
        assert_eq!(third.severity, Severity::Error);
        assert_eq!(third.alert_type, "generation_failure");
    }

    #[test]
    fn threshold_of_one_prefers_error() {
        let (tracker, _) = tracker(1);
        let alert = tracker
            .record(TenantId(1), FailureKind::Generation, "anthropic", "down")
            .unwrap();
        assert_eq!(alert.severity, Severity::Error);
    }

    #[test]
    fn rejected_webhook_is_audited_and_alerted() {
        let shared = Arc::new(SharedStore::in_memory().unwrap());
        let sink = AuditSink::new(Arc::clone(&shared));

        let alert = sink
            .webhook_rejected("whatsapp", "signature mismatch", Some("10.0.0.9".into()), None)
            .unwrap();
        assert_eq!(alert.severity, Severity::Warning);

        let audit = shared.list_audit(10).unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, "webhook_verification_failed");
        assert_eq!(audit[0].ip_address.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn resolving_sets_operator_and_audits() {
        let shared = Arc::new(SharedStore::in_memory().unwrap());
        let sink = AuditSink::new(Arc::clone(&shared));
        let alert = sink
            .raise_alert(NewAlert {
                alert_type: "test".into(),
                severity: Severity::Info,
                title: "t".into(),
                message: "m".into(),
                metadata: json!({}),
            })
            .unwrap();

        let resolved = sink.resolve_alert(alert.id, TenantId(9)).unwrap().unwrap();
        assert!(resolved.resolved);
        assert_eq!(resolved.resolved_by, Some(TenantId(9)));
        assert!(sink.resolve_alert(9999, TenantId(9)).unwrap().is_none());
        assert_eq!(shared.list_audit(10).unwrap()[0].action, "alert_resolved");
    }
}
