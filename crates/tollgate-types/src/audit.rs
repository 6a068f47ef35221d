//! Audit trail for externally significant transitions.
//!
//! Every permission decision, registry change and alert transition is
//! appended to an [`AuditSink`]. The sink is fire-and-forget: appending
//! never fails and never blocks the decision path on I/O.

use std::{
    collections::VecDeque,
    sync::RwLock,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{SecurityEventType, Severity};

/// A single audit record.
///
/// Variants carry only identifying fields; free-form context stays in the
/// security event log, not the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AuditEntry {
    // -- Permission decisions --
    /// A permission check concluded.
    PermissionDecision {
        user_id: Option<String>,
        tier: String,
        feature: String,
        action: String,
        allowed: bool,
        reason: Option<String>,
    },
    /// A usage counter was incremented.
    UsageTracked {
        user_id: String,
        feature: String,
        action: String,
    },
    /// A resource-cap check concluded.
    TierLimitDecision {
        tier: String,
        limit_type: String,
        proposed: i64,
        allowed: bool,
    },

    // -- Security events --
    /// A security event was recorded.
    EventRecorded {
        event_id: Uuid,
        event_type: SecurityEventType,
        severity: Severity,
    },
    /// A security event was marked resolved.
    EventResolved {
        event_id: Uuid,
        resolved_by: String,
    },

    // -- Registries --
    /// An IP address was blocked.
    IpBlocked {
        ip: String,
        reason: String,
        expires_at: DateTime<Utc>,
    },
    /// An IP block was lifted before expiry.
    IpUnblocked { ip: String },
    /// A user account was suspended.
    UserSuspended { user_id: String, reason: String },
    /// A suspended user was reinstated.
    UserReinstated { user_id: String },

    // -- Alerts --
    /// An alert record was created.
    AlertCreated {
        alert_id: Uuid,
        alert_type: SecurityEventType,
        severity: Severity,
    },
    /// An alert was delivered through a channel.
    AlertDelivered {
        alert_id: Uuid,
        config_id: String,
        channel: String,
    },
    /// A channel delivery failed after exhausting its retries.
    AlertDeliveryFailed {
        alert_id: Uuid,
        config_id: String,
        channel: String,
        error: String,
    },
    /// An alert was suppressed by the throttle window.
    AlertThrottled { alert_id: Uuid, config_id: String },
    /// Buffered alerts were flushed as one aggregated summary.
    AlertAggregated {
        config_id: String,
        alert_type: SecurityEventType,
        event_count: u32,
    },
    /// An alert was acknowledged by an operator.
    AlertAcknowledged { alert_id: Uuid, by: String },
    /// An alert was resolved by an operator.
    AlertResolved { alert_id: Uuid, by: String },
}

/// Destination for audit records.
///
/// Implementations must be cheap and infallible; callers never handle an
/// audit failure.
pub trait AuditSink: Send + Sync {
    /// Appends one record.
    fn append(&self, entry: AuditEntry);
}

/// Default sink: emits each record as a structured `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn append(&self, entry: AuditEntry) {
        match &entry {
            AuditEntry::PermissionDecision {
                user_id,
                tier,
                feature,
                action,
                allowed,
                reason,
            } => {
                tracing::debug!(
                    ?user_id,
                    tier,
                    feature,
                    action,
                    allowed,
                    ?reason,
                    "permission decision"
                );
            }
            AuditEntry::UsageTracked {
                user_id,
                feature,
                action,
            } => {
                tracing::debug!(user_id, feature, action, "usage tracked");
            }
            AuditEntry::TierLimitDecision {
                tier,
                limit_type,
                proposed,
                allowed,
            } => {
                tracing::debug!(tier, limit_type, proposed, allowed, "tier limit decision");
            }
            AuditEntry::EventRecorded {
                event_id,
                event_type,
                severity,
            } => {
                tracing::info!(%event_id, %event_type, %severity, "security event recorded");
            }
            AuditEntry::EventResolved {
                event_id,
                resolved_by,
            } => {
                tracing::info!(%event_id, resolved_by, "security event resolved");
            }
            AuditEntry::IpBlocked {
                ip,
                reason,
                expires_at,
            } => {
                tracing::info!(ip, reason, %expires_at, "ip blocked");
            }
            AuditEntry::IpUnblocked { ip } => {
                tracing::info!(ip, "ip unblocked");
            }
            AuditEntry::UserSuspended { user_id, reason } => {
                tracing::info!(user_id, reason, "user suspended");
            }
            AuditEntry::UserReinstated { user_id } => {
                tracing::info!(user_id, "user reinstated");
            }
            AuditEntry::AlertCreated {
                alert_id,
                alert_type,
                severity,
            } => {
                tracing::info!(%alert_id, %alert_type, %severity, "alert created");
            }
            AuditEntry::AlertDelivered {
                alert_id,
                config_id,
                channel,
            } => {
                tracing::info!(%alert_id, config_id, channel, "alert delivered");
            }
            AuditEntry::AlertDeliveryFailed {
                alert_id,
                config_id,
                channel,
                error,
            } => {
                tracing::warn!(%alert_id, config_id, channel, error, "alert delivery failed");
            }
            AuditEntry::AlertThrottled { alert_id, config_id } => {
                tracing::warn!(%alert_id, config_id, "alert throttled");
            }
            AuditEntry::AlertAggregated {
                config_id,
                alert_type,
                event_count,
            } => {
                tracing::info!(config_id, %alert_type, event_count, "alerts aggregated");
            }
            AuditEntry::AlertAcknowledged { alert_id, by } => {
                tracing::info!(%alert_id, by, "alert acknowledged");
            }
            AuditEntry::AlertResolved { alert_id, by } => {
                tracing::info!(%alert_id, by, "alert resolved");
            }
        }
    }
}

/// In-memory sink for tests; keeps the most recent `capacity` records.
#[derive(Debug)]
pub struct MemoryAuditSink {
    capacity: usize,
    entries: RwLock<VecDeque<AuditEntry>>,
}

impl MemoryAuditSink {
    const DEFAULT_CAPACITY: usize = 1024;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Creates a sink that retains at most `capacity` records.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be positive");
        Self {
            capacity,
            entries: RwLock::new(VecDeque::new()),
        }
    }

    /// Snapshot of the retained records, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .read()
            .expect("lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.write().expect("lock poisoned").clear();
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, entry: AuditEntry) {
        let mut entries = self.entries.write().expect("lock poisoned");
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(feature: &str, allowed: bool) -> AuditEntry {
        AuditEntry::PermissionDecision {
            user_id: Some("user-1".to_string()),
            tier: "basic".to_string(),
            feature: feature.to_string(),
            action: "read".to_string(),
            allowed,
            reason: None,
        }
    }

    #[test]
    fn memory_sink_captures_in_order() {
        let sink = MemoryAuditSink::new();
        sink.append(decision("reports", true));
        sink.append(decision("ai_analysis", false));

        let entries = sink.entries();
        assert_eq!(entries.len(), 2);
        assert!(matches!(
            &entries[0],
            AuditEntry::PermissionDecision { feature, allowed: true, .. } if feature == "reports"
        ));
    }

    #[test]
    fn memory_sink_drops_oldest_past_capacity() {
        let sink = MemoryAuditSink::with_capacity(2);
        sink.append(decision("a", true));
        sink.append(decision("b", true));
        sink.append(decision("c", true));

        let entries = sink.entries();
        assert_eq!(entries.len(), 2);
        assert!(matches!(
            &entries[0],
            AuditEntry::PermissionDecision { feature, .. } if feature == "b"
        ));
    }

    #[test]
    fn sink_is_object_safe() {
        let sink: Box<dyn AuditSink> = Box::new(MemoryAuditSink::new());
        sink.append(decision("reports", true));
    }
}
