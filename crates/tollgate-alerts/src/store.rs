//! Alert records and their lifecycle.
//!
//! An alert moves `Open -> Acknowledged -> Resolved`, forward only.
//! Lifecycle transitions are idempotent by construction: re-resolving a
//! resolved alert keeps the first mark, and acknowledging one is a no-op,
//! so operator retries are always safe.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tollgate_types::{Clock, SecurityEventType, Severity};
use uuid::Uuid;

use crate::{AlertError, Result};

/// Lifecycle state of an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AlertStatus {
    Open,
    Acknowledged { by: String, at: DateTime<Utc> },
    Resolved { by: String, at: DateTime<Utc> },
}

impl AlertStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, AlertStatus::Open)
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, AlertStatus::Resolved { .. })
    }
}

/// One alert record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub title: String,
    pub alert_type: SecurityEventType,
    pub severity: Severity,
    pub message: String,
    /// Security events (or, for a summary, member alerts) behind this alert.
    pub source_event_ids: Vec<Uuid>,
    /// 1 for a direct alert, the buffer size for an aggregated summary.
    pub event_count: u32,
    pub created_at: DateTime<Utc>,
    pub status: AlertStatus,
}

/// Producer-side alert description; identity, timestamp and status are
/// assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertDraft {
    pub title: String,
    pub alert_type: SecurityEventType,
    pub severity: Severity,
    pub message: String,
    pub source_event_ids: Vec<Uuid>,
    pub event_count: u32,
}

impl AlertDraft {
    /// Starts a draft with the event type's default severity and a title
    /// derived from the type name.
    pub fn new(alert_type: SecurityEventType, message: impl Into<String>) -> Self {
        Self {
            title: alert_type.as_str().replace('_', " "),
            alert_type,
            severity: alert_type.default_severity(),
            message: message.into(),
            source_event_ids: Vec::new(),
            event_count: 1,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_source_event(mut self, event_id: Uuid) -> Self {
        self.source_event_ids.push(event_id);
        self
    }

    pub fn with_source_events(mut self, event_ids: impl IntoIterator<Item = Uuid>) -> Self {
        self.source_event_ids.extend(event_ids);
        self
    }

    pub fn with_event_count(mut self, event_count: u32) -> Self {
        self.event_count = event_count;
        self
    }
}

/// Filter for [`AlertStore::query`]. Set fields compose with AND.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertQuery {
    pub alert_type: Option<SecurityEventType>,
    pub min_severity: Option<Severity>,
    pub open_only: bool,
    pub limit: Option<usize>,
}

impl AlertQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, alert_type: SecurityEventType) -> Self {
        self.alert_type = Some(alert_type);
        self
    }

    pub fn with_min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    pub fn open_only(mut self) -> Self {
        self.open_only = true;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Concurrent store of alert records.
pub struct AlertStore {
    alerts: RwLock<Vec<Alert>>,
    clock: Arc<dyn Clock>,
}

impl AlertStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            alerts: RwLock::new(Vec::new()),
            clock,
        }
    }

    /// Creates an alert from a draft. Never fails.
    pub fn create(&self, draft: AlertDraft) -> Alert {
        let alert = Alert {
            id: Uuid::new_v4(),
            title: draft.title,
            alert_type: draft.alert_type,
            severity: draft.severity,
            message: draft.message,
            source_event_ids: draft.source_event_ids,
            event_count: draft.event_count,
            created_at: self.clock.now(),
            status: AlertStatus::Open,
        };
        let mut alerts = self.alerts.write().expect("lock poisoned");
        alerts.push(alert.clone());
        alert
    }

    pub fn get(&self, id: Uuid) -> Option<Alert> {
        let alerts = self.alerts.read().expect("lock poisoned");
        alerts.iter().find(|alert| alert.id == id).cloned()
    }

    /// Acknowledges an open alert.
    ///
    /// Acknowledging an alert that is already acknowledged or resolved is a
    /// no-op; the existing mark stands.
    pub fn acknowledge(&self, id: Uuid, by: &str) -> Result<Alert> {
        self.transition(id, |alert, now| {
            if alert.status.is_open() {
                alert.status = AlertStatus::Acknowledged {
                    by: by.to_string(),
                    at: now,
                };
            }
        })
    }

    /// Resolves an alert from any non-resolved state.
    ///
    /// Resolving an already-resolved alert is a no-op, not an error, so the
    /// operation is safe under retries.
    pub fn resolve(&self, id: Uuid, by: &str) -> Result<Alert> {
        self.transition(id, |alert, now| {
            if !alert.status.is_resolved() {
                alert.status = AlertStatus::Resolved {
                    by: by.to_string(),
                    at: now,
                };
            }
        })
    }

    fn transition(
        &self,
        id: Uuid,
        apply: impl FnOnce(&mut Alert, DateTime<Utc>),
    ) -> Result<Alert> {
        let now = self.clock.now();
        let mut alerts = self.alerts.write().expect("lock poisoned");
        let alert = alerts
            .iter_mut()
            .find(|alert| alert.id == id)
            .ok_or(AlertError::AlertNotFound(id))?;
        apply(alert, now);
        Ok(alert.clone())
    }

    /// Returns matching alerts in creation order.
    pub fn query(&self, query: &AlertQuery) -> Vec<Alert> {
        let alerts = self.alerts.read().expect("lock poisoned");
        let mut results: Vec<Alert> = alerts
            .iter()
            .filter(|alert| {
                query.alert_type.is_none_or(|t| alert.alert_type == t)
                    && query.min_severity.is_none_or(|s| alert.severity >= s)
                    && (!query.open_only || alert.status.is_open())
            })
            .cloned()
            .collect();
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }
        results
    }

    pub fn count(&self) -> usize {
        self.alerts.read().expect("lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, TimeZone};
    use tollgate_types::ManualClock;

    use super::*;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 4, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn store_with_clock() -> (AlertStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        (AlertStore::new(clock.clone()), clock)
    }

    fn brute_force_draft() -> AlertDraft {
        AlertDraft::new(
            SecurityEventType::BruteForceAttempt,
            "5 invalid API key attempts from 203.0.113.7",
        )
    }

    #[test]
    fn create_assigns_identity_and_defaults() {
        let (store, _clock) = store_with_clock();
        let alert = store.create(brute_force_draft());

        assert_eq!(alert.title, "brute force attempt");
        assert_eq!(alert.severity, Severity::High);
        assert_eq!(alert.event_count, 1);
        assert_eq!(alert.status, AlertStatus::Open);
        assert_eq!(store.get(alert.id), Some(alert));
    }

    #[test]
    fn lifecycle_walks_forward_only() {
        let (store, clock) = store_with_clock();
        let alert = store.create(brute_force_draft());

        let acked = store.acknowledge(alert.id, "ops").expect("alert exists");
        assert_eq!(
            acked.status,
            AlertStatus::Acknowledged {
                by: "ops".to_string(),
                at: start()
            }
        );

        clock.advance(TimeDelta::minutes(10));
        let resolved = store.resolve(alert.id, "ops").expect("alert exists");
        assert!(resolved.status.is_resolved());

        // A late acknowledge does not reopen or re-mark.
        let after = store.acknowledge(alert.id, "someone-else").expect("still ok");
        assert!(after.status.is_resolved());
    }

    #[test]
    fn resolve_is_idempotent() {
        let (store, clock) = store_with_clock();
        let alert = store.create(brute_force_draft());

        store.resolve(alert.id, "ops").expect("alert exists");
        clock.advance(TimeDelta::hours(1));
        let again = store.resolve(alert.id, "someone-else").expect("still ok");

        assert_eq!(
            again.status,
            AlertStatus::Resolved {
                by: "ops".to_string(),
                at: start()
            }
        );
    }

    #[test]
    fn unknown_id_is_an_error() {
        let (store, _clock) = store_with_clock();
        let err = store
            .acknowledge(Uuid::new_v4(), "ops")
            .expect_err("no such alert");
        assert!(matches!(err, AlertError::AlertNotFound(_)));
    }

    #[test]
    fn query_filters_compose() {
        let (store, _clock) = store_with_clock();
        let low = store.create(
            AlertDraft::new(SecurityEventType::UsageLimitExceeded, "limit hit")
                .with_severity(Severity::Low),
        );
        store.create(brute_force_draft());
        store.resolve(low.id, "ops").expect("alert exists");

        assert_eq!(
            store
                .query(&AlertQuery::new().with_min_severity(Severity::High))
                .len(),
            1
        );
        assert_eq!(store.query(&AlertQuery::new().open_only()).len(), 1);
        assert_eq!(
            store
                .query(&AlertQuery::new().with_type(SecurityEventType::UsageLimitExceeded))
                .len(),
            1
        );
        assert_eq!(store.query(&AlertQuery::new().with_limit(1)).len(), 1);
        assert_eq!(store.count(), 2);
    }
}
