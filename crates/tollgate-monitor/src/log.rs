//! Append-only security event log.
//!
//! Events are only ever appended or marked resolved; nothing rewrites
//! history. Pattern evaluation reads through [`SecurityEventLog::
//! snapshot_window`], which clones the matching slice under the read lock
//! and evaluates outside it, so a slow rule never holds up writers.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, TimeDelta, Utc};
use tollgate_types::{Clock, SecurityEventType, Severity};
use uuid::Uuid;

use crate::{
    MonitorError, Result,
    event::{EventDraft, Resolution, SecurityEvent},
};

/// Filter for [`SecurityEventLog::query`]. All set fields use AND logic;
/// the empty query matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventQuery {
    pub event_type: Option<SecurityEventType>,
    pub min_severity: Option<Severity>,
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub unresolved_only: bool,
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, event_type: SecurityEventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    /// Keeps events at `severity` and above.
    pub fn with_min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn with_ip(mut self, ip_address: &str) -> Self {
        self.ip_address = Some(ip_address.to_string());
        self
    }

    /// Keeps events within `[since, until]` (inclusive).
    pub fn with_time_range(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn unresolved_only(mut self) -> Self {
        self.unresolved_only = true;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Concurrent append-only log of security events.
pub struct SecurityEventLog {
    events: RwLock<Vec<SecurityEvent>>,
    clock: Arc<dyn Clock>,
}

impl SecurityEventLog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            clock,
        }
    }

    /// Records a draft, assigning identity and timestamp. Returns the
    /// recorded event.
    pub fn record(&self, draft: EventDraft) -> SecurityEvent {
        let event = SecurityEvent {
            id: Uuid::new_v4(),
            event_type: draft.event_type,
            severity: draft.severity,
            user_id: draft.user_id,
            ip_address: draft.ip_address,
            user_agent: draft.user_agent,
            timestamp: self.clock.now(),
            details: draft.details,
            geolocation: draft.geolocation,
            resolution: None,
        };

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            severity = %event.severity,
            ip = event.ip_address,
            "security event recorded"
        );

        let mut events = self.events.write().expect("lock poisoned");
        events.push(event.clone());
        event
    }

    /// Looks up one event by id.
    pub fn get(&self, id: Uuid) -> Option<SecurityEvent> {
        let events = self.events.read().expect("lock poisoned");
        events.iter().find(|event| event.id == id).cloned()
    }

    /// Marks an event resolved.
    ///
    /// Resolving an already-resolved event succeeds and keeps the original
    /// resolution; an unknown id is [`MonitorError::EventNotFound`].
    pub fn resolve(&self, id: Uuid, resolved_by: &str) -> Result<()> {
        let mut events = self.events.write().expect("lock poisoned");
        let event = events
            .iter_mut()
            .find(|event| event.id == id)
            .ok_or(MonitorError::EventNotFound(id))?;

        if event.resolution.is_none() {
            event.resolution = Some(Resolution {
                resolved_by: resolved_by.to_string(),
                resolved_at: self.clock.now(),
            });
            tracing::info!(event_id = %id, resolved_by, "security event resolved");
        }
        Ok(())
    }

    /// Returns matching events in insertion order.
    pub fn query(&self, query: &EventQuery) -> Vec<SecurityEvent> {
        let events = self.events.read().expect("lock poisoned");
        let mut results: Vec<SecurityEvent> = events
            .iter()
            .filter(|event| Self::matches(event, query))
            .cloned()
            .collect();
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }
        results
    }

    /// Clones the events of `event_type` at or after `since`.
    ///
    /// This is the read path for pattern evaluation: the lock is held only
    /// for the clone, never while conditions run.
    pub fn snapshot_window(
        &self,
        event_type: SecurityEventType,
        since: DateTime<Utc>,
    ) -> Vec<SecurityEvent> {
        let events = self.events.read().expect("lock poisoned");
        events
            .iter()
            .filter(|event| event.event_type == event_type && event.timestamp >= since)
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.events.read().expect("lock poisoned").len()
    }

    /// Drops resolved events older than `retention`. Unresolved events are
    /// kept regardless of age. Returns how many were removed.
    pub fn sweep(&self, now: DateTime<Utc>, retention: TimeDelta) -> usize {
        let horizon = now - retention;
        let mut events = self.events.write().expect("lock poisoned");
        let before = events.len();
        events.retain(|event| !(event.is_resolved() && event.timestamp < horizon));
        let removed = before - events.len();
        if removed > 0 {
            tracing::info!(removed, "swept resolved security events");
        }
        removed
    }

    fn matches(event: &SecurityEvent, query: &EventQuery) -> bool {
        if let Some(event_type) = query.event_type {
            if event.event_type != event_type {
                return false;
            }
        }
        if let Some(min) = query.min_severity {
            if event.severity < min {
                return false;
            }
        }
        if let Some(user_id) = &query.user_id {
            if event.user_id.as_deref() != Some(user_id.as_str()) {
                return false;
            }
        }
        if let Some(ip) = &query.ip_address {
            if event.ip_address != *ip {
                return false;
            }
        }
        if let Some(since) = query.since {
            if event.timestamp < since {
                return false;
            }
        }
        if let Some(until) = query.until {
            if event.timestamp > until {
                return false;
            }
        }
        if query.unresolved_only && event.is_resolved() {
            return false;
        }
        true
    }
}
