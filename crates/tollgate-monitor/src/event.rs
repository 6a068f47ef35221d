//! Security events and their drafts.
//!
//! Producers build an [`EventDraft`]; the log assigns identity and time
//! when recording it. A recorded [`SecurityEvent`] is immutable except for
//! its resolution mark.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tollgate_types::{DetailValue, EventDetails, GeoPoint, SecurityEventType, Severity};
use uuid::Uuid;

/// Resolution mark on a handled event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub resolved_by: String,
    pub resolved_at: DateTime<Utc>,
}

/// One recorded security event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub event_type: SecurityEventType,
    pub severity: Severity,
    pub user_id: Option<String>,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub details: EventDetails,
    pub geolocation: Option<GeoPoint>,
    pub resolution: Option<Resolution>,
}

impl SecurityEvent {
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    /// Dotted-path field lookup used by pattern conditions.
    ///
    /// Paths resolve `type`, `severity`, `user_id`, `ip_address` and
    /// `user_agent` at the root, and `details.<key>` inside the payload.
    /// Anything else, including an absent optional field, yields `None`.
    pub fn field(&self, path: &str) -> Option<DetailValue> {
        match path {
            "type" => Some(DetailValue::Text(self.event_type.as_str().to_string())),
            "severity" => Some(DetailValue::Text(self.severity.as_str().to_string())),
            "user_id" => self.user_id.clone().map(DetailValue::Text),
            "ip_address" => Some(DetailValue::Text(self.ip_address.clone())),
            "user_agent" => self.user_agent.clone().map(DetailValue::Text),
            _ => path
                .strip_prefix("details.")
                .and_then(|key| self.details.get(key).cloned()),
        }
    }
}

/// Producer-side event description; identity and timestamp are assigned by
/// the log at record time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    pub event_type: SecurityEventType,
    pub severity: Severity,
    pub user_id: Option<String>,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub details: EventDetails,
    pub geolocation: Option<GeoPoint>,
}

impl EventDraft {
    /// Starts a draft with the event type's default severity.
    pub fn new(event_type: SecurityEventType, ip_address: impl Into<String>) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            user_id: None,
            ip_address: ip_address.into(),
            user_agent: None,
            details: EventDetails::new(),
            geolocation: None,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_details(mut self, details: EventDetails) -> Self {
        self.details = details;
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<DetailValue>) -> Self {
        self.details.insert(key, value);
        self
    }

    pub fn with_geolocation(mut self, point: GeoPoint) -> Self {
        self.geolocation = Some(point);
        self
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use test_case::test_case;

    use super::*;

    fn sample() -> SecurityEvent {
        SecurityEvent {
            id: Uuid::new_v4(),
            event_type: SecurityEventType::PermissionDenied,
            severity: Severity::Medium,
            user_id: Some("user-1".to_string()),
            ip_address: "203.0.113.7".to_string(),
            user_agent: None,
            timestamp: Utc
                .with_ymd_and_hms(2025, 6, 4, 12, 0, 0)
                .single()
                .expect("valid timestamp"),
            details: EventDetails::new()
                .with("feature", "ai_analysis")
                .with("attempts", 5),
            geolocation: None,
            resolution: None,
        }
    }

    #[test_case("type", Some("permission_denied"); "event type at root")]
    #[test_case("severity", Some("medium"); "severity at root")]
    #[test_case("user_id", Some("user-1"); "user id at root")]
    #[test_case("ip_address", Some("203.0.113.7"); "ip at root")]
    #[test_case("details.feature", Some("ai_analysis"); "details key")]
    #[test_case("details.missing", None; "absent details key")]
    #[test_case("user_agent", None; "absent optional field")]
    #[test_case("nonsense", None; "unknown root")]
    fn field_lookup(path: &str, expected: Option<&str>) {
        let event = sample();
        let found = event.field(path);
        match expected {
            Some(text) => assert_eq!(found, Some(DetailValue::Text(text.to_string()))),
            None => assert!(found.is_none()),
        }
    }

    #[test]
    fn field_lookup_preserves_value_types() {
        let event = sample();
        assert_eq!(event.field("details.attempts"), Some(DetailValue::Int(5)));
    }

    #[test]
    fn draft_defaults_severity_from_type() {
        let draft = EventDraft::new(SecurityEventType::InjectionAttempt, "203.0.113.7");
        assert_eq!(draft.severity, Severity::Critical);

        let draft = draft.with_severity(Severity::High);
        assert_eq!(draft.severity, Severity::High);
    }
}
