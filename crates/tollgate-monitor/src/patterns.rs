//! Threshold patterns over the security event log.
//!
//! A pattern names an event type, a set of field conditions, a threshold
//! and a window: "5 `invalid_api_key` events from one source inside 5
//! minutes". Evaluation is free of side effects; a matched pattern comes
//! back as a [`PatternTrigger`] and the caller decides what to do with its
//! actions.
//!
//! After a pattern fires it stays quiet until its window has rolled past
//! the firing instant, then a fresh threshold count is required. Without
//! that, every event after the threshold would re-fire the pattern and any
//! block/alert action would run once per event instead of once per burst.

use std::{
    collections::HashMap,
    sync::RwLock,
};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tollgate_types::{DetailValue, SecurityEventType};

use crate::{
    MonitorError, Result,
    event::SecurityEvent,
    log::SecurityEventLog,
};

// ============================================================================
// Field conditions
// ============================================================================

/// Comparison operator in a [`FieldCondition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Equals,
    /// Substring match for text fields, membership for list fields.
    Contains,
    GreaterThan,
    LessThan,
    /// Field value is one of the listed values.
    In,
    /// Field value is present and none of the listed values.
    NotIn,
}

/// One predicate over an event field.
///
/// Paths use the event's dotted lookup (`type`, `severity`, `user_id`,
/// `ip_address`, `user_agent`, `details.<key>`). A missing path or a
/// type-mismatched comparison evaluates to false; conditions narrow, they
/// never fail open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCondition {
    pub path: String,
    pub op: ConditionOp,
    pub value: DetailValue,
}

impl FieldCondition {
    pub fn new(path: impl Into<String>, op: ConditionOp, value: impl Into<DetailValue>) -> Self {
        Self {
            path: path.into(),
            op,
            value: value.into(),
        }
    }

    /// Evaluates this condition against one event.
    pub fn matches(&self, event: &SecurityEvent) -> bool {
        let Some(field) = event.field(&self.path) else {
            return false;
        };

        match self.op {
            ConditionOp::Equals => values_equal(&field, &self.value),
            ConditionOp::Contains => match (&field, &self.value) {
                (DetailValue::Text(haystack), DetailValue::Text(needle)) => {
                    haystack.contains(needle.as_str())
                }
                (DetailValue::List(items), needle) => {
                    items.iter().any(|item| values_equal(item, needle))
                }
                _ => false,
            },
            ConditionOp::GreaterThan => match (field.as_f64(), self.value.as_f64()) {
                (Some(a), Some(b)) => a > b,
                _ => false,
            },
            ConditionOp::LessThan => match (field.as_f64(), self.value.as_f64()) {
                (Some(a), Some(b)) => a < b,
                _ => false,
            },
            ConditionOp::In => self
                .value
                .as_list()
                .is_some_and(|items| items.iter().any(|item| values_equal(&field, item))),
            ConditionOp::NotIn => self
                .value
                .as_list()
                .is_some_and(|items| !items.iter().any(|item| values_equal(&field, item))),
        }
    }
}

/// Equality with `Int`/`Float` treated as one numeric domain.
fn values_equal(a: &DetailValue, b: &DetailValue) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
        _ => a == b,
    }
}

// ============================================================================
// Patterns
// ============================================================================

/// What to do when a pattern fires.
///
/// Messages and reasons may carry `{user}`, `{ip}` and `{count}`
/// placeholders; the executor substitutes them from the trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatternAction {
    /// Send an alert through the alerting pipeline.
    Alert { message: String },
    /// Block the triggering event's source IP.
    BlockIp { reason: String },
    /// Suspend the triggering event's user.
    SuspendUser { reason: String },
    /// Deliver a one-off webhook notification.
    Webhook { url: String },
}

/// A threshold rule over the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityPattern {
    pub id: String,
    pub name: String,
    pub event_type: SecurityEventType,
    pub conditions: Vec<FieldCondition>,
    /// Matching events required inside the window before the pattern
    /// fires. At least 1.
    pub threshold: u32,
    /// Evaluation window, measured back from the triggering event.
    /// Serialized as whole minutes (`window_minutes`).
    #[serde(rename = "window_minutes", with = "window_minutes")]
    pub window: TimeDelta,
    pub actions: Vec<PatternAction>,
    pub enabled: bool,
}

impl SecurityPattern {
    /// Starts a pattern with threshold 1, a 5 minute window and no
    /// conditions or actions.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        event_type: SecurityEventType,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            event_type,
            conditions: Vec::new(),
            threshold: 1,
            window: TimeDelta::minutes(5),
            actions: Vec::new(),
            enabled: true,
        }
    }

    pub fn with_condition(mut self, condition: FieldCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_window(mut self, window: TimeDelta) -> Self {
        self.window = window;
        self
    }

    pub fn with_action(mut self, action: PatternAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Checks the structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(MonitorError::InvalidPattern {
                id: self.id.clone(),
                reason: "id must not be empty".to_string(),
            });
        }
        if self.threshold == 0 {
            return Err(MonitorError::InvalidPattern {
                id: self.id.clone(),
                reason: "threshold must be at least 1".to_string(),
            });
        }
        if self.window <= TimeDelta::zero() {
            return Err(MonitorError::InvalidPattern {
                id: self.id.clone(),
                reason: "window must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Whether this event alone satisfies the type and field conditions.
    fn matches_event(&self, event: &SecurityEvent) -> bool {
        self.event_type == event.event_type
            && self.conditions.iter().all(|condition| condition.matches(event))
    }
}

/// Serde mapping between [`TimeDelta`] windows and whole minutes, the
/// unit pattern files use.
mod window_minutes {
    use chrono::TimeDelta;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(window: &TimeDelta, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(window.num_minutes())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TimeDelta, D::Error> {
        let minutes = i64::deserialize(deserializer)?;
        TimeDelta::try_minutes(minutes)
            .ok_or_else(|| D::Error::custom(format!("window of {minutes} minutes is out of range")))
    }
}

/// A pattern that fired, with everything the executor needs.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternTrigger {
    pub pattern_id: String,
    pub pattern_name: String,
    pub actions: Vec<PatternAction>,
    /// Matching events counted inside the window, threshold included.
    pub matched: u32,
    pub window: TimeDelta,
    /// The event that tipped the count over the threshold.
    pub event: SecurityEvent,
}

// ============================================================================
// Engine
// ============================================================================

/// Evaluates patterns against incoming events.
///
/// The engine is pure with respect to effects and to time: it reads the
/// clock from event timestamps and only ever returns triggers. Callers
/// record the event in the log first, then hand it here.
pub struct PatternEngine {
    patterns: Vec<SecurityPattern>,
    /// Pattern id -> timestamp of the last fire, for window suppression.
    fired: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl PatternEngine {
    /// Validates and installs `patterns`. Ids must be unique; suppression
    /// state is keyed by id.
    pub fn new(patterns: Vec<SecurityPattern>) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for pattern in &patterns {
            pattern.validate()?;
            if !seen.insert(pattern.id.as_str()) {
                return Err(MonitorError::InvalidPattern {
                    id: pattern.id.clone(),
                    reason: "duplicate id".to_string(),
                });
            }
        }
        Ok(Self {
            patterns,
            fired: RwLock::new(HashMap::new()),
        })
    }

    pub fn patterns(&self) -> &[SecurityPattern] {
        &self.patterns
    }

    /// Evaluates every enabled pattern against `event`.
    ///
    /// `event` must already be recorded in `log`; the window count runs
    /// over the log snapshot, so an unrecorded triggering event would be
    /// invisible to its own threshold.
    pub fn on_event(&self, event: &SecurityEvent, log: &SecurityEventLog) -> Vec<PatternTrigger> {
        let mut triggers = Vec::new();

        for pattern in &self.patterns {
            if !pattern.enabled || !pattern.matches_event(event) {
                continue;
            }

            if self.is_suppressed(&pattern.id, pattern.window, event.timestamp) {
                continue;
            }

            let since = event.timestamp - pattern.window;
            let window_events = log.snapshot_window(pattern.event_type, since);
            let matched = window_events
                .iter()
                .filter(|candidate| pattern.matches_event(candidate))
                .count();
            let matched = u32::try_from(matched).unwrap_or(u32::MAX);

            if matched >= pattern.threshold {
                tracing::info!(
                    pattern_id = pattern.id,
                    pattern_name = pattern.name,
                    matched,
                    threshold = pattern.threshold,
                    "pattern fired"
                );
                self.fired
                    .write()
                    .expect("lock poisoned")
                    .insert(pattern.id.clone(), event.timestamp);
                triggers.push(PatternTrigger {
                    pattern_id: pattern.id.clone(),
                    pattern_name: pattern.name.clone(),
                    actions: pattern.actions.clone(),
                    matched,
                    window: pattern.window,
                    event: event.clone(),
                });
            }
        }

        triggers
    }

    fn is_suppressed(&self, pattern_id: &str, window: TimeDelta, now: DateTime<Utc>) -> bool {
        let fired = self.fired.read().expect("lock poisoned");
        fired
            .get(pattern_id)
            .is_some_and(|fired_at| now < *fired_at + window)
    }
}

/// The rules Tollgate ships with when no `[[pattern]]` section is
/// configured.
pub fn default_patterns() -> Vec<SecurityPattern> {
    vec![
        SecurityPattern::new(
            "brute_force",
            "Repeated invalid API keys",
            SecurityEventType::InvalidApiKey,
        )
        .with_threshold(5)
        .with_window(TimeDelta::minutes(5))
        .with_action(PatternAction::Alert {
            message: "{count} invalid API key attempts from {ip}".to_string(),
        })
        .with_action(PatternAction::BlockIp {
            reason: "repeated invalid API keys".to_string(),
        }),
        SecurityPattern::new(
            "rate_limit_abuse",
            "Sustained rate limit abuse",
            SecurityEventType::RateLimitExceeded,
        )
        .with_threshold(10)
        .with_window(TimeDelta::minutes(10))
        .with_action(PatternAction::Alert {
            message: "{ip} exceeded rate limits {count} times".to_string(),
        })
        .with_action(PatternAction::BlockIp {
            reason: "sustained rate limit abuse".to_string(),
        }),
        SecurityPattern::new(
            "tier_probe",
            "Tier bypass probing",
            SecurityEventType::TierBypassAttempt,
        )
        .with_threshold(3)
        .with_window(TimeDelta::minutes(15))
        .with_action(PatternAction::Alert {
            message: "{user} probed gated features {count} times".to_string(),
        })
        .with_action(PatternAction::SuspendUser {
            reason: "repeated tier bypass attempts".to_string(),
        }),
    ]
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;
    use test_case::test_case;
    use tollgate_types::{EventDetails, ManualClock, Severity};
    use uuid::Uuid;

    use super::*;
    use crate::event::EventDraft;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 4, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn event_with_details(details: EventDetails) -> SecurityEvent {
        SecurityEvent {
            id: Uuid::new_v4(),
            event_type: SecurityEventType::PermissionDenied,
            severity: Severity::Medium,
            user_id: Some("user-1".to_string()),
            ip_address: "203.0.113.7".to_string(),
            user_agent: Some("curl/8.0".to_string()),
            timestamp: start(),
            details,
            geolocation: None,
            resolution: None,
        }
    }

    #[test_case(
        FieldCondition::new("user_id", ConditionOp::Equals, "user-1"), true;
        "equals on root field"
    )]
    #[test_case(
        FieldCondition::new("user_id", ConditionOp::Equals, "user-2"), false;
        "equals mismatch"
    )]
    #[test_case(
        FieldCondition::new("details.attempts", ConditionOp::GreaterThan, 3), true;
        "greater than on int"
    )]
    #[test_case(
        FieldCondition::new("details.attempts", ConditionOp::GreaterThan, 5.0), false;
        "greater than is strict"
    )]
    #[test_case(
        FieldCondition::new("details.attempts", ConditionOp::LessThan, 10), true;
        "less than widens int and float"
    )]
    #[test_case(
        FieldCondition::new("details.attempts", ConditionOp::Equals, 5.0), true;
        "int equals float"
    )]
    #[test_case(
        FieldCondition::new("user_agent", ConditionOp::Contains, "curl"), true;
        "contains substring"
    )]
    #[test_case(
        FieldCondition::new("details.attempts", ConditionOp::Contains, "5"), false;
        "contains on non text is false"
    )]
    #[test_case(
        FieldCondition::new("details.missing", ConditionOp::Equals, "x"), false;
        "missing path is false"
    )]
    #[test_case(
        FieldCondition::new("user_id", ConditionOp::GreaterThan, 3), false;
        "type mismatch is false"
    )]
    fn condition_evaluation(condition: FieldCondition, expected: bool) {
        let event = event_with_details(EventDetails::new().with("attempts", 5));
        assert_eq!(condition.matches(&event), expected);
    }

    #[test]
    fn membership_ops() {
        let event = event_with_details(
            EventDetails::new().with("tags", vec!["vpn", "tor"]),
        );

        let included = FieldCondition::new(
            "user_id",
            ConditionOp::In,
            vec!["user-1", "user-9"],
        );
        assert!(included.matches(&event));

        let excluded = FieldCondition::new(
            "user_id",
            ConditionOp::NotIn,
            vec!["user-8", "user-9"],
        );
        assert!(excluded.matches(&event));

        // NotIn still requires the field to exist.
        let on_missing = FieldCondition::new(
            "details.missing",
            ConditionOp::NotIn,
            vec!["anything"],
        );
        assert!(!on_missing.matches(&event));

        let list_contains = FieldCondition::new("details.tags", ConditionOp::Contains, "tor");
        assert!(list_contains.matches(&event));
    }

    #[test]
    fn pattern_validation_rejects_degenerate_rules() {
        let zero_threshold = SecurityPattern::new(
            "p",
            "P",
            SecurityEventType::InvalidApiKey,
        )
        .with_threshold(0);
        assert!(matches!(
            zero_threshold.validate(),
            Err(MonitorError::InvalidPattern { .. })
        ));

        let empty_id =
            SecurityPattern::new("", "P", SecurityEventType::InvalidApiKey);
        assert!(empty_id.validate().is_err());

        let zero_window = SecurityPattern::new("p", "P", SecurityEventType::InvalidApiKey)
            .with_window(TimeDelta::zero());
        assert!(zero_window.validate().is_err());

        assert!(PatternEngine::new(vec![zero_window]).is_err());
    }

    struct Rig {
        log: SecurityEventLog,
        clock: Arc<ManualClock>,
        engine: PatternEngine,
    }

    fn rig(patterns: Vec<SecurityPattern>) -> Rig {
        let clock = Arc::new(ManualClock::new(start()));
        Rig {
            log: SecurityEventLog::new(clock.clone()),
            clock,
            engine: PatternEngine::new(patterns).expect("patterns are valid"),
        }
    }

    /// Records a draft and runs the engine over it, the way the service
    /// wires the two together.
    fn feed(rig: &Rig, draft: EventDraft) -> Vec<PatternTrigger> {
        let event = rig.log.record(draft);
        rig.engine.on_event(&event, &rig.log)
    }

    fn invalid_key(ip: &str) -> EventDraft {
        EventDraft::new(SecurityEventType::InvalidApiKey, ip)
    }

    fn brute_force_pattern(threshold: u32) -> SecurityPattern {
        SecurityPattern::new(
            "brute_force",
            "Repeated invalid API keys",
            SecurityEventType::InvalidApiKey,
        )
        .with_threshold(threshold)
        .with_window(TimeDelta::minutes(5))
        .with_action(PatternAction::BlockIp {
            reason: "repeated invalid API keys".to_string(),
        })
    }

    #[test]
    fn fires_exactly_at_the_threshold() {
        let rig = rig(vec![brute_force_pattern(3)]);

        assert!(feed(&rig, invalid_key("203.0.113.7")).is_empty());
        assert!(feed(&rig, invalid_key("203.0.113.7")).is_empty());

        let triggers = feed(&rig, invalid_key("203.0.113.7"));
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].pattern_id, "brute_force");
        assert_eq!(triggers[0].matched, 3);
        assert_eq!(triggers[0].actions.len(), 1);
    }

    #[test]
    fn events_outside_the_window_do_not_count() {
        let rig = rig(vec![brute_force_pattern(3)]);

        feed(&rig, invalid_key("203.0.113.7"));
        feed(&rig, invalid_key("203.0.113.7"));

        // The burst goes stale before the third event arrives.
        rig.clock.advance(TimeDelta::minutes(6));
        assert!(feed(&rig, invalid_key("203.0.113.7")).is_empty());
    }

    #[test]
    fn suppressed_inside_the_window_then_fresh_threshold() {
        let rig = rig(vec![brute_force_pattern(3)]);

        feed(&rig, invalid_key("203.0.113.7"));
        feed(&rig, invalid_key("203.0.113.7"));
        assert_eq!(feed(&rig, invalid_key("203.0.113.7")).len(), 1);

        // A fourth qualifying event inside the window stays quiet.
        rig.clock.advance(TimeDelta::minutes(1));
        assert!(feed(&rig, invalid_key("203.0.113.7")).is_empty());

        // Once the window has rolled past the fire, a new burst must
        // re-meet the threshold on its own.
        rig.clock.advance(TimeDelta::minutes(5));
        assert!(feed(&rig, invalid_key("203.0.113.7")).is_empty());
        rig.clock.advance(TimeDelta::seconds(10));
        assert!(feed(&rig, invalid_key("203.0.113.7")).is_empty());
        rig.clock.advance(TimeDelta::seconds(10));
        assert_eq!(feed(&rig, invalid_key("203.0.113.7")).len(), 1);
    }

    #[test]
    fn conditions_narrow_the_window_count() {
        let pattern = brute_force_pattern(2).with_condition(FieldCondition::new(
            "ip_address",
            ConditionOp::Equals,
            "203.0.113.7",
        ));
        let rig = rig(vec![pattern]);

        feed(&rig, invalid_key("203.0.113.7"));
        // A different source does not contribute, and does not trigger.
        assert!(feed(&rig, invalid_key("198.51.100.1")).is_empty());

        let triggers = feed(&rig, invalid_key("203.0.113.7"));
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].matched, 2);
    }

    #[test]
    fn disabled_patterns_never_fire() {
        let rig = rig(vec![brute_force_pattern(1).with_enabled(false)]);
        assert!(feed(&rig, invalid_key("203.0.113.7")).is_empty());
    }

    #[test]
    fn patterns_fire_independently() {
        let rig = rig(vec![
            brute_force_pattern(2),
            SecurityPattern::new(
                "rate_abuse",
                "Rate limit abuse",
                SecurityEventType::RateLimitExceeded,
            )
            .with_threshold(1)
            .with_window(TimeDelta::minutes(5)),
        ]);

        let triggers = feed(
            &rig,
            EventDraft::new(SecurityEventType::RateLimitExceeded, "203.0.113.7"),
        );
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].pattern_id, "rate_abuse");

        feed(&rig, invalid_key("203.0.113.7"));
        let triggers = feed(&rig, invalid_key("203.0.113.7"));
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].pattern_id, "brute_force");
    }

    #[test]
    fn pattern_serde_uses_window_minutes() {
        let pattern = brute_force_pattern(3);
        let json = serde_json::to_string(&pattern).expect("serialize");
        assert!(json.contains("\"window_minutes\":5"), "got {json}");

        let back: SecurityPattern = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, pattern);
    }

    #[test]
    fn shipped_patterns_validate() {
        let patterns = default_patterns();
        assert!(!patterns.is_empty());
        PatternEngine::new(patterns).expect("shipped patterns are valid");
    }
}
