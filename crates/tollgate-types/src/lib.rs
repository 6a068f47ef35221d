//! # tollgate-types: Core types for Tollgate
//!
//! Shared vocabulary used across the Tollgate system:
//! - Subscription tiers ([`Tier`])
//! - Permission levels ([`PermissionLevel`])
//! - Severity scale ([`Severity`])
//! - Security event classification ([`SecurityEventType`])
//! - Structured event details ([`EventDetails`], [`DetailValue`])
//! - Geolocation ([`GeoPoint`])
//! - Time sources ([`Clock`], [`SystemClock`], [`ManualClock`])
//! - Audit trail ([`AuditSink`], [`AuditEntry`])
//!
//! Everything here is plain data with no I/O; the engines in the other
//! crates build on this vocabulary.

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod audit;
mod clock;

pub use audit::{AuditEntry, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use clock::{Clock, ManualClock, SystemClock};

// ============================================================================
// Parse errors
// ============================================================================

/// Error returned when a name does not belong to one of the closed
/// vocabularies (tier, permission level, severity, event type).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value:?}")]
pub struct UnknownNameError {
    /// Which vocabulary was being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

impl UnknownNameError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

// ============================================================================
// Subscription tiers
// ============================================================================

/// Subscription tier.
///
/// Tiers are ordered from lowest to highest:
/// Basic < Professional < Enterprise
///
/// Declaration order is rank order: a tier satisfies every requirement a
/// lower tier satisfies.
///
/// # Examples
///
/// ```
/// use tollgate_types::Tier;
///
/// assert!(Tier::Enterprise.has_access(Tier::Basic));
/// assert!(!Tier::Basic.has_access(Tier::Professional));
/// assert_eq!("professional".parse::<Tier>(), Ok(Tier::Professional));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Entry tier with metered access to premium features.
    Basic,
    /// Mid tier with broader grants and higher resource caps.
    Professional,
    /// Top tier; unlimited caps and eligible for the admin override.
    Enterprise,
}

impl Tier {
    /// All tiers, lowest first.
    pub const ALL: [Tier; 3] = [Tier::Basic, Tier::Professional, Tier::Enterprise];

    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Basic => "basic",
            Tier::Professional => "professional",
            Tier::Enterprise => "enterprise",
        }
    }

    /// Returns whether this tier satisfies a requirement of `required`.
    pub fn has_access(&self, required: Tier) -> bool {
        *self >= required
    }

    /// The next tier up, or `None` for the top tier.
    pub fn next_tier(&self) -> Option<Tier> {
        match self {
            Tier::Basic => Some(Tier::Professional),
            Tier::Professional => Some(Tier::Enterprise),
            Tier::Enterprise => None,
        }
    }
}

impl Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = UnknownNameError;

    /// Case-insensitive; leading/trailing whitespace is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(Tier::Basic),
            "professional" => Ok(Tier::Professional),
            "enterprise" => Ok(Tier::Enterprise),
            _ => Err(UnknownNameError::new("tier", s)),
        }
    }
}

// ============================================================================
// Permission levels
// ============================================================================

/// Access level granted for a (tier, feature, action) combination.
///
/// Ordered from least to most capable: None < Read < Write < Admin.
/// `None` is an explicit denial, distinct from the combination being
/// absent from the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    /// Explicitly denied.
    None,
    /// Read-only access.
    Read,
    /// Read and write access.
    Write,
    /// Full access, including destructive operations.
    Admin,
}

impl PermissionLevel {
    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::None => "none",
            PermissionLevel::Read => "read",
            PermissionLevel::Write => "write",
            PermissionLevel::Admin => "admin",
        }
    }

    /// Whether this level grants any access at all.
    pub fn grants_access(&self) -> bool {
        !matches!(self, PermissionLevel::None)
    }
}

impl Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionLevel {
    type Err = UnknownNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(PermissionLevel::None),
            "read" => Ok(PermissionLevel::Read),
            "write" => Ok(PermissionLevel::Write),
            "admin" => Ok(PermissionLevel::Admin),
            _ => Err(UnknownNameError::new("permission level", s)),
        }
    }
}

// ============================================================================
// Severity
// ============================================================================

/// Severity scale shared by security events and alerts.
///
/// Ordered: Low < Medium < High < Critical. A severity threshold of `Low`
/// therefore admits everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = UnknownNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(UnknownNameError::new("severity", s)),
        }
    }
}

// ============================================================================
// Security event types
// ============================================================================

/// Classification of a security event.
///
/// This is a closed vocabulary; producers pick a variant rather than
/// inventing ad-hoc type strings, so pattern rules and alert routing can
/// match on it exactly.
///
/// Each variant documents the `details` keys its producers conventionally
/// attach. Consumers must tolerate missing keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    /// A permission check failed. Details: `feature`, `action`, `tier`,
    /// `reason`.
    PermissionDenied,
    /// A caller presented a tier it does not hold or probed a gate it
    /// cannot pass. Details: `feature`, `claimed_tier`.
    TierBypassAttempt,
    /// A conditional grant ran out of budget. Details: `feature`, `action`,
    /// `usage_limit`, `period`.
    UsageLimitExceeded,
    /// Request rate above the configured ceiling. Details: `endpoint`,
    /// `limit`, `observed`.
    RateLimitExceeded,
    /// Authentication with an unknown or revoked API key. Details:
    /// `key_prefix`.
    InvalidApiKey,
    /// Input matched an injection signature. Details: `field`, `signature`.
    InjectionAttempt,
    /// Login from a location implying impossible travel. Details:
    /// `from_location`, `to_location`, `distance_km`, `elapsed_hours`,
    /// `min_travel_hours`.
    GeographicAnomaly,
    /// Login that is suspicious for reasons other than geography.
    /// Details: `indicator`.
    SuspiciousLogin,
    /// Repeated failed authentication attempts. Details: `attempts`.
    BruteForceAttempt,
    /// A permission check succeeded. Recorded only where an audit of
    /// positive decisions is wanted. Details: `feature`, `action`.
    AccessGranted,
}

impl SecurityEventType {
    /// All event types.
    pub const ALL: [SecurityEventType; 10] = [
        SecurityEventType::PermissionDenied,
        SecurityEventType::TierBypassAttempt,
        SecurityEventType::UsageLimitExceeded,
        SecurityEventType::RateLimitExceeded,
        SecurityEventType::InvalidApiKey,
        SecurityEventType::InjectionAttempt,
        SecurityEventType::GeographicAnomaly,
        SecurityEventType::SuspiciousLogin,
        SecurityEventType::BruteForceAttempt,
        SecurityEventType::AccessGranted,
    ];

    /// Canonical snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventType::PermissionDenied => "permission_denied",
            SecurityEventType::TierBypassAttempt => "tier_bypass_attempt",
            SecurityEventType::UsageLimitExceeded => "usage_limit_exceeded",
            SecurityEventType::RateLimitExceeded => "rate_limit_exceeded",
            SecurityEventType::InvalidApiKey => "invalid_api_key",
            SecurityEventType::InjectionAttempt => "injection_attempt",
            SecurityEventType::GeographicAnomaly => "geographic_anomaly",
            SecurityEventType::SuspiciousLogin => "suspicious_login",
            SecurityEventType::BruteForceAttempt => "brute_force_attempt",
            SecurityEventType::AccessGranted => "access_granted",
        }
    }

    /// Severity a producer assigns when it has no better signal.
    pub fn default_severity(&self) -> Severity {
        match self {
            SecurityEventType::AccessGranted | SecurityEventType::UsageLimitExceeded => {
                Severity::Low
            }
            SecurityEventType::PermissionDenied
            | SecurityEventType::RateLimitExceeded
            | SecurityEventType::InvalidApiKey
            | SecurityEventType::GeographicAnomaly => Severity::Medium,
            SecurityEventType::TierBypassAttempt
            | SecurityEventType::SuspiciousLogin
            | SecurityEventType::BruteForceAttempt => Severity::High,
            SecurityEventType::InjectionAttempt => Severity::Critical,
        }
    }
}

impl Display for SecurityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityEventType {
    type Err = UnknownNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "permission_denied" => Ok(SecurityEventType::PermissionDenied),
            "tier_bypass_attempt" => Ok(SecurityEventType::TierBypassAttempt),
            "usage_limit_exceeded" => Ok(SecurityEventType::UsageLimitExceeded),
            "rate_limit_exceeded" => Ok(SecurityEventType::RateLimitExceeded),
            "invalid_api_key" => Ok(SecurityEventType::InvalidApiKey),
            "injection_attempt" => Ok(SecurityEventType::InjectionAttempt),
            "geographic_anomaly" => Ok(SecurityEventType::GeographicAnomaly),
            "suspicious_login" => Ok(SecurityEventType::SuspiciousLogin),
            "brute_force_attempt" => Ok(SecurityEventType::BruteForceAttempt),
            "access_granted" => Ok(SecurityEventType::AccessGranted),
            _ => Err(UnknownNameError::new("event type", s)),
        }
    }
}

// ============================================================================
// Event details
// ============================================================================

/// A single value inside [`EventDetails`].
///
/// Pattern conditions compare against these; `Int` and `Float` are
/// interchangeable for numeric comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DetailValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<DetailValue>),
}

impl DetailValue {
    /// The text payload, if this is a `Text`.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            DetailValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The integer payload, if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            DetailValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric payload widened to `f64` (`Int` or `Float`).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DetailValue::Int(n) => Some(*n as f64),
            DetailValue::Float(x) => Some(*x),
            _ => None,
        }
    }

    /// The boolean payload, if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DetailValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The list payload, if this is a `List`.
    pub fn as_list(&self) -> Option<&[DetailValue]> {
        match self {
            DetailValue::List(items) => Some(items),
            _ => None,
        }
    }
}

impl Display for DetailValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetailValue::Bool(b) => write!(f, "{b}"),
            DetailValue::Int(n) => write!(f, "{n}"),
            DetailValue::Float(x) => write!(f, "{x}"),
            DetailValue::Text(s) => f.write_str(s),
            DetailValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<&str> for DetailValue {
    fn from(value: &str) -> Self {
        DetailValue::Text(value.to_string())
    }
}

impl From<String> for DetailValue {
    fn from(value: String) -> Self {
        DetailValue::Text(value)
    }
}

impl From<i64> for DetailValue {
    fn from(value: i64) -> Self {
        DetailValue::Int(value)
    }
}

impl From<i32> for DetailValue {
    fn from(value: i32) -> Self {
        DetailValue::Int(i64::from(value))
    }
}

impl From<u32> for DetailValue {
    fn from(value: u32) -> Self {
        DetailValue::Int(i64::from(value))
    }
}

impl From<f64> for DetailValue {
    fn from(value: f64) -> Self {
        DetailValue::Float(value)
    }
}

impl From<bool> for DetailValue {
    fn from(value: bool) -> Self {
        DetailValue::Bool(value)
    }
}

impl<V: Into<DetailValue>> From<Vec<V>> for DetailValue {
    fn from(values: Vec<V>) -> Self {
        DetailValue::List(values.into_iter().map(Into::into).collect())
    }
}

/// Structured key/value payload attached to a security event.
///
/// Keys are ordered so serialized output and iteration are deterministic.
///
/// # Examples
///
/// ```
/// use tollgate_types::EventDetails;
///
/// let details = EventDetails::new()
///     .with("feature", "ai_analysis")
///     .with("attempts", 5);
/// assert_eq!(details.get("attempts").and_then(|v| v.as_int()), Some(5));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventDetails {
    entries: BTreeMap<String, DetailValue>,
}

impl EventDetails {
    /// Creates an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<DetailValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts a value, replacing any previous value under `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<DetailValue>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Looks up a value by key.
    pub fn get(&self, key: &str) -> Option<&DetailValue> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &DetailValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>, V: Into<DetailValue>> FromIterator<(K, V)> for EventDetails {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

// ============================================================================
// Geolocation
// ============================================================================

/// A resolved geographic position attached to a login or request.
///
/// Coordinates are decimal degrees. Equality of *places* (for usual-location
/// tracking) uses [`GeoPoint::location_key`], not raw coordinates, since the
/// same city resolves to slightly different coordinates across lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub country: String,
    pub region: String,
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(
        country: impl Into<String>,
        region: impl Into<String>,
        city: impl Into<String>,
        latitude: f64,
        longitude: f64,
    ) -> Self {
        Self {
            country: country.into(),
            region: region.into(),
            city: city.into(),
            latitude,
            longitude,
        }
    }

    /// Region-granularity identity, e.g. `"US/California"`.
    pub fn location_key(&self) -> String {
        format!("{}/{}", self.country, self.region)
    }
}

impl Display for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}, {}", self.city, self.region, self.country)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    #[test_case("basic", Tier::Basic; "lowercase basic")]
    #[test_case("Basic", Tier::Basic; "capitalized basic")]
    #[test_case("PROFESSIONAL", Tier::Professional)]
    #[test_case("  enterprise  ", Tier::Enterprise)]
    fn tier_parses_case_insensitively(input: &str, expected: Tier) {
        assert_eq!(input.parse::<Tier>(), Ok(expected));
    }

    #[test]
    fn tier_rejects_unknown_names() {
        let err = "gold".parse::<Tier>().expect_err("must reject");
        assert_eq!(err.kind, "tier");
        assert_eq!(err.value, "gold");
    }

    #[test]
    fn tier_ordering_matches_rank() {
        assert!(Tier::Basic < Tier::Professional);
        assert!(Tier::Professional < Tier::Enterprise);
        assert!(Tier::Enterprise.has_access(Tier::Enterprise));
        assert!(Tier::Professional.has_access(Tier::Basic));
        assert!(!Tier::Basic.has_access(Tier::Enterprise));
    }

    #[test]
    fn tier_next_walks_upward() {
        assert_eq!(Tier::Basic.next_tier(), Some(Tier::Professional));
        assert_eq!(Tier::Professional.next_tier(), Some(Tier::Enterprise));
        assert_eq!(Tier::Enterprise.next_tier(), None);
    }

    #[test]
    fn permission_level_grants() {
        assert!(!PermissionLevel::None.grants_access());
        assert!(PermissionLevel::Read.grants_access());
        assert!(PermissionLevel::Read < PermissionLevel::Write);
        assert!(PermissionLevel::Write < PermissionLevel::Admin);
    }

    #[test]
    fn severity_low_is_floor() {
        for severity in [
            Severity::Low,
            Severity::Medium,
            Severity::High,
            Severity::Critical,
        ] {
            assert!(severity >= Severity::Low);
        }
    }

    #[test]
    fn event_type_round_trips_through_name() {
        for event_type in SecurityEventType::ALL {
            let parsed = event_type
                .as_str()
                .parse::<SecurityEventType>()
                .expect("canonical name must parse");
            assert_eq!(parsed, event_type);
        }
    }

    #[test]
    fn event_type_serde_uses_snake_case() {
        let json =
            serde_json::to_string(&SecurityEventType::BruteForceAttempt).expect("serialize");
        assert_eq!(json, "\"brute_force_attempt\"");
    }

    #[test]
    fn detail_value_widens_int_to_f64() {
        assert_eq!(DetailValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(DetailValue::Float(2.5).as_f64(), Some(2.5));
        assert_eq!(DetailValue::Text("3".into()).as_f64(), None);
    }

    #[test]
    fn detail_value_untagged_serde() {
        let details = EventDetails::new()
            .with("attempts", 5)
            .with("score", 0.75)
            .with("flagged", true)
            .with("tags", vec!["vpn", "tor"]);

        let json = serde_json::to_string(&details).expect("serialize");
        let back: EventDetails = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, details);
        assert_eq!(back.get("attempts"), Some(&DetailValue::Int(5)));
        assert_eq!(
            back.get("tags").and_then(|v| v.as_list()).map(<[_]>::len),
            Some(2)
        );
    }

    #[test]
    fn event_details_iterates_in_key_order() {
        let details = EventDetails::new().with("b", 2).with("a", 1);
        let keys: Vec<&str> = details.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn geo_point_location_key_is_region_granular() {
        let sf = GeoPoint::new("US", "California", "San Francisco", 37.77, -122.42);
        let la = GeoPoint::new("US", "California", "Los Angeles", 34.05, -118.24);
        assert_eq!(sf.location_key(), la.location_key());
        assert_eq!(sf.location_key(), "US/California");
    }

    proptest! {
        #[test]
        fn tier_access_equals_ordering(a in 0usize..3, b in 0usize..3) {
            let ta = Tier::ALL[a];
            let tb = Tier::ALL[b];
            prop_assert_eq!(ta.has_access(tb), a >= b);
        }

        #[test]
        fn tier_display_round_trips(idx in 0usize..3) {
            let tier = Tier::ALL[idx];
            prop_assert_eq!(tier.to_string().parse::<Tier>(), Ok(tier));
        }
    }
}
