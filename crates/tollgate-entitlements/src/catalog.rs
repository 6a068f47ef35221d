//! The permission catalog: which tier may do what, under which meter.
//!
//! A catalog is an immutable table
//!
//! ```text
//! tier ─▶ feature ─▶ action ─▶ PermissionSpec
//! tier ─▶ limit type ─▶ cap (i64, -1 = unlimited)
//! ```
//!
//! built once through [`PermissionCatalogBuilder`] (or parsed from a
//! [`CatalogDef`]) and validated at construction. Hot reload swaps the whole
//! catalog behind a [`CatalogHandle`]; readers always see either the old or
//! the new table, never a mix.

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use chrono::{DateTime, Datelike, Days, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tollgate_types::{PermissionLevel, Tier};

use crate::{CatalogError, Result};

// ============================================================================
// Usage periods
// ============================================================================

/// Granularity of a usage meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsagePeriod {
    Daily,
    Weekly,
    Monthly,
}

impl UsagePeriod {
    /// All periods.
    pub const ALL: [UsagePeriod; 3] = [
        UsagePeriod::Daily,
        UsagePeriod::Weekly,
        UsagePeriod::Monthly,
    ];

    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            UsagePeriod::Daily => "daily",
            UsagePeriod::Weekly => "weekly",
            UsagePeriod::Monthly => "monthly",
        }
    }

    /// Noun used in human-readable grant summaries ("10 per day").
    pub fn noun(&self) -> &'static str {
        match self {
            UsagePeriod::Daily => "day",
            UsagePeriod::Weekly => "week",
            UsagePeriod::Monthly => "month",
        }
    }

    /// Start of the period containing `now`, in UTC.
    ///
    /// Daily periods start at midnight, weekly periods at midnight on
    /// Monday (ISO week), monthly periods at midnight on the first.
    /// Idempotent: `period_start(period_start(t)) == period_start(t)`.
    pub fn period_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let date = now.date_naive();
        let start = match self {
            UsagePeriod::Daily => date,
            UsagePeriod::Weekly => {
                date - Days::new(u64::from(date.weekday().num_days_from_monday()))
            }
            UsagePeriod::Monthly => date - Days::new(u64::from(date.day0())),
        };
        start.and_time(NaiveTime::MIN).and_utc()
    }
}

impl std::fmt::Display for UsagePeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Permission specs
// ============================================================================

/// What a (tier, feature, action) combination grants.
///
/// Serialized form is either a bare level name or a metered table, so a
/// catalog file reads naturally:
///
/// ```toml
/// view = "read"
/// analyze = { level = "read", usage_limit = 10, period = "daily" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PermissionSpec {
    /// Unconditional grant (or explicit denial via `PermissionLevel::None`).
    Level(PermissionLevel),
    /// Grant metered against a per-period usage budget.
    Conditional {
        level: PermissionLevel,
        usage_limit: u32,
        period: UsagePeriod,
    },
}

impl PermissionSpec {
    /// The level this spec grants when its conditions hold.
    pub fn level(&self) -> PermissionLevel {
        match self {
            PermissionSpec::Level(level) | PermissionSpec::Conditional { level, .. } => *level,
        }
    }

    pub fn is_conditional(&self) -> bool {
        matches!(self, PermissionSpec::Conditional { .. })
    }

    /// Short human-readable form: `"read"`, `"read, 10 per day"`.
    pub fn summary(&self) -> String {
        match self {
            PermissionSpec::Level(level) => level.to_string(),
            PermissionSpec::Conditional {
                level,
                usage_limit,
                period,
            } => format!("{level}, {usage_limit} per {}", period.noun()),
        }
    }
}

// ============================================================================
// Catalog
// ============================================================================

type ActionGrants = BTreeMap<String, PermissionSpec>;
type FeatureGrants = BTreeMap<String, ActionGrants>;

/// Immutable permission table for all tiers.
///
/// Once built it is only read; hot reload replaces the whole catalog via
/// [`CatalogHandle::swap`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PermissionCatalog {
    grants: BTreeMap<Tier, FeatureGrants>,
    caps: BTreeMap<Tier, BTreeMap<String, i64>>,
}

impl PermissionCatalog {
    /// Starts an empty builder.
    pub fn builder() -> PermissionCatalogBuilder {
        PermissionCatalogBuilder::default()
    }

    /// Looks up the grant for one (tier, feature, action) combination.
    pub fn spec(&self, tier: Tier, feature: &str, action: &str) -> Option<&PermissionSpec> {
        self.grants.get(&tier)?.get(feature)?.get(action)
    }

    /// Looks up the resource cap for one (tier, limit type) combination.
    pub fn cap(&self, tier: Tier, limit_type: &str) -> Option<i64> {
        self.caps.get(&tier)?.get(limit_type).copied()
    }

    /// Whether any tier defines any action on `feature`.
    pub fn feature_exists(&self, feature: &str) -> bool {
        self.grants.values().any(|features| features.contains_key(feature))
    }

    /// Lowest tier whose grant for (feature, action) actually admits access.
    ///
    /// Explicit `none` grants do not count.
    pub fn lowest_tier_with_access(&self, feature: &str, action: &str) -> Option<Tier> {
        Tier::ALL.into_iter().find(|tier| {
            self.spec(*tier, feature, action)
                .is_some_and(|spec| spec.level().grants_access())
        })
    }

    /// Lowest tier whose cap for `limit_type` admits `proposed`.
    pub fn lowest_tier_with_capacity(&self, limit_type: &str, proposed: i64) -> Option<Tier> {
        Tier::ALL.into_iter().find(|tier| {
            self.cap(*tier, limit_type)
                .is_some_and(|cap| cap == -1 || proposed <= cap)
        })
    }

    /// Human-readable grant summaries for `feature` at `tier`, used in
    /// upgrade recommendations. Explicit denials are not benefits.
    pub fn benefits_at(&self, tier: Tier, feature: &str) -> Vec<String> {
        let Some(actions) = self.grants.get(&tier).and_then(|f| f.get(feature)) else {
            return Vec::new();
        };
        actions
            .iter()
            .filter(|(_, spec)| spec.level().grants_access())
            .map(|(action, spec)| format!("{action}: {}", spec.summary()))
            .collect()
    }

    /// Human-readable cap summary for `limit_type` at `tier`.
    pub fn cap_summary(&self, tier: Tier, limit_type: &str) -> Option<String> {
        self.cap(tier, limit_type).map(|cap| {
            if cap == -1 {
                format!("{limit_type}: unlimited")
            } else {
                format!("{limit_type}: up to {cap}")
            }
        })
    }
}

/// Builder for [`PermissionCatalog`]; all validation happens in [`build`].
///
/// [`build`]: PermissionCatalogBuilder::build
#[derive(Debug, Clone, Default)]
pub struct PermissionCatalogBuilder {
    grants: BTreeMap<Tier, FeatureGrants>,
    caps: BTreeMap<Tier, BTreeMap<String, i64>>,
}

impl PermissionCatalogBuilder {
    /// Records a grant; replaces any previous spec for the same combination.
    pub fn grant(
        mut self,
        tier: Tier,
        feature: impl Into<String>,
        action: impl Into<String>,
        spec: PermissionSpec,
    ) -> Self {
        self.grants
            .entry(tier)
            .or_default()
            .entry(feature.into())
            .or_default()
            .insert(action.into(), spec);
        self
    }

    /// Shorthand for an unconditional grant.
    pub fn grant_level(
        self,
        tier: Tier,
        feature: impl Into<String>,
        action: impl Into<String>,
        level: PermissionLevel,
    ) -> Self {
        self.grant(tier, feature, action, PermissionSpec::Level(level))
    }

    /// Shorthand for a usage-metered grant.
    pub fn grant_metered(
        self,
        tier: Tier,
        feature: impl Into<String>,
        action: impl Into<String>,
        level: PermissionLevel,
        usage_limit: u32,
        period: UsagePeriod,
    ) -> Self {
        self.grant(
            tier,
            feature,
            action,
            PermissionSpec::Conditional {
                level,
                usage_limit,
                period,
            },
        )
    }

    /// Records a resource cap; `-1` means unlimited.
    pub fn cap(mut self, tier: Tier, limit_type: impl Into<String>, cap: i64) -> Self {
        self.caps
            .entry(tier)
            .or_default()
            .insert(limit_type.into(), cap);
        self
    }

    /// Validates every recorded entry and produces the catalog.
    pub fn build(self) -> Result<PermissionCatalog> {
        for (tier, features) in &self.grants {
            for (feature, actions) in features {
                for (action, spec) in actions {
                    if let PermissionSpec::Conditional { level, .. } = spec {
                        if !level.grants_access() {
                            return Err(CatalogError::ConditionalNone {
                                tier: *tier,
                                feature: feature.clone(),
                                action: action.clone(),
                            });
                        }
                    }
                }
            }
        }
        for (tier, caps) in &self.caps {
            for (limit_type, cap) in caps {
                if *cap < -1 {
                    return Err(CatalogError::InvalidCap {
                        tier: *tier,
                        limit_type: limit_type.clone(),
                        cap: *cap,
                    });
                }
            }
        }
        Ok(PermissionCatalog {
            grants: self.grants,
            caps: self.caps,
        })
    }
}

// ============================================================================
// Hot reload handle
// ============================================================================

/// Shared handle to the current catalog.
///
/// `current` hands out an `Arc` clone, so an in-flight resolution keeps
/// reading the catalog it started with even while `swap` installs a new one.
#[derive(Debug)]
pub struct CatalogHandle {
    current: RwLock<Arc<PermissionCatalog>>,
}

impl CatalogHandle {
    pub fn new(catalog: PermissionCatalog) -> Self {
        Self {
            current: RwLock::new(Arc::new(catalog)),
        }
    }

    /// The catalog as of this call.
    pub fn current(&self) -> Arc<PermissionCatalog> {
        Arc::clone(&self.current.read().expect("lock poisoned"))
    }

    /// Installs `next` and returns the previous catalog.
    pub fn swap(&self, next: PermissionCatalog) -> Arc<PermissionCatalog> {
        let mut current = self.current.write().expect("lock poisoned");
        std::mem::replace(&mut current, Arc::new(next))
    }
}

// ============================================================================
// Serialized definition
// ============================================================================

/// Serialized catalog shape, as it appears under `[catalog]` in a config
/// file. Tier names are validated when converting into a catalog, not at
/// parse time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogDef {
    #[serde(default)]
    pub tiers: BTreeMap<String, TierDef>,
}

/// Grants and caps for one tier in a [`CatalogDef`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierDef {
    #[serde(default)]
    pub features: BTreeMap<String, BTreeMap<String, PermissionSpec>>,
    #[serde(default)]
    pub limits: BTreeMap<String, i64>,
}

impl CatalogDef {
    /// Validates and converts into a [`PermissionCatalog`].
    pub fn into_catalog(self) -> Result<PermissionCatalog> {
        let mut builder = PermissionCatalog::builder();
        for (tier_name, def) in self.tiers {
            let tier: Tier = tier_name.parse()?;
            for (feature, actions) in def.features {
                for (action, spec) in actions {
                    builder = builder.grant(tier, feature.clone(), action, spec);
                }
            }
            for (limit_type, cap) in def.limits {
                builder = builder.cap(tier, limit_type, cap);
            }
        }
        builder.build()
    }
}

// ============================================================================
// Shipped catalog
// ============================================================================

/// The catalog Tollgate ships with when no `[catalog]` section is
/// configured.
///
/// Basic meters the expensive features, Professional raises the meters and
/// unlocks export, Enterprise is uncapped.
pub fn default_catalog() -> PermissionCatalog {
    PermissionCatalog::builder()
        // Basic: metered entry-level access.
        .grant_metered(
            Tier::Basic,
            "ai_analysis",
            "analyze",
            PermissionLevel::Read,
            10,
            UsagePeriod::Daily,
        )
        .grant_metered(
            Tier::Basic,
            "reports",
            "generate",
            PermissionLevel::Read,
            5,
            UsagePeriod::Monthly,
        )
        .grant_level(Tier::Basic, "reports", "view", PermissionLevel::Read)
        .grant_level(Tier::Basic, "projects", "manage", PermissionLevel::Write)
        .grant_level(Tier::Basic, "data_export", "export", PermissionLevel::None)
        .cap(Tier::Basic, "projects", 3)
        .cap(Tier::Basic, "api_keys", 2)
        // Professional: higher meters, weekly export budget.
        .grant_metered(
            Tier::Professional,
            "ai_analysis",
            "analyze",
            PermissionLevel::Write,
            100,
            UsagePeriod::Daily,
        )
        .grant_level(Tier::Professional, "reports", "generate", PermissionLevel::Write)
        .grant_level(Tier::Professional, "reports", "view", PermissionLevel::Read)
        .grant_level(Tier::Professional, "projects", "manage", PermissionLevel::Write)
        .grant_metered(
            Tier::Professional,
            "data_export",
            "export",
            PermissionLevel::Read,
            20,
            UsagePeriod::Weekly,
        )
        .cap(Tier::Professional, "projects", 20)
        .cap(Tier::Professional, "api_keys", 10)
        // Enterprise: unconditional access, unlimited caps.
        .grant_level(Tier::Enterprise, "ai_analysis", "analyze", PermissionLevel::Write)
        .grant_level(Tier::Enterprise, "reports", "generate", PermissionLevel::Write)
        .grant_level(Tier::Enterprise, "reports", "view", PermissionLevel::Read)
        .grant_level(Tier::Enterprise, "projects", "manage", PermissionLevel::Write)
        .grant_level(Tier::Enterprise, "data_export", "export", PermissionLevel::Write)
        .grant_level(Tier::Enterprise, "audit_log", "view", PermissionLevel::Admin)
        .cap(Tier::Enterprise, "projects", -1)
        .cap(Tier::Enterprise, "api_keys", -1)
        .build()
        .expect("shipped catalog is valid")
}

// ============================================================================
// Tests
// ============================================================================
