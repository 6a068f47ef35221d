//! Permission resolution: tier + catalog + usage ledger in, decision out.
//!
//! Every outcome is an [`AccessDecision`] value. The resolver fails closed:
//! an unparseable tier, a combination the catalog never mentions, or an
//! exhausted usage budget all produce `allowed: false` with a
//! [`DenyReason`], never an error or a panic. Denials carry
//! [`UpgradeAdvice`] whenever some higher tier would have been admitted.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tollgate_types::{Clock, PermissionLevel, Tier};

use crate::{
    catalog::{CatalogHandle, PermissionCatalog, PermissionSpec, UsagePeriod},
    usage::{UsageKey, UsageLedger},
};

/// Usage bucket shared by callers who present no user identity.
pub const ANONYMOUS_USER: &str = "anonymous";

// ============================================================================
// Request context
// ============================================================================

/// Caller-supplied context for one permission check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccessContext {
    /// Identity used for usage metering. Absent identities share the
    /// [`ANONYMOUS_USER`] bucket.
    pub user_id: Option<String>,
    /// Whether the caller holds an administrative role.
    pub admin_role: bool,
    /// Evaluation instant; falls back to the injected clock.
    pub timestamp: Option<DateTime<Utc>>,
}

impl AccessContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_admin_role(mut self) -> Self {
        self.admin_role = true;
        self
    }

    /// Pins the evaluation instant instead of reading the clock.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

// ============================================================================
// Decisions
// ============================================================================

/// Why a check was denied.
///
/// `Display` is the generic phrase safe to show a caller; the specifics
/// stay in logs and the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// The presented tier name is outside the vocabulary.
    InvalidTier,
    /// The catalog does not mention this combination for this tier.
    PermissionNotDefined,
    /// The catalog explicitly grants level `none` here.
    LevelNone,
    /// The per-period usage budget is spent.
    UsageLimitExceeded,
    /// The proposed resource count exceeds the tier cap.
    LimitExceeded,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phrase = match self {
            DenyReason::InvalidTier => "invalid tier",
            DenyReason::PermissionNotDefined => "permission not defined",
            DenyReason::LevelNone => "permission denied",
            DenyReason::UsageLimitExceeded => "usage limit exceeded",
            DenyReason::LimitExceeded => "tier limit exceeded",
        };
        f.write_str(phrase)
    }
}

/// Meter state attached to decisions on usage-limited grants, allowed or
/// not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageConditions {
    pub usage_limit: u32,
    pub remaining: u32,
    pub period: UsagePeriod,
}

/// Which tier would have been admitted, and what it buys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeAdvice {
    pub required_tier: Tier,
    pub benefits: Vec<String>,
}

/// Outcome of one permission or tier-limit check.
///
/// Computed per call and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub allowed: bool,
    /// Granted level; `None` whenever `allowed` is false.
    pub level: PermissionLevel,
    pub reason: Option<DenyReason>,
    pub conditions: Option<UsageConditions>,
    pub upgrade: Option<UpgradeAdvice>,
}

impl AccessDecision {
    pub fn allowed(level: PermissionLevel) -> Self {
        Self {
            allowed: true,
            level,
            reason: None,
            conditions: None,
            upgrade: None,
        }
    }

    pub fn denied(reason: DenyReason) -> Self {
        Self {
            allowed: false,
            level: PermissionLevel::None,
            reason: Some(reason),
            conditions: None,
            upgrade: None,
        }
    }

    pub fn with_conditions(mut self, conditions: UsageConditions) -> Self {
        self.conditions = Some(conditions);
        self
    }

    pub fn with_upgrade(mut self, upgrade: Option<UpgradeAdvice>) -> Self {
        self.upgrade = upgrade;
        self
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Stateless decision engine over a catalog handle, a usage ledger and a
/// clock.
///
/// The check→act→track protocol is deliberately non-atomic: two concurrent
/// requests can both pass `resolve` before either `track_usage` lands, so a
/// meter can overshoot its budget by the number of in-flight requests.
/// Callers that need a hard ceiling must serialize externally.
pub struct PermissionResolver {
    catalog: Arc<CatalogHandle>,
    ledger: Arc<UsageLedger>,
    clock: Arc<dyn Clock>,
    admin_override: bool,
}

impl PermissionResolver {
    pub fn new(catalog: Arc<CatalogHandle>, ledger: Arc<UsageLedger>, clock: Arc<dyn Clock>) -> Self {
        Self {
            catalog,
            ledger,
            clock,
            admin_override: true,
        }
    }

    /// Enables or disables the Enterprise admin override.
    pub fn with_admin_override(mut self, enabled: bool) -> Self {
        self.admin_override = enabled;
        self
    }

    /// Resolves a check for a tier presented as a string.
    ///
    /// Unparseable tiers fail closed with [`DenyReason::InvalidTier`].
    pub fn resolve(
        &self,
        tier: &str,
        feature: &str,
        action: &str,
        ctx: &AccessContext,
    ) -> AccessDecision {
        match tier.parse::<Tier>() {
            Ok(known) => self.resolve_known(known, feature, action, ctx),
            Err(_) => {
                tracing::debug!(tier, feature, action, "unparseable tier fails closed");
                AccessDecision::denied(DenyReason::InvalidTier)
            }
        }
    }

    /// Resolves a check for an already-validated tier.
    pub fn resolve_known(
        &self,
        tier: Tier,
        feature: &str,
        action: &str,
        ctx: &AccessContext,
    ) -> AccessDecision {
        let catalog = self.catalog.current();
        let decision = self.decide(&catalog, tier, feature, action, ctx);
        tracing::debug!(
            %tier,
            feature,
            action,
            allowed = decision.allowed,
            level = %decision.level,
            reason = ?decision.reason,
            "permission resolved"
        );
        decision
    }

    fn decide(
        &self,
        catalog: &PermissionCatalog,
        tier: Tier,
        feature: &str,
        action: &str,
        ctx: &AccessContext,
    ) -> AccessDecision {
        // The override still requires the feature to exist somewhere in the
        // catalog, so a typo cannot be admin-escalated into a grant.
        if self.admin_override
            && ctx.admin_role
            && tier == Tier::Enterprise
            && catalog.feature_exists(feature)
        {
            return AccessDecision::allowed(PermissionLevel::Admin);
        }

        let Some(spec) = catalog.spec(tier, feature, action) else {
            return AccessDecision::denied(DenyReason::PermissionNotDefined)
                .with_upgrade(upgrade_above(catalog, tier, feature, action));
        };

        match spec {
            PermissionSpec::Level(level) if level.grants_access() => {
                AccessDecision::allowed(*level)
            }
            PermissionSpec::Level(_) => AccessDecision::denied(DenyReason::LevelNone)
                .with_upgrade(upgrade_above(catalog, tier, feature, action)),
            PermissionSpec::Conditional {
                level,
                usage_limit,
                period,
            } => self.decide_metered(
                catalog, tier, feature, action, ctx, *level, *usage_limit, *period,
            ),
        }
    }

    fn decide_metered(
        &self,
        catalog: &PermissionCatalog,
        tier: Tier,
        feature: &str,
        action: &str,
        ctx: &AccessContext,
        level: PermissionLevel,
        usage_limit: u32,
        period: UsagePeriod,
    ) -> AccessDecision {
        let now = ctx.timestamp.unwrap_or_else(|| self.clock.now());
        let user = ctx.user_id.as_deref().unwrap_or(ANONYMOUS_USER);
        let key = UsageKey::new(user, feature, action, period, now);
        let used = self.ledger.count(&key);

        let conditions = UsageConditions {
            usage_limit,
            remaining: usage_limit.saturating_sub(used),
            period,
        };

        if used < usage_limit {
            AccessDecision::allowed(level).with_conditions(conditions)
        } else {
            AccessDecision::denied(DenyReason::UsageLimitExceeded)
                .with_conditions(conditions)
                .with_upgrade(upgrade_above(catalog, tier, feature, action))
        }
    }

    /// Records one use of (user, feature, action).
    ///
    /// Infallible and decoupled from the catalog: unknown features are
    /// counted too, and the count is kept at every period granularity so a
    /// catalog swap that changes a grant's period still sees earlier usage.
    pub fn track_usage(&self, user_id: &str, feature: &str, action: &str) {
        let now = self.clock.now();
        for period in UsagePeriod::ALL {
            self.ledger
                .increment(UsageKey::new(user_id, feature, action, period, now));
        }
        tracing::debug!(user_id, feature, action, "usage tracked");
    }

    /// Checks a proposed resource count against the tier's cap.
    ///
    /// A cap of `-1` is unlimited; a missing cap fails closed.
    pub fn check_tier_limit(&self, tier: &str, limit_type: &str, proposed: i64) -> AccessDecision {
        let Ok(known) = tier.parse::<Tier>() else {
            tracing::debug!(tier, limit_type, "unparseable tier fails closed");
            return AccessDecision::denied(DenyReason::InvalidTier);
        };

        let catalog = self.catalog.current();
        let decision = match catalog.cap(known, limit_type) {
            None => AccessDecision::denied(DenyReason::PermissionNotDefined)
                .with_upgrade(cap_upgrade(&catalog, known, limit_type, proposed)),
            Some(cap) if cap == -1 || proposed <= cap => {
                AccessDecision::allowed(PermissionLevel::Write)
            }
            Some(_) => AccessDecision::denied(DenyReason::LimitExceeded)
                .with_upgrade(cap_upgrade(&catalog, known, limit_type, proposed)),
        };

        tracing::debug!(
            %known,
            limit_type,
            proposed,
            allowed = decision.allowed,
            "tier limit checked"
        );
        decision
    }
}

/// Lowest tier strictly above `current` whose grant admits access.
fn upgrade_above(
    catalog: &PermissionCatalog,
    current: Tier,
    feature: &str,
    action: &str,
) -> Option<UpgradeAdvice> {
    Tier::ALL
        .into_iter()
        .filter(|tier| *tier > current)
        .find(|tier| {
            catalog
                .spec(*tier, feature, action)
                .is_some_and(|spec| spec.level().grants_access())
        })
        .map(|tier| UpgradeAdvice {
            required_tier: tier,
            benefits: catalog.benefits_at(tier, feature),
        })
}

/// Lowest tier strictly above `current` whose cap admits `proposed`.
fn cap_upgrade(
    catalog: &PermissionCatalog,
    current: Tier,
    limit_type: &str,
    proposed: i64,
) -> Option<UpgradeAdvice> {
    Tier::ALL
        .into_iter()
        .filter(|tier| *tier > current)
        .find(|tier| {
            catalog
                .cap(*tier, limit_type)
                .is_some_and(|cap| cap == -1 || proposed <= cap)
        })
        .map(|tier| UpgradeAdvice {
            required_tier: tier,
            benefits: catalog.cap_summary(tier, limit_type).into_iter().collect(),
        })
}

// ============================================================================
// Tests
// ============================================================================
