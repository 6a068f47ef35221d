//! Permission catalog, usage metering and tier resolution.
//!
//! This crate answers one question: *may this tier perform this action on
//! this feature right now?* The answer is always a value, never an error:
//!
//! ```text
//! tier name ──▶ PermissionResolver::resolve ──▶ AccessDecision
//!                    │
//!                    ├── PermissionCatalog   (immutable, hot-swapped whole)
//!                    ├── UsageLedger         (sharded per-period counters)
//!                    └── Clock               (injected time source)
//! ```
//!
//! Unparseable tiers, unknown features and exhausted usage budgets all come
//! back as `AccessDecision { allowed: false, reason, .. }` so a caller can
//! never mistake a denial for an infrastructure failure.

use thiserror::Error;
use tollgate_types::{Tier, UnknownNameError};

pub mod catalog;
pub mod resolver;
pub mod usage;

pub use catalog::{
    CatalogDef, CatalogHandle, PermissionCatalog, PermissionCatalogBuilder, PermissionSpec,
    UsagePeriod, default_catalog,
};
pub use resolver::{
    ANONYMOUS_USER, AccessContext, AccessDecision, DenyReason, PermissionResolver, UpgradeAdvice,
    UsageConditions,
};
pub use usage::{UsageKey, UsageLedger};

/// Errors raised while constructing or loading a permission catalog.
///
/// Resolution itself never returns these; a resolver only ever sees a
/// catalog that already passed validation.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// A conditional grant tried to meter the explicit-denial level.
    #[error("conditional grant cannot use level \"none\": {tier}/{feature}/{action}")]
    ConditionalNone {
        tier: Tier,
        feature: String,
        action: String,
    },

    /// A catalog definition named a tier outside the closed vocabulary.
    #[error("in catalog definition: {0}")]
    UnknownTier(#[from] UnknownNameError),

    /// A resource cap was negative without being the unlimited sentinel.
    #[error("cap for {limit_type:?} at tier {tier} must be -1 (unlimited) or >= 0, got {cap}")]
    InvalidCap {
        tier: Tier,
        limit_type: String,
        cap: i64,
    },
}

pub type Result<T> = std::result::Result<T, CatalogError>;
