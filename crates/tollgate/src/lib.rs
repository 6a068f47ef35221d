//! # Tollgate
//!
//! Subscription-tier permission resolution with usage metering, security
//! event monitoring and alerting.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                           Tollgate                            │
//! │  ┌──────────┐   ┌───────────┐   ┌──────────┐   ┌───────────┐  │
//! │  │ Resolver │ → │ Event log │ → │ Patterns │ → │  Alerts   │  │
//! │  │ (tiers)  │   │ (append)  │   │ (rules)  │   │ (channels)│  │
//! │  └──────────┘   └───────────┘   └──────────┘   └───────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! A denied permission check is not just a refusal: it is recorded as a
//! security event, counted by the pattern engine, and can end in a blocked
//! IP, a suspended account and an alert on someone's pager.
//!
//! # Quick start
//!
//! ```ignore
//! use tollgate::{RequestContext, Tollgate};
//!
//! let gate = Tollgate::builder().build()?;
//! let ctx = RequestContext::new().with_user("user-1").with_ip("203.0.113.7");
//!
//! let decision = gate.resolve("basic", "ai_analysis", "analyze", &ctx);
//! if decision.allowed {
//!     // ... do the work ...
//!     gate.track_usage(&ctx, "ai_analysis", "analyze");
//! }
//! let _sweeper = gate.start_sweeper();
//! ```

use thiserror::Error;

mod service;
mod sweeper;

pub use service::{RequestContext, Tollgate, TollgateBuilder};
pub use sweeper::{SweepReport, Sweeper, SweeperHandle};

// Re-export the vocabulary types.
pub use tollgate_types::{
    AuditEntry, AuditSink, Clock, DetailValue, EventDetails, GeoPoint, ManualClock,
    MemoryAuditSink, PermissionLevel, SecurityEventType, Severity, SystemClock, Tier,
    TracingAuditSink,
};

// Re-export the resolution surface.
pub use tollgate_entitlements::{
    AccessContext, AccessDecision, CatalogDef, CatalogError, CatalogHandle, DenyReason,
    PermissionCatalog, PermissionSpec, UpgradeAdvice, UsageConditions, UsageLedger, UsagePeriod,
    default_catalog,
};

// Re-export the monitoring surface.
pub use tollgate_monitor::{
    BlockEntry, ConditionOp, EventDraft, EventQuery, FieldCondition, GeoAnomalyConfig,
    MonitorError, PatternAction, Resolution, SecurityEvent, SecurityPattern, SuspendEntry,
    UsualLocation, default_patterns,
};

// Re-export the alerting surface.
pub use tollgate_alerts::{
    AggregationPolicy, Alert, AlertConfig, AlertDraft, AlertError, AlertQuery, AlertStatus,
    ChannelConfig, ChannelKind, DeliveryReport, LogTransport, RecordingTransport, ThrottlePolicy,
    Transport, TransportError,
};

// Re-export configuration loading.
pub use tollgate_config::{ConfigLoader, TollgateConfig};

/// Errors surfaced by the facade.
///
/// The permission resolution path never produces these; a denial is an
/// [`AccessDecision`] value, not an error.
#[derive(Debug, Error)]
pub enum TollgateError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    Alert(#[from] AlertError),
}

pub type Result<T> = std::result::Result<T, TollgateError>;
