//! Security event log, pattern detection and geo-anomaly heuristics.
//!
//! The pipeline is deliberately split into a pure decision side and an
//! effectful side:
//!
//! ```text
//! EventDraft ─▶ SecurityEventLog::record ─▶ SecurityEvent
//!                                │
//!                                ▼
//!                    PatternEngine::on_event ─▶ Vec<PatternTrigger>
//! ```
//!
//! The engine never blocks an IP or sends an alert itself; it returns
//! triggers describing what should happen and the caller executes them.
//! That keeps threshold evaluation testable without standing up delivery
//! infrastructure, and it means a slow action can never stall detection.

use thiserror::Error;
use uuid::Uuid;

pub mod event;
pub mod geo;
pub mod log;
pub mod patterns;
pub mod registry;

pub use event::{EventDraft, Resolution, SecurityEvent};
pub use geo::{GeoAnomalyConfig, GeoAnomalyDetector, UsualLocation};
pub use log::{EventQuery, SecurityEventLog};
pub use patterns::{
    ConditionOp, FieldCondition, PatternAction, PatternEngine, PatternTrigger, SecurityPattern,
    default_patterns,
};
pub use registry::{BlockEntry, BlockRegistry, SuspendEntry, SuspendRegistry};

/// Errors from the monitoring pipeline.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The referenced security event does not exist.
    #[error("security event not found: {0}")]
    EventNotFound(Uuid),

    /// A pattern definition failed validation.
    #[error("invalid pattern {id:?}: {reason}")]
    InvalidPattern { id: String, reason: String },
}

pub type Result<T> = std::result::Result<T, MonitorError>;
