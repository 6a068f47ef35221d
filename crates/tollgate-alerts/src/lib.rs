//! Alert lifecycle, throttling, aggregation and channel delivery.
//!
//! The flow is:
//!
//! ```text
//! AlertDraft ─▶ AlertManager::send ─▶ Alert (always created)
//!                     │
//!                     ├── throttled?  skip the config, audit, move on
//!                     ├── aggregating? buffer, flush later as one summary
//!                     └── otherwise    build payload, Transport::deliver
//! ```
//!
//! Creating the alert record never fails; delivery can, per channel, and a
//! failed channel never stops the others. The [`Transport`] trait is the
//! process boundary: the core builds channel payloads but never opens a
//! socket itself.

use thiserror::Error;
use uuid::Uuid;

pub mod channels;
pub mod manager;
pub mod store;

pub use channels::{
    ChannelConfig, ChannelKind, LogTransport, RecordingTransport, Transport, TransportError,
    build_payload,
};
pub use manager::{
    AggregationBuffers, AggregationPolicy, AlertConfig, AlertManager, DeliveryReport,
    ThrottleMap, ThrottlePolicy,
};
pub use store::{Alert, AlertDraft, AlertQuery, AlertStatus, AlertStore};

/// Errors from the alerting pipeline.
#[derive(Debug, Error)]
pub enum AlertError {
    /// The referenced alert does not exist.
    #[error("alert not found: {0}")]
    AlertNotFound(Uuid),

    /// A channel delivery failed after exhausting its attempts.
    #[error("delivery through {channel} failed after {attempts} attempt(s): {source}")]
    DeliveryFailed {
        channel: ChannelKind,
        attempts: u32,
        source: TransportError,
    },

    /// A channel configuration is structurally unusable.
    #[error("invalid {kind} channel config: {reason}")]
    ChannelConfigInvalid { kind: ChannelKind, reason: String },

    /// An alert config failed validation.
    #[error("invalid alert config {id:?}: {reason}")]
    InvalidConfig { id: String, reason: String },
}

pub type Result<T> = std::result::Result<T, AlertError>;
