//! Alert routing: config matching, throttling, aggregation, delivery.
//!
//! Creation and delivery are separate concerns. `send` always creates the
//! alert record; whether anything goes out depends on each matching
//! config. A throttled config is skipped whole. An aggregating config
//! buffers and delivers one summary when the window closes; that summary
//! is itself the storm control, so it does not consult the throttle.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tollgate_types::{AuditEntry, AuditSink, Clock, SecurityEventType, Severity};

use crate::{
    AlertError, Result,
    channels::{self, ChannelConfig, ChannelKind, Transport},
    store::{Alert, AlertDraft, AlertStore},
};

// ============================================================================
// Policies and configs
// ============================================================================

/// Per-config delivery ceiling inside a rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlePolicy {
    pub enabled: bool,
    /// Direct deliveries admitted per `(config, alert type)` per window.
    pub max_alerts: u32,
    pub window_minutes: i64,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_alerts: 10,
            window_minutes: 60,
        }
    }
}

impl ThrottlePolicy {
    pub fn window(&self) -> TimeDelta {
        TimeDelta::minutes(self.window_minutes)
    }
}

/// Per-config batching of alerts into one summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationPolicy {
    pub enabled: bool,
    /// Flush deadline measured from the first buffered alert.
    pub window_minutes: i64,
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            window_minutes: 5,
        }
    }
}

impl AggregationPolicy {
    pub fn window(&self) -> TimeDelta {
        TimeDelta::minutes(self.window_minutes)
    }
}

/// One alert routing rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub id: String,
    pub name: String,
    /// Alert types this config wants; empty means all.
    pub event_types: Vec<SecurityEventType>,
    /// Alerts below this severity are ignored. `Low` admits everything.
    pub severity_threshold: Severity,
    pub channels: Vec<ChannelConfig>,
    pub throttle: ThrottlePolicy,
    pub aggregation: AggregationPolicy,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            event_types: Vec::new(),
            severity_threshold: Severity::Low,
            channels: Vec::new(),
            throttle: ThrottlePolicy::default(),
            aggregation: AggregationPolicy::default(),
        }
    }
}

impl AlertConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_event_type(mut self, event_type: SecurityEventType) -> Self {
        self.event_types.push(event_type);
        self
    }

    pub fn with_severity_threshold(mut self, severity: Severity) -> Self {
        self.severity_threshold = severity;
        self
    }

    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn with_throttle(mut self, throttle: ThrottlePolicy) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_aggregation(mut self, aggregation: AggregationPolicy) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Whether this config wants an alert of this type and severity.
    pub fn matches(&self, alert_type: SecurityEventType, severity: Severity) -> bool {
        (self.event_types.is_empty() || self.event_types.contains(&alert_type))
            && severity >= self.severity_threshold
    }

    /// Checks the structural invariants.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| AlertError::InvalidConfig {
            id: self.id.clone(),
            reason: reason.to_string(),
        };
        if self.id.is_empty() {
            return Err(invalid("id must not be empty"));
        }
        if self.throttle.enabled && self.throttle.max_alerts == 0 {
            return Err(invalid("throttle max_alerts must be at least 1"));
        }
        if self.throttle.enabled && self.throttle.window_minutes <= 0 {
            return Err(invalid("throttle window must be positive"));
        }
        if self.aggregation.enabled && self.aggregation.window_minutes <= 0 {
            return Err(invalid("aggregation window must be positive"));
        }
        for channel in &self.channels {
            channel.validate()?;
        }
        Ok(())
    }
}

// ============================================================================
// Throttle map
// ============================================================================

type ThrottleKey = (String, SecurityEventType);

#[derive(Debug, Clone, Copy)]
struct ThrottleEntry {
    count: u32,
    reset_at: DateTime<Utc>,
}

/// Per-`(config, alert type)` delivery counters with lazy window reset.
///
/// An entry whose `reset_at` has passed counts as fresh on the next check;
/// nothing resets it eagerly. [`ThrottleMap::sweep`] evicts expired
/// entries so idle keys do not accumulate.
#[derive(Debug, Default)]
pub struct ThrottleMap {
    entries: RwLock<HashMap<ThrottleKey, ThrottleEntry>>,
}

impl ThrottleMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the key has spent its budget for the current window.
    pub fn is_throttled(
        &self,
        config_id: &str,
        alert_type: SecurityEventType,
        now: DateTime<Utc>,
        policy: &ThrottlePolicy,
    ) -> bool {
        if !policy.enabled {
            return false;
        }
        let entries = self.entries.read().expect("lock poisoned");
        entries
            .get(&(config_id.to_string(), alert_type))
            .is_some_and(|entry| now < entry.reset_at && entry.count >= policy.max_alerts)
    }

    /// Counts one delivery against the key, opening a fresh window if the
    /// previous one has passed. Returns the count within the window.
    pub fn record(
        &self,
        config_id: &str,
        alert_type: SecurityEventType,
        now: DateTime<Utc>,
        policy: &ThrottlePolicy,
    ) -> u32 {
        let mut entries = self.entries.write().expect("lock poisoned");
        let entry = entries
            .entry((config_id.to_string(), alert_type))
            .or_insert(ThrottleEntry {
                count: 0,
                reset_at: now + policy.window(),
            });
        if now >= entry.reset_at {
            entry.count = 0;
            entry.reset_at = now + policy.window();
        }
        entry.count += 1;
        entry.count
    }

    /// Evicts entries whose window has passed. Returns how many were
    /// removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write().expect("lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| now < entry.reset_at);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Aggregation buffers
// ============================================================================

#[derive(Debug, Clone)]
struct Buffer {
    alerts: Vec<Alert>,
    flush_at: DateTime<Utc>,
}

/// Per-`(config, alert type)` buffers awaiting a scheduled flush.
#[derive(Debug, Default)]
pub struct AggregationBuffers {
    buffers: RwLock<HashMap<ThrottleKey, Buffer>>,
}

impl AggregationBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers one alert; the first alert in a buffer schedules the flush
    /// at `now + window`. Returns the buffer size.
    pub fn push(
        &self,
        config_id: &str,
        alert: Alert,
        now: DateTime<Utc>,
        window: TimeDelta,
    ) -> usize {
        let mut buffers = self.buffers.write().expect("lock poisoned");
        let buffer = buffers
            .entry((config_id.to_string(), alert.alert_type))
            .or_insert_with(|| Buffer {
                alerts: Vec::new(),
                flush_at: now + window,
            });
        buffer.alerts.push(alert);
        buffer.alerts.len()
    }

    /// Drains every buffer whose deadline has passed.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<(String, SecurityEventType, Vec<Alert>)> {
        let mut buffers = self.buffers.write().expect("lock poisoned");
        let due: Vec<ThrottleKey> = buffers
            .iter()
            .filter(|(_, buffer)| now >= buffer.flush_at)
            .map(|(key, _)| key.clone())
            .collect();
        due.into_iter()
            .filter_map(|key| {
                buffers
                    .remove(&key)
                    .map(|buffer| (key.0, key.1, buffer.alerts))
            })
            .collect()
    }

    /// Alerts currently buffered, across all keys.
    pub fn buffered_count(&self) -> usize {
        self.buffers
            .read()
            .expect("lock poisoned")
            .values()
            .map(|buffer| buffer.alerts.len())
            .sum()
    }
}

// ============================================================================
// Manager
// ============================================================================

/// What happened to one `send`, per config and channel.
#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    pub delivered: Vec<(String, ChannelKind)>,
    pub failed: Vec<(String, ChannelKind)>,
    /// Configs skipped whole by their throttle.
    pub throttled: Vec<String>,
    /// Configs that buffered the alert for aggregation.
    pub buffered: Vec<String>,
}

impl DeliveryReport {
    pub fn any_delivered(&self) -> bool {
        !self.delivered.is_empty()
    }
}

const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Routes created alerts to channels according to the installed configs.
pub struct AlertManager {
    configs: Vec<AlertConfig>,
    store: Arc<AlertStore>,
    throttle: ThrottleMap,
    buffers: AggregationBuffers,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    backoff_base: Duration,
}

impl AlertManager {
    /// Validates and installs `configs`. Ids must be unique.
    pub fn new(
        configs: Vec<AlertConfig>,
        store: Arc<AlertStore>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for config in &configs {
            config.validate()?;
            if !seen.insert(config.id.as_str()) {
                return Err(AlertError::InvalidConfig {
                    id: config.id.clone(),
                    reason: "duplicate id".to_string(),
                });
            }
        }
        Ok(Self {
            configs,
            store,
            throttle: ThrottleMap::new(),
            buffers: AggregationBuffers::new(),
            transport,
            clock,
            audit,
            backoff_base: DEFAULT_BACKOFF_BASE,
        })
    }

    /// Overrides the webhook retry backoff base.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn configs(&self) -> &[AlertConfig] {
        &self.configs
    }

    pub fn store(&self) -> &AlertStore {
        &self.store
    }

    /// Creates the alert record and routes it.
    ///
    /// The record is always created; the report says what each matching
    /// config did with it. Channel failures are reported, never raised.
    pub fn send(&self, draft: AlertDraft) -> (Alert, DeliveryReport) {
        let alert = self.store.create(draft);
        self.audit.append(AuditEntry::AlertCreated {
            alert_id: alert.id,
            alert_type: alert.alert_type,
            severity: alert.severity,
        });
        tracing::info!(
            alert_id = %alert.id,
            alert_type = %alert.alert_type,
            severity = %alert.severity,
            "alert created"
        );

        let now = self.clock.now();
        let mut report = DeliveryReport::default();

        for config in &self.configs {
            if !config.matches(alert.alert_type, alert.severity) {
                continue;
            }

            if self
                .throttle
                .is_throttled(&config.id, alert.alert_type, now, &config.throttle)
            {
                tracing::warn!(alert_id = %alert.id, config_id = config.id, "alert throttled");
                self.audit.append(AuditEntry::AlertThrottled {
                    alert_id: alert.id,
                    config_id: config.id.clone(),
                });
                report.throttled.push(config.id.clone());
                continue;
            }

            if config.aggregation.enabled {
                let buffered = self.buffers.push(
                    &config.id,
                    alert.clone(),
                    now,
                    config.aggregation.window(),
                );
                tracing::debug!(
                    alert_id = %alert.id,
                    config_id = config.id,
                    buffered,
                    "alert buffered for aggregation"
                );
                report.buffered.push(config.id.clone());
                continue;
            }

            self.deliver_through(config, &alert, &mut report);
            self.throttle
                .record(&config.id, alert.alert_type, now, &config.throttle);
        }

        (alert, report)
    }

    /// Flushes every aggregation buffer whose window has closed, one
    /// summary alert per buffer. Returns the summaries created.
    ///
    /// Summary delivery does not consult the throttle: the summary is the
    /// storm control, and suppressing it would drop the only record of the
    /// batch.
    pub fn flush_due(&self, now: DateTime<Utc>) -> Vec<Alert> {
        let mut summaries = Vec::new();
        for (config_id, alert_type, alerts) in self.buffers.take_due(now) {
            let Some(config) = self.configs.iter().find(|config| config.id == config_id) else {
                continue;
            };
            let count = u32::try_from(alerts.len()).unwrap_or(u32::MAX);
            let severity = alerts
                .iter()
                .map(|alert| alert.severity)
                .max()
                .unwrap_or(Severity::Low);

            let summary = self.store.create(
                AlertDraft::new(
                    alert_type,
                    format!("{count} {alert_type} alerts aggregated over one window"),
                )
                .with_title(format!("{count} {alert_type} events"))
                .with_severity(severity)
                .with_source_events(alerts.iter().map(|alert| alert.id))
                .with_event_count(count),
            );
            self.audit.append(AuditEntry::AlertAggregated {
                config_id: config_id.clone(),
                alert_type,
                event_count: count,
            });
            tracing::info!(
                config_id,
                %alert_type,
                event_count = count,
                "aggregated alerts flushed"
            );

            let mut report = DeliveryReport::default();
            self.deliver_through(config, &summary, &mut report);
            summaries.push(summary);
        }
        summaries
    }

    fn deliver_through(&self, config: &AlertConfig, alert: &Alert, report: &mut DeliveryReport) {
        for channel in &config.channels {
            if !channel.admits(alert.severity) {
                continue;
            }
            match channels::deliver(
                self.transport.as_ref(),
                self.clock.as_ref(),
                channel,
                alert,
                self.backoff_base,
            ) {
                Ok(()) => {
                    self.audit.append(AuditEntry::AlertDelivered {
                        alert_id: alert.id,
                        config_id: config.id.clone(),
                        channel: channel.kind.as_str().to_string(),
                    });
                    report.delivered.push((config.id.clone(), channel.kind));
                }
                Err(error) => {
                    tracing::warn!(
                        alert_id = %alert.id,
                        config_id = config.id,
                        channel = %channel.kind,
                        %error,
                        "alert delivery failed"
                    );
                    self.audit.append(AuditEntry::AlertDeliveryFailed {
                        alert_id: alert.id,
                        config_id: config.id.clone(),
                        channel: channel.kind.as_str().to_string(),
                        error: error.to_string(),
                    });
                    report.failed.push((config.id.clone(), channel.kind));
                }
            }
        }
    }

    /// Acknowledges an alert on behalf of `by`. Idempotent.
    pub fn acknowledge(&self, id: uuid::Uuid, by: &str) -> Result<Alert> {
        let alert = self.store.acknowledge(id, by)?;
        self.audit.append(AuditEntry::AlertAcknowledged {
            alert_id: id,
            by: by.to_string(),
        });
        Ok(alert)
    }

    /// Resolves an alert on behalf of `by`. Idempotent.
    pub fn resolve(&self, id: uuid::Uuid, by: &str) -> Result<Alert> {
        let alert = self.store.resolve(id, by)?;
        self.audit.append(AuditEntry::AlertResolved {
            alert_id: id,
            by: by.to_string(),
        });
        Ok(alert)
    }

    /// Evicts expired throttle entries. Returns how many were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        self.throttle.sweep(now)
    }

    /// Alerts currently waiting in aggregation buffers.
    pub fn buffered_count(&self) -> usize {
        self.buffers.buffered_count()
    }
}

// ============================================================================
// Tests
// ============================================================================
