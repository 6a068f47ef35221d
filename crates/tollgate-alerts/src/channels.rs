//! Channel adapters and the transport boundary.
//!
//! A channel adapter does exactly two things: shape an [`Alert`] into the
//! payload its channel expects, and hand that payload to the injected
//! [`Transport`] with the configured per-attempt timeout. Webhooks retry
//! with linear backoff (slept through the injected clock, so tests never
//! wait); every other channel is single-attempt, since its transport is
//! expected to queue internally.

use std::{
    sync::RwLock,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tollgate_types::{Clock, Severity};

use crate::{AlertError, Result, store::Alert};

/// Kind of delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Email,
    Slack,
    Webhook,
    Sms,
    Pagerduty,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Email => "email",
            ChannelKind::Slack => "slack",
            ChannelKind::Webhook => "webhook",
            ChannelKind::Sms => "sms",
            ChannelKind::Pagerduty => "pagerduty",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured delivery channel inside an alert config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    pub enabled: bool,
    /// Target URL or routing key; required for webhook, slack and
    /// pagerduty channels.
    pub endpoint: Option<String>,
    /// Addresses or numbers; required for email and sms channels.
    pub recipients: Vec<String>,
    /// Delivery attempts for webhook channels. Other kinds ignore this.
    pub retries: u32,
    /// Per-attempt timeout handed to the transport.
    pub timeout_ms: u64,
    /// Channel-level severity floor on top of the config-level threshold.
    pub min_severity: Option<Severity>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            kind: ChannelKind::Webhook,
            enabled: true,
            endpoint: None,
            recipients: Vec::new(),
            retries: 3,
            timeout_ms: 5_000,
            min_severity: None,
        }
    }
}

impl ChannelConfig {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipients.push(recipient.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Checks that the channel has the addressing its kind needs.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| AlertError::ChannelConfigInvalid {
            kind: self.kind,
            reason: reason.to_string(),
        };
        match self.kind {
            ChannelKind::Webhook | ChannelKind::Slack | ChannelKind::Pagerduty => {
                if self.endpoint.as_deref().is_none_or(str::is_empty) {
                    return Err(invalid("endpoint is required"));
                }
            }
            ChannelKind::Email | ChannelKind::Sms => {
                if self.recipients.is_empty() {
                    return Err(invalid("at least one recipient is required"));
                }
            }
        }
        if self.timeout_ms == 0 {
            return Err(invalid("timeout must be positive"));
        }
        Ok(())
    }

    /// Whether this channel wants an alert of `severity`.
    pub fn admits(&self, severity: Severity) -> bool {
        self.enabled && self.min_severity.is_none_or(|floor| severity >= floor)
    }
}

/// Failure reported by a transport implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Process boundary for outbound delivery.
///
/// Implementations own the actual I/O (SMTP, HTTP, SMS gateway) and must
/// honor `timeout` per call; the core never opens a socket.
pub trait Transport: Send + Sync {
    fn deliver(
        &self,
        kind: ChannelKind,
        config: &ChannelConfig,
        payload: &Value,
        timeout: Duration,
    ) -> std::result::Result<(), TransportError>;
}

const SMS_MAX_CHARS: usize = 160;

/// Shapes an alert into the payload `kind` expects.
pub fn build_payload(kind: ChannelKind, alert: &Alert) -> Value {
    match kind {
        ChannelKind::Email => json!({
            "subject": format!("[{}] {}", alert.severity, alert.title),
            "body": format!(
                "{}\n\nevents: {}\nalert id: {}",
                alert.message, alert.event_count, alert.id
            ),
        }),
        ChannelKind::Slack => json!({
            "text": format!("*{}* ({})\n{}", alert.title, alert.severity, alert.message),
        }),
        ChannelKind::Webhook => json!({
            "alert": alert,
        }),
        ChannelKind::Sms => {
            let text = format!("{}: {}", alert.title, alert.message);
            let truncated: String = text.chars().take(SMS_MAX_CHARS).collect();
            json!({ "text": truncated })
        }
        ChannelKind::Pagerduty => json!({
            "event_action": "trigger",
            "payload": {
                "summary": alert.title,
                "severity": pagerduty_severity(alert.severity),
                "source": "tollgate",
                "custom_details": {
                    "message": alert.message,
                    "event_count": alert.event_count,
                    "alert_id": alert.id,
                },
            },
        }),
    }
}

fn pagerduty_severity(severity: Severity) -> &'static str {
    match severity {
        Severity::Low => "info",
        Severity::Medium => "warning",
        Severity::High => "error",
        Severity::Critical => "critical",
    }
}

/// Delivers `alert` through one channel, retrying webhooks with linear
/// backoff (`attempt * backoff_base`, slept through `clock`).
///
/// Returns [`AlertError::DeliveryFailed`] once every attempt is spent.
pub fn deliver(
    transport: &dyn Transport,
    clock: &dyn Clock,
    config: &ChannelConfig,
    alert: &Alert,
    backoff_base: Duration,
) -> Result<()> {
    let payload = build_payload(config.kind, alert);
    let attempts = match config.kind {
        ChannelKind::Webhook => config.retries.max(1),
        _ => 1,
    };

    let mut last_error = None;
    for attempt in 1..=attempts {
        match transport.deliver(config.kind, config, &payload, config.timeout()) {
            Ok(()) => return Ok(()),
            Err(error) => {
                tracing::warn!(
                    channel = %config.kind,
                    attempt,
                    attempts,
                    %error,
                    "channel delivery attempt failed"
                );
                last_error = Some(error);
                if attempt < attempts {
                    clock.sleep(backoff_base * attempt);
                }
            }
        }
    }

    Err(AlertError::DeliveryFailed {
        channel: config.kind,
        attempts,
        source: last_error.unwrap_or_else(|| TransportError("no attempt made".to_string())),
    })
}

/// Default transport: emits each delivery as a structured `tracing`
/// event and reports success.
///
/// Useful until a real transport is wired in; nothing leaves the process.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTransport;

impl Transport for LogTransport {
    fn deliver(
        &self,
        kind: ChannelKind,
        config: &ChannelConfig,
        payload: &Value,
        _timeout: Duration,
    ) -> std::result::Result<(), TransportError> {
        tracing::info!(
            channel = %kind,
            endpoint = config.endpoint.as_deref(),
            %payload,
            "alert delivery (log transport)"
        );
        Ok(())
    }
}

/// One captured delivery attempt.
#[derive(Debug, Clone)]
pub struct RecordedDelivery {
    pub kind: ChannelKind,
    pub endpoint: Option<String>,
    pub payload: Value,
    pub timeout: Duration,
}

/// Test transport: records every attempt and can be scripted to fail the
/// next N of them.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    deliveries: RwLock<Vec<RecordedDelivery>>,
    failures_remaining: RwLock<u32>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` deliver calls fail.
    pub fn fail_next(&self, n: u32) {
        *self.failures_remaining.write().expect("lock poisoned") = n;
    }

    /// Every attempt seen so far, failed ones included.
    pub fn deliveries(&self) -> Vec<RecordedDelivery> {
        self.deliveries.read().expect("lock poisoned").clone()
    }

    pub fn delivery_count(&self) -> usize {
        self.deliveries.read().expect("lock poisoned").len()
    }

    /// Attempts against one channel kind.
    pub fn count_for(&self, kind: ChannelKind) -> usize {
        self.deliveries
            .read()
            .expect("lock poisoned")
            .iter()
            .filter(|delivery| delivery.kind == kind)
            .count()
    }
}

impl Transport for RecordingTransport {
    fn deliver(
        &self,
        kind: ChannelKind,
        config: &ChannelConfig,
        payload: &Value,
        timeout: Duration,
    ) -> std::result::Result<(), TransportError> {
        self.deliveries
            .write()
            .expect("lock poisoned")
            .push(RecordedDelivery {
                kind,
                endpoint: config.endpoint.clone(),
                payload: payload.clone(),
                timeout,
            });

        let mut failures = self.failures_remaining.write().expect("lock poisoned");
        if *failures > 0 {
            *failures -= 1;
            return Err(TransportError("scripted failure".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeDelta, TimeZone, Utc};
    use test_case::test_case;
    use tollgate_types::{ManualClock, SecurityEventType};
    use uuid::Uuid;

    use super::*;
    use crate::store::AlertStatus;

    fn sample_alert() -> Alert {
        Alert {
            id: Uuid::new_v4(),
            title: "brute force attempt".to_string(),
            alert_type: SecurityEventType::BruteForceAttempt,
            severity: Severity::High,
            message: "5 invalid API key attempts from 203.0.113.7".to_string(),
            source_event_ids: Vec::new(),
            event_count: 5,
            created_at: Utc
                .with_ymd_and_hms(2025, 6, 4, 12, 0, 0)
                .single()
                .expect("valid timestamp"),
            status: AlertStatus::Open,
        }
    }

    #[test]
    fn email_payload_has_subject_and_body() {
        let payload = build_payload(ChannelKind::Email, &sample_alert());
        let subject = payload["subject"].as_str().expect("subject");
        assert_eq!(subject, "[high] brute force attempt");
        assert!(payload["body"].as_str().expect("body").contains("events: 5"));
    }

    #[test]
    fn webhook_payload_carries_the_full_alert() {
        let alert = sample_alert();
        let payload = build_payload(ChannelKind::Webhook, &alert);
        assert_eq!(
            payload["alert"]["id"].as_str().expect("id"),
            alert.id.to_string()
        );
        assert_eq!(payload["alert"]["event_count"], 5);
    }

    #[test]
    fn sms_payload_is_truncated() {
        let mut alert = sample_alert();
        alert.message = "x".repeat(500);
        let payload = build_payload(ChannelKind::Sms, &alert);
        assert_eq!(payload["text"].as_str().expect("text").chars().count(), 160);
    }

    #[test_case(Severity::Low, "info")]
    #[test_case(Severity::Medium, "warning")]
    #[test_case(Severity::High, "error")]
    #[test_case(Severity::Critical, "critical")]
    fn pagerduty_severity_mapping(severity: Severity, expected: &str) {
        let mut alert = sample_alert();
        alert.severity = severity;
        let payload = build_payload(ChannelKind::Pagerduty, &alert);
        assert_eq!(payload["payload"]["severity"], expected);
        assert_eq!(payload["event_action"], "trigger");
    }

    #[test]
    fn validation_requires_kind_appropriate_addressing() {
        assert!(ChannelConfig::new(ChannelKind::Webhook).validate().is_err());
        assert!(
            ChannelConfig::new(ChannelKind::Webhook)
                .with_endpoint("https://example.com/hook")
                .validate()
                .is_ok()
        );

        assert!(ChannelConfig::new(ChannelKind::Email).validate().is_err());
        assert!(
            ChannelConfig::new(ChannelKind::Email)
                .with_recipient("ops@example.com")
                .validate()
                .is_ok()
        );

        let zero_timeout = ChannelConfig::new(ChannelKind::Sms)
            .with_recipient("+15550100")
            .with_timeout_ms(0);
        assert!(matches!(
            zero_timeout.validate(),
            Err(AlertError::ChannelConfigInvalid { .. })
        ));
    }

    #[test]
    fn severity_floor_gates_the_channel() {
        let config = ChannelConfig::new(ChannelKind::Slack)
            .with_endpoint("https://hooks.example.com/T000")
            .with_min_severity(Severity::High);
        assert!(config.admits(Severity::Critical));
        assert!(!config.admits(Severity::Medium));
        assert!(!config.clone().disabled().admits(Severity::Critical));
    }

    fn start_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 4, 12, 0, 0)
                .single()
                .expect("valid timestamp"),
        ))
    }

    #[test]
    fn webhook_retries_with_linear_backoff() {
        let transport = RecordingTransport::new();
        transport.fail_next(2);
        let clock = start_clock();
        let config = ChannelConfig::new(ChannelKind::Webhook)
            .with_endpoint("https://example.com/hook")
            .with_retries(3);

        let before = clock.now();
        deliver(
            &transport,
            clock.as_ref(),
            &config,
            &sample_alert(),
            Duration::from_millis(500),
        )
        .expect("third attempt succeeds");

        assert_eq!(transport.delivery_count(), 3);
        // Backoff slept 500 ms after attempt 1 and 1000 ms after attempt 2.
        assert_eq!(clock.now() - before, TimeDelta::milliseconds(1_500));
    }

    #[test]
    fn webhook_exhausted_retries_report_failure() {
        let transport = RecordingTransport::new();
        transport.fail_next(10);
        let clock = start_clock();
        let config = ChannelConfig::new(ChannelKind::Webhook)
            .with_endpoint("https://example.com/hook")
            .with_retries(2);

        let err = deliver(
            &transport,
            clock.as_ref(),
            &config,
            &sample_alert(),
            Duration::from_millis(500),
        )
        .expect_err("every attempt fails");

        assert!(matches!(
            err,
            AlertError::DeliveryFailed {
                channel: ChannelKind::Webhook,
                attempts: 2,
                ..
            }
        ));
        assert_eq!(transport.delivery_count(), 2);
    }

    #[test]
    fn non_webhook_channels_are_single_attempt() {
        let transport = RecordingTransport::new();
        transport.fail_next(1);
        let clock = start_clock();
        let config = ChannelConfig::new(ChannelKind::Email)
            .with_recipient("ops@example.com")
            .with_retries(5);

        let err = deliver(
            &transport,
            clock.as_ref(),
            &config,
            &sample_alert(),
            Duration::from_millis(500),
        )
        .expect_err("one failure is final for email");

        assert!(matches!(err, AlertError::DeliveryFailed { attempts: 1, .. }));
        assert_eq!(transport.delivery_count(), 1);
    }
}
