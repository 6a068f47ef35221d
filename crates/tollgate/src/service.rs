//! The Tollgate service object and its builder.
//!
//! One `Tollgate` owns the whole pipeline: resolver, event log, pattern
//! engine, geo detector, registries and alert manager, all sharing one
//! clock and one audit sink. It is built once and passed by handle; there
//! is no global instance.

use std::{sync::Arc, time::Duration};

use chrono::TimeDelta;
use uuid::Uuid;

use tollgate_alerts::{
    Alert, AlertConfig, AlertDraft, AlertManager, AlertQuery, AlertStore, ChannelConfig,
    ChannelKind, DeliveryReport, LogTransport, Transport, channels,
};
use tollgate_config::TollgateConfig;
use tollgate_entitlements::{
    ANONYMOUS_USER, AccessContext, AccessDecision, CatalogHandle, DenyReason, PermissionCatalog,
    PermissionResolver, UsageLedger, default_catalog,
};
use tollgate_monitor::{
    BlockEntry, BlockRegistry, EventDraft, EventQuery, GeoAnomalyConfig, GeoAnomalyDetector,
    PatternAction, PatternEngine, PatternTrigger, SecurityEvent, SecurityEventLog, SecurityPattern,
    SuspendEntry, SuspendRegistry, default_patterns,
};
use tollgate_types::{
    AuditEntry, AuditSink, Clock, EventDetails, GeoPoint, SecurityEventType, SystemClock,
    TracingAuditSink,
};

use crate::{Result, sweeper::Sweeper};

// ============================================================================
// Request context
// ============================================================================

/// Caller-supplied context for one facade call: who is asking, and from
/// where.
///
/// The origin fields only matter when a denial turns into a security
/// event; callers that cannot name an origin fall back to `"unknown"`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestContext {
    pub access: AccessContext,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.access = self.access.with_user(user_id);
        self
    }

    pub fn with_admin_role(mut self) -> Self {
        self.access = self.access.with_admin_role();
        self
    }

    pub fn with_ip(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    fn ip(&self) -> &str {
        self.ip_address.as_deref().unwrap_or("unknown")
    }

    fn user(&self) -> &str {
        self.access.user_id.as_deref().unwrap_or(ANONYMOUS_USER)
    }
}

// ============================================================================
// Service
// ============================================================================

/// The assembled permission and security service.
pub struct Tollgate {
    catalog: Arc<CatalogHandle>,
    ledger: Arc<UsageLedger>,
    resolver: PermissionResolver,
    log: Arc<SecurityEventLog>,
    engine: PatternEngine,
    geo: GeoAnomalyDetector,
    blocks: Arc<BlockRegistry>,
    suspensions: Arc<SuspendRegistry>,
    alerts: Arc<AlertManager>,
    transport: Arc<dyn Transport>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    event_retention: TimeDelta,
    webhook_backoff: Duration,
    sweep_interval: Duration,
    sweeper_enabled: bool,
}

impl Tollgate {
    /// Starts a builder with the shipped catalog and patterns.
    pub fn builder() -> TollgateBuilder {
        TollgateBuilder::new()
    }

    // ------------------------------------------------------------------
    // Permission resolution
    // ------------------------------------------------------------------

    /// Resolves one permission check and audits the decision.
    ///
    /// Denials additionally become security events: an unparseable tier is
    /// a `TierBypassAttempt`, everything else a `PermissionDenied`. Both
    /// feed the pattern engine like any other recorded event.
    pub fn resolve(
        &self,
        tier: &str,
        feature: &str,
        action: &str,
        ctx: &RequestContext,
    ) -> AccessDecision {
        let decision = self.resolver.resolve(tier, feature, action, &ctx.access);

        self.audit.append(AuditEntry::PermissionDecision {
            user_id: ctx.access.user_id.clone(),
            tier: tier.to_string(),
            feature: feature.to_string(),
            action: action.to_string(),
            allowed: decision.allowed,
            reason: decision.reason.map(|reason| reason.to_string()),
        });

        if !decision.allowed {
            self.record_denial(tier, feature, action, ctx, &decision);
        }
        decision
    }

    fn record_denial(
        &self,
        tier: &str,
        feature: &str,
        action: &str,
        ctx: &RequestContext,
        decision: &AccessDecision,
    ) {
        let event_type = match decision.reason {
            Some(DenyReason::InvalidTier) => SecurityEventType::TierBypassAttempt,
            _ => SecurityEventType::PermissionDenied,
        };
        let details = match event_type {
            SecurityEventType::TierBypassAttempt => EventDetails::new()
                .with("feature", feature)
                .with("claimed_tier", tier),
            _ => EventDetails::new()
                .with("feature", feature)
                .with("action", action)
                .with("tier", tier)
                .with(
                    "reason",
                    decision
                        .reason
                        .map_or_else(|| "denied".to_string(), |reason| reason.to_string()),
                ),
        };

        let mut draft = EventDraft::new(event_type, ctx.ip()).with_details(details);
        if let Some(user_id) = &ctx.access.user_id {
            draft = draft.with_user(user_id.clone());
        }
        if let Some(user_agent) = &ctx.user_agent {
            draft = draft.with_user_agent(user_agent.clone());
        }
        self.record_event(draft);
    }

    /// Records one use of (user, feature, action) against the ledger.
    pub fn track_usage(&self, ctx: &RequestContext, feature: &str, action: &str) {
        let user = ctx.user();
        self.resolver.track_usage(user, feature, action);
        self.audit.append(AuditEntry::UsageTracked {
            user_id: user.to_string(),
            feature: feature.to_string(),
            action: action.to_string(),
        });
    }

    /// Checks a proposed resource count against the tier's cap.
    pub fn check_tier_limit(&self, tier: &str, limit_type: &str, proposed: i64) -> AccessDecision {
        let decision = self.resolver.check_tier_limit(tier, limit_type, proposed);
        self.audit.append(AuditEntry::TierLimitDecision {
            tier: tier.to_string(),
            limit_type: limit_type.to_string(),
            proposed,
            allowed: decision.allowed,
        });
        decision
    }

    /// Handle for hot catalog reload: `swap` installs a new catalog without
    /// interrupting in-flight resolutions.
    pub fn catalog(&self) -> &CatalogHandle {
        &self.catalog
    }

    // ------------------------------------------------------------------
    // Security events
    // ------------------------------------------------------------------

    /// Records a security event, runs the pattern engine over it and
    /// executes any resulting triggers.
    ///
    /// Action failures are logged and audited, never retried here, and
    /// never abort the remaining actions.
    pub fn record_event(&self, draft: EventDraft) -> SecurityEvent {
        let event = self.log.record(draft);
        self.audit.append(AuditEntry::EventRecorded {
            event_id: event.id,
            event_type: event.event_type,
            severity: event.severity,
        });

        for trigger in self.engine.on_event(&event, &self.log) {
            self.execute_trigger(&trigger);
        }
        event
    }

    fn execute_trigger(&self, trigger: &PatternTrigger) {
        for action in &trigger.actions {
            match action {
                PatternAction::Alert { message } => {
                    let draft = AlertDraft::new(
                        trigger.event.event_type,
                        substitute(message, trigger),
                    )
                    .with_title(trigger.pattern_name.clone())
                    .with_source_event(trigger.event.id)
                    .with_event_count(trigger.matched);
                    let (alert, report) = self.alerts.send(draft);
                    if !report.failed.is_empty() {
                        tracing::warn!(
                            alert_id = %alert.id,
                            pattern_id = trigger.pattern_id,
                            failed = report.failed.len(),
                            "pattern alert partially undelivered"
                        );
                    }
                }
                PatternAction::BlockIp { reason } => {
                    let reason = substitute(reason, trigger);
                    self.block_ip(&trigger.event.ip_address, &reason);
                }
                PatternAction::SuspendUser { reason } => {
                    if let Some(user_id) = &trigger.event.user_id {
                        let reason = substitute(reason, trigger);
                        self.suspend_user(user_id, &reason);
                    } else {
                        tracing::warn!(
                            pattern_id = trigger.pattern_id,
                            "suspend action skipped: triggering event has no user"
                        );
                    }
                }
                PatternAction::Webhook { url } => {
                    self.deliver_pattern_webhook(url, trigger);
                }
            }
        }
    }

    fn deliver_pattern_webhook(&self, url: &str, trigger: &PatternTrigger) {
        let channel = ChannelConfig::new(ChannelKind::Webhook).with_endpoint(url);
        let notification = self.alerts.store().create(
            AlertDraft::new(
                trigger.event.event_type,
                format!("pattern {} fired", trigger.pattern_name),
            )
            .with_title(trigger.pattern_name.clone())
            .with_source_event(trigger.event.id)
            .with_event_count(trigger.matched),
        );

        match channels::deliver(
            self.transport.as_ref(),
            self.clock.as_ref(),
            &channel,
            &notification,
            self.webhook_backoff,
        ) {
            Ok(()) => {
                self.audit.append(AuditEntry::AlertDelivered {
                    alert_id: notification.id,
                    config_id: trigger.pattern_id.clone(),
                    channel: ChannelKind::Webhook.as_str().to_string(),
                });
            }
            Err(error) => {
                tracing::warn!(
                    pattern_id = trigger.pattern_id,
                    url,
                    %error,
                    "pattern webhook delivery failed"
                );
                self.audit.append(AuditEntry::AlertDeliveryFailed {
                    alert_id: notification.id,
                    config_id: trigger.pattern_id.clone(),
                    channel: ChannelKind::Webhook.as_str().to_string(),
                    error: error.to_string(),
                });
            }
        }
    }

    /// Feeds a located sighting into the geo detector; an anomaly is
    /// recorded as a security event and returned.
    pub fn observe_location(
        &self,
        user_id: &str,
        point: &GeoPoint,
        ip_address: &str,
        user_agent: Option<&str>,
    ) -> Option<SecurityEvent> {
        self.geo
            .observe(user_id, point, ip_address, user_agent)
            .map(|draft| self.record_event(draft))
    }

    /// Overrides the geo reporting threshold for one user; `None` restores
    /// the configured default.
    pub fn set_geo_threshold(&self, user_id: &str, threshold_hours: Option<f64>) {
        self.geo.set_user_threshold(user_id, threshold_hours);
    }

    /// Marks a security event resolved.
    pub fn resolve_event(&self, id: Uuid, resolved_by: &str) -> Result<()> {
        self.log.resolve(id, resolved_by)?;
        self.audit.append(AuditEntry::EventResolved {
            event_id: id,
            resolved_by: resolved_by.to_string(),
        });
        Ok(())
    }

    /// Queries the security event log.
    pub fn events(&self, query: &EventQuery) -> Vec<SecurityEvent> {
        self.log.query(query)
    }

    // ------------------------------------------------------------------
    // Registries
    // ------------------------------------------------------------------

    pub fn is_blocked(&self, ip: &str) -> bool {
        self.blocks.is_blocked(ip)
    }

    pub fn is_suspended(&self, user_id: &str) -> bool {
        self.suspensions.is_suspended(user_id)
    }

    /// Blocks an IP until the configured horizon. Re-blocking refreshes
    /// the expiry.
    pub fn block_ip(&self, ip: &str, reason: &str) -> BlockEntry {
        let entry = self.blocks.block(ip, reason);
        self.audit.append(AuditEntry::IpBlocked {
            ip: ip.to_string(),
            reason: reason.to_string(),
            expires_at: entry.expires_at,
        });
        entry
    }

    /// Lifts a block before its horizon. Returns whether one existed.
    pub fn unblock_ip(&self, ip: &str) -> bool {
        let removed = self.blocks.unblock(ip);
        if removed {
            self.audit
                .append(AuditEntry::IpUnblocked { ip: ip.to_string() });
        }
        removed
    }

    /// Suspends a user until reinstated. The first reason stands on
    /// re-suspension.
    pub fn suspend_user(&self, user_id: &str, reason: &str) -> SuspendEntry {
        let entry = self.suspensions.suspend(user_id, reason);
        self.audit.append(AuditEntry::UserSuspended {
            user_id: user_id.to_string(),
            reason: reason.to_string(),
        });
        entry
    }

    /// Reinstates a suspended user. Returns whether a suspension existed.
    pub fn reinstate_user(&self, user_id: &str) -> bool {
        let removed = self.suspensions.reinstate(user_id);
        if removed {
            self.audit.append(AuditEntry::UserReinstated {
                user_id: user_id.to_string(),
            });
        }
        removed
    }

    // ------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------

    /// Sends an alert through the configured routing.
    pub fn send_alert(&self, draft: AlertDraft) -> (Alert, DeliveryReport) {
        self.alerts.send(draft)
    }

    pub fn acknowledge_alert(&self, id: Uuid, by: &str) -> Result<Alert> {
        Ok(self.alerts.acknowledge(id, by)?)
    }

    pub fn resolve_alert(&self, id: Uuid, by: &str) -> Result<Alert> {
        Ok(self.alerts.resolve(id, by)?)
    }

    /// Queries the alert store.
    pub fn alerts(&self, query: &AlertQuery) -> Vec<Alert> {
        self.alerts.store().query(query)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Builds a sweeper over this service's stores.
    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(
            Arc::clone(&self.ledger),
            Arc::clone(&self.log),
            Arc::clone(&self.alerts),
            Arc::clone(&self.blocks),
            Arc::clone(&self.clock),
            self.event_retention,
        )
    }

    /// Spawns the background sweeper at the configured interval, or
    /// returns `None` when sweeping is disabled.
    pub fn start_sweeper(&self) -> Option<crate::sweeper::SweeperHandle> {
        if !self.sweeper_enabled {
            return None;
        }
        Some(self.sweeper().spawn(self.sweep_interval))
    }
}

/// Fills `{user}`, `{ip}` and `{count}` placeholders from a trigger.
fn substitute(template: &str, trigger: &PatternTrigger) -> String {
    template
        .replace("{user}", trigger.event.user_id.as_deref().unwrap_or("unknown"))
        .replace("{ip}", &trigger.event.ip_address)
        .replace("{count}", &trigger.matched.to_string())
}

// ============================================================================
// Builder
// ============================================================================

/// Assembles a [`Tollgate`].
///
/// Everything has a default: the shipped catalog and patterns, no alert
/// configs, the log transport, the tracing audit sink and the system
/// clock.
pub struct TollgateBuilder {
    catalog: Option<PermissionCatalog>,
    patterns: Option<Vec<SecurityPattern>>,
    alert_configs: Vec<AlertConfig>,
    transport: Option<Arc<dyn Transport>>,
    audit: Option<Arc<dyn AuditSink>>,
    clock: Option<Arc<dyn Clock>>,
    admin_override: bool,
    geo_config: GeoAnomalyConfig,
    block_horizon: TimeDelta,
    event_retention: TimeDelta,
    webhook_backoff: Duration,
    sweep_interval: Duration,
    sweeper_enabled: bool,
}

impl TollgateBuilder {
    pub fn new() -> Self {
        Self {
            catalog: None,
            patterns: None,
            alert_configs: Vec::new(),
            transport: None,
            audit: None,
            clock: None,
            admin_override: true,
            geo_config: GeoAnomalyConfig::default(),
            block_horizon: TimeDelta::hours(24),
            event_retention: TimeDelta::days(7),
            webhook_backoff: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(60),
            sweeper_enabled: true,
        }
    }

    /// Seeds the builder from a loaded configuration.
    pub fn from_config(config: &TollgateConfig) -> Result<Self> {
        let mut builder = Self::new()
            .with_admin_override(config.resolver.admin_override)
            .with_geo_config(GeoAnomalyConfig {
                travel_speed_kmh: config.monitor.geo_travel_speed_kmh,
                threshold_hours: config.monitor.geo_threshold_hours as f64,
                promotion_sightings: config.monitor.geo_promotion_sightings,
            })
            .with_block_horizon(TimeDelta::hours(config.monitor.block_horizon_hours))
            .with_event_retention(TimeDelta::days(i64::from(
                config.monitor.event_retention_days,
            )))
            .with_webhook_backoff(Duration::from_millis(config.alerts.webhook_retry_base_ms))
            .with_sweeper(
                config.sweeper.enabled,
                Duration::from_secs(config.sweeper.interval_secs),
            )
            .with_alert_configs(config.alert_configs.clone());

        if !config.catalog.tiers.is_empty() {
            builder = builder.with_catalog(config.catalog.clone().into_catalog()?);
        }
        if !config.patterns.is_empty() {
            builder = builder.with_patterns(config.patterns.clone());
        }
        Ok(builder)
    }

    pub fn with_catalog(mut self, catalog: PermissionCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_patterns(mut self, patterns: Vec<SecurityPattern>) -> Self {
        self.patterns = Some(patterns);
        self
    }

    pub fn with_alert_configs(mut self, configs: Vec<AlertConfig>) -> Self {
        self.alert_configs = configs;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_admin_override(mut self, enabled: bool) -> Self {
        self.admin_override = enabled;
        self
    }

    pub fn with_geo_config(mut self, config: GeoAnomalyConfig) -> Self {
        self.geo_config = config;
        self
    }

    pub fn with_block_horizon(mut self, horizon: TimeDelta) -> Self {
        self.block_horizon = horizon;
        self
    }

    pub fn with_event_retention(mut self, retention: TimeDelta) -> Self {
        self.event_retention = retention;
        self
    }

    pub fn with_webhook_backoff(mut self, backoff: Duration) -> Self {
        self.webhook_backoff = backoff;
        self
    }

    pub fn with_sweeper(mut self, enabled: bool, interval: Duration) -> Self {
        self.sweeper_enabled = enabled;
        self.sweep_interval = interval;
        self
    }

    /// Validates the patterns and alert configs and assembles the service.
    pub fn build(self) -> Result<Tollgate> {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let audit: Arc<dyn AuditSink> = self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink));
        let transport = self.transport.unwrap_or_else(|| Arc::new(LogTransport));

        let catalog = Arc::new(CatalogHandle::new(
            self.catalog.unwrap_or_else(default_catalog),
        ));
        let ledger = Arc::new(UsageLedger::new());
        let resolver =
            PermissionResolver::new(Arc::clone(&catalog), Arc::clone(&ledger), Arc::clone(&clock))
                .with_admin_override(self.admin_override);

        let log = Arc::new(SecurityEventLog::new(Arc::clone(&clock)));
        let engine = PatternEngine::new(self.patterns.unwrap_or_else(default_patterns))?;
        let geo = GeoAnomalyDetector::new(self.geo_config, Arc::clone(&clock));
        let blocks = Arc::new(BlockRegistry::new(self.block_horizon, Arc::clone(&clock)));
        let suspensions = Arc::new(SuspendRegistry::new(Arc::clone(&clock)));

        let store = Arc::new(AlertStore::new(Arc::clone(&clock)));
        let alerts = Arc::new(
            AlertManager::new(
                self.alert_configs,
                store,
                Arc::clone(&transport),
                Arc::clone(&clock),
                Arc::clone(&audit),
            )?
            .with_backoff_base(self.webhook_backoff),
        );

        Ok(Tollgate {
            catalog,
            ledger,
            resolver,
            log,
            engine,
            geo,
            blocks,
            suspensions,
            alerts,
            transport,
            audit,
            clock,
            event_retention: self.event_retention,
            webhook_backoff: self.webhook_backoff,
            sweep_interval: self.sweep_interval,
            sweeper_enabled: self.sweeper_enabled,
        })
    }
}

impl Default for TollgateBuilder {
    fn default() -> Self {
        Self::new()
    }
}
