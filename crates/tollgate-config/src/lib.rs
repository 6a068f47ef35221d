//! Configuration management for Tollgate
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (TOLLGATE_* prefix, highest precedence)
//! 2. tollgate.local.toml (gitignored, local overrides)
//! 3. tollgate.toml (git-tracked, project config)
//! 4. ~/.config/tollgate/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)
//!
//! The project file also carries the domain definitions: `[catalog]` for
//! the permission catalog, `[[pattern]]` for detection rules and
//! `[[alert_config]]` for alert routing.

use serde::{Deserialize, Serialize};

use tollgate_alerts::AlertConfig;
use tollgate_entitlements::CatalogDef;
use tollgate_monitor::SecurityPattern;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main Tollgate configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TollgateConfig {
    pub project: ProjectConfig,
    pub resolver: ResolverConfig,
    pub monitor: MonitorConfig,
    pub alerts: AlertsConfig,
    pub sweeper: SweeperConfig,
    /// Permission catalog definition. Empty means the shipped default
    /// catalog.
    pub catalog: CatalogDef,
    /// Detection rules (`[[pattern]]`). Empty means the shipped defaults.
    #[serde(rename = "pattern")]
    pub patterns: Vec<SecurityPattern>,
    /// Alert routing rules (`[[alert_config]]`).
    #[serde(rename = "alert_config")]
    pub alert_configs: Vec<AlertConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub name: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: "tollgate-project".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Whether Admin-level grants skip usage metering.
    pub admin_override: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            admin_override: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Resolved events older than this are eligible for sweep eviction.
    pub event_retention_days: u32,
    /// Plausible travel speed for the geographic anomaly check.
    pub geo_travel_speed_kmh: f64,
    /// Gap between sightings above which travel is no longer suspicious.
    pub geo_threshold_hours: i64,
    /// Clean sightings before a new region becomes usual.
    pub geo_promotion_sightings: u32,
    /// IP blocks expire this long after they are placed.
    pub block_horizon_hours: i64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            event_retention_days: 7,
            geo_travel_speed_kmh: 500.0,
            geo_threshold_hours: 4,
            geo_promotion_sightings: 3,
            block_horizon_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Base for the linear webhook retry backoff (attempt x base).
    pub webhook_retry_base_ms: u64,
    /// Per-attempt delivery timeout applied when a channel does not set
    /// its own.
    pub channel_timeout_ms: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            webhook_retry_base_ms: 500,
            channel_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
        }
    }
}

impl TollgateConfig {
    /// Load configuration from default locations
    pub fn load() -> anyhow::Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from a specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }
}
