//! # Control Plane Configuration
//!
//! TOML-backed configuration for the control plane: router behavior,
//! failover bounds, health monitoring cadence, auto-scaling policy defaults,
//! retention, and the seed fleet (instances and provider groups) loaded at
//! startup.
//!
//! Every section has sensible defaults, so an empty file is a valid
//! configuration. `validate()` rejects the combinations the runtime cannot
//! honor (zero intervals, inverted thresholds, bad group bounds) before any
//! task starts. A handful of operational knobs can be overridden from the
//! environment without editing the file.

use crate::router::RoutingStrategy;
use anyhow::Context;
use fleetwise_core::models::{ProviderKind, RegisterInstance};
use fleetwise_core::{BreakerConfig, ProviderGroup};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for a control plane process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub router: RouterConfig,
    pub failover: FailoverConfig,
    pub health: HealthConfig,
    pub scaler: ScalerConfig,
    pub retention: RetentionConfig,
    pub breaker: BreakerSection,
    /// Instances registered at startup
    pub instances: Vec<RegisterInstance>,
    /// Provider groups created at startup
    pub groups: Vec<GroupConfig>,
}

/// Router behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// TTL of cached routing decisions, seconds
    pub cache_ttl_secs: u64,
    /// Soft deadline for query classification, milliseconds
    pub routing_timeout_ms: u64,
    /// Alternatives carried on each decision for failover
    pub max_alternatives: usize,
    /// Minimum health fraction (0-1) an instance needs to be a candidate
    pub min_health: f64,
    pub default_strategy: RoutingStrategy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            routing_timeout_ms: 100,
            max_alternatives: 3,
            min_health: 0.5,
            default_strategy: RoutingStrategy::Balanced,
        }
    }
}

impl RouterConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn routing_timeout(&self) -> Duration {
        Duration::from_millis(self.routing_timeout_ms)
    }
}

/// Failover executor bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub max_attempts: u32,
    /// Per-attempt upstream deadline, seconds
    pub attempt_timeout_secs: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout_secs: 30,
        }
    }
}

impl FailoverConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

/// Health monitoring cadence and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    /// Per-probe deadline, seconds
    pub timeout_secs: u64,
    /// Failing probes within the failure window before demotion
    pub max_failures: u32,
    pub failure_window_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 10,
            max_failures: 3,
            failure_window_secs: 600,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }
}

/// Auto-scaler cadence and performance thresholds. Per-group load thresholds
/// and cooldowns live on the group itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerConfig {
    pub evaluation_interval_secs: u64,
    pub metrics_window_secs: u64,
    /// Average response time that triggers performance-based scale-up, ms
    pub max_response_time_ms: f64,
    /// Error-rate fraction (0-1) that triggers performance-based scale-up
    pub max_error_rate: f64,
    pub health_based_scaling: bool,
    pub queue_based_scaling: bool,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_secs: 60,
            metrics_window_secs: 300,
            max_response_time_ms: 5000.0,
            max_error_rate: 0.1,
            health_based_scaling: true,
            queue_based_scaling: true,
        }
    }
}

impl ScalerConfig {
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval_secs)
    }

    pub fn metrics_window(&self) -> Duration {
        Duration::from_secs(self.metrics_window_secs)
    }
}

/// Retention horizon for durable event rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub days: i64,
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: 30,
            sweep_interval_secs: 3600,
        }
    }
}

impl RetentionConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Circuit breaker thresholds applied to every instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub timeout_secs: u64,
    pub success_threshold: u32,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_secs: 60,
            success_threshold: 3,
        }
    }
}

impl BreakerSection {
    pub fn to_breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            timeout: Duration::from_secs(self.timeout_secs),
            success_threshold: self.success_threshold,
        }
    }
}

/// Provider group as declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub id: i64,
    pub name: String,
    pub provider: ProviderKind,
    #[serde(default)]
    pub model_prefix: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "group_defaults::min_instances")]
    pub min_instances: u32,
    #[serde(default = "group_defaults::max_instances")]
    pub max_instances: u32,
    #[serde(default = "group_defaults::desired_instances")]
    pub desired_instances: u32,
    #[serde(default = "group_defaults::auto_scaling_enabled")]
    pub auto_scaling_enabled: bool,
    #[serde(default = "group_defaults::scale_up_threshold")]
    pub scale_up_threshold: f64,
    #[serde(default = "group_defaults::scale_down_threshold")]
    pub scale_down_threshold: f64,
    #[serde(default = "group_defaults::scale_up_cooldown_secs")]
    pub scale_up_cooldown_secs: u64,
    #[serde(default = "group_defaults::scale_down_cooldown_secs")]
    pub scale_down_cooldown_secs: u64,
    #[serde(default)]
    pub members: Vec<String>,
}

mod group_defaults {
    pub(super) fn min_instances() -> u32 {
        1
    }
    pub(super) fn max_instances() -> u32 {
        10
    }
    pub(super) fn desired_instances() -> u32 {
        2
    }
    pub(super) fn auto_scaling_enabled() -> bool {
        true
    }
    pub(super) fn scale_up_threshold() -> f64 {
        0.8
    }
    pub(super) fn scale_down_threshold() -> f64 {
        0.2
    }
    pub(super) fn scale_up_cooldown_secs() -> u64 {
        300
    }
    pub(super) fn scale_down_cooldown_secs() -> u64 {
        600
    }
}

impl GroupConfig {
    pub fn into_group(self, now: DateTime<Utc>) -> ProviderGroup {
        ProviderGroup {
            id: self.id,
            name: self.name,
            provider: self.provider,
            model_prefix: self.model_prefix,
            description: self.description,
            min_instances: self.min_instances,
            max_instances: self.max_instances,
            desired_instances: self.desired_instances,
            auto_scaling_enabled: self.auto_scaling_enabled,
            scale_up_threshold: self.scale_up_threshold,
            scale_down_threshold: self.scale_down_threshold,
            scale_up_cooldown_secs: self.scale_up_cooldown_secs,
            scale_down_cooldown_secs: self.scale_down_cooldown_secs,
            members: self.members,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

impl ControlPlaneConfig {
    /// Load from a TOML file, apply environment overrides, and validate.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading config file {}", path.as_ref().display()))?;
        let mut config: Self = toml::from_str(&raw).context("parsing config file")?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Operational knobs that may be overridden without editing the file.
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(days) = std::env::var("FLEETWISE_RETENTION_DAYS") {
            self.retention.days = days
                .parse()
                .context("FLEETWISE_RETENTION_DAYS must be an integer")?;
        }
        if let Ok(secs) = std::env::var("FLEETWISE_HEALTH_INTERVAL_SECS") {
            self.health.interval_secs = secs
                .parse()
                .context("FLEETWISE_HEALTH_INTERVAL_SECS must be an integer")?;
        }
        if let Ok(min_health) = std::env::var("FLEETWISE_MIN_HEALTH") {
            self.router.min_health = min_health
                .parse()
                .context("FLEETWISE_MIN_HEALTH must be a number")?;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.router.min_health < 0.0 || self.router.min_health > 1.0 {
            anyhow::bail!(
                "router.min_health must be within [0, 1], got {}",
                self.router.min_health
            );
        }
        if self.router.max_alternatives == 0 {
            anyhow::bail!("router.max_alternatives must be at least 1");
        }
        if self.failover.max_attempts == 0 {
            anyhow::bail!("failover.max_attempts must be at least 1");
        }
        if self.health.interval_secs == 0 {
            anyhow::bail!("health.interval_secs must be non-zero");
        }
        if self.health.max_failures == 0 {
            anyhow::bail!("health.max_failures must be at least 1");
        }
        if self.scaler.evaluation_interval_secs == 0 {
            anyhow::bail!("scaler.evaluation_interval_secs must be non-zero");
        }
        if self.scaler.max_error_rate < 0.0 || self.scaler.max_error_rate > 1.0 {
            anyhow::bail!(
                "scaler.max_error_rate must be within [0, 1], got {}",
                self.scaler.max_error_rate
            );
        }
        if self.retention.days <= 0 {
            anyhow::bail!("retention.days must be positive");
        }
        for group in &self.groups {
            if group.min_instances > group.max_instances {
                anyhow::bail!(
                    "group {}: min_instances {} exceeds max_instances {}",
                    group.name,
                    group.min_instances,
                    group.max_instances
                );
            }
            if group.desired_instances < group.min_instances
                || group.desired_instances > group.max_instances
            {
                anyhow::bail!(
                    "group {}: desired_instances {} outside [{}, {}]",
                    group.name,
                    group.desired_instances,
                    group.min_instances,
                    group.max_instances
                );
            }
            if group.scale_down_threshold >= group.scale_up_threshold {
                anyhow::bail!(
                    "group {}: scale_down_threshold must be below scale_up_threshold",
                    group.name
                );
            }
        }
        let mut ids: Vec<i64> = self.groups.iter().map(|g| g.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.groups.len() {
            anyhow::bail!("group ids must be unique");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let config: ControlPlaneConfig = toml::from_str("").unwrap();
        assert_eq!(config.router.cache_ttl_secs, 300);
        assert_eq!(config.router.routing_timeout_ms, 100);
        assert_eq!(config.failover.max_attempts, 3);
        assert_eq!(config.health.interval_secs, 30);
        assert_eq!(config.scaler.evaluation_interval_secs, 60);
        assert_eq!(config.retention.days, 30);
        config.validate().unwrap();
    }

    #[test]
    fn full_sections_parse() {
        let raw = r#"
            [router]
            cache_ttl_secs = 60
            min_health = 0.7
            default_strategy = "performance"

            [health]
            interval_secs = 10
            max_failures = 5

            [[groups]]
            id = 1
            name = "openai-pool"
            provider = "openai"
            model_prefix = "gpt"
            min_instances = 1
            max_instances = 4
            desired_instances = 2

            [[instances]]
            instance_id = "openai-1"
            provider = "openai"
            model = "gpt-4"
            name = "primary"
            endpoint_url = "https://api.openai.com/v1"
            credential_ref = "OPENAI_API_KEY"
        "#;
        let config: ControlPlaneConfig = toml::from_str(raw).unwrap();
        config.validate().unwrap();

        assert_eq!(config.router.cache_ttl_secs, 60);
        assert_eq!(
            config.router.default_strategy,
            RoutingStrategy::Performance
        );
        assert_eq!(config.groups.len(), 1);
        assert_eq!(config.groups[0].scale_up_threshold, 0.8);
        assert_eq!(config.instances.len(), 1);
        assert_eq!(config.instances[0].max_concurrent, 10);
    }

    #[test]
    fn validate_rejects_inverted_group_bounds() {
        let raw = r#"
            [[groups]]
            id = 1
            name = "bad"
            provider = "openai"
            min_instances = 5
            max_instances = 2
            desired_instances = 3
        "#;
        let config: ControlPlaneConfig = toml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_min_health() {
        let mut config = ControlPlaneConfig::default();
        config.router.min_health = 1.5;
        assert!(config.validate().is_err());
    }
}
