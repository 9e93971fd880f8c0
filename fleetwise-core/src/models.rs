//! # Fleet Domain Records
//!
//! This module defines the core data structures shared by every part of the
//! control plane: the instance record with its capacity and rolling metrics,
//! provider groups with their scaling policy, and the append-only event rows
//! (health events, request logs, scaling events) that the store persists.
//!
//! ## Overview
//!
//! - **Instance**: one upstream model endpoint with identity, capacity,
//!   health, and rolling performance metrics
//! - **ProviderGroup**: a logical pool of instances sharing a scaling policy
//! - **HealthEvent**: the durable outcome of a single probe
//! - **RequestLog**: the durable outcome of a single routed request
//! - **ScalingEvent**: an auditable scaling decision and its lifecycle
//!
//! The registry is the only writer of live `Instance` records; everything
//! else reads snapshots through registry accessors. Event rows are
//! append-only and scanned for rolling metrics and scaling signals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Upstream AI provider identifier.
///
/// Providers are treated uniformly by the core; per-provider request shaping
/// lives in the invoker adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI or any OpenAI-compatible endpoint
    OpenAi,
    /// Anthropic messages API
    Anthropic,
    /// Zhipu AI (GLM family)
    Zai,
    /// Perplexity online models
    Perplexity,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Zai => "zai",
            ProviderKind::Perplexity => "perplexity",
        };
        f.write_str(s)
    }
}

/// Lifecycle status of an instance.
///
/// New registrations land in `Starting` and are promoted to `Healthy` by the
/// first passing probe. `Maintenance` is admin-only and excluded from
/// selection. `Stopped` instances take no new traffic but keep their history
/// until the retention sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Healthy,
    Unhealthy,
    Maintenance,
    Stopped,
    Error,
    Scaling,
}

/// One upstream model endpoint with identity, capacity, and rolling metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    /// Unique identifier, stable across re-registration
    pub instance_id: String,
    pub provider: ProviderKind,
    /// Model served by this endpoint (e.g. "gpt-4", "glm-4")
    pub model: String,
    /// Human-readable name
    pub name: String,
    /// Base URL of the endpoint
    pub endpoint_url: String,
    /// Name of the environment variable holding the credential; never the
    /// credential itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    // Status and health
    pub status: InstanceStatus,
    /// Admin toggle; inactive instances are never selected or monitored
    pub is_active: bool,
    /// Monitor-derived verdict, valid within the probe interval plus grace
    pub is_healthy: bool,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,

    // Rolling metrics over the metrics window
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Mean response time in milliseconds over the rolling window
    pub avg_response_ms: f64,
    /// Success percentage (0-100) over the rolling window; 0 when no data
    pub success_rate: f64,

    // Capacity
    pub max_concurrent: u32,
    pub current_load: u32,
    pub max_tokens_per_minute: u32,
    pub current_tokens_per_minute: u32,

    // Request defaults
    pub temperature: f32,
    pub max_tokens: u32,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,

    /// Higher priority wins ties in weighted selection
    pub priority: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_scaled_at: Option<DateTime<Utc>>,
}

impl Instance {
    /// Fraction of capacity in use, in `[0, 1]`. Zero-capacity instances
    /// report full load so they are never preferred.
    pub fn load_ratio(&self) -> f64 {
        if self.max_concurrent == 0 {
            1.0
        } else {
            f64::from(self.current_load) / f64::from(self.max_concurrent)
        }
    }

    /// Whether a dispatch decision may place another request here.
    pub fn has_capacity(&self) -> bool {
        self.current_load < self.max_concurrent
    }

    /// Whether the instance may be offered to the selector at all.
    pub fn is_selectable(&self) -> bool {
        self.is_active
            && self.status != InstanceStatus::Maintenance
            && self.status != InstanceStatus::Stopped
    }
}

/// Registration request for a new or re-registered instance.
///
/// A second registration under an existing `instance_id` is treated as an
/// update; identity and history are preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterInstance {
    pub instance_id: String,
    pub provider: ProviderKind,
    pub model: String,
    pub name: String,
    pub endpoint_url: String,
    #[serde(default)]
    pub credential_ref: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default = "defaults::max_tokens_per_minute")]
    pub max_tokens_per_minute: u32,
    #[serde(default = "defaults::temperature")]
    pub temperature: f32,
    #[serde(default = "defaults::max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "defaults::timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "defaults::priority")]
    pub priority: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

mod defaults {
    pub(super) fn max_concurrent() -> u32 {
        10
    }
    pub(super) fn max_tokens_per_minute() -> u32 {
        10_000
    }
    pub(super) fn temperature() -> f32 {
        0.7
    }
    pub(super) fn max_tokens() -> u32 {
        1000
    }
    pub(super) fn timeout_secs() -> u64 {
        30
    }
    pub(super) fn priority() -> u32 {
        1
    }
}

impl RegisterInstance {
    /// Materialize a fresh instance record at `now`. New instances start in
    /// `Starting` and are considered unhealthy until the first passing probe.
    pub fn into_instance(self, now: DateTime<Utc>) -> Instance {
        Instance {
            instance_id: self.instance_id,
            provider: self.provider,
            model: self.model,
            name: self.name,
            endpoint_url: self.endpoint_url,
            credential_ref: self.credential_ref,
            region: self.region,
            version: self.version,
            status: InstanceStatus::Starting,
            is_active: true,
            is_healthy: false,
            last_health_check: None,
            last_success: None,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            avg_response_ms: 0.0,
            success_rate: 0.0,
            max_concurrent: self.max_concurrent,
            current_load: 0,
            max_tokens_per_minute: self.max_tokens_per_minute,
            current_tokens_per_minute: 0,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            timeout_secs: self.timeout_secs,
            priority: self.priority,
            tags: self.tags,
            metadata: self.metadata,
            created_at: now,
            updated_at: now,
            last_scaled_at: None,
        }
    }
}

/// Filter for instance listings. All fields are conjunctive; `None` matches
/// everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceFilter {
    pub provider: Option<ProviderKind>,
    pub model: Option<String>,
    pub status: Option<InstanceStatus>,
    pub is_active: Option<bool>,
    pub is_healthy: Option<bool>,
}

impl InstanceFilter {
    pub fn matches(&self, instance: &Instance) -> bool {
        if let Some(provider) = self.provider {
            if instance.provider != provider {
                return false;
            }
        }
        if let Some(model) = &self.model {
            if &instance.model != model {
                return false;
            }
        }
        if let Some(status) = self.status {
            if instance.status != status {
                return false;
            }
        }
        if let Some(is_active) = self.is_active {
            if instance.is_active != is_active {
                return false;
            }
        }
        if let Some(is_healthy) = self.is_healthy {
            if instance.is_healthy != is_healthy {
                return false;
            }
        }
        true
    }
}

/// Pagination window for listings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// A logical pool of instances for one provider (optionally narrowed to a
/// model family) sharing a scaling policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderGroup {
    pub id: i64,
    pub name: String,
    pub provider: ProviderKind,
    /// When set, only instances whose model starts with this prefix belong
    /// to the group
    #[serde(default)]
    pub model_prefix: Option<String>,
    #[serde(default)]
    pub description: Option<String>,

    pub min_instances: u32,
    pub max_instances: u32,
    pub desired_instances: u32,

    pub auto_scaling_enabled: bool,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub scale_up_cooldown_secs: u64,
    pub scale_down_cooldown_secs: u64,

    /// Explicit membership override; when empty, membership is derived from
    /// provider and model prefix
    #[serde(default)]
    pub members: Vec<String>,

    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProviderGroup {
    /// Whether an instance belongs to this group, honoring the explicit
    /// member list when present.
    pub fn contains(&self, instance: &Instance) -> bool {
        if !self.members.is_empty() {
            return self.members.iter().any(|id| id == &instance.instance_id);
        }
        if instance.provider != self.provider {
            return false;
        }
        match &self.model_prefix {
            Some(prefix) => instance.model.starts_with(prefix.as_str()),
            None => true,
        }
    }

    /// Policy sanity: `min <= desired <= max`.
    pub fn bounds_valid(&self) -> bool {
        self.min_instances <= self.desired_instances
            && self.desired_instances <= self.max_instances
    }
}

/// Kind of synthetic check a probe ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    /// Connectivity and a trivial response
    Basic,
    /// Three rapid probes scored by average latency
    Latency,
    /// Concurrent probes while the instance is under load
    Load,
    /// Basic plus reasoning and short-response prompts
    Comprehensive,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckKind::Basic => "basic",
            CheckKind::Latency => "latency",
            CheckKind::Load => "load",
            CheckKind::Comprehensive => "comprehensive",
        };
        f.write_str(s)
    }
}

/// Outcome status recorded on a health event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthEventStatus {
    Healthy,
    Unhealthy,
    Error,
}

/// Durable outcome of a single probe. Append-only; scanned for rolling
/// success rate and the consecutive-failure count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEvent {
    pub instance_id: String,
    pub status: HealthEventStatus,
    pub response_ms: Option<f64>,
    pub error: Option<String>,
    pub check_kind: CheckKind,
    /// Health score in `[0, 100]`
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

/// Terminal status of a routed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Routed but not yet completed
    Routed,
    Success,
    Error,
    Timeout,
    /// No instance could be selected at all
    RoutingFailed,
}

/// Durable outcome of a single routed request. Append-only; scanned for
/// per-instance rolling metrics and group-level scaling signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLog {
    pub request_id: Uuid,
    pub instance_id: String,
    pub provider: ProviderKind,
    pub model: String,
    pub status: RequestStatus,
    pub response_ms: Option<f64>,
    pub queue_ms: Option<f64>,
    pub tokens_used: Option<u32>,
    pub error: Option<String>,
    pub was_failover: bool,
    pub original_instance_id: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Direction or advisory kind of a scaling event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingEventKind {
    ScaleUp,
    ScaleDown,
    /// Advisory hint emitted by the registry when an instance runs hot;
    /// consumed by the scaler, never a decision by itself
    ScaleUpCheck,
}

/// What tripped a scaling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingTrigger {
    HighLoad,
    LowLoad,
    HighErrorRate,
    HighResponseTime,
    QueueBacklog,
    HealthIssues,
    Manual,
    Scheduled,
}

/// Lifecycle status of a scaling event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingEventStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Auditable record of a decision to add or remove instances from a group.
/// The most recent `Completed` event per direction drives cooldown checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub id: Uuid,
    pub group_id: i64,
    pub kind: ScalingEventKind,
    pub old_replicas: u32,
    pub new_replicas: u32,
    pub trigger: ScalingTrigger,
    pub metric_value: f64,
    pub threshold: f64,
    pub status: ScalingEventStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScalingEvent {
    pub fn new(
        group_id: i64,
        kind: ScalingEventKind,
        old_replicas: u32,
        new_replicas: u32,
        trigger: ScalingTrigger,
        metric_value: f64,
        threshold: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id,
            kind,
            old_replicas,
            new_replicas,
            trigger,
            metric_value,
            threshold,
            status: ScalingEventStatus::Pending,
            error: None,
            started_at: now,
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str) -> Instance {
        RegisterInstance {
            instance_id: id.to_string(),
            provider: ProviderKind::OpenAi,
            model: "gpt-4".to_string(),
            name: format!("test-{id}"),
            endpoint_url: "https://api.example.com/v1".to_string(),
            credential_ref: None,
            region: None,
            version: None,
            max_concurrent: 10,
            max_tokens_per_minute: 10_000,
            temperature: 0.7,
            max_tokens: 1000,
            timeout_secs: 30,
            priority: 1,
            tags: vec![],
            metadata: HashMap::new(),
        }
        .into_instance(Utc::now())
    }

    #[test]
    fn new_registrations_start_inactive_in_health_terms() {
        let inst = instance("a");
        assert_eq!(inst.status, InstanceStatus::Starting);
        assert!(inst.is_active);
        assert!(!inst.is_healthy);
        assert_eq!(inst.current_load, 0);
    }

    #[test]
    fn load_ratio_saturates_on_zero_capacity() {
        let mut inst = instance("a");
        inst.max_concurrent = 0;
        assert_eq!(inst.load_ratio(), 1.0);
        inst.max_concurrent = 10;
        inst.current_load = 5;
        assert!((inst.load_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn filter_is_conjunctive() {
        let mut inst = instance("a");
        inst.is_healthy = true;
        let filter = InstanceFilter {
            provider: Some(ProviderKind::OpenAi),
            is_healthy: Some(true),
            ..Default::default()
        };
        assert!(filter.matches(&inst));

        let filter = InstanceFilter {
            provider: Some(ProviderKind::Anthropic),
            is_healthy: Some(true),
            ..Default::default()
        };
        assert!(!filter.matches(&inst));
    }

    #[test]
    fn group_membership_prefers_explicit_members() {
        let inst = instance("a");
        let mut group = ProviderGroup {
            id: 1,
            name: "openai-pool".to_string(),
            provider: ProviderKind::OpenAi,
            model_prefix: Some("gpt".to_string()),
            description: None,
            min_instances: 1,
            max_instances: 4,
            desired_instances: 2,
            auto_scaling_enabled: true,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            scale_up_cooldown_secs: 300,
            scale_down_cooldown_secs: 600,
            members: vec![],
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(group.contains(&inst));

        group.members = vec!["b".to_string()];
        assert!(!group.contains(&inst));
        group.members = vec!["a".to_string()];
        assert!(group.contains(&inst));
    }
}
