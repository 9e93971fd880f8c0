//! # Health Monitor
//!
//! Runs one cooperative loop per monitored instance. Each tick selects the
//! probe kinds that are due, drives them through the [`Prober`] under a
//! deadline, appends the durable health events, and folds the verdicts into
//! the instance record via the registry.
//!
//! ## Probe schedule
//!
//! - **Basic** every tick
//! - **Latency** when two minutes have passed since the last latency probe
//! - **Comprehensive** when five minutes have passed
//! - **Load** whenever the instance is above 70% of its capacity
//!
//! ## Transitions
//!
//! The first passing probe after `Starting` or `Unhealthy` promotes the
//! instance to `Healthy`. Once the failing probes within the failure window
//! reach `max_failures`, the instance is demoted to `Unhealthy`. Both
//! transitions are logged; probe failures never reach the request path.

use crate::config::HealthConfig;
use crate::registry::InstanceRegistry;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use fleetwise_core::invoker::{ProbeResult, Prober};
use fleetwise_core::models::{
    CheckKind, HealthEvent, HealthEventStatus, Instance, InstanceStatus,
};
use fleetwise_core::{Clock, FleetError, Store};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const LATENCY_PROBE_EVERY: i64 = 2 * 60;
const COMPREHENSIVE_PROBE_EVERY: i64 = 5 * 60;
const LOAD_PROBE_THRESHOLD: f64 = 0.7;

/// Reported health level, coarser than the instance status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Assembled per-instance health view for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub instance_id: String,
    pub level: HealthLevel,
    pub score: f64,
    pub issues: Vec<String>,
    pub last_check: Option<DateTime<Utc>>,
}

/// Fleet-wide health summary.
#[derive(Debug, Clone, Serialize)]
pub struct FleetHealthSummary {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub unhealthy_instances: usize,
    pub monitored_instances: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct ProbeSchedule {
    last_latency: Option<DateTime<Utc>>,
    last_comprehensive: Option<DateTime<Utc>>,
}

pub struct HealthMonitor {
    registry: Arc<InstanceRegistry>,
    store: Arc<dyn Store>,
    prober: Arc<dyn Prober>,
    clock: Arc<dyn Clock>,
    config: HealthConfig,
    tasks: DashMap<String, JoinHandle<()>>,
    schedules: DashMap<String, ProbeSchedule>,
    shutdown: watch::Sender<bool>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        store: Arc<dyn Store>,
        prober: Arc<dyn Prober>,
        clock: Arc<dyn Clock>,
        config: HealthConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            registry,
            store,
            prober,
            clock,
            config,
            tasks: DashMap::new(),
            schedules: DashMap::new(),
            shutdown,
        }
    }

    /// Start a monitor loop for every active instance.
    pub fn start(self: &Arc<Self>) {
        for instance in self.registry.list(&Default::default(), fleetwise_core::Page {
            offset: 0,
            limit: usize::MAX,
        }) {
            if instance.is_active {
                self.start_instance(&instance.instance_id);
            }
        }
    }

    /// Start (or keep) the monitor loop for one instance.
    pub fn start_instance(self: &Arc<Self>, instance_id: &str) {
        if self.tasks.contains_key(instance_id) {
            return;
        }
        let monitor = Arc::clone(self);
        let id = instance_id.to_string();
        let handle = tokio::spawn(async move {
            monitor.monitor_loop(&id).await;
        });
        self.tasks.insert(instance_id.to_string(), handle);
        tracing::info!(instance_id, "started health monitoring");
    }

    pub fn stop_instance(&self, instance_id: &str) {
        if let Some((_, handle)) = self.tasks.remove(instance_id) {
            handle.abort();
            tracing::info!(instance_id, "stopped health monitoring");
        }
    }

    /// Signal every loop to wind down, wait out the grace period, then
    /// abort whatever is still running.
    pub async fn stop(&self, grace: Duration) {
        let _ = self.shutdown.send(true);
        self.clock.sleep(grace).await;
        for entry in self.tasks.iter() {
            entry.value().abort();
        }
        self.tasks.clear();
        tracing::info!("health monitoring stopped");
    }

    pub fn monitored_instances(&self) -> usize {
        self.tasks.len()
    }

    async fn monitor_loop(self: Arc<Self>, instance_id: &str) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            let Some(instance) = self.registry.get(instance_id) else {
                break;
            };
            if !instance.is_active || instance.status == InstanceStatus::Stopped {
                tracing::info!(instance_id, "instance no longer active, ending monitor loop");
                break;
            }
            if instance.status == InstanceStatus::Maintenance {
                // Maintenance pauses probing; look again at a slower cadence.
                self.clock.sleep(self.config.interval() * 2).await;
                continue;
            }

            self.run_due_checks(instance_id).await;
            self.clock.sleep(self.config.interval()).await;
        }
        self.tasks.remove(instance_id);
    }

    /// Run every probe kind currently due for the instance.
    pub async fn run_due_checks(&self, instance_id: &str) {
        let Some(instance) = self.registry.get(instance_id) else {
            return;
        };
        for kind in self.due_checks(&instance) {
            if let Err(e) = self.run_check(instance_id, kind).await {
                tracing::error!(instance_id, check = %kind, error = %e, "health check errored");
            }
        }
    }

    fn due_checks(&self, instance: &Instance) -> Vec<CheckKind> {
        let now = self.clock.now();
        let schedule = self
            .schedules
            .get(&instance.instance_id)
            .map(|s| *s)
            .unwrap_or_default();

        let mut checks = vec![CheckKind::Basic];
        let due = |last: Option<DateTime<Utc>>, every_secs: i64| {
            last.map(|at| now - at >= ChronoDuration::seconds(every_secs))
                .unwrap_or(true)
        };
        if due(schedule.last_latency, LATENCY_PROBE_EVERY) {
            checks.push(CheckKind::Latency);
        }
        if due(schedule.last_comprehensive, COMPREHENSIVE_PROBE_EVERY) {
            checks.push(CheckKind::Comprehensive);
        }
        if instance.max_concurrent > 0
            && f64::from(instance.current_load)
                > LOAD_PROBE_THRESHOLD * f64::from(instance.max_concurrent)
        {
            checks.push(CheckKind::Load);
        }
        checks
    }

    /// Run one probe of the given kind, record the event, and fold the
    /// verdict into the instance. Also the ad-hoc admin check.
    pub async fn run_check(
        &self,
        instance_id: &str,
        kind: CheckKind,
    ) -> Result<ProbeResult, FleetError> {
        let instance = self
            .registry
            .get(instance_id)
            .ok_or_else(|| FleetError::NotFound(format!("instance {instance_id}")))?;

        let result = match tokio::time::timeout(
            self.config.probe_timeout(),
            self.prober.probe(&instance, kind),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => ProbeResult {
                ok: false,
                response_ms: self.config.probe_timeout().as_secs_f64() * 1000.0,
                score: 0.0,
                detail: "probe timed out".to_string(),
            },
        };

        let now = self.clock.now();
        let timed_out = result.detail == "probe timed out";
        let event = HealthEvent {
            instance_id: instance_id.to_string(),
            status: if result.ok {
                HealthEventStatus::Healthy
            } else if timed_out {
                HealthEventStatus::Error
            } else {
                HealthEventStatus::Unhealthy
            },
            response_ms: Some(result.response_ms),
            error: (!result.ok).then(|| result.detail.clone()),
            check_kind: kind,
            score: result.score,
            created_at: now,
        };
        self.store.append_health_event(&event).await?;

        match kind {
            CheckKind::Latency => {
                self.schedules
                    .entry(instance_id.to_string())
                    .or_default()
                    .last_latency = Some(now);
            }
            CheckKind::Comprehensive => {
                self.schedules
                    .entry(instance_id.to_string())
                    .or_default()
                    .last_comprehensive = Some(now);
            }
            _ => {}
        }

        let demote = if result.ok {
            false
        } else {
            let since = now - ChronoDuration::from_std(self.config.failure_window())
                .map_err(|e| FleetError::Internal(format!("failure window: {e}")))?;
            let recent_failures = self
                .store
                .range_health_events(instance_id, since)
                .await?
                .iter()
                .filter(|e| e.status != HealthEventStatus::Healthy)
                .count() as u32;
            recent_failures >= self.config.max_failures
        };

        if let Some((from, to)) = self.registry.apply_probe(instance_id, result.ok, demote).await? {
            match to {
                InstanceStatus::Healthy => {
                    tracing::info!(instance_id, ?from, "instance recovered and is now healthy");
                }
                InstanceStatus::Unhealthy => {
                    tracing::error!(
                        instance_id,
                        ?from,
                        max_failures = self.config.max_failures,
                        "instance demoted after consecutive probe failures"
                    );
                }
                _ => {}
            }
        }

        self.registry.update_rolling_metrics(instance_id).await?;

        tracing::debug!(
            instance_id,
            check = %kind,
            ok = result.ok,
            score = result.score,
            "health check completed"
        );
        Ok(result)
    }

    /// Assemble the admin-facing health report for one instance.
    pub fn health_report(&self, instance_id: &str) -> Option<HealthReport> {
        let instance = self.registry.get(instance_id)?;
        let score = instance.success_rate;

        let mut issues = Vec::new();
        if !instance.is_healthy {
            issues.push("instance marked as unhealthy".to_string());
        }
        if instance.success_rate < 80.0 {
            issues.push(format!("low success rate: {:.1}%", instance.success_rate));
        }
        if instance.avg_response_ms > 5000.0 {
            issues.push(format!(
                "high response time: {:.0}ms",
                instance.avg_response_ms
            ));
        }

        let level = if instance.is_healthy && score >= 80.0 {
            HealthLevel::Healthy
        } else if instance.is_healthy && score >= 60.0 {
            HealthLevel::Degraded
        } else {
            HealthLevel::Unhealthy
        };

        Some(HealthReport {
            instance_id: instance_id.to_string(),
            level,
            score,
            issues,
            last_check: instance.last_health_check,
        })
    }

    pub fn fleet_summary(&self) -> FleetHealthSummary {
        let instances = self.registry.list(
            &Default::default(),
            fleetwise_core::Page {
                offset: 0,
                limit: usize::MAX,
            },
        );
        let active: Vec<_> = instances.iter().filter(|i| i.is_active).collect();
        FleetHealthSummary {
            total_instances: active.len(),
            healthy_instances: active.iter().filter(|i| i.is_healthy).count(),
            unhealthy_instances: active.iter().filter(|i| !i.is_healthy).count(),
            monitored_instances: self.tasks.len(),
        }
    }
}
