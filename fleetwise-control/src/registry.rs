//! # Instance Registry
//!
//! The authoritative model of fleet members. The registry owns the live
//! in-memory instance view, mirrors every mutation to the durable store, and
//! is the only component that writes instance records. It also owns the
//! per-instance circuit breakers (the router and the failover executor reach
//! them only through registry methods) and the live load gauges that carry
//! the admission signal.
//!
//! ## Write discipline
//!
//! Mutations take the per-instance lock, build the new record, write it to
//! the store, and only then commit it to the in-memory view. A store failure
//! therefore leaves the live view at its prior value. There is no
//! cross-instance transaction; a candidate snapshot is a point-in-time view
//! that may be stale by dispatch time.
//!
//! ## Load accounting
//!
//! `current_load` lives in an atomic gauge per instance. Dispatch goes
//! through [`InstanceRegistry::acquire_slot`], which rejects at capacity and
//! returns a [`LoadPermit`] whose drop decrements the gauge on every exit
//! path, panics included. Running hot (>= 80% of capacity outside the
//! five-minute scale cooldown) persists an advisory scale-up-check event for
//! the scaler to consume.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use fleetwise_core::models::{
    HealthEventStatus, Instance, InstanceFilter, InstanceStatus, Page, ProviderGroup,
    ProviderKind, RegisterInstance, RequestStatus, ScalingEvent, ScalingEventKind, ScalingTrigger,
};
use fleetwise_core::{BreakerConfig, BreakerSnapshot, CircuitBreaker, Clock, FleetError, Store};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Minimum gap between two scale-up hints for the same instance.
const SCALE_HINT_COOLDOWN_MINS: i64 = 5;
/// Load fraction at which an instance is considered to be running hot.
const SCALE_HINT_LOAD_FRACTION: f64 = 0.8;

/// RAII admission slot. Dropping the permit releases the load slot
/// synchronously, so the decrement survives errors, timeouts, and panics.
#[derive(Debug)]
pub struct LoadPermit {
    instance_id: String,
    gauge: Arc<AtomicU32>,
}

impl LoadPermit {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

impl Drop for LoadPermit {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Windowed metrics for one instance, assembled from store ranges.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceMetricsWindow {
    pub instance_id: String,
    pub window_secs: i64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub avg_response_ms: f64,
    pub probe_success_rate: f64,
    pub current_load: u32,
    pub max_concurrent: u32,
    pub is_healthy: bool,
    pub status: InstanceStatus,
    pub last_health_check: Option<DateTime<Utc>>,
}

/// Per-instance slice of the fleet utilization report.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceUtilization {
    pub instance_id: String,
    pub current_load: u32,
    pub max_concurrent: u32,
    pub utilization_pct: f64,
    pub is_healthy: bool,
}

/// Fleet-wide capacity utilization, for the admin surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UtilizationReport {
    pub total_capacity: u32,
    pub total_load: u32,
    pub overall_utilization_pct: f64,
    pub instances: Vec<InstanceUtilization>,
}

/// The registry itself; shared across the router, executor, monitor, and
/// scaler behind an `Arc`.
pub struct InstanceRegistry {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    breaker_config: BreakerConfig,
    instances: DashMap<String, Instance>,
    write_locks: DashMap<String, Arc<Mutex<()>>>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    live_loads: DashMap<String, Arc<AtomicU32>>,
    groups: DashMap<i64, ProviderGroup>,
}

impl InstanceRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        breaker_config: BreakerConfig,
    ) -> Self {
        Self {
            store,
            clock,
            breaker_config,
            instances: DashMap::new(),
            write_locks: DashMap::new(),
            breakers: DashMap::new(),
            live_loads: DashMap::new(),
            groups: DashMap::new(),
        }
    }

    fn write_lock(&self, instance_id: &str) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn gauge(&self, instance_id: &str) -> Arc<AtomicU32> {
        self.live_loads
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(AtomicU32::new(0)))
            .clone()
    }

    /// Circuit breaker for an instance, created on first use.
    pub fn breaker(&self, instance_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(instance_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    instance_id.to_string(),
                    self.breaker_config,
                ))
            })
            .clone()
    }

    /// Overlay the live load gauge onto a stored snapshot.
    fn with_live_load(&self, mut instance: Instance) -> Instance {
        instance.current_load = self.gauge(&instance.instance_id).load(Ordering::SeqCst);
        instance
    }

    /// Write an updated record to the store, committing to the live view
    /// only on success. The caller must hold the instance's write lock.
    async fn persist(&self, instance: Instance) -> Result<Instance, FleetError> {
        self.store.upsert_instance(&instance).await?;
        self.instances
            .insert(instance.instance_id.clone(), instance.clone());
        Ok(instance)
    }

    /// Register a new instance or update an existing one.
    ///
    /// A registration race on the same `instance_id` resolves as an update:
    /// identity, status, and rolling metrics survive, while endpoint,
    /// capacity, defaults, and metadata take the new values. A stopped
    /// instance is revived into `Starting`.
    pub async fn register(&self, req: RegisterInstance) -> Result<Instance, FleetError> {
        let lock = self.write_lock(&req.instance_id);
        let _guard = lock.lock().await;
        let now = self.clock.now();

        let instance = match self.instances.get(&req.instance_id).map(|e| e.value().clone()) {
            Some(mut existing) => {
                existing.provider = req.provider;
                existing.model = req.model;
                existing.name = req.name;
                existing.endpoint_url = req.endpoint_url;
                existing.credential_ref = req.credential_ref;
                existing.region = req.region;
                existing.version = req.version;
                existing.max_concurrent = req.max_concurrent;
                existing.max_tokens_per_minute = req.max_tokens_per_minute;
                existing.temperature = req.temperature;
                existing.max_tokens = req.max_tokens;
                existing.timeout_secs = req.timeout_secs;
                existing.priority = req.priority;
                existing.tags = req.tags;
                existing.metadata = req.metadata;
                existing.is_active = true;
                if existing.status == InstanceStatus::Stopped {
                    existing.status = InstanceStatus::Starting;
                    existing.is_healthy = false;
                }
                existing.updated_at = now;
                tracing::info!(instance_id = %existing.instance_id, "re-registered instance");
                existing
            }
            None => {
                let instance = req.into_instance(now);
                tracing::info!(
                    instance_id = %instance.instance_id,
                    provider = %instance.provider,
                    model = %instance.model,
                    "registered instance"
                );
                instance
            }
        };

        let committed = self.persist(instance).await?;
        self.breaker(&committed.instance_id);
        self.gauge(&committed.instance_id);
        Ok(committed)
    }

    /// Stop an instance: no new traffic, existing requests finish, history
    /// retained until the retention boundary.
    pub async fn deregister(&self, instance_id: &str) -> Result<(), FleetError> {
        let lock = self.write_lock(instance_id);
        let _guard = lock.lock().await;

        let mut instance = self
            .instances
            .get(instance_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| FleetError::NotFound(format!("instance {instance_id}")))?;
        instance.status = InstanceStatus::Stopped;
        instance.is_active = false;
        instance.updated_at = self.clock.now();

        self.persist(instance).await?;
        tracing::info!(instance_id, "deregistered instance");
        Ok(())
    }

    pub fn get(&self, instance_id: &str) -> Option<Instance> {
        self.instances
            .get(instance_id)
            .map(|e| self.with_live_load(e.value().clone()))
    }

    pub fn list(&self, filter: &InstanceFilter, page: Page) -> Vec<Instance> {
        let mut matching: Vec<Instance> = self
            .instances
            .iter()
            .map(|e| self.with_live_load(e.value().clone()))
            .filter(|i| filter.matches(i))
            .collect();
        matching.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        matching
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect()
    }

    /// Admission: claim one load slot. Rejects when the instance is at
    /// capacity rather than queueing.
    pub async fn acquire_slot(&self, instance_id: &str) -> Result<LoadPermit, FleetError> {
        let instance = self
            .instances
            .get(instance_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| FleetError::NotFound(format!("instance {instance_id}")))?;

        let gauge = self.gauge(instance_id);
        let max = instance.max_concurrent;
        let claimed = gauge.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |load| {
            if load < max {
                Some(load + 1)
            } else {
                None
            }
        });

        match claimed {
            Ok(prior) => {
                self.maybe_emit_scale_hint(&instance, prior + 1).await;
                Ok(LoadPermit {
                    instance_id: instance_id.to_string(),
                    gauge,
                })
            }
            Err(_) => Err(FleetError::NoCapacity(format!(
                "instance {instance_id} at capacity ({max})"
            ))),
        }
    }

    /// Admin form: pin the load gauge to an absolute value and persist it.
    pub async fn update_load(&self, instance_id: &str, load: u32) -> Result<(), FleetError> {
        let committed = {
            let lock = self.write_lock(instance_id);
            let _guard = lock.lock().await;

            let mut instance = self
                .instances
                .get(instance_id)
                .map(|e| e.value().clone())
                .ok_or_else(|| FleetError::NotFound(format!("instance {instance_id}")))?;

            self.gauge(instance_id).store(load, Ordering::SeqCst);
            instance.current_load = load;
            instance.updated_at = self.clock.now();
            self.persist(instance).await?
        };
        self.maybe_emit_scale_hint(&committed, load).await;
        Ok(())
    }

    /// Persist an advisory scale-up-check event when the instance runs hot.
    /// Advisory only: failures are logged, never surfaced to dispatch.
    async fn maybe_emit_scale_hint(&self, instance: &Instance, load: u32) {
        if f64::from(load) < SCALE_HINT_LOAD_FRACTION * f64::from(instance.max_concurrent) {
            return;
        }
        let now = self.clock.now();
        if let Some(last) = instance.last_scaled_at {
            if now - last <= ChronoDuration::minutes(SCALE_HINT_COOLDOWN_MINS) {
                return;
            }
        }
        let Some(group) = self
            .groups
            .iter()
            .find(|g| g.contains(instance))
            .map(|g| g.value().clone())
        else {
            return;
        };

        let event = ScalingEvent::new(
            group.id,
            ScalingEventKind::ScaleUpCheck,
            group.desired_instances,
            group.desired_instances,
            ScalingTrigger::HighLoad,
            f64::from(load),
            SCALE_HINT_LOAD_FRACTION * f64::from(instance.max_concurrent),
            now,
        );
        if let Err(e) = self.store.append_scaling_event(&event).await {
            tracing::warn!(instance_id = %instance.instance_id, error = %e, "failed to persist scale-up hint");
            return;
        }

        // Start the hint cooldown so a hot instance does not spam events.
        let lock = self.write_lock(&instance.instance_id);
        let _guard = lock.lock().await;
        if let Some(mut current) = self.instances.get(&instance.instance_id).map(|e| e.value().clone()) {
            current.last_scaled_at = Some(now);
            if let Err(e) = self.persist(current).await {
                tracing::warn!(instance_id = %instance.instance_id, error = %e, "failed to persist hint cooldown");
            }
        }
        tracing::info!(
            instance_id = %instance.instance_id,
            group_id = group.id,
            load,
            "scale-up check triggered"
        );
    }

    /// Report a request outcome: bump the lifetime counters and notify the
    /// instance's circuit breaker.
    pub async fn record_request_outcome(
        &self,
        instance_id: &str,
        success: bool,
    ) -> Result<(), FleetError> {
        let breaker = self.breaker(instance_id);
        if success {
            breaker.on_success();
        } else {
            breaker.on_failure();
        }

        let lock = self.write_lock(instance_id);
        let _guard = lock.lock().await;
        let mut instance = self
            .instances
            .get(instance_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| FleetError::NotFound(format!("instance {instance_id}")))?;
        instance.total_requests += 1;
        if success {
            instance.successful_requests += 1;
        } else {
            instance.failed_requests += 1;
        }
        instance.updated_at = self.clock.now();
        self.persist(instance).await?;
        Ok(())
    }

    /// Recompute the rolling averages from the last hour of health events:
    /// success percentage over all probes, mean response time over the
    /// probes that measured one.
    pub async fn update_rolling_metrics(&self, instance_id: &str) -> Result<(), FleetError> {
        let since = self.clock.now() - ChronoDuration::hours(1);
        let events = self.store.range_health_events(instance_id, since).await?;
        if events.is_empty() {
            return Ok(());
        }

        let healthy = events
            .iter()
            .filter(|e| e.status == HealthEventStatus::Healthy)
            .count();
        let success_rate = healthy as f64 / events.len() as f64 * 100.0;
        let measured: Vec<f64> = events.iter().filter_map(|e| e.response_ms).collect();
        let avg_response_ms = if measured.is_empty() {
            0.0
        } else {
            measured.iter().sum::<f64>() / measured.len() as f64
        };

        let lock = self.write_lock(instance_id);
        let _guard = lock.lock().await;
        let mut instance = self
            .instances
            .get(instance_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| FleetError::NotFound(format!("instance {instance_id}")))?;
        instance.success_rate = success_rate;
        if avg_response_ms > 0.0 {
            instance.avg_response_ms = avg_response_ms;
        }
        instance.updated_at = self.clock.now();
        self.persist(instance).await?;
        Ok(())
    }

    /// Fold a probe verdict into the instance. `demote` is set by the health
    /// monitor once the consecutive-failure threshold is crossed. Returns
    /// the status transition when one occurred.
    pub async fn apply_probe(
        &self,
        instance_id: &str,
        healthy: bool,
        demote: bool,
    ) -> Result<Option<(InstanceStatus, InstanceStatus)>, FleetError> {
        let lock = self.write_lock(instance_id);
        let _guard = lock.lock().await;
        let now = self.clock.now();

        let mut instance = self
            .instances
            .get(instance_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| FleetError::NotFound(format!("instance {instance_id}")))?;
        let old_status = instance.status;

        instance.is_healthy = healthy;
        instance.last_health_check = Some(now);
        if healthy {
            instance.last_success = Some(now);
            if matches!(
                instance.status,
                InstanceStatus::Starting | InstanceStatus::Unhealthy | InstanceStatus::Error
            ) {
                instance.status = InstanceStatus::Healthy;
            }
        } else if demote && instance.status != InstanceStatus::Unhealthy {
            instance.status = InstanceStatus::Unhealthy;
        }
        instance.updated_at = now;

        let committed = self.persist(instance).await?;
        if committed.status != old_status {
            Ok(Some((old_status, committed.status)))
        } else {
            Ok(None)
        }
    }

    /// Candidate set for routing: active, routable status, healthy enough,
    /// spare capacity, and an admitting circuit breaker. Sorted by id so the
    /// snapshot order is deterministic.
    pub fn candidates(
        &self,
        provider: Option<ProviderKind>,
        model: Option<&str>,
        min_health: f64,
    ) -> Vec<Instance> {
        let mut matching: Vec<Instance> = self
            .instances
            .iter()
            .map(|e| self.with_live_load(e.value().clone()))
            .filter(|i| {
                i.is_active
                    && matches!(i.status, InstanceStatus::Healthy | InstanceStatus::Starting)
                    && provider.map(|p| i.provider == p).unwrap_or(true)
                    && model.map(|m| i.model == m).unwrap_or(true)
                    && i.success_rate >= min_health * 100.0
                    && i.has_capacity()
                    && self.breaker(&i.instance_id).available()
            })
            .collect();
        matching.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        matching
    }

    pub fn reset_breaker(&self, instance_id: &str) {
        self.breaker(instance_id).reset();
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> =
            self.breakers.iter().map(|e| e.snapshot()).collect();
        snapshots.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        snapshots
    }

    // Provider groups are registry-owned: config-seeded, admin-mutable;
    // only their scaling events are durable.

    pub fn upsert_group(&self, group: ProviderGroup) {
        self.groups.insert(group.id, group);
    }

    pub fn get_group(&self, group_id: i64) -> Option<ProviderGroup> {
        self.groups.get(&group_id).map(|e| e.value().clone())
    }

    pub fn list_groups(&self) -> Vec<ProviderGroup> {
        let mut groups: Vec<ProviderGroup> = self.groups.iter().map(|e| e.value().clone()).collect();
        groups.sort_by_key(|g| g.id);
        groups
    }

    /// Active members of a group, by the group's membership rule.
    pub fn group_instances(&self, group: &ProviderGroup) -> Vec<Instance> {
        let mut members: Vec<Instance> = self
            .instances
            .iter()
            .map(|e| self.with_live_load(e.value().clone()))
            .filter(|i| i.is_active && group.contains(i))
            .collect();
        members.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        members
    }

    pub fn set_group_desired(&self, group_id: i64, desired: u32) -> Result<(), FleetError> {
        let mut group = self
            .groups
            .get_mut(&group_id)
            .ok_or_else(|| FleetError::NotFound(format!("group {group_id}")))?;
        group.desired_instances = desired;
        group.updated_at = self.clock.now();
        Ok(())
    }

    /// Live capacity utilization across the active fleet.
    pub fn utilization_report(&self) -> UtilizationReport {
        let mut instances: Vec<InstanceUtilization> = self
            .instances
            .iter()
            .map(|e| self.with_live_load(e.value().clone()))
            .filter(|i| i.is_active)
            .map(|i| InstanceUtilization {
                utilization_pct: i.load_ratio() * 100.0,
                instance_id: i.instance_id,
                current_load: i.current_load,
                max_concurrent: i.max_concurrent,
                is_healthy: i.is_healthy,
            })
            .collect();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        let total_capacity: u32 = instances.iter().map(|i| i.max_concurrent).sum();
        let total_load: u32 = instances.iter().map(|i| i.current_load).sum();
        UtilizationReport {
            total_capacity,
            total_load,
            overall_utilization_pct: if total_capacity > 0 {
                f64::from(total_load) / f64::from(total_capacity) * 100.0
            } else {
                0.0
            },
            instances,
        }
    }

    /// Windowed per-instance metrics for the admin surface.
    pub async fn instance_metrics(
        &self,
        instance_id: &str,
        window: std::time::Duration,
    ) -> Result<InstanceMetricsWindow, FleetError> {
        let instance = self
            .get(instance_id)
            .ok_or_else(|| FleetError::NotFound(format!("instance {instance_id}")))?;
        let since = self.clock.now()
            - ChronoDuration::from_std(window)
                .map_err(|e| FleetError::Internal(format!("window out of range: {e}")))?;

        let logs = self.store.range_request_logs(instance_id, since).await?;
        let events = self.store.range_health_events(instance_id, since).await?;

        let total = logs.len() as u64;
        let successful = logs
            .iter()
            .filter(|l| l.status == RequestStatus::Success)
            .count() as u64;
        let failed = logs
            .iter()
            .filter(|l| matches!(l.status, RequestStatus::Error | RequestStatus::Timeout))
            .count() as u64;
        let success_rate = if total > 0 {
            successful as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        let measured: Vec<f64> = logs.iter().filter_map(|l| l.response_ms).collect();
        let avg_response_ms = if measured.is_empty() {
            0.0
        } else {
            measured.iter().sum::<f64>() / measured.len() as f64
        };
        let probe_success_rate = if events.is_empty() {
            0.0
        } else {
            events
                .iter()
                .filter(|e| e.status == HealthEventStatus::Healthy)
                .count() as f64
                / events.len() as f64
                * 100.0
        };

        Ok(InstanceMetricsWindow {
            instance_id: instance_id.to_string(),
            window_secs: (self.clock.now() - since).num_seconds(),
            total_requests: total,
            successful_requests: successful,
            failed_requests: failed,
            success_rate,
            avg_response_ms,
            probe_success_rate,
            current_load: instance.current_load,
            max_concurrent: instance.max_concurrent,
            is_healthy: instance.is_healthy,
            status: instance.status,
            last_health_check: instance.last_health_check,
        })
    }
}
