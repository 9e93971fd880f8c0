//! # Auto-Scaler
//!
//! One cooperative evaluation loop per enabled provider group. Each tick
//! resolves the group's active members, collects rolling signals from the
//! store, gates each direction on its cooldown, evaluates the candidate
//! decisions independently, reconciles them, and executes the winner as an
//! auditable scaling event.
//!
//! ## Candidate evaluators
//!
//! - **Load**: scale up past the group's load threshold, down below the
//!   low-water mark while above the minimum
//! - **Performance**: scale up on high average response time or error rate
//! - **Health**: scale up when the mean health score drops below 70
//! - **Queue**: scale up proportionally to the derived backlog
//!
//! Scale-up outranks scale-down; among same-direction candidates the
//! highest confidence wins; targets are always clamped to the group's
//! bounds. Scaling events for one group are serialized by its loop, so the
//! cooldown lookups are consistent.

use crate::config::ScalerConfig;
use crate::health::HealthMonitor;
use crate::registry::InstanceRegistry;
use chrono::Duration as ChronoDuration;
use dashmap::DashMap;
use fleetwise_core::models::{
    Instance, ProviderGroup, RegisterInstance, RequestStatus, ScalingEvent, ScalingEventKind,
    ScalingEventStatus, ScalingTrigger,
};
use fleetwise_core::{Clock, FleetError, Store};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

const LOW_HEALTH_SCORE: f64 = 70.0;
const QUEUE_BACKLOG_THRESHOLD: u32 = 10;
/// Capacity fraction above which an instance contributes to the derived
/// queue length.
const QUEUE_CAPACITY_FRACTION: f64 = 0.8;

/// Scaling activity over a lookback window, for the admin surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScalingSummary {
    pub total_events: usize,
    pub scale_up_events: usize,
    pub scale_down_events: usize,
    pub completed_events: usize,
    pub failed_events: usize,
    pub success_rate: f64,
    pub active_groups: usize,
}

/// Rolling signals for one group over the metrics window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScalingSignals {
    pub avg_load: f64,
    pub max_load: f64,
    pub avg_response_ms: f64,
    pub p95_response_ms: f64,
    pub error_rate: f64,
    pub success_rate: f64,
    pub queue_length: u32,
    pub requests_per_min: f64,
    pub mean_health_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone)]
struct Candidate {
    direction: Direction,
    trigger: ScalingTrigger,
    target: u32,
    confidence: f64,
    metric_value: f64,
    threshold: f64,
    recommendation: String,
}

pub struct AutoScaler {
    registry: Arc<InstanceRegistry>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: ScalerConfig,
    monitor: Option<Arc<HealthMonitor>>,
    tasks: DashMap<i64, JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl AutoScaler {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        config: ScalerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            registry,
            store,
            clock,
            config,
            monitor: None,
            tasks: DashMap::new(),
            shutdown,
        }
    }

    /// Wire the health monitor so instances added or removed by scaling
    /// have their monitor loops started and stopped.
    pub fn with_monitor(mut self, monitor: Arc<HealthMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Start an evaluation loop for every enabled group.
    pub fn start(self: &Arc<Self>) {
        for group in self.registry.list_groups() {
            if group.is_active && group.auto_scaling_enabled {
                self.start_group(group.id);
            }
        }
    }

    pub fn start_group(self: &Arc<Self>, group_id: i64) {
        if self.tasks.contains_key(&group_id) {
            return;
        }
        let scaler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            scaler.run_loop(group_id).await;
        });
        self.tasks.insert(group_id, handle);
        tracing::info!(group_id, "started auto-scaling");
    }

    pub fn stop_group(&self, group_id: i64) {
        if let Some((_, handle)) = self.tasks.remove(&group_id) {
            handle.abort();
            tracing::info!(group_id, "stopped auto-scaling");
        }
    }

    pub async fn stop(&self, grace: Duration) {
        let _ = self.shutdown.send(true);
        self.clock.sleep(grace).await;
        for entry in self.tasks.iter() {
            entry.value().abort();
        }
        self.tasks.clear();
        tracing::info!("auto-scaling stopped");
    }

    pub fn scaled_groups(&self) -> usize {
        self.tasks.len()
    }

    async fn run_loop(self: Arc<Self>, group_id: i64) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            match self.evaluate_group(group_id).await {
                Ok(Some(event)) => {
                    tracing::info!(
                        group_id,
                        kind = ?event.kind,
                        from = event.old_replicas,
                        to = event.new_replicas,
                        trigger = ?event.trigger,
                        "scaling executed"
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(group_id, error = %e, "scaling evaluation failed");
                }
            }
            self.clock.sleep(self.config.evaluation_interval()).await;
        }
        self.tasks.remove(&group_id);
    }

    /// One evaluation pass for a group. Returns the executed scaling event,
    /// if any.
    pub async fn evaluate_group(
        &self,
        group_id: i64,
    ) -> Result<Option<ScalingEvent>, FleetError> {
        let group = self
            .registry
            .get_group(group_id)
            .ok_or_else(|| FleetError::NotFound(format!("group {group_id}")))?;
        if !group.auto_scaling_enabled || !group.is_active {
            return Ok(None);
        }

        let members = self.registry.group_instances(&group);
        let count = members.len() as u32;
        let signals = self.collect_signals(&members).await?;

        let up_allowed = !self
            .in_cooldown(&group, ScalingEventKind::ScaleUp, group.scale_up_cooldown_secs)
            .await?;
        let down_allowed = !self
            .in_cooldown(
                &group,
                ScalingEventKind::ScaleDown,
                group.scale_down_cooldown_secs,
            )
            .await?;

        let mut candidates = Vec::new();
        candidates.extend(self.evaluate_load(&group, &signals, count));
        candidates.extend(self.evaluate_performance(&group, &signals, count));
        candidates.extend(self.evaluate_health(&group, &signals, count));
        candidates.extend(self.evaluate_queue(&group, &signals, count));
        candidates.extend(self.evaluate_hint(&group, count).await?);

        candidates.retain(|c| match c.direction {
            Direction::Up => up_allowed,
            Direction::Down => down_allowed,
        });

        let Some(decision) = Self::reconcile(candidates, &group, count) else {
            return Ok(None);
        };
        if decision.target == count {
            return Ok(None);
        }

        tracing::info!(
            group_id,
            direction = ?decision.direction,
            trigger = ?decision.trigger,
            confidence = decision.confidence,
            recommendation = %decision.recommendation,
            "scaling decision selected"
        );

        self.execute(&group, &members, count, decision).await.map(Some)
    }

    async fn collect_signals(&self, members: &[Instance]) -> Result<ScalingSignals, FleetError> {
        if members.is_empty() {
            return Ok(ScalingSignals::default());
        }
        let now = self.clock.now();
        let since = now
            - ChronoDuration::from_std(self.config.metrics_window())
                .map_err(|e| FleetError::Internal(format!("metrics window: {e}")))?;

        let loads: Vec<f64> = members.iter().map(Instance::load_ratio).collect();
        let avg_load = loads.iter().sum::<f64>() / loads.len() as f64;
        let max_load = loads.iter().cloned().fold(0.0f64, f64::max);

        let mut response_times = Vec::new();
        let mut total_requests = 0u64;
        let mut error_requests = 0u64;
        let mut health_scores = Vec::new();

        for member in members {
            let logs = self
                .store
                .range_request_logs(&member.instance_id, since)
                .await?;
            for log in &logs {
                if log.status == RequestStatus::Routed {
                    continue;
                }
                total_requests += 1;
                if matches!(log.status, RequestStatus::Error | RequestStatus::Timeout) {
                    error_requests += 1;
                }
                if let Some(ms) = log.response_ms {
                    response_times.push(ms);
                }
            }

            let events = self
                .store
                .range_health_events(&member.instance_id, since)
                .await?;
            if events.is_empty() {
                health_scores.push(member.success_rate);
            } else {
                health_scores
                    .push(events.iter().map(|e| e.score).sum::<f64>() / events.len() as f64);
            }
        }

        let avg_response_ms = if response_times.is_empty() {
            0.0
        } else {
            response_times.iter().sum::<f64>() / response_times.len() as f64
        };
        let p95_response_ms = percentile(&mut response_times, 0.95);

        let error_rate = if total_requests > 0 {
            error_requests as f64 / total_requests as f64
        } else {
            0.0
        };
        let window_mins = self.config.metrics_window().as_secs_f64() / 60.0;
        let requests_per_min = if window_mins > 0.0 {
            total_requests as f64 / window_mins
        } else {
            0.0
        };

        let queue_length: f64 = members
            .iter()
            .map(|m| {
                (f64::from(m.current_load)
                    - QUEUE_CAPACITY_FRACTION * f64::from(m.max_concurrent))
                .max(0.0)
            })
            .sum();

        let mean_health_score = health_scores.iter().sum::<f64>() / health_scores.len() as f64;

        Ok(ScalingSignals {
            avg_load,
            max_load,
            avg_response_ms,
            p95_response_ms,
            error_rate,
            success_rate: 1.0 - error_rate,
            queue_length: queue_length.round() as u32,
            requests_per_min,
            mean_health_score,
        })
    }

    fn evaluate_load(
        &self,
        group: &ProviderGroup,
        signals: &ScalingSignals,
        count: u32,
    ) -> Option<Candidate> {
        if signals.avg_load >= group.scale_up_threshold && count < group.max_instances {
            let scaled = (f64::from(count) * signals.avg_load / group.scale_up_threshold).ceil()
                as u32;
            let target = scaled.max(count + 1).min(group.max_instances);
            return Some(Candidate {
                direction: Direction::Up,
                trigger: ScalingTrigger::HighLoad,
                target,
                confidence: ((signals.avg_load - group.scale_up_threshold) / 0.2).min(1.0),
                metric_value: signals.avg_load,
                threshold: group.scale_up_threshold,
                recommendation: format!(
                    "scale up on high load: {:.1}% >= {:.1}%",
                    signals.avg_load * 100.0,
                    group.scale_up_threshold * 100.0
                ),
            });
        }

        if signals.avg_load <= group.scale_down_threshold && count > group.min_instances {
            // Zero offered load carries no ratio signal; step down one at a
            // time toward the floor.
            let target = if signals.avg_load <= f64::EPSILON {
                count - 1
            } else {
                let scaled =
                    (f64::from(count) * signals.avg_load / group.scale_down_threshold) as u32;
                scaled.clamp(group.min_instances, count - 1)
            };
            return Some(Candidate {
                direction: Direction::Down,
                trigger: ScalingTrigger::LowLoad,
                target: target.max(group.min_instances),
                confidence: ((group.scale_down_threshold - signals.avg_load) / 0.1).min(1.0),
                metric_value: signals.avg_load,
                threshold: group.scale_down_threshold,
                recommendation: format!(
                    "scale down on low load: {:.1}% <= {:.1}%",
                    signals.avg_load * 100.0,
                    group.scale_down_threshold * 100.0
                ),
            });
        }

        None
    }

    fn evaluate_performance(
        &self,
        group: &ProviderGroup,
        signals: &ScalingSignals,
        count: u32,
    ) -> Option<Candidate> {
        if count >= group.max_instances {
            return None;
        }
        if signals.avg_response_ms > self.config.max_response_time_ms {
            return Some(Candidate {
                direction: Direction::Up,
                trigger: ScalingTrigger::HighResponseTime,
                target: count + 1,
                confidence: (signals.avg_response_ms / self.config.max_response_time_ms - 1.0)
                    .min(1.0),
                metric_value: signals.avg_response_ms,
                threshold: self.config.max_response_time_ms,
                recommendation: format!(
                    "scale up on high response time: {:.0}ms > {:.0}ms",
                    signals.avg_response_ms, self.config.max_response_time_ms
                ),
            });
        }
        if signals.error_rate > self.config.max_error_rate {
            return Some(Candidate {
                direction: Direction::Up,
                trigger: ScalingTrigger::HighErrorRate,
                target: count + 1,
                confidence: (signals.error_rate / self.config.max_error_rate - 1.0).min(1.0),
                metric_value: signals.error_rate,
                threshold: self.config.max_error_rate,
                recommendation: format!(
                    "scale up on high error rate: {:.1}% > {:.1}%",
                    signals.error_rate * 100.0,
                    self.config.max_error_rate * 100.0
                ),
            });
        }
        None
    }

    fn evaluate_health(
        &self,
        group: &ProviderGroup,
        signals: &ScalingSignals,
        count: u32,
    ) -> Option<Candidate> {
        if !self.config.health_based_scaling
            || signals.mean_health_score >= LOW_HEALTH_SCORE
            || count >= group.max_instances
        {
            return None;
        }
        Some(Candidate {
            direction: Direction::Up,
            trigger: ScalingTrigger::HealthIssues,
            target: count + 1,
            confidence: (LOW_HEALTH_SCORE - signals.mean_health_score) / LOW_HEALTH_SCORE,
            metric_value: signals.mean_health_score,
            threshold: LOW_HEALTH_SCORE,
            recommendation: format!(
                "scale up on low health score: {:.1}",
                signals.mean_health_score
            ),
        })
    }

    fn evaluate_queue(
        &self,
        group: &ProviderGroup,
        signals: &ScalingSignals,
        count: u32,
    ) -> Option<Candidate> {
        if !self.config.queue_based_scaling
            || signals.queue_length <= QUEUE_BACKLOG_THRESHOLD
            || count >= group.max_instances
        {
            return None;
        }
        let additions = (signals.queue_length / QUEUE_BACKLOG_THRESHOLD)
            .max(1)
            .min(group.max_instances - count);
        Some(Candidate {
            direction: Direction::Up,
            trigger: ScalingTrigger::QueueBacklog,
            target: count + additions,
            confidence: (f64::from(signals.queue_length) / 50.0).min(1.0),
            metric_value: f64::from(signals.queue_length),
            threshold: f64::from(QUEUE_BACKLOG_THRESHOLD),
            recommendation: format!(
                "scale up on queue backlog: {} requests",
                signals.queue_length
            ),
        })
    }

    /// Advisory scale-up-check events persisted by the registry when an
    /// instance runs hot.
    async fn evaluate_hint(
        &self,
        group: &ProviderGroup,
        count: u32,
    ) -> Result<Option<Candidate>, FleetError> {
        if count >= group.max_instances {
            return Ok(None);
        }
        let Some(hint) = self
            .store
            .latest_scaling_event(
                group.id,
                ScalingEventKind::ScaleUpCheck,
                ScalingEventStatus::Pending,
            )
            .await?
        else {
            return Ok(None);
        };
        let window = ChronoDuration::from_std(self.config.metrics_window())
            .map_err(|e| FleetError::Internal(format!("metrics window: {e}")))?;
        if self.clock.now() - hint.started_at > window {
            return Ok(None);
        }
        Ok(Some(Candidate {
            direction: Direction::Up,
            trigger: ScalingTrigger::HighLoad,
            target: count + 1,
            confidence: 0.5,
            metric_value: hint.metric_value,
            threshold: hint.threshold,
            recommendation: "scale up on registry load hint".to_string(),
        }))
    }

    fn reconcile(candidates: Vec<Candidate>, group: &ProviderGroup, count: u32) -> Option<Candidate> {
        let best = |mut list: Vec<Candidate>| {
            list.sort_by(|a, b| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            list.into_iter().next()
        };

        let (ups, downs): (Vec<Candidate>, Vec<Candidate>) = candidates
            .into_iter()
            .partition(|c| c.direction == Direction::Up);

        if let Some(mut up) = best(ups) {
            up.target = up.target.clamp(group.min_instances, group.max_instances);
            return Some(up);
        }
        if let Some(mut down) = best(downs) {
            down.target = down
                .target
                .clamp(group.min_instances, count.max(group.min_instances));
            return Some(down);
        }
        None
    }

    async fn execute(
        &self,
        group: &ProviderGroup,
        members: &[Instance],
        count: u32,
        decision: Candidate,
    ) -> Result<ScalingEvent, FleetError> {
        let now = self.clock.now();
        let kind = match decision.direction {
            Direction::Up => ScalingEventKind::ScaleUp,
            Direction::Down => ScalingEventKind::ScaleDown,
        };
        let mut event = ScalingEvent::new(
            group.id,
            kind,
            count,
            decision.target,
            decision.trigger,
            decision.metric_value,
            decision.threshold,
            now,
        );
        self.store.append_scaling_event(&event).await?;
        self.store
            .update_scaling_event_status(event.id, ScalingEventStatus::InProgress, None, None)
            .await?;
        event.status = ScalingEventStatus::InProgress;

        let result = match decision.direction {
            Direction::Up => self.scale_up(group, members, decision.target - count).await,
            Direction::Down => {
                self.scale_down(members, count - decision.target).await
            }
        };

        match result {
            Ok(()) => {
                self.registry.set_group_desired(group.id, decision.target)?;
                let completed_at = self.clock.now();
                self.store
                    .update_scaling_event_status(
                        event.id,
                        ScalingEventStatus::Completed,
                        None,
                        Some(completed_at),
                    )
                    .await?;
                event.status = ScalingEventStatus::Completed;
                event.completed_at = Some(completed_at);
                self.consume_hint(group).await;
                Ok(event)
            }
            Err(e) => {
                self.store
                    .update_scaling_event_status(
                        event.id,
                        ScalingEventStatus::Failed,
                        Some(e.to_string()),
                        Some(self.clock.now()),
                    )
                    .await?;
                tracing::error!(group_id = group.id, error = %e, "scaling operation failed");
                Err(e)
            }
        }
    }

    /// Provision replicas cloned from an existing member's settings.
    async fn scale_up(
        &self,
        group: &ProviderGroup,
        members: &[Instance],
        to_add: u32,
    ) -> Result<(), FleetError> {
        let template = members.first().ok_or_else(|| {
            FleetError::Configuration(format!(
                "group {} has no member to use as a replica template",
                group.id
            ))
        })?;

        for _ in 0..to_add {
            let suffix = Uuid::new_v4().simple().to_string();
            let instance_id = format!("{}-auto-{}", group.provider, &suffix[..8]);
            let registered = self
                .registry
                .register(RegisterInstance {
                    instance_id: instance_id.clone(),
                    provider: template.provider,
                    model: template.model.clone(),
                    name: format!("{} auto replica", group.name),
                    endpoint_url: template.endpoint_url.clone(),
                    credential_ref: template.credential_ref.clone(),
                    region: template.region.clone(),
                    version: template.version.clone(),
                    max_concurrent: template.max_concurrent,
                    max_tokens_per_minute: template.max_tokens_per_minute,
                    temperature: template.temperature,
                    max_tokens: template.max_tokens,
                    timeout_secs: template.timeout_secs,
                    priority: template.priority,
                    tags: template.tags.clone(),
                    metadata: template.metadata.clone(),
                })
                .await?;
            if let Some(monitor) = &self.monitor {
                monitor.start_instance(&registered.instance_id);
            }
            tracing::info!(
                group_id = group.id,
                instance_id = %registered.instance_id,
                "provisioned replica"
            );
        }
        Ok(())
    }

    /// Gracefully stop surplus members: the least-loaded, highest-success
    /// instances first; no new traffic, in-flight requests finish.
    async fn scale_down(&self, members: &[Instance], to_remove: u32) -> Result<(), FleetError> {
        let mut surplus: Vec<&Instance> = members.iter().collect();
        surplus.sort_by(|a, b| {
            a.current_load.cmp(&b.current_load).then(
                b.success_rate
                    .partial_cmp(&a.success_rate)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
        });

        for instance in surplus.into_iter().take(to_remove as usize) {
            self.registry.deregister(&instance.instance_id).await?;
            if let Some(monitor) = &self.monitor {
                monitor.stop_instance(&instance.instance_id);
            }
            tracing::info!(instance_id = %instance.instance_id, "marked instance for removal");
        }
        Ok(())
    }

    async fn in_cooldown(
        &self,
        group: &ProviderGroup,
        kind: ScalingEventKind,
        cooldown_secs: u64,
    ) -> Result<bool, FleetError> {
        let Some(last) = self
            .store
            .latest_scaling_event(group.id, kind, ScalingEventStatus::Completed)
            .await?
        else {
            return Ok(false);
        };
        let Some(completed_at) = last.completed_at else {
            return Ok(false);
        };
        Ok(self.clock.now() < completed_at + ChronoDuration::seconds(cooldown_secs as i64))
    }

    /// Summarize scaling activity over the lookback window, optionally for
    /// one group.
    pub async fn scaling_summary(
        &self,
        group_id: Option<i64>,
        lookback: Duration,
    ) -> Result<ScalingSummary, FleetError> {
        let since = self.clock.now()
            - ChronoDuration::from_std(lookback)
                .map_err(|e| FleetError::Internal(format!("lookback out of range: {e}")))?;
        let events = self.store.range_scaling_events(group_id, since).await?;

        let decisions: Vec<&ScalingEvent> = events
            .iter()
            .filter(|e| {
                matches!(
                    e.kind,
                    ScalingEventKind::ScaleUp | ScalingEventKind::ScaleDown
                )
            })
            .collect();
        let completed = decisions
            .iter()
            .filter(|e| e.status == ScalingEventStatus::Completed)
            .count();
        let failed = decisions
            .iter()
            .filter(|e| e.status == ScalingEventStatus::Failed)
            .count();

        Ok(ScalingSummary {
            total_events: decisions.len(),
            scale_up_events: decisions
                .iter()
                .filter(|e| e.kind == ScalingEventKind::ScaleUp)
                .count(),
            scale_down_events: decisions
                .iter()
                .filter(|e| e.kind == ScalingEventKind::ScaleDown)
                .count(),
            completed_events: completed,
            failed_events: failed,
            success_rate: if decisions.is_empty() {
                0.0
            } else {
                completed as f64 / decisions.len() as f64 * 100.0
            },
            active_groups: self.tasks.len(),
        })
    }

    async fn consume_hint(&self, group: &ProviderGroup) {
        if let Ok(Some(hint)) = self
            .store
            .latest_scaling_event(
                group.id,
                ScalingEventKind::ScaleUpCheck,
                ScalingEventStatus::Pending,
            )
            .await
        {
            if let Err(e) = self
                .store
                .update_scaling_event_status(
                    hint.id,
                    ScalingEventStatus::Completed,
                    None,
                    Some(self.clock.now()),
                )
                .await
            {
                tracing::warn!(group_id = group.id, error = %e, "failed to consume scale hint");
            }
        }
    }
}

fn percentile(values: &mut [f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((values.len() as f64) * q).ceil() as usize;
    values[rank.clamp(1, values.len()) - 1]
}
