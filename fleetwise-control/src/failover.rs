//! # Failover Executor
//!
//! Wraps an upstream call with bounded retry onto alternative instances.
//! This is the one place in the control plane where retries happen
//! automatically; every other layer handles or propagates.
//!
//! ## Per-attempt protocol
//!
//! 1. claim a load slot (admission; a full instance is skipped, not queued)
//! 2. pass the instance's circuit breaker gate (fast-fail when open)
//! 3. invoke with the per-attempt deadline
//! 4. report the outcome to the registry (counters + breaker) and append
//!    the request log row
//!
//! On failure the executor re-selects an alternative with the health-based
//! discipline among candidates for the same provider and model, excluding
//! everything already tried, and marks the remaining attempts as failover.
//! The load slot is released on every exit path, including panics, because
//! it is a scoped permit.

use crate::config::FailoverConfig;
use crate::registry::InstanceRegistry;
use crate::router::RoutingDecision;
use fleetwise_core::invoker::{InvokeOptions, Invocation, UpstreamInvoker};
use fleetwise_core::models::{Instance, RequestLog, RequestStatus};
use fleetwise_core::selector::{SelectionStrategy, Selector};
use fleetwise_core::{Clock, FleetError, Store};
use std::sync::Arc;
use uuid::Uuid;

/// Health floor applied when re-selecting an alternative; looser than the
/// routing floor so a degraded-but-working instance can still rescue a
/// request.
const FAILOVER_MIN_HEALTH: f64 = 0.6;

/// Result of a completed execution.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub request_id: Uuid,
    pub invocation: Invocation,
    pub instance: Instance,
    pub was_failover: bool,
    pub attempts: u32,
}

pub struct FailoverExecutor {
    registry: Arc<InstanceRegistry>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    selector: Selector,
    config: FailoverConfig,
}

impl FailoverExecutor {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        config: FailoverConfig,
    ) -> Self {
        Self {
            registry,
            store,
            clock,
            selector: Selector::new(),
            config,
        }
    }

    /// Execute a routed query, failing over across alternatives until one
    /// succeeds or the attempt budget is spent.
    pub async fn execute(
        &self,
        decision: &RoutingDecision,
        invoker: Arc<dyn UpstreamInvoker>,
    ) -> Result<ExecutionOutcome, FleetError> {
        let request_id = Uuid::new_v4();
        let original = decision.instance.clone();
        let mut current = decision.instance.clone();
        let mut tried: Vec<String> = Vec::new();
        let mut last_error: Option<FleetError> = None;

        self.append_log(
            request_id,
            &original,
            RequestStatus::Routed,
            None,
            None,
            None,
            false,
            None,
            decision,
        )
        .await;

        let mut attempt = 0u32;
        while attempt < self.config.max_attempts {
            attempt += 1;
            let was_failover = attempt > 1;
            let original_id = was_failover.then(|| original.instance_id.clone());
            tried.push(current.instance_id.clone());

            // Admission first: a full instance is ineligible, not queued.
            let permit = match self.registry.acquire_slot(&current.instance_id).await {
                Ok(permit) => permit,
                Err(e) => {
                    self.append_log(
                        request_id,
                        &current,
                        RequestStatus::Error,
                        None,
                        None,
                        Some(e.to_string()),
                        was_failover,
                        original_id.clone(),
                        decision,
                    )
                    .await;
                    last_error = Some(e);
                    match self.next_alternative(&original, &tried) {
                        Some(next) => {
                            current = next;
                            continue;
                        }
                        None => break,
                    }
                }
            };

            let breaker = self.registry.breaker(&current.instance_id);
            if !breaker.try_acquire() {
                drop(permit);
                let e = FleetError::CircuitOpen {
                    instance_id: current.instance_id.clone(),
                };
                self.append_log(
                    request_id,
                    &current,
                    RequestStatus::Error,
                    None,
                    None,
                    Some(e.to_string()),
                    was_failover,
                    original_id.clone(),
                    decision,
                )
                .await;
                last_error = Some(e);
                match self.next_alternative(&original, &tried) {
                    Some(next) => {
                        current = next;
                        continue;
                    }
                    None => break,
                }
            }

            let options = InvokeOptions {
                timeout: Some(self.config.attempt_timeout()),
                ..Default::default()
            };
            let outcome = tokio::time::timeout(
                self.config.attempt_timeout(),
                invoker.invoke(&current, &decision.query, &options),
            )
            .await;
            drop(permit);

            match outcome {
                Ok(Ok(invocation)) => {
                    self.registry
                        .record_request_outcome(&current.instance_id, true)
                        .await?;
                    self.registry
                        .update_rolling_metrics(&current.instance_id)
                        .await
                        .ok();
                    self.append_log(
                        request_id,
                        &current,
                        RequestStatus::Success,
                        Some(invocation.response_ms),
                        Some(invocation.tokens_used),
                        None,
                        was_failover,
                        original_id,
                        decision,
                    )
                    .await;

                    if was_failover {
                        tracing::info!(
                            %request_id,
                            from = %original.instance_id,
                            to = %current.instance_id,
                            attempt,
                            "request succeeded after failover"
                        );
                    }
                    return Ok(ExecutionOutcome {
                        request_id,
                        invocation,
                        instance: current,
                        was_failover,
                        attempts: attempt,
                    });
                }
                Ok(Err(invoke_err)) => {
                    self.registry
                        .record_request_outcome(&current.instance_id, false)
                        .await?;
                    let e = FleetError::InstanceFailure {
                        instance_id: current.instance_id.clone(),
                        detail: invoke_err.to_string(),
                    };
                    self.append_log(
                        request_id,
                        &current,
                        RequestStatus::Error,
                        None,
                        None,
                        Some(invoke_err.to_string()),
                        was_failover,
                        original_id,
                        decision,
                    )
                    .await;
                    tracing::warn!(
                        %request_id,
                        instance_id = %current.instance_id,
                        attempt,
                        error = %invoke_err,
                        "upstream attempt failed"
                    );
                    last_error = Some(e);
                }
                Err(_) => {
                    self.registry
                        .record_request_outcome(&current.instance_id, false)
                        .await?;
                    self.append_log(
                        request_id,
                        &current,
                        RequestStatus::Timeout,
                        None,
                        None,
                        Some("attempt deadline exceeded".to_string()),
                        was_failover,
                        original_id,
                        decision,
                    )
                    .await;
                    tracing::warn!(
                        %request_id,
                        instance_id = %current.instance_id,
                        attempt,
                        "upstream attempt timed out"
                    );
                    last_error = Some(FleetError::DeadlineExceeded(format!(
                        "attempt on {}",
                        current.instance_id
                    )));
                }
            }

            if attempt < self.config.max_attempts {
                match self.next_alternative(&original, &tried) {
                    Some(next) => {
                        tracing::info!(
                            %request_id,
                            from = %current.instance_id,
                            to = %next.instance_id,
                            "failing over to alternative instance"
                        );
                        current = next;
                    }
                    None => break,
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            FleetError::NoCapacity(format!(
                "no alternative instances for {}/{}",
                original.provider, original.model
            ))
        }))
    }

    /// Health-based re-selection among same-provider, same-model candidates
    /// that have not been tried yet.
    fn next_alternative(&self, original: &Instance, tried: &[String]) -> Option<Instance> {
        let candidates: Vec<Instance> = self
            .registry
            .candidates(
                Some(original.provider),
                Some(&original.model),
                FAILOVER_MIN_HEALTH,
            )
            .into_iter()
            .filter(|c| !tried.contains(&c.instance_id))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        self.selector
            .select(&candidates, SelectionStrategy::HealthBased)
            .ok()
            .map(|s| s.instance)
    }

    #[allow(clippy::too_many_arguments)]
    async fn append_log(
        &self,
        request_id: Uuid,
        instance: &Instance,
        status: RequestStatus,
        response_ms: Option<f64>,
        tokens_used: Option<u32>,
        error: Option<String>,
        was_failover: bool,
        original_instance_id: Option<String>,
        decision: &RoutingDecision,
    ) {
        let now = self.clock.now();
        let completed = !matches!(status, RequestStatus::Routed);
        let log = RequestLog {
            request_id,
            instance_id: instance.instance_id.clone(),
            provider: instance.provider,
            model: instance.model.clone(),
            status,
            response_ms,
            queue_ms: None,
            tokens_used,
            error,
            was_failover,
            original_instance_id,
            user_id: decision.user_id.clone(),
            session_id: decision.session_id.clone(),
            created_at: now,
            completed_at: completed.then_some(now),
        };
        if let Err(e) = self.store.append_request_log(&log).await {
            tracing::warn!(%request_id, error = %e, "failed to append request log");
        }
    }
}
