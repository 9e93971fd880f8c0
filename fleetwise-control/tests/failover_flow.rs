//! End-to-end failover behavior: route a query, fail the chosen instance,
//! and verify the request is rescued by an alternative with correct
//! bookkeeping (request logs, breaker counts, load quiescence).

mod common;

use common::{register_request, seed_probe_history, ScriptedInvoker};
use fleetwise_control::config::{FailoverConfig, RouterConfig};
use fleetwise_control::failover::FailoverExecutor;
use fleetwise_control::registry::InstanceRegistry;
use fleetwise_control::router::{QueryRouter, RouteRequest, RoutingStrategy};
use fleetwise_core::models::RequestStatus;
use fleetwise_core::specialization::SpecializationRegistry;
use fleetwise_core::{BreakerConfig, FleetError, ManualClock, MemoryStore, Store};
use std::sync::Arc;

struct Harness {
    store: Arc<MemoryStore>,
    registry: Arc<InstanceRegistry>,
    router: QueryRouter,
    executor: FailoverExecutor,
    invoker: Arc<ScriptedInvoker>,
}

async fn harness(instance_ids: &[&str]) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let registry = Arc::new(InstanceRegistry::new(
        store.clone(),
        clock.clone(),
        BreakerConfig::default(),
    ));
    let router = QueryRouter::new(
        registry.clone(),
        Arc::new(SpecializationRegistry::with_defaults()),
        RouterConfig::default(),
    );
    let executor = FailoverExecutor::new(
        registry.clone(),
        store.clone(),
        clock.clone(),
        FailoverConfig::default(),
    );

    for id in instance_ids {
        registry.register(register_request(id, "gpt-4")).await.unwrap();
        seed_probe_history(&store, id, 10, 0, 300.0).await;
        registry.update_rolling_metrics(id).await.unwrap();
        registry.apply_probe(id, true, false).await.unwrap();
    }

    Harness {
        store,
        registry,
        router,
        executor,
        invoker: Arc::new(ScriptedInvoker::new()),
    }
}

async fn logs_by_status(store: &MemoryStore, ids: &[&str], status: RequestStatus) -> usize {
    let mut count = 0;
    for id in ids {
        count += store
            .range_request_logs(id, chrono::Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap()
            .iter()
            .filter(|l| l.status == status)
            .count();
    }
    count
}

#[tokio::test]
async fn failed_primary_fails_over_to_alternative() {
    let harness = harness(&["a", "b"]).await;
    // "a" wins selection (seeded identically, lower id breaks the tie) and
    // is scripted to fail once.
    harness.invoker.script("a", vec![Err("boom".to_string())]);

    let decision = harness
        .router
        .route(&RouteRequest {
            query: "hello there".to_string(),
            strategy: Some(RoutingStrategy::Performance),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(decision.instance.instance_id, "a");

    let outcome = harness
        .executor
        .execute(&decision, harness.invoker.clone())
        .await
        .unwrap();

    assert_eq!(outcome.instance.instance_id, "b");
    assert!(outcome.was_failover);
    assert_eq!(outcome.attempts, 2);

    // Exactly one success row, one failure row on the original instance.
    assert_eq!(
        logs_by_status(&harness.store, &["a", "b"], RequestStatus::Success).await,
        1
    );
    assert_eq!(
        logs_by_status(&harness.store, &["a"], RequestStatus::Error).await,
        1
    );

    // The failed attempt fed the breaker.
    assert_eq!(harness.registry.breaker("a").snapshot().failure_count, 1);
    assert_eq!(harness.registry.breaker("b").snapshot().failure_count, 0);

    // All load slots drained after the request finished.
    assert_eq!(harness.registry.get("a").unwrap().current_load, 0);
    assert_eq!(harness.registry.get("b").unwrap().current_load, 0);
}

#[tokio::test]
async fn exhausting_all_attempts_propagates_the_last_error() {
    let harness = harness(&["a", "b", "c"]).await;
    for id in ["a", "b", "c"] {
        harness.invoker.always_fail(id);
    }

    let decision = harness
        .router
        .route(&RouteRequest {
            query: "hello there".to_string(),
            strategy: Some(RoutingStrategy::Performance),
            ..Default::default()
        })
        .await
        .unwrap();

    let err = harness
        .executor
        .execute(&decision, harness.invoker.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::InstanceFailure { .. }));

    // Three attempts, three failure rows, no success anywhere.
    assert_eq!(
        logs_by_status(&harness.store, &["a", "b", "c"], RequestStatus::Error).await,
        3
    );
    assert_eq!(
        logs_by_status(&harness.store, &["a", "b", "c"], RequestStatus::Success).await,
        0
    );

    for id in ["a", "b", "c"] {
        assert_eq!(harness.registry.get(id).unwrap().current_load, 0);
    }
}

#[tokio::test]
async fn open_breaker_fast_fails_the_attempt_and_rescues_elsewhere() {
    let harness = harness(&["a", "b"]).await;

    let decision = harness
        .router
        .route(&RouteRequest {
            query: "hello there".to_string(),
            strategy: Some(RoutingStrategy::Performance),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(decision.instance.instance_id, "a");

    // The breaker opens between routing and dispatch.
    harness.registry.breaker("a").force_open();

    let outcome = harness
        .executor
        .execute(&decision, harness.invoker.clone())
        .await
        .unwrap();
    assert_eq!(outcome.instance.instance_id, "b");
    assert!(outcome.was_failover);

    // The gated attempt was recorded without invoking upstream.
    let a_logs = harness
        .store
        .range_request_logs("a", chrono::Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    assert!(a_logs.iter().any(|l| {
        l.status == RequestStatus::Error
            && l.error
                .as_deref()
                .map(|e| e.contains("circuit open"))
                .unwrap_or(false)
    }));
}

#[tokio::test]
async fn no_alternatives_ends_the_retry_early() {
    let harness = harness(&["a"]).await;
    harness.invoker.always_fail("a");

    let decision = harness
        .router
        .route(&RouteRequest {
            query: "hello there".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let err = harness
        .executor
        .execute(&decision, harness.invoker.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::InstanceFailure { .. }));

    // One attempt only; there was nowhere to fail over to.
    assert_eq!(
        logs_by_status(&harness.store, &["a"], RequestStatus::Error).await,
        1
    );
}

#[tokio::test]
async fn successful_request_marks_routed_and_success_rows() {
    let harness = harness(&["a"]).await;

    let decision = harness
        .router
        .route(&RouteRequest {
            query: "hello there".to_string(),
            user_id: Some("user-7".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    let outcome = harness
        .executor
        .execute(&decision, harness.invoker.clone())
        .await
        .unwrap();
    assert!(!outcome.was_failover);
    assert_eq!(outcome.attempts, 1);

    let logs = harness
        .store
        .range_request_logs("a", chrono::Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    let routed = logs
        .iter()
        .find(|l| l.status == RequestStatus::Routed)
        .unwrap();
    let success = logs
        .iter()
        .find(|l| l.status == RequestStatus::Success)
        .unwrap();

    assert_eq!(routed.request_id, success.request_id);
    assert_eq!(success.user_id.as_deref(), Some("user-7"));
    assert_eq!(success.tokens_used, Some(12));
    assert!(!success.was_failover);

    // Lifetime counters moved.
    let instance = harness.registry.get("a").unwrap();
    assert_eq!(instance.total_requests, 1);
    assert_eq!(instance.successful_requests, 1);
}
