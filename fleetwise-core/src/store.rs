//! # Durable Store Contract
//!
//! This module defines the persistence boundary of the control plane. The
//! store owns the durable rows (instances, health events, request logs,
//! scaling events) and receives writes only through the registry, the health
//! monitor, and the scaler.
//!
//! ## Contract
//!
//! The engine behind the trait is deliberately unspecified; the control
//! plane only requires:
//! - atomic read-modify-write on single records (`upsert_instance`,
//!   `update_scaling_event_status`)
//! - time-window range queries (`range_request_logs`,
//!   `range_health_events`)
//! - ordered lookup of the most recent scaling event per group, kind, and
//!   status (cooldown checks)
//! - retention deletes by record kind and cutoff
//!
//! [`MemoryStore`] is the bundled reference implementation; it backs the
//! default binary wiring and every test. Its `fail_writes` switch simulates
//! a broken durable layer for registry rollback tests.

use crate::error::FleetError;
use crate::models::{
    HealthEvent, Instance, InstanceFilter, Page, RequestLog, ScalingEvent, ScalingEventKind,
    ScalingEventStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use uuid::Uuid;

/// Record families subject to retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    HealthEvents,
    RequestLogs,
    ScalingEvents,
}

/// Persistence contract for the control plane.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or replace an instance row by `instance_id`.
    async fn upsert_instance(&self, instance: &Instance) -> Result<(), FleetError>;

    async fn get_instance(&self, instance_id: &str) -> Result<Option<Instance>, FleetError>;

    /// List instances matching `filter`, ordered by `instance_id`, windowed
    /// by `page`.
    async fn list_instances(
        &self,
        filter: &InstanceFilter,
        page: Page,
    ) -> Result<Vec<Instance>, FleetError>;

    async fn append_health_event(&self, event: &HealthEvent) -> Result<(), FleetError>;

    async fn append_request_log(&self, log: &RequestLog) -> Result<(), FleetError>;

    async fn append_scaling_event(&self, event: &ScalingEvent) -> Result<(), FleetError>;

    /// Move a scaling event to a new lifecycle status, recording the error
    /// and completion time when present.
    async fn update_scaling_event_status(
        &self,
        event_id: Uuid,
        status: ScalingEventStatus,
        error: Option<String>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), FleetError>;

    /// Most recent scaling event for the group with the given kind and
    /// status, by `started_at`.
    async fn latest_scaling_event(
        &self,
        group_id: i64,
        kind: ScalingEventKind,
        status: ScalingEventStatus,
    ) -> Result<Option<ScalingEvent>, FleetError>;

    /// Scaling events started at or after `since`, optionally narrowed to
    /// one group, most recent first. Feeds the scaling history summary.
    async fn range_scaling_events(
        &self,
        group_id: Option<i64>,
        since: DateTime<Utc>,
    ) -> Result<Vec<ScalingEvent>, FleetError>;

    /// Request logs for one instance created at or after `since`.
    async fn range_request_logs(
        &self,
        instance_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RequestLog>, FleetError>;

    /// Health events for one instance created at or after `since`.
    async fn range_health_events(
        &self,
        instance_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<HealthEvent>, FleetError>;

    /// Delete rows of `kind` created strictly before `before`. Returns the
    /// number of rows removed.
    async fn delete_old(&self, kind: RecordKind, before: DateTime<Utc>) -> Result<u64, FleetError>;
}

/// In-memory store backed by concurrent maps.
#[derive(Debug, Default)]
pub struct MemoryStore {
    instances: DashMap<String, Instance>,
    health_events: DashMap<String, Vec<HealthEvent>>,
    request_logs: DashMap<String, Vec<RequestLog>>,
    scaling_events: RwLock<Vec<ScalingEvent>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with a store error. Used to test
    /// rollback behavior in the registry.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), FleetError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(FleetError::Store("injected write failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_instance(&self, instance: &Instance) -> Result<(), FleetError> {
        self.check_writable()?;
        self.instances
            .insert(instance.instance_id.clone(), instance.clone());
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<Instance>, FleetError> {
        Ok(self.instances.get(instance_id).map(|e| e.value().clone()))
    }

    async fn list_instances(
        &self,
        filter: &InstanceFilter,
        page: Page,
    ) -> Result<Vec<Instance>, FleetError> {
        let mut matching: Vec<Instance> = self
            .instances
            .iter()
            .filter(|e| filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        matching.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(matching
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect())
    }

    async fn append_health_event(&self, event: &HealthEvent) -> Result<(), FleetError> {
        self.check_writable()?;
        self.health_events
            .entry(event.instance_id.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn append_request_log(&self, log: &RequestLog) -> Result<(), FleetError> {
        self.check_writable()?;
        self.request_logs
            .entry(log.instance_id.clone())
            .or_default()
            .push(log.clone());
        Ok(())
    }

    async fn append_scaling_event(&self, event: &ScalingEvent) -> Result<(), FleetError> {
        self.check_writable()?;
        self.scaling_events
            .write()
            .expect("scaling events lock poisoned")
            .push(event.clone());
        Ok(())
    }

    async fn update_scaling_event_status(
        &self,
        event_id: Uuid,
        status: ScalingEventStatus,
        error: Option<String>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), FleetError> {
        self.check_writable()?;
        let mut events = self
            .scaling_events
            .write()
            .expect("scaling events lock poisoned");
        let event = events
            .iter_mut()
            .find(|e| e.id == event_id)
            .ok_or_else(|| FleetError::NotFound(format!("scaling event {event_id}")))?;
        event.status = status;
        if error.is_some() {
            event.error = error;
        }
        if completed_at.is_some() {
            event.completed_at = completed_at;
        }
        Ok(())
    }

    async fn latest_scaling_event(
        &self,
        group_id: i64,
        kind: ScalingEventKind,
        status: ScalingEventStatus,
    ) -> Result<Option<ScalingEvent>, FleetError> {
        let events = self
            .scaling_events
            .read()
            .expect("scaling events lock poisoned");
        Ok(events
            .iter()
            .filter(|e| e.group_id == group_id && e.kind == kind && e.status == status)
            .max_by_key(|e| e.started_at)
            .cloned())
    }

    async fn range_scaling_events(
        &self,
        group_id: Option<i64>,
        since: DateTime<Utc>,
    ) -> Result<Vec<ScalingEvent>, FleetError> {
        let events = self
            .scaling_events
            .read()
            .expect("scaling events lock poisoned");
        let mut matching: Vec<ScalingEvent> = events
            .iter()
            .filter(|e| {
                e.started_at >= since && group_id.map(|id| e.group_id == id).unwrap_or(true)
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(matching)
    }

    async fn range_request_logs(
        &self,
        instance_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RequestLog>, FleetError> {
        Ok(self
            .request_logs
            .get(instance_id)
            .map(|logs| {
                logs.iter()
                    .filter(|l| l.created_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn range_health_events(
        &self,
        instance_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<HealthEvent>, FleetError> {
        Ok(self
            .health_events
            .get(instance_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.created_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_old(&self, kind: RecordKind, before: DateTime<Utc>) -> Result<u64, FleetError> {
        self.check_writable()?;
        let mut deleted = 0u64;
        match kind {
            RecordKind::HealthEvents => {
                for mut entry in self.health_events.iter_mut() {
                    let prior = entry.value().len();
                    entry.value_mut().retain(|e| e.created_at >= before);
                    deleted += (prior - entry.value().len()) as u64;
                }
            }
            RecordKind::RequestLogs => {
                for mut entry in self.request_logs.iter_mut() {
                    let prior = entry.value().len();
                    entry.value_mut().retain(|l| l.created_at >= before);
                    deleted += (prior - entry.value().len()) as u64;
                }
            }
            RecordKind::ScalingEvents => {
                let mut events = self
                    .scaling_events
                    .write()
                    .expect("scaling events lock poisoned");
                let prior = events.len();
                events.retain(|e| e.started_at >= before);
                deleted += (prior - events.len()) as u64;
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        HealthEventStatus, ProviderKind, RegisterInstance, RequestStatus, ScalingTrigger,
    };
    use chrono::Duration as ChronoDuration;
    use std::collections::HashMap;

    fn register(id: &str) -> RegisterInstance {
        RegisterInstance {
            instance_id: id.to_string(),
            provider: ProviderKind::OpenAi,
            model: "gpt-4".to_string(),
            name: id.to_string(),
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
    }

    fn health_event(id: &str, at: DateTime<Utc>) -> HealthEvent {
        HealthEvent {
            instance_id: id.to_string(),
            status: HealthEventStatus::Healthy,
            response_ms: Some(120.0),
            error: None,
            check_kind: crate::models::CheckKind::Basic,
            score: 100.0,
            created_at: at,
        }
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let store = MemoryStore::new();
        let mut instance = register("a").into_instance(Utc::now());
        store.upsert_instance(&instance).await.unwrap();

        instance.priority = 5;
        store.upsert_instance(&instance).await.unwrap();

        let fetched = store.get_instance("a").await.unwrap().unwrap();
        assert_eq!(fetched.priority, 5);
    }

    #[tokio::test]
    async fn list_orders_and_pages_by_id() {
        let store = MemoryStore::new();
        for id in ["c", "a", "b"] {
            store
                .upsert_instance(&register(id).into_instance(Utc::now()))
                .await
                .unwrap();
        }

        let page = store
            .list_instances(
                &InstanceFilter::default(),
                Page {
                    offset: 1,
                    limit: 1,
                },
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].instance_id, "b");
    }

    #[tokio::test]
    async fn range_health_events_honors_since() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .append_health_event(&health_event("a", now - ChronoDuration::hours(2)))
            .await
            .unwrap();
        store
            .append_health_event(&health_event("a", now - ChronoDuration::minutes(5)))
            .await
            .unwrap();

        let events = store
            .range_health_events("a", now - ChronoDuration::hours(1))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn latest_scaling_event_picks_most_recent_match() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let mut earlier = ScalingEvent::new(
            1,
            ScalingEventKind::ScaleUp,
            2,
            3,
            ScalingTrigger::HighLoad,
            0.9,
            0.8,
            now - ChronoDuration::minutes(30),
        );
        earlier.status = ScalingEventStatus::Completed;
        let mut later = ScalingEvent::new(
            1,
            ScalingEventKind::ScaleUp,
            3,
            4,
            ScalingTrigger::HighLoad,
            0.95,
            0.8,
            now - ChronoDuration::minutes(5),
        );
        later.status = ScalingEventStatus::Completed;

        store.append_scaling_event(&earlier).await.unwrap();
        store.append_scaling_event(&later).await.unwrap();

        let latest = store
            .latest_scaling_event(1, ScalingEventKind::ScaleUp, ScalingEventStatus::Completed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, later.id);

        assert!(store
            .latest_scaling_event(1, ScalingEventKind::ScaleDown, ScalingEventStatus::Completed)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn range_scaling_events_filters_by_group_and_orders_newest_first() {
        let store = MemoryStore::new();
        let now = Utc::now();

        for (group_id, minutes_ago) in [(1, 30), (1, 5), (2, 10)] {
            store
                .append_scaling_event(&ScalingEvent::new(
                    group_id,
                    ScalingEventKind::ScaleUp,
                    1,
                    2,
                    ScalingTrigger::HighLoad,
                    0.9,
                    0.8,
                    now - ChronoDuration::minutes(minutes_ago),
                ))
                .await
                .unwrap();
        }

        let events = store
            .range_scaling_events(Some(1), now - ChronoDuration::hours(1))
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].started_at > events[1].started_at);

        let all = store
            .range_scaling_events(None, now - ChronoDuration::hours(1))
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn delete_old_removes_only_targeted_kind() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let cutoff = now - ChronoDuration::days(30);

        store
            .append_health_event(&health_event("a", now - ChronoDuration::days(40)))
            .await
            .unwrap();
        store
            .append_health_event(&health_event("a", now))
            .await
            .unwrap();
        store
            .append_request_log(&RequestLog {
                request_id: Uuid::new_v4(),
                instance_id: "a".to_string(),
                provider: ProviderKind::OpenAi,
                model: "gpt-4".to_string(),
                status: RequestStatus::Success,
                response_ms: Some(200.0),
                queue_ms: None,
                tokens_used: Some(42),
                error: None,
                was_failover: false,
                original_instance_id: None,
                user_id: None,
                session_id: None,
                created_at: now - ChronoDuration::days(40),
                completed_at: Some(now - ChronoDuration::days(40)),
            })
            .await
            .unwrap();

        let deleted = store
            .delete_old(RecordKind::HealthEvents, cutoff)
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        // Request logs are untouched until their own sweep.
        let logs = store
            .range_request_logs("a", now - ChronoDuration::days(60))
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);

        let remaining = store
            .range_health_events("a", now - ChronoDuration::days(60))
            .await
            .unwrap();
        assert!(remaining.iter().all(|e| e.created_at >= cutoff));
    }

    #[tokio::test]
    async fn injected_failure_rejects_writes() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let err = store
            .upsert_instance(&register("a").into_instance(Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Store(_)));
    }
}
