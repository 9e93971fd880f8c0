//! # Control Plane Composition Root
//!
//! Constructs every component from configuration, wires them together, and
//! exposes the request and admin surfaces as plain methods. The edge layer
//! (HTTP, CLI, tests) holds one [`ControlPlane`] and never reaches around
//! it; there are no process-wide singletons.
//!
//! ## Surfaces
//!
//! - **Request path**: [`ControlPlane::route`] (read-only decision) and
//!   [`ControlPlane::route_and_execute`] (decision plus failover-protected
//!   upstream call). An empty candidate set is retried once with relaxed
//!   health before giving up.
//! - **Admin path**: instance registration and lifecycle, load updates,
//!   listings, windowed metrics, ad-hoc health checks, monitor and scaler
//!   start/stop, group management, breaker reset, cache clear.
//!
//! Shutdown cancels the background loops cooperatively and waits out a
//! grace period before aborting stragglers.

use crate::config::{ControlPlaneConfig, GroupConfig};
use crate::failover::{ExecutionOutcome, FailoverExecutor};
use crate::health::{FleetHealthSummary, HealthMonitor, HealthReport};
use crate::registry::{InstanceMetricsWindow, InstanceRegistry};
use crate::retention::RetentionSweeper;
use crate::router::{QueryRouter, RouteRequest, RouterStats, RoutingDecision};
use crate::scaler::AutoScaler;
use fleetwise_core::invoker::{ProbeResult, Prober, UpstreamInvoker};
use fleetwise_core::models::{
    CheckKind, Instance, InstanceFilter, Page, ProviderGroup, RegisterInstance, RequestLog,
    RequestStatus,
};
use fleetwise_core::specialization::SpecializationRegistry;
use fleetwise_core::{BreakerSnapshot, Clock, FleetError, Store};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub struct ControlPlane {
    config: ControlPlaneConfig,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    invoker: Arc<dyn UpstreamInvoker>,
    registry: Arc<InstanceRegistry>,
    router: Arc<QueryRouter>,
    executor: Arc<FailoverExecutor>,
    monitor: Arc<HealthMonitor>,
    scaler: Arc<AutoScaler>,
    sweeper: Arc<RetentionSweeper>,
}

impl ControlPlane {
    pub fn new(
        config: ControlPlaneConfig,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        invoker: Arc<dyn UpstreamInvoker>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let registry = Arc::new(InstanceRegistry::new(
            store.clone(),
            clock.clone(),
            config.breaker.to_breaker_config(),
        ));
        let specializations = Arc::new(SpecializationRegistry::with_defaults());
        let router = Arc::new(QueryRouter::new(
            registry.clone(),
            specializations,
            config.router.clone(),
        ));
        let executor = Arc::new(FailoverExecutor::new(
            registry.clone(),
            store.clone(),
            clock.clone(),
            config.failover.clone(),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            store.clone(),
            prober,
            clock.clone(),
            config.health.clone(),
        ));
        let scaler = Arc::new(
            AutoScaler::new(
                registry.clone(),
                store.clone(),
                clock.clone(),
                config.scaler.clone(),
            )
            .with_monitor(monitor.clone()),
        );
        let sweeper = Arc::new(RetentionSweeper::new(
            store.clone(),
            clock.clone(),
            config.retention.clone(),
        ));

        Self {
            config,
            store,
            clock,
            invoker,
            registry,
            router,
            executor,
            monitor,
            scaler,
            sweeper,
        }
    }

    /// Seed the fleet from configuration and start the background loops.
    pub async fn start(&self) -> Result<(), FleetError> {
        let now = self.clock.now();
        for group in self.config.groups.clone() {
            self.registry.upsert_group(group.into_group(now));
        }
        for instance in self.config.instances.clone() {
            self.registry.register(instance).await?;
        }

        self.monitor.start();
        self.scaler.start();
        self.sweeper.start();
        tracing::info!(
            instances = self.config.instances.len(),
            groups = self.config.groups.len(),
            "control plane started"
        );
        Ok(())
    }

    /// Cooperative shutdown with a grace period per subsystem.
    pub async fn shutdown(&self, grace: Duration) {
        tracing::info!("control plane shutting down");
        self.scaler.stop(grace).await;
        self.monitor.stop(grace).await;
        self.sweeper.stop(grace).await;
    }

    // --- Request surface -------------------------------------------------

    /// Route one query. Falls back to relaxed health constraints when the
    /// strict candidate set is empty.
    pub async fn route(&self, request: &RouteRequest) -> Result<RoutingDecision, FleetError> {
        match self.router.route(request).await {
            Ok(decision) => Ok(decision),
            Err(FleetError::NoCapacity(_)) => {
                tracing::warn!("no candidates at configured health floor, retrying relaxed");
                self.router.route_relaxed(request).await
            }
            Err(e) => Err(e),
        }
    }

    /// Route one query and execute it with failover protection.
    pub async fn route_and_execute(
        &self,
        request: &RouteRequest,
    ) -> Result<(RoutingDecision, ExecutionOutcome), FleetError> {
        let decision = match self.route(request).await {
            Ok(decision) => decision,
            Err(e) => {
                self.log_routing_failure(request, &e).await;
                return Err(e);
            }
        };
        let outcome = self.executor.execute(&decision, self.invoker.clone()).await?;
        Ok((decision, outcome))
    }

    async fn log_routing_failure(&self, request: &RouteRequest, error: &FleetError) {
        let Some(provider) = request.preferred_provider else {
            tracing::error!(error = %error, "routing failed with no provider preference");
            return;
        };
        let now = self.clock.now();
        let log = RequestLog {
            request_id: Uuid::new_v4(),
            instance_id: "failed-routing".to_string(),
            provider,
            model: String::new(),
            status: RequestStatus::RoutingFailed,
            response_ms: None,
            queue_ms: None,
            tokens_used: None,
            error: Some(error.to_string()),
            was_failover: false,
            original_instance_id: None,
            user_id: request.user_id.clone(),
            session_id: request.session_id.clone(),
            created_at: now,
            completed_at: Some(now),
        };
        if let Err(e) = self.store.append_request_log(&log).await {
            tracing::warn!(error = %e, "failed to record routing failure");
        }
    }

    // --- Admin surface ---------------------------------------------------

    /// Register an instance and put it under health monitoring, which runs
    /// its initial probe asynchronously.
    pub async fn register_instance(&self, req: RegisterInstance) -> Result<Instance, FleetError> {
        let instance = self.registry.register(req).await?;
        self.monitor.start_instance(&instance.instance_id);
        Ok(instance)
    }

    pub async fn deregister_instance(&self, instance_id: &str) -> Result<(), FleetError> {
        self.monitor.stop_instance(instance_id);
        self.registry.deregister(instance_id).await
    }

    pub async fn update_instance_load(
        &self,
        instance_id: &str,
        load: u32,
    ) -> Result<(), FleetError> {
        self.registry.update_load(instance_id, load).await
    }

    pub fn get_instance(&self, instance_id: &str) -> Option<Instance> {
        self.registry.get(instance_id)
    }

    pub fn list_instances(&self, filter: &InstanceFilter, page: Page) -> Vec<Instance> {
        self.registry.list(filter, page)
    }

    pub async fn instance_metrics(
        &self,
        instance_id: &str,
        window: Duration,
    ) -> Result<InstanceMetricsWindow, FleetError> {
        self.registry.instance_metrics(instance_id, window).await
    }

    /// Run one ad-hoc health check of the given kind.
    pub async fn trigger_health_check(
        &self,
        instance_id: &str,
        kind: CheckKind,
    ) -> Result<ProbeResult, FleetError> {
        self.monitor.run_check(instance_id, kind).await
    }

    pub fn start_monitoring(&self) {
        self.monitor.start();
    }

    pub async fn stop_monitoring(&self, grace: Duration) {
        self.monitor.stop(grace).await;
    }

    pub fn start_scaling(&self) {
        self.scaler.start();
    }

    pub async fn stop_scaling(&self, grace: Duration) {
        self.scaler.stop(grace).await;
    }

    pub fn create_group(&self, group: GroupConfig) -> ProviderGroup {
        let group = group.into_group(self.clock.now());
        self.registry.upsert_group(group.clone());
        self.scaler.start_group(group.id);
        group
    }

    pub fn list_groups(&self) -> Vec<ProviderGroup> {
        self.registry.list_groups()
    }

    pub fn get_group(&self, group_id: i64) -> Option<ProviderGroup> {
        self.registry.get_group(group_id)
    }

    pub fn reset_circuit_breaker(&self, instance_id: &str) {
        self.registry.reset_breaker(instance_id);
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.registry.breaker_snapshots()
    }

    pub fn clear_routing_cache(&self) {
        self.router.clear_cache();
    }

    pub fn router_stats(&self) -> RouterStats {
        self.router.stats()
    }

    pub fn health_report(&self, instance_id: &str) -> Option<HealthReport> {
        self.monitor.health_report(instance_id)
    }

    pub fn utilization_report(&self) -> crate::registry::UtilizationReport {
        self.registry.utilization_report()
    }

    pub async fn scaling_summary(
        &self,
        group_id: Option<i64>,
        lookback: Duration,
    ) -> Result<crate::scaler::ScalingSummary, FleetError> {
        self.scaler.scaling_summary(group_id, lookback).await
    }

    pub fn fleet_health(&self) -> FleetHealthSummary {
        self.monitor.fleet_summary()
    }

    /// Direct access for embedders that need the lower layers.
    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }
}
