//! Retention sweeper.
//!
//! Periodically deletes health events, request logs, and scaling events
//! older than the configured horizon so the durable store does not grow
//! without bound.

use crate::config::RetentionConfig;
use chrono::Duration as ChronoDuration;
use fleetwise_core::{Clock, FleetError, RecordKind, Store};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Counts removed by one sweep.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RetentionReport {
    pub health_events_deleted: u64,
    pub request_logs_deleted: u64,
    pub scaling_events_deleted: u64,
}

pub struct RetentionSweeper {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: RetentionConfig,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: RetentionConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            clock,
            config,
            task: std::sync::Mutex::new(None),
            shutdown,
        }
    }

    /// Delete everything older than the horizon, once.
    pub async fn run_once(&self) -> Result<RetentionReport, FleetError> {
        let before = self.clock.now() - ChronoDuration::days(self.config.days);
        let report = RetentionReport {
            health_events_deleted: self.store.delete_old(RecordKind::HealthEvents, before).await?,
            request_logs_deleted: self.store.delete_old(RecordKind::RequestLogs, before).await?,
            scaling_events_deleted: self
                .store
                .delete_old(RecordKind::ScalingEvents, before)
                .await?,
        };
        tracing::info!(
            health_events = report.health_events_deleted,
            request_logs = report.request_logs_deleted,
            scaling_events = report.scaling_events_deleted,
            horizon_days = self.config.days,
            "retention sweep completed"
        );
        Ok(report)
    }

    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().expect("sweeper task lock poisoned");
        if task.is_some() {
            return;
        }
        let sweeper = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let mut shutdown = sweeper.shutdown.subscribe();
            loop {
                if *shutdown.borrow_and_update() {
                    break;
                }
                if let Err(e) = sweeper.run_once().await {
                    tracing::error!(error = %e, "retention sweep failed");
                }
                sweeper.clock.sleep(sweeper.config.sweep_interval()).await;
            }
        }));
    }

    pub async fn stop(&self, grace: Duration) {
        let _ = self.shutdown.send(true);
        self.clock.sleep(grace).await;
        if let Some(handle) = self.task.lock().expect("sweeper task lock poisoned").take() {
            handle.abort();
        }
    }
}
