//! # Fleetwise Control
//!
//! The orchestration layer of the Fleetwise control plane. It composes the
//! substrate from `fleetwise-core` into a running fleet manager:
//!
//! - **`registry`**: the authoritative live view of fleet members, their
//!   circuit breakers, and the admission gauges
//! - **`router`**: query classification, candidate filtering, and strategy
//!   overlay into a routing decision
//! - **`failover`**: bounded retry across alternatives with breaker and
//!   load bookkeeping on every path
//! - **`health`**: per-instance probe loops and status transitions
//! - **`scaler`**: per-group evaluation loops issuing auditable scaling
//!   events under cooldowns and bounds
//! - **`retention`**: the periodic sweep of aged event rows
//! - **`config`**: TOML configuration with validation
//! - **`plane`**: the composition root exposing the request and admin
//!   surfaces
//!
//! ## Quick start
//!
//! ```rust
//! use fleetwise_control::config::ControlPlaneConfig;
//! use fleetwise_control::plane::ControlPlane;
//! use fleetwise_core::{HttpInvoker, MemoryStore, SyntheticProber, SystemClock};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = ControlPlaneConfig::load("fleetwise.toml")?;
//! let invoker = Arc::new(HttpInvoker::new());
//! let plane = ControlPlane::new(
//!     config,
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(SystemClock),
//!     invoker.clone(),
//!     Arc::new(SyntheticProber::new(invoker)),
//! );
//! plane.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod failover;
pub mod health;
pub mod plane;
pub mod registry;
pub mod retention;
pub mod router;
pub mod scaler;

pub use config::ControlPlaneConfig;
pub use failover::{ExecutionOutcome, FailoverExecutor};
pub use health::{FleetHealthSummary, HealthLevel, HealthMonitor, HealthReport};
pub use plane::ControlPlane;
pub use registry::{
    InstanceMetricsWindow, InstanceRegistry, InstanceUtilization, LoadPermit, UtilizationReport,
};
pub use retention::{RetentionReport, RetentionSweeper};
pub use router::{QueryRouter, RouteRequest, RouterStats, RoutingDecision, RoutingStrategy};
pub use scaler::{AutoScaler, ScalingSignals, ScalingSummary};
