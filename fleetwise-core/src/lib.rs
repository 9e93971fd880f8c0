//! # Fleetwise Core
//!
//! Substrate of the Fleetwise control plane: the domain records, contracts,
//! and pure machinery that the orchestration layer composes into a running
//! fleet manager.
//!
//! ## Overview
//!
//! This crate provides:
//! - **Domain records** ([`models`]): instances, provider groups, health
//!   events, request logs, scaling events
//! - **Error taxonomy** ([`error`]): structured outcomes with retriability
//! - **Store contract** ([`store`]): the persistence boundary plus an
//!   in-memory reference implementation
//! - **Clock** ([`clock`]): injectable time for deterministic scheduling
//! - **Upstream access** ([`invoker`]): the invoker and prober capabilities,
//!   an HTTP adapter, and the synthetic prober
//! - **Circuit breakers** ([`breaker`]): per-instance three-state gates
//! - **Selection** ([`selector`]): the load-balancing disciplines
//! - **Query analysis** ([`classify`]): type/complexity/language
//!   classification with token budgeting
//! - **Capability knowledge** ([`specialization`]): which models excel at
//!   which query types, with cost and quality profiles
//!
//! Nothing in this crate spawns tasks or owns a loop; that belongs to the
//! `fleetwise-control` crate. Everything here is either pure or a small
//! concurrent data structure, which keeps the interesting logic testable
//! without a running fleet.

pub mod breaker;
pub mod classify;
pub mod clock;
pub mod error;
pub mod invoker;
pub mod models;
pub mod selector;
pub mod specialization;
pub mod store;

pub use breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use classify::{QueryAnalysis, QueryClassifier, QueryComplexity, QueryType};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{FleetError, InvokerError};
pub use invoker::{
    HttpInvoker, InvokeOptions, Invocation, ProbeResult, Prober, SyntheticProber, UpstreamInvoker,
};
pub use models::{
    CheckKind, HealthEvent, HealthEventStatus, Instance, InstanceFilter, InstanceStatus, Page,
    ProviderGroup, ProviderKind, RegisterInstance, RequestLog, RequestStatus, ScalingEvent,
    ScalingEventKind, ScalingEventStatus, ScalingTrigger,
};
pub use selector::{Selection, SelectionStrategy, Selector};
pub use specialization::{
    ModelSpecialization, SpecializationRegistry, DEFAULT_COST_PER_1K_TOKENS,
};
pub use store::{MemoryStore, RecordKind, Store};
