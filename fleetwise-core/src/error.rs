//! # Error Taxonomy
//!
//! This module defines the structured error types for the control plane.
//! Every core operation returns `Result<T, FleetError>`; the error kind, not
//! an exception class, drives handling. The one place retries happen
//! automatically is the failover executor, which keys off
//! [`FleetError::is_retriable`].
//!
//! ## Error Categories
//!
//! - **Configuration**: caller-side misuse (unknown provider, missing
//!   credential, inverted bounds); the request is rejected
//! - **NoCapacity**: no eligible instance survived the health and circuit
//!   filters; callers may retry with relaxed constraints
//! - **InstanceFailure**: one upstream attempt failed; feeds the circuit
//!   breaker and failover, surfaced only when all alternatives are exhausted
//! - **CircuitOpen**: fast-fail on a gated call; treated like an instance
//!   failure for failover purposes
//! - **ProbeFailure**: a synthetic check failed; never reaches the request
//!   path
//! - **Store**: durable-layer failure; the current operation aborts and
//!   in-memory registry state is rolled back
//! - **DeadlineExceeded** / **Cancelled**: cooperative termination of the
//!   current attempt
//!
//! Nothing in the control plane panics; unexpected conditions are logged and
//! translated to `Store` or `Internal`.

use thiserror::Error;

/// Structured control-plane error.
#[derive(Debug, Error)]
pub enum FleetError {
    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No eligible instance for the requested provider/model under the
    /// current health and circuit filters
    #[error("no capacity: {0}")]
    NoCapacity(String),

    /// A single upstream attempt failed
    #[error("instance failure on {instance_id}: {detail}")]
    InstanceFailure { instance_id: String, detail: String },

    /// The instance's circuit breaker rejected the call
    #[error("circuit open for {instance_id}")]
    CircuitOpen { instance_id: String },

    /// A synthetic probe failed
    #[error("probe failure on {instance_id}: {detail}")]
    ProbeFailure { instance_id: String, detail: String },

    /// The durable store failed; the operation was aborted
    #[error("store error: {0}")]
    Store(String),

    /// The operation's deadline elapsed
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The operation was cancelled by shutdown
    #[error("cancelled")]
    Cancelled,

    /// A record that was expected to exist does not
    #[error("not found: {0}")]
    NotFound(String),

    /// Anything that should not happen
    #[error("internal error: {0}")]
    Internal(String),
}

impl FleetError {
    /// Whether another attempt against a different instance can reasonably
    /// succeed. Drives the failover executor; everything else handles or
    /// propagates.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            FleetError::InstanceFailure { .. }
                | FleetError::CircuitOpen { .. }
                | FleetError::DeadlineExceeded(_)
        )
    }
}

/// Upstream adapter errors, local to one invocation.
///
/// Converted into [`FleetError::InstanceFailure`] at the executor boundary so
/// the rest of the control plane never sees transport details.
#[derive(Debug, Error)]
pub enum InvokerError {
    /// HTTP transport or connection error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream returned a non-success status
    #[error("api error: {code} - {message}")]
    Api { code: u16, message: String },

    /// The credential reference could not be resolved
    #[error("missing credential: {0}")]
    MissingCredential(String),

    /// The upstream response did not parse
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Response body failed to deserialize
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The invocation's own deadline elapsed
    #[error("timeout")]
    Timeout,
}
