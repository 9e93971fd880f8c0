//! Shared fixtures for the control plane integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use fleetwise_core::invoker::{InvokeOptions, Invocation, ProbeResult, Prober, UpstreamInvoker};
use fleetwise_core::models::{CheckKind, HealthEvent, HealthEventStatus, Instance, ProviderKind, RegisterInstance};
use fleetwise_core::{InvokerError, MemoryStore, Store};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Invoker with a scripted outcome queue per instance. Instances without a
/// script always succeed.
#[derive(Default)]
pub struct ScriptedInvoker {
    scripts: Mutex<HashMap<String, VecDeque<Result<(), String>>>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, instance_id: &str, outcomes: Vec<Result<(), String>>) {
        self.scripts
            .lock()
            .expect("script lock poisoned")
            .insert(instance_id.to_string(), outcomes.into());
    }

    pub fn always_fail(&self, instance_id: &str) {
        // An empty queue means success, so keep a long failure script.
        self.script(
            instance_id,
            std::iter::repeat(Err("upstream unavailable".to_string()))
                .take(64)
                .collect(),
        );
    }
}

#[async_trait]
impl UpstreamInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        instance: &Instance,
        _prompt: &str,
        _options: &InvokeOptions,
    ) -> Result<Invocation, InvokerError> {
        let outcome = self
            .scripts
            .lock()
            .expect("script lock poisoned")
            .get_mut(&instance.instance_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Ok(()));
        match outcome {
            Ok(()) => Ok(Invocation {
                text: "OK".to_string(),
                tokens_used: 12,
                response_ms: 42.0,
            }),
            Err(message) => Err(InvokerError::Api { code: 503, message }),
        }
    }
}

/// Prober that always reports a passing basic check.
pub struct HealthyProber;

#[async_trait]
impl Prober for HealthyProber {
    async fn probe(&self, _instance: &Instance, _kind: CheckKind) -> ProbeResult {
        ProbeResult {
            ok: true,
            response_ms: 120.0,
            score: 100.0,
            detail: "ok".to_string(),
        }
    }
}

pub fn register_request(id: &str, model: &str) -> RegisterInstance {
    RegisterInstance {
        instance_id: id.to_string(),
        provider: ProviderKind::OpenAi,
        model: model.to_string(),
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

/// Seed probe history so the instance carries the given success ratio.
pub async fn seed_probe_history(
    store: &MemoryStore,
    instance_id: &str,
    healthy: usize,
    unhealthy: usize,
    response_ms: f64,
) {
    let now = chrono::Utc::now();
    for i in 0..healthy + unhealthy {
        let ok = i < healthy;
        store
            .append_health_event(&HealthEvent {
                instance_id: instance_id.to_string(),
                status: if ok {
                    HealthEventStatus::Healthy
                } else {
                    HealthEventStatus::Unhealthy
                },
                response_ms: ok.then_some(response_ms),
                error: None,
                check_kind: CheckKind::Basic,
                score: if ok { 100.0 } else { 0.0 },
                created_at: now,
            })
            .await
            .unwrap();
    }
}
