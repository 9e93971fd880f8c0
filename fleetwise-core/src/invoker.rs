//! # Upstream Invoker and Prober
//!
//! The control plane talks to every upstream endpoint through two small
//! capabilities:
//!
//! - [`UpstreamInvoker`]: run one prompt against one instance, returning the
//!   text, token usage, and latency. Per-provider request shaping (auth
//!   header placement, message schema) lives entirely inside the adapter;
//!   the rest of the system treats providers uniformly.
//! - [`Prober`]: run a synthetic request of a given [`CheckKind`] against an
//!   instance, returning a scored [`ProbeResult`] that drives health state.
//!
//! [`HttpInvoker`] is the bundled adapter. It speaks the Anthropic messages
//! shape (`x-api-key`, `/messages`) and the OpenAI-compatible chat shape
//! (bearer token, `/chat/completions`) used by the other providers, and
//! resolves credentials from the environment variable named by the
//! instance's `credential_ref`.
//!
//! [`SyntheticProber`] implements the four probe kinds over any invoker
//! with fixed prompts and the bucketed scoring the health monitor expects.

use crate::error::InvokerError;
use crate::models::{CheckKind, Instance, ProviderKind};
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-invocation overrides; unset fields fall back to instance defaults.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub system: Option<String>,
    pub timeout: Option<Duration>,
}

/// Outcome of one upstream invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub text: String,
    pub tokens_used: u32,
    pub response_ms: f64,
}

/// Uniform capability for calling an upstream model endpoint.
#[async_trait]
pub trait UpstreamInvoker: Send + Sync {
    async fn invoke(
        &self,
        instance: &Instance,
        prompt: &str,
        options: &InvokeOptions,
    ) -> Result<Invocation, InvokerError>;
}

/// Result of one synthetic probe.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub ok: bool,
    pub response_ms: f64,
    /// Health score in `[0, 100]`
    pub score: f64,
    pub detail: String,
}

impl ProbeResult {
    fn failed(response_ms: f64, detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            response_ms,
            score: 0.0,
            detail: detail.into(),
        }
    }
}

/// Capability for running synthetic checks against an instance.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, instance: &Instance, kind: CheckKind) -> ProbeResult;
}

/// HTTP adapter over the two wire shapes the fleet speaks.
pub struct HttpInvoker {
    client: reqwest::Client,
}

impl Default for HttpInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpInvoker {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn resolve_credential(instance: &Instance) -> Result<Option<String>, InvokerError> {
        match &instance.credential_ref {
            None => Ok(None),
            Some(var) => std::env::var(var)
                .map(Some)
                .map_err(|_| InvokerError::MissingCredential(var.clone())),
        }
    }

    fn parse_anthropic(body: &Value) -> Result<(String, u32), InvokerError> {
        let text = body["content"][0]["text"]
            .as_str()
            .ok_or_else(|| InvokerError::InvalidResponse("missing content[0].text".to_string()))?
            .to_string();
        let tokens = body["usage"]["input_tokens"].as_u64().unwrap_or(0)
            + body["usage"]["output_tokens"].as_u64().unwrap_or(0);
        Ok((text, tokens as u32))
    }

    fn parse_openai(body: &Value) -> Result<(String, u32), InvokerError> {
        let text = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                InvokerError::InvalidResponse("missing choices[0].message.content".to_string())
            })?
            .to_string();
        let tokens = body["usage"]["total_tokens"].as_u64().unwrap_or(0);
        Ok((text, tokens as u32))
    }
}

#[async_trait]
impl UpstreamInvoker for HttpInvoker {
    async fn invoke(
        &self,
        instance: &Instance,
        prompt: &str,
        options: &InvokeOptions,
    ) -> Result<Invocation, InvokerError> {
        let credential = Self::resolve_credential(instance)?;
        let timeout = options
            .timeout
            .unwrap_or_else(|| Duration::from_secs(instance.timeout_secs));
        let max_tokens = options.max_tokens.unwrap_or(instance.max_tokens);
        let temperature = options.temperature.unwrap_or(instance.temperature);

        let base = instance.endpoint_url.trim_end_matches('/');
        let started = Instant::now();

        let request = match instance.provider {
            ProviderKind::Anthropic => {
                let mut request = self
                    .client
                    .post(format!("{base}/messages"))
                    .header("anthropic-version", "2023-06-01")
                    .timeout(timeout);
                if let Some(key) = &credential {
                    request = request.header("x-api-key", key);
                }
                request.json(&json!({
                    "model": instance.model,
                    "messages": [{"role": "user", "content": prompt}],
                    "max_tokens": max_tokens,
                }))
            }
            _ => {
                // OpenAI-compatible shape, shared by the remaining providers.
                let mut messages = Vec::new();
                if let Some(system) = &options.system {
                    messages.push(json!({"role": "system", "content": system}));
                }
                messages.push(json!({"role": "user", "content": prompt}));

                let mut request = self
                    .client
                    .post(format!("{base}/chat/completions"))
                    .timeout(timeout);
                if let Some(key) = &credential {
                    request = request.bearer_auth(key);
                }
                request.json(&json!({
                    "model": instance.model,
                    "messages": messages,
                    "temperature": temperature,
                    "max_tokens": max_tokens,
                }))
            }
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                InvokerError::Timeout
            } else {
                InvokerError::Http(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(InvokerError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let body: Value = response.json().await?;
        let (text, tokens_used) = match instance.provider {
            ProviderKind::Anthropic => Self::parse_anthropic(&body)?,
            _ => Self::parse_openai(&body)?,
        };

        Ok(Invocation {
            text,
            tokens_used,
            response_ms: started.elapsed().as_secs_f64() * 1000.0,
        })
    }
}

const BASIC_PROMPT: &str = "Health check: respond with 'OK'";
const LATENCY_PROMPT: &str = "Quick health check: respond with 'FAST'";
const LOAD_PROMPT: &str = "Load test: respond with a brief confirmation";
const REASONING_PROMPT: &str = "Solve this simple math: What is 15 + 27?";
const SHORT_RESPONSE_PROMPT: &str = "Generate a short response (under 50 words)";

/// Probe implementation driving fixed synthetic prompts through an invoker.
pub struct SyntheticProber {
    invoker: Arc<dyn UpstreamInvoker>,
}

impl SyntheticProber {
    pub fn new(invoker: Arc<dyn UpstreamInvoker>) -> Self {
        Self { invoker }
    }

    fn probe_options() -> InvokeOptions {
        InvokeOptions {
            temperature: Some(0.1),
            max_tokens: Some(10),
            system: Some("Health check - respond briefly.".to_string()),
            timeout: None,
        }
    }

    async fn basic(&self, instance: &Instance) -> ProbeResult {
        let started = Instant::now();
        match self
            .invoker
            .invoke(instance, BASIC_PROMPT, &Self::probe_options())
            .await
        {
            Ok(invocation) => {
                let response_ms = started.elapsed().as_secs_f64() * 1000.0;
                if invocation.text.to_uppercase().contains("OK") {
                    ProbeResult {
                        ok: true,
                        response_ms,
                        score: 100.0,
                        detail: "basic check passed".to_string(),
                    }
                } else {
                    ProbeResult::failed(
                        response_ms,
                        format!("unexpected response: {}", invocation.text),
                    )
                }
            }
            Err(e) => ProbeResult::failed(started.elapsed().as_secs_f64() * 1000.0, e.to_string()),
        }
    }

    async fn latency(&self, instance: &Instance) -> ProbeResult {
        let mut latencies = Vec::with_capacity(3);
        let started = Instant::now();

        for i in 0..3 {
            let attempt = Instant::now();
            match self
                .invoker
                .invoke(instance, LATENCY_PROMPT, &Self::probe_options())
                .await
            {
                Ok(_) => latencies.push(attempt.elapsed().as_secs_f64() * 1000.0),
                Err(e) => {
                    return ProbeResult::failed(
                        started.elapsed().as_secs_f64() * 1000.0,
                        format!("latency probe {} failed: {e}", i + 1),
                    );
                }
            }
            if i < 2 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        let max = latencies.iter().cloned().fold(0.0f64, f64::max);
        if max > 10_000.0 {
            return ProbeResult::failed(
                started.elapsed().as_secs_f64() * 1000.0,
                format!("latency too high: {max:.0}ms"),
            );
        }

        let avg = latencies.iter().sum::<f64>() / latencies.len() as f64;
        let score = if avg < 500.0 {
            100.0
        } else if avg < 1000.0 {
            80.0
        } else if avg < 2000.0 {
            60.0
        } else if avg < 5000.0 {
            40.0
        } else {
            20.0
        };

        ProbeResult {
            ok: true,
            response_ms: avg,
            score,
            detail: format!("avg latency {avg:.0}ms over {} probes", latencies.len()),
        }
    }

    async fn load(&self, instance: &Instance) -> ProbeResult {
        let headroom = instance.max_concurrent.saturating_sub(instance.current_load);
        let concurrency = headroom.min(5) as usize;
        if concurrency == 0 {
            return ProbeResult::failed(0.0, "instance at maximum capacity".to_string());
        }

        let started = Instant::now();
        let probes = (0..concurrency).map(|i| {
            let prompt = format!("{LOAD_PROMPT} {}", i + 1);
            let invoker = Arc::clone(&self.invoker);
            let instance = instance.clone();
            async move {
                invoker
                    .invoke(&instance, &prompt, &Self::probe_options())
                    .await
            }
        });
        let outcomes = join_all(probes).await;
        let total_ms = started.elapsed().as_secs_f64() * 1000.0;

        let succeeded = outcomes.iter().filter(|o| o.is_ok()).count();
        let success_rate = succeeded as f64 / outcomes.len() as f64 * 100.0;

        if success_rate < 50.0 {
            return ProbeResult::failed(
                total_ms,
                format!("load test failed: {success_rate:.1}% success rate"),
            );
        }

        let score = if success_rate >= 95.0 {
            100.0
        } else if success_rate >= 80.0 {
            80.0
        } else if success_rate >= 60.0 {
            60.0
        } else {
            40.0
        };

        ProbeResult {
            ok: true,
            response_ms: total_ms,
            score,
            detail: format!(
                "{succeeded}/{} concurrent probes succeeded",
                outcomes.len()
            ),
        }
    }

    async fn comprehensive(&self, instance: &Instance) -> ProbeResult {
        let started = Instant::now();
        let mut scores = Vec::with_capacity(3);

        let basic = self.basic(instance).await;
        scores.push(basic.score);

        match self
            .invoker
            .invoke(instance, REASONING_PROMPT, &Self::probe_options())
            .await
        {
            Ok(invocation) => {
                scores.push(if invocation.text.contains("42") {
                    100.0
                } else {
                    50.0
                });
            }
            Err(_) => scores.push(0.0),
        }

        match self
            .invoker
            .invoke(instance, SHORT_RESPONSE_PROMPT, &Self::probe_options())
            .await
        {
            Ok(invocation) => {
                scores.push(if invocation.tokens_used <= 200 {
                    100.0
                } else {
                    70.0
                });
            }
            Err(_) => scores.push(0.0),
        }

        let overall = scores.iter().sum::<f64>() / scores.len() as f64;
        let response_ms = started.elapsed().as_secs_f64() * 1000.0;

        let (ok, detail) = if overall >= 80.0 {
            (true, format!("comprehensive check healthy ({overall:.0})"))
        } else if overall >= 60.0 {
            (true, format!("comprehensive check degraded ({overall:.0})"))
        } else {
            (
                false,
                format!("comprehensive check unhealthy ({overall:.0})"),
            )
        };

        ProbeResult {
            ok,
            response_ms,
            score: overall,
            detail,
        }
    }
}

#[async_trait]
impl Prober for SyntheticProber {
    async fn probe(&self, instance: &Instance, kind: CheckKind) -> ProbeResult {
        match kind {
            CheckKind::Basic => self.basic(instance).await,
            CheckKind::Latency => self.latency(instance).await,
            CheckKind::Load => self.load(instance).await,
            CheckKind::Comprehensive => self.comprehensive(instance).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RegisterInstance;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn instance(provider: ProviderKind, endpoint: &str) -> Instance {
        RegisterInstance {
            instance_id: "probe-target".to_string(),
            provider,
            model: match provider {
                ProviderKind::Anthropic => "claude-3-sonnet".to_string(),
                _ => "gpt-4".to_string(),
            },
            name: "probe target".to_string(),
            endpoint_url: endpoint.to_string(),
            credential_ref: None,
            region: None,
            version: None,
            max_concurrent: 10,
            max_tokens_per_minute: 10_000,
            temperature: 0.7,
            max_tokens: 1000,
            timeout_secs: 5,
            priority: 1,
            tags: vec![],
            metadata: HashMap::new(),
        }
        .into_instance(Utc::now())
    }

    /// Invoker that returns canned responses, optionally failing every call.
    struct CannedInvoker {
        text: String,
        tokens: u32,
        fail: bool,
        calls: AtomicUsize,
    }

    impl CannedInvoker {
        fn ok(text: &str, tokens: u32) -> Self {
            Self {
                text: text.to_string(),
                tokens,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                text: String::new(),
                tokens: 0,
                fail: true,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl UpstreamInvoker for CannedInvoker {
        async fn invoke(
            &self,
            _instance: &Instance,
            _prompt: &str,
            _options: &InvokeOptions,
        ) -> Result<Invocation, InvokerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(InvokerError::Api {
                    code: 503,
                    message: "unavailable".to_string(),
                });
            }
            Ok(Invocation {
                text: self.text.clone(),
                tokens_used: self.tokens,
                response_ms: 50.0,
            })
        }
    }

    #[tokio::test]
    async fn openai_shape_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "OK"}}],
                "usage": {"total_tokens": 7}
            })))
            .mount(&server)
            .await;

        let invoker = HttpInvoker::new();
        let target = instance(ProviderKind::OpenAi, &server.uri());
        let invocation = invoker
            .invoke(&target, "ping", &InvokeOptions::default())
            .await
            .unwrap();
        assert_eq!(invocation.text, "OK");
        assert_eq!(invocation.tokens_used, 7);
    }

    #[tokio::test]
    async fn anthropic_shape_uses_messages_route_and_version_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("anthropic-version", "2023-06-01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{"type": "text", "text": "OK"}],
                "usage": {"input_tokens": 4, "output_tokens": 3}
            })))
            .mount(&server)
            .await;

        let invoker = HttpInvoker::new();
        let target = instance(ProviderKind::Anthropic, &server.uri());
        let invocation = invoker
            .invoke(&target, "ping", &InvokeOptions::default())
            .await
            .unwrap();
        assert_eq!(invocation.text, "OK");
        assert_eq!(invocation.tokens_used, 7);
    }

    #[tokio::test]
    async fn upstream_error_surfaces_status_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let invoker = HttpInvoker::new();
        let target = instance(ProviderKind::OpenAi, &server.uri());
        let err = invoker
            .invoke(&target, "ping", &InvokeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, InvokerError::Api { code: 429, .. }));
    }

    #[tokio::test]
    async fn basic_probe_requires_ok_in_response() {
        let target = instance(ProviderKind::OpenAi, "http://unused");

        let prober = SyntheticProber::new(Arc::new(CannedInvoker::ok("OK", 5)));
        let result = prober.probe(&target, CheckKind::Basic).await;
        assert!(result.ok);
        assert_eq!(result.score, 100.0);

        let prober = SyntheticProber::new(Arc::new(CannedInvoker::ok("sorry, no", 5)));
        let result = prober.probe(&target, CheckKind::Basic).await;
        assert!(!result.ok);
    }

    #[tokio::test]
    async fn latency_probe_scores_fast_responses_high() {
        let target = instance(ProviderKind::OpenAi, "http://unused");
        let prober = SyntheticProber::new(Arc::new(CannedInvoker::ok("FAST", 2)));
        let result = prober.probe(&target, CheckKind::Latency).await;
        assert!(result.ok);
        assert_eq!(result.score, 100.0);
    }

    #[tokio::test]
    async fn load_probe_fails_without_headroom() {
        let mut target = instance(ProviderKind::OpenAi, "http://unused");
        target.current_load = target.max_concurrent;

        let prober = SyntheticProber::new(Arc::new(CannedInvoker::ok("fine", 2)));
        let result = prober.probe(&target, CheckKind::Load).await;
        assert!(!result.ok);
        assert!(result.detail.contains("capacity"));
    }

    #[tokio::test]
    async fn load_probe_caps_concurrency_at_five() {
        let target = instance(ProviderKind::OpenAi, "http://unused");
        let invoker = Arc::new(CannedInvoker::ok("fine", 2));
        let prober = SyntheticProber::new(invoker.clone());

        let result = prober.probe(&target, CheckKind::Load).await;
        assert!(result.ok);
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn comprehensive_probe_averages_sub_scores() {
        let target = instance(ProviderKind::OpenAi, "http://unused");

        // "OK" satisfies basic, contains no "42", and is short: 100 + 50 +
        // 100 over three checks.
        let prober = SyntheticProber::new(Arc::new(CannedInvoker::ok("OK", 5)));
        let result = prober.probe(&target, CheckKind::Comprehensive).await;
        assert!(result.ok);
        assert!((result.score - 83.3).abs() < 1.0);

        let prober = SyntheticProber::new(Arc::new(CannedInvoker::failing()));
        let result = prober.probe(&target, CheckKind::Comprehensive).await;
        assert!(!result.ok);
        assert_eq!(result.score, 0.0);
    }
}
