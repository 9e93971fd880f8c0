//! # Intelligent Query Router
//!
//! Orchestrates the request-time decision: classify the query, fetch the
//! eligible candidates from the registry, overlay specialization knowledge,
//! apply the routing strategy, and emit a [`RoutingDecision`] carrying the
//! chosen instance, alternatives for failover, and cost/latency estimates.
//!
//! ## Strategies
//!
//! - **Performance**: delegate to the health-based selection discipline
//! - **Cost**: cheapest estimated cost for the query's token budget
//! - **Specialization**: restrict to instances whose model lists the query
//!   type among its strengths, then health-based within; falls back to
//!   performance when nothing specializes
//! - **Balanced** (default): weighted blend of specialization bonus,
//!   success rate, cost, and load headroom
//! - **RoundRobin**: per-(provider, model) rotation through the candidates
//!
//! Decisions for the scoring strategies are cached per (query type,
//! complexity, language, strategy) with a TTL; stale entries are swept
//! lazily on read. Round-robin is exempt from the cache, since serving a
//! cached choice would defeat the rotation.
//!
//! Routing is read-only with respect to durable state: it writes only the
//! in-process cache and counters.

use crate::config::RouterConfig;
use crate::registry::InstanceRegistry;
use dashmap::DashMap;
use fleetwise_core::classify::{QueryAnalysis, QueryClassifier, QueryComplexity, QueryType};
use fleetwise_core::models::{Instance, ProviderKind};
use fleetwise_core::selector::{SelectionStrategy, Selector};
use fleetwise_core::specialization::SpecializationRegistry;
use fleetwise_core::FleetError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Minimum health fraction when re-routing with relaxed constraints.
const RELAXED_MIN_HEALTH: f64 = 0.0;

/// Strategy applied on top of the candidate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    Performance,
    Cost,
    Specialization,
    Balanced,
    RoundRobin,
}

/// One routing request.
#[derive(Debug, Clone, Default)]
pub struct RouteRequest {
    pub query: String,
    pub preferred_provider: Option<ProviderKind>,
    pub strategy: Option<RoutingStrategy>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

/// The record of which instance was chosen for a query, why, and what
/// alternatives existed.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub query: String,
    pub analysis: QueryAnalysis,
    pub instance: Instance,
    pub strategy: RoutingStrategy,
    pub reason: String,
    pub confidence: f64,
    pub alternatives: Vec<Instance>,
    pub estimated_cost: f64,
    pub estimated_response_ms: f64,
    pub routing_ms: f64,
    pub cache_hit: bool,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

/// Router statistics for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub total_decisions: u64,
    pub cache_entries: usize,
    pub strategy_counts: HashMap<String, u64>,
    pub query_type_counts: HashMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    query_type: QueryType,
    complexity: QueryComplexity,
    language: String,
    strategy: RoutingStrategy,
}

struct CachedDecision {
    decision: RoutingDecision,
    inserted_at: Instant,
}

/// The router itself.
pub struct QueryRouter {
    registry: Arc<InstanceRegistry>,
    specializations: Arc<SpecializationRegistry>,
    classifier: QueryClassifier,
    selector: Selector,
    config: RouterConfig,
    cache: DashMap<CacheKey, CachedDecision>,
    strategy_counts: DashMap<RoutingStrategy, u64>,
    query_type_counts: DashMap<QueryType, u64>,
    total_decisions: std::sync::atomic::AtomicU64,
}

impl QueryRouter {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        specializations: Arc<SpecializationRegistry>,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            specializations,
            classifier: QueryClassifier::new(),
            selector: Selector::new(),
            config,
            cache: DashMap::new(),
            strategy_counts: DashMap::new(),
            query_type_counts: DashMap::new(),
            total_decisions: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Route one query under the configured minimum health.
    pub async fn route(&self, request: &RouteRequest) -> Result<RoutingDecision, FleetError> {
        self.route_with_min_health(request, self.config.min_health)
            .await
    }

    /// Route with every health constraint dropped; the higher-level fallback
    /// for a `NoCapacity` answer.
    pub async fn route_relaxed(
        &self,
        request: &RouteRequest,
    ) -> Result<RoutingDecision, FleetError> {
        self.route_with_min_health(request, RELAXED_MIN_HEALTH).await
    }

    pub async fn route_with_min_health(
        &self,
        request: &RouteRequest,
        min_health: f64,
    ) -> Result<RoutingDecision, FleetError> {
        let started = Instant::now();

        // Classification is bounded by a soft deadline; past it the query
        // routes as a generic medium-complexity request.
        let analysis = match tokio::time::timeout(self.config.routing_timeout(), async {
            self.classifier.analyze(&request.query)
        })
        .await
        {
            Ok(analysis) => analysis,
            Err(_) => {
                tracing::warn!("query classification exceeded the routing deadline");
                QueryAnalysis::fallback()
            }
        };

        let strategy = request.strategy.unwrap_or(self.config.default_strategy);

        let cache_key = CacheKey {
            query_type: analysis.query_type,
            complexity: analysis.complexity,
            language: analysis.language.clone(),
            strategy,
        };
        if strategy != RoutingStrategy::RoundRobin {
            if let Some(cached) = self.cache_lookup(&cache_key) {
                tracing::debug!(query_id = %analysis.query_id, "routing cache hit");
                return Ok(RoutingDecision {
                    query: request.query.clone(),
                    analysis,
                    cache_hit: true,
                    user_id: request.user_id.clone(),
                    session_id: request.session_id.clone(),
                    ..cached
                });
            }
        }

        let candidates =
            self.registry
                .candidates(request.preferred_provider, None, min_health);
        if candidates.is_empty() {
            return Err(FleetError::NoCapacity(format!(
                "no eligible instance for provider {:?}",
                request.preferred_provider
            )));
        }

        let (instance, reason) = self.apply_strategy(strategy, &candidates, &analysis)?;

        let alternatives: Vec<Instance> = candidates
            .iter()
            .filter(|c| c.instance_id != instance.instance_id)
            .take(self.config.max_alternatives)
            .cloned()
            .collect();

        let estimated_cost = self.estimate_cost(&instance, &analysis);
        let estimated_response_ms = self.estimate_response_ms(&instance, &analysis);
        let confidence = self.routing_confidence(&instance, &analysis);

        let decision = RoutingDecision {
            query: request.query.clone(),
            analysis,
            instance,
            strategy,
            reason,
            confidence,
            alternatives,
            estimated_cost,
            estimated_response_ms,
            routing_ms: started.elapsed().as_secs_f64() * 1000.0,
            cache_hit: false,
            user_id: request.user_id.clone(),
            session_id: request.session_id.clone(),
        };

        self.total_decisions
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        *self.strategy_counts.entry(strategy).or_insert(0) += 1;
        *self
            .query_type_counts
            .entry(decision.analysis.query_type)
            .or_insert(0) += 1;

        if strategy != RoutingStrategy::RoundRobin {
            self.cache.insert(
                cache_key,
                CachedDecision {
                    decision: decision.clone(),
                    inserted_at: Instant::now(),
                },
            );
        }

        tracing::info!(
            query_id = %decision.analysis.query_id,
            query_type = ?decision.analysis.query_type,
            instance_id = %decision.instance.instance_id,
            strategy = ?strategy,
            reason = %decision.reason,
            routing_ms = decision.routing_ms,
            "routed query"
        );

        Ok(decision)
    }

    fn cache_lookup(&self, key: &CacheKey) -> Option<RoutingDecision> {
        let expired = match self.cache.get(key) {
            Some(entry) => {
                if entry.inserted_at.elapsed() <= self.config.cache_ttl() {
                    return Some(entry.decision.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            self.cache.remove(key);
        }
        None
    }

    fn apply_strategy(
        &self,
        strategy: RoutingStrategy,
        candidates: &[Instance],
        analysis: &QueryAnalysis,
    ) -> Result<(Instance, String), FleetError> {
        match strategy {
            RoutingStrategy::Performance => self.route_by_performance(candidates),
            RoutingStrategy::Cost => Ok(self.route_by_cost(candidates, analysis)),
            RoutingStrategy::Specialization => self.route_by_specialization(candidates, analysis),
            RoutingStrategy::Balanced => Ok(self.route_balanced(candidates, analysis)),
            RoutingStrategy::RoundRobin => {
                let selection = self
                    .selector
                    .select(candidates, SelectionStrategy::RoundRobin)?;
                Ok((selection.instance, selection.reason))
            }
        }
    }

    fn route_by_performance(
        &self,
        candidates: &[Instance],
    ) -> Result<(Instance, String), FleetError> {
        let selection = self
            .selector
            .select(candidates, SelectionStrategy::HealthBased)?;
        Ok((selection.instance, selection.reason))
    }

    fn route_by_cost(&self, candidates: &[Instance], analysis: &QueryAnalysis) -> (Instance, String) {
        let chosen = candidates
            .iter()
            .fold(None::<(&Instance, f64)>, |best, candidate| {
                let cost = self.estimate_cost(candidate, analysis);
                match best {
                    None => Some((candidate, cost)),
                    Some((best_inst, best_cost)) => {
                        let better = cost < best_cost
                            || (cost == best_cost
                                && (candidate.priority > best_inst.priority
                                    || (candidate.priority == best_inst.priority
                                        && candidate.instance_id < best_inst.instance_id)));
                        if better {
                            Some((candidate, cost))
                        } else {
                            Some((best_inst, best_cost))
                        }
                    }
                }
            })
            .expect("candidates checked non-empty");

        (
            chosen.0.clone(),
            format!("Cost-based routing (estimated cost: ${:.4})", chosen.1),
        )
    }

    fn route_by_specialization(
        &self,
        candidates: &[Instance],
        analysis: &QueryAnalysis,
    ) -> Result<(Instance, String), FleetError> {
        let strong: Vec<Instance> = candidates
            .iter()
            .filter(|c| {
                self.specializations
                    .get(c.provider, &c.model)
                    .map(|s| s.is_strong_at(analysis.query_type))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        if strong.is_empty() {
            return self.route_by_performance(candidates);
        }

        let selection = self.selector.select(&strong, SelectionStrategy::HealthBased)?;
        let reason = format!(
            "Specialization-based routing (model {} excels at {:?})",
            selection.instance.model, analysis.query_type
        );
        Ok((selection.instance, reason))
    }

    fn route_balanced(&self, candidates: &[Instance], analysis: &QueryAnalysis) -> (Instance, String) {
        let score_of = |instance: &Instance| {
            let spec = self.specializations.get(instance.provider, &instance.model);
            let spec_bonus = match &spec {
                Some(s) if s.is_strong_at(analysis.query_type) => s.quality_score,
                Some(s) if s.is_weak_at(analysis.query_type) => -0.2,
                _ => 0.0,
            };
            let cost = self
                .specializations
                .cost_per_1k(instance.provider, &instance.model);

            let mut score = 0.4 * spec_bonus;
            score += 0.3 * (instance.success_rate / 100.0);
            score += 0.2 * (1.0 - cost / 0.05).max(0.0);
            score += 0.1 * (1.0 - instance.load_ratio()).max(0.0);
            score
        };

        let chosen = candidates
            .iter()
            .fold(None::<(&Instance, f64)>, |best, candidate| {
                let score = score_of(candidate);
                match best {
                    None => Some((candidate, score)),
                    Some((best_inst, best_score)) => {
                        let better = score > best_score
                            || (score == best_score
                                && (candidate.priority > best_inst.priority
                                    || (candidate.priority == best_inst.priority
                                        && candidate.instance_id < best_inst.instance_id)));
                        if better {
                            Some((candidate, score))
                        } else {
                            Some((best_inst, best_score))
                        }
                    }
                }
            })
            .expect("candidates checked non-empty");

        (
            chosen.0.clone(),
            format!("Balanced routing (score={:.3})", chosen.1),
        )
    }

    fn estimate_cost(&self, instance: &Instance, analysis: &QueryAnalysis) -> f64 {
        let cost_per_1k = self
            .specializations
            .cost_per_1k(instance.provider, &instance.model);
        f64::from(analysis.estimated_tokens) / 1000.0 * cost_per_1k
    }

    fn estimate_response_ms(&self, instance: &Instance, analysis: &QueryAnalysis) -> f64 {
        match self.specializations.get(instance.provider, &instance.model) {
            Some(spec) => {
                let complexity_multiplier =
                    1.0 + f64::from(analysis.complexity.level() - 1) * 0.2;
                let load_multiplier = 1.0 + instance.load_ratio() * 0.5;
                spec.average_response_ms * complexity_multiplier * load_multiplier
            }
            None => {
                if instance.avg_response_ms > 0.0 {
                    instance.avg_response_ms
                } else {
                    1000.0
                }
            }
        }
    }

    fn routing_confidence(&self, instance: &Instance, analysis: &QueryAnalysis) -> f64 {
        let mut confidence: f64 = 0.7;
        if self
            .specializations
            .get(instance.provider, &instance.model)
            .map(|s| s.is_strong_at(analysis.query_type))
            .unwrap_or(false)
        {
            confidence += 0.2;
        }
        if instance.is_healthy && instance.success_rate > 80.0 {
            confidence += 0.1;
        }
        confidence.min(1.0)
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn stats(&self) -> RouterStats {
        let strategy_counts = self
            .strategy_counts
            .iter()
            .map(|e| (format!("{:?}", e.key()).to_lowercase(), *e.value()))
            .collect();
        let query_type_counts = self
            .query_type_counts
            .iter()
            .map(|e| (format!("{:?}", e.key()).to_lowercase(), *e.value()))
            .collect();
        RouterStats {
            total_decisions: self
                .total_decisions
                .load(std::sync::atomic::Ordering::Relaxed),
            cache_entries: self.cache.len(),
            strategy_counts,
            query_type_counts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetwise_core::models::{
        CheckKind, HealthEvent, HealthEventStatus, RegisterInstance,
    };
    use fleetwise_core::{BreakerConfig, Clock, ManualClock, MemoryStore, Store};
    use std::collections::HashMap as StdHashMap;

    struct Fixture {
        registry: Arc<InstanceRegistry>,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let registry = Arc::new(InstanceRegistry::new(
            store.clone(),
            clock.clone(),
            BreakerConfig::default(),
        ));
        Fixture {
            registry,
            store,
            clock,
        }
    }

    fn router(fixture: &Fixture) -> QueryRouter {
        QueryRouter::new(
            fixture.registry.clone(),
            Arc::new(SpecializationRegistry::with_defaults()),
            RouterConfig::default(),
        )
    }

    fn request(id: &str, provider: ProviderKind, model: &str) -> RegisterInstance {
        RegisterInstance {
            instance_id: id.to_string(),
            provider,
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
            metadata: StdHashMap::new(),
        }
    }

    /// Register an instance and seed enough probe history to give it the
    /// requested rolling metrics.
    async fn seed_instance(
        fixture: &Fixture,
        id: &str,
        provider: ProviderKind,
        model: &str,
        healthy_events: usize,
        unhealthy_events: usize,
        response_ms: f64,
    ) {
        fixture
            .registry
            .register(request(id, provider, model))
            .await
            .unwrap();
        let now = fixture.clock.now();
        for i in 0..healthy_events + unhealthy_events {
            let healthy = i < healthy_events;
            fixture
                .store
                .append_health_event(&HealthEvent {
                    instance_id: id.to_string(),
                    status: if healthy {
                        HealthEventStatus::Healthy
                    } else {
                        HealthEventStatus::Unhealthy
                    },
                    response_ms: if healthy { Some(response_ms) } else { None },
                    error: None,
                    check_kind: CheckKind::Basic,
                    score: if healthy { 100.0 } else { 0.0 },
                    created_at: now,
                })
                .await
                .unwrap();
        }
        fixture.registry.update_rolling_metrics(id).await.unwrap();
        fixture.registry.apply_probe(id, true, false).await.unwrap();
    }

    fn balanced_query() -> RouteRequest {
        RouteRequest {
            query: "hello there".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn round_robin_cycles_through_candidates() {
        let fixture = fixture();
        for id in ["a", "b", "c"] {
            seed_instance(&fixture, id, ProviderKind::OpenAi, "gpt-4", 10, 0, 400.0).await;
        }
        let router = router(&fixture);

        let mut picks = Vec::new();
        for _ in 0..5 {
            let decision = router
                .route(&RouteRequest {
                    query: "hello there".to_string(),
                    strategy: Some(RoutingStrategy::RoundRobin),
                    ..Default::default()
                })
                .await
                .unwrap();
            picks.push(decision.instance.instance_id);
        }
        assert_eq!(picks, vec!["a", "b", "c", "a", "b"]);
    }

    #[tokio::test]
    async fn performance_prefers_the_healthier_instance() {
        let fixture = fixture();
        seed_instance(&fixture, "a", ProviderKind::OpenAi, "gpt-4", 99, 1, 400.0).await;
        seed_instance(&fixture, "b", ProviderKind::OpenAi, "gpt-4", 8, 2, 1200.0).await;
        // Put b under load.
        let _permits: Vec<_> = futures::future::join_all(
            (0..5).map(|_| fixture.registry.acquire_slot("b")),
        )
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

        let router = router(&fixture);
        let decision = router
            .route(&RouteRequest {
                query: "hello there".to_string(),
                strategy: Some(RoutingStrategy::Performance),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(decision.instance.instance_id, "a");
        assert!(decision.reason.contains("score="));
    }

    #[tokio::test]
    async fn cost_strategy_picks_the_cheapest_model() {
        let fixture = fixture();
        seed_instance(&fixture, "expensive", ProviderKind::OpenAi, "gpt-4", 10, 0, 800.0).await;
        seed_instance(
            &fixture,
            "cheap",
            ProviderKind::OpenAi,
            "gpt-3.5-turbo",
            10,
            0,
            500.0,
        )
        .await;

        let router = router(&fixture);
        let decision = router
            .route(&RouteRequest {
                query: "hello there".to_string(),
                strategy: Some(RoutingStrategy::Cost),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(decision.instance.instance_id, "cheap");
        assert!(decision.reason.contains("Cost-based"));
        assert!(decision.estimated_cost < 0.001);
    }

    #[tokio::test]
    async fn specialization_routes_chinese_queries_to_glm() {
        let fixture = fixture();
        seed_instance(&fixture, "gpt", ProviderKind::OpenAi, "gpt-4", 10, 0, 800.0).await;
        seed_instance(&fixture, "glm", ProviderKind::Zai, "glm-4", 10, 0, 600.0).await;

        let router = router(&fixture);
        let decision = router
            .route(&RouteRequest {
                query: "请帮我翻译这段文字".to_string(),
                strategy: Some(RoutingStrategy::Specialization),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(decision.instance.instance_id, "glm");
        assert!(decision.reason.contains("excels at"));
    }

    #[tokio::test]
    async fn specialization_falls_back_to_performance_without_strong_models() {
        let fixture = fixture();
        // Only a perplexity instance, which lists automation among its
        // weaknesses and claims no strength for code generation.
        seed_instance(
            &fixture,
            "pplx",
            ProviderKind::Perplexity,
            "perplexity-online",
            10,
            0,
            900.0,
        )
        .await;

        let router = router(&fixture);
        let decision = router
            .route(&RouteRequest {
                query: "Write a python function to sort a list".to_string(),
                strategy: Some(RoutingStrategy::Specialization),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(decision.instance.instance_id, "pplx");
        assert!(decision.reason.contains("score="));
    }

    #[tokio::test]
    async fn balanced_penalizes_declared_weaknesses() {
        let fixture = fixture();
        // GPT-4 lists Chinese content as a weakness; GLM lists it as a
        // strength. Identical live metrics, so the bonus decides.
        seed_instance(&fixture, "gpt", ProviderKind::OpenAi, "gpt-4", 10, 0, 800.0).await;
        seed_instance(&fixture, "glm", ProviderKind::Zai, "glm-4", 10, 0, 800.0).await;

        let router = router(&fixture);
        let decision = router
            .route(&RouteRequest {
                query: "请帮我翻译这段文字".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(decision.instance.instance_id, "glm");
        assert!(decision.reason.contains("Balanced"));
    }

    #[tokio::test]
    async fn decisions_are_cached_per_shape_and_strategy() {
        let fixture = fixture();
        seed_instance(&fixture, "a", ProviderKind::OpenAi, "gpt-4", 10, 0, 400.0).await;

        let router = router(&fixture);
        let first = router.route(&balanced_query()).await.unwrap();
        assert!(!first.cache_hit);

        let second = router.route(&balanced_query()).await.unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.instance.instance_id, first.instance.instance_id);

        router.clear_cache();
        let third = router.route(&balanced_query()).await.unwrap();
        assert!(!third.cache_hit);
    }

    #[tokio::test]
    async fn empty_candidate_set_is_no_capacity() {
        let fixture = fixture();
        let router = router(&fixture);
        let err = router.route(&balanced_query()).await.unwrap_err();
        assert!(matches!(err, FleetError::NoCapacity(_)));
    }

    #[tokio::test]
    async fn relaxed_routing_readmits_low_health_instances() {
        let fixture = fixture();
        // 2/10 probes passing: below the default 0.5 threshold.
        seed_instance(&fixture, "weak", ProviderKind::OpenAi, "gpt-4", 2, 8, 700.0).await;

        let router = router(&fixture);
        assert!(router.route(&balanced_query()).await.is_err());

        let decision = router.route_relaxed(&balanced_query()).await.unwrap();
        assert_eq!(decision.instance.instance_id, "weak");
    }

    #[tokio::test]
    async fn preferred_provider_narrows_candidates() {
        let fixture = fixture();
        seed_instance(&fixture, "gpt", ProviderKind::OpenAi, "gpt-4", 10, 0, 800.0).await;
        seed_instance(&fixture, "claude", ProviderKind::Anthropic, "claude-3-sonnet", 10, 0, 700.0)
            .await;

        let router = router(&fixture);
        let decision = router
            .route(&RouteRequest {
                query: "hello there".to_string(),
                preferred_provider: Some(ProviderKind::Anthropic),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(decision.instance.instance_id, "claude");
    }

    #[tokio::test]
    async fn alternatives_exclude_the_chosen_instance() {
        let fixture = fixture();
        for id in ["a", "b", "c", "d", "e"] {
            seed_instance(&fixture, id, ProviderKind::OpenAi, "gpt-4", 10, 0, 400.0).await;
        }

        let router = router(&fixture);
        let decision = router.route(&balanced_query()).await.unwrap();
        assert_eq!(decision.alternatives.len(), 3);
        assert!(decision
            .alternatives
            .iter()
            .all(|a| a.instance_id != decision.instance.instance_id));
    }

    #[tokio::test]
    async fn stats_count_decisions_by_strategy_and_type() {
        let fixture = fixture();
        seed_instance(&fixture, "a", ProviderKind::OpenAi, "gpt-4", 10, 0, 400.0).await;

        let router = router(&fixture);
        router.route(&balanced_query()).await.unwrap();
        router
            .route(&RouteRequest {
                query: "Write a python function".to_string(),
                strategy: Some(RoutingStrategy::Performance),
                ..Default::default()
            })
            .await
            .unwrap();

        let stats = router.stats();
        assert_eq!(stats.total_decisions, 2);
        assert_eq!(stats.strategy_counts.get("balanced"), Some(&1));
        assert_eq!(stats.strategy_counts.get("performance"), Some(&1));
    }
}
