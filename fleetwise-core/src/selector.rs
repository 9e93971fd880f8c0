//! # Load-Balancing Selector
//!
//! Implements the request-time placement disciplines over a candidate set
//! that has already been filtered for eligibility (active, non-maintenance,
//! healthy enough, circuit not open). Selection is pure with respect to
//! instance state: it never writes anything back, and the only internal
//! state is the per-`(provider, model)` round-robin counters, which are
//! non-persistent.
//!
//! ## Disciplines
//!
//! - **RoundRobin**: per-key monotone counter, `candidates[counter mod n]`
//! - **Weighted**: weight = priority x success_rate/100, uniform draw over
//!   the cumulative weights; priority-only weights when all rates are zero
//! - **LeastConnections**: lowest `current_load`
//! - **LeastResponseTime**: lowest measured `avg_response_ms`; first
//!   candidate when nothing has been measured yet
//! - **HealthBased**: composite score over success rate, health flag,
//!   response time, and load headroom
//! - **Random**: uniform draw
//!
//! Ties everywhere break toward higher `priority`, then lower
//! `instance_id`. Weighted and Random accept a seeded RNG so tests are
//! deterministic.

use crate::error::FleetError;
use crate::models::Instance;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Placement discipline for one selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    Weighted,
    LeastConnections,
    LeastResponseTime,
    HealthBased,
    Random,
}

/// Result of a selection: the chosen instance and a human-readable reason.
#[derive(Debug, Clone)]
pub struct Selection {
    pub instance: Instance,
    pub reason: String,
}

/// Stateless-by-contract selector over pre-filtered candidates.
pub struct Selector {
    round_robin_counters: DashMap<String, AtomicU64>,
    rng: Mutex<StdRng>,
}

impl Default for Selector {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector {
    pub fn new() -> Self {
        Self {
            round_robin_counters: DashMap::new(),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Selector with a fixed RNG seed; Weighted and Random become
    /// deterministic functions of the candidate set.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            round_robin_counters: DashMap::new(),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Pick one instance from a non-empty candidate list.
    pub fn select(
        &self,
        candidates: &[Instance],
        strategy: SelectionStrategy,
    ) -> Result<Selection, FleetError> {
        if candidates.is_empty() {
            return Err(FleetError::NoCapacity(
                "selector called with no candidates".to_string(),
            ));
        }

        let selection = match strategy {
            SelectionStrategy::RoundRobin => self.select_round_robin(candidates),
            SelectionStrategy::Weighted => self.select_weighted(candidates),
            SelectionStrategy::LeastConnections => Self::select_least_connections(candidates),
            SelectionStrategy::LeastResponseTime => Self::select_least_response_time(candidates),
            SelectionStrategy::HealthBased => Self::select_health_based(candidates),
            SelectionStrategy::Random => self.select_random(candidates),
        };
        Ok(selection)
    }

    /// Composite health score used by the HealthBased discipline and by the
    /// router's performance strategy.
    pub fn health_score(instance: &Instance) -> f64 {
        let mut score = (instance.success_rate / 100.0) * 0.4;
        if instance.is_healthy {
            score += 0.3;
        }
        if instance.avg_response_ms > 0.0 {
            score += (1.0 - instance.avg_response_ms / 5000.0).max(0.0) * 0.2;
        }
        if instance.max_concurrent > 0 {
            score += (1.0 - instance.load_ratio()).max(0.0) * 0.1;
        }
        score
    }

    fn select_round_robin(&self, candidates: &[Instance]) -> Selection {
        let key = format!("{}:{}", candidates[0].provider, candidates[0].model);
        let counter = self
            .round_robin_counters
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0));
        let index = (counter.fetch_add(1, Ordering::Relaxed) % candidates.len() as u64) as usize;

        Selection {
            instance: candidates[index].clone(),
            reason: format!("Round-robin selection (index {index})"),
        }
    }

    fn select_weighted(&self, candidates: &[Instance]) -> Selection {
        let weight_of = |i: &Instance| f64::from(i.priority) * (i.success_rate / 100.0);
        let mut total: f64 = candidates.iter().map(weight_of).sum();

        // No instance has any recorded success yet: fall back to priorities.
        let priority_only = total <= 0.0;
        if priority_only {
            total = candidates.iter().map(|i| f64::from(i.priority)).sum();
        }
        if total <= 0.0 {
            return Selection {
                instance: candidates[0].clone(),
                reason: "Weighted selection (fallback)".to_string(),
            };
        }

        let draw: f64 = {
            let mut rng = self.rng.lock().expect("selector rng lock poisoned");
            rng.gen_range(0.0..total)
        };

        let mut cumulative = 0.0;
        for instance in candidates {
            let weight = if priority_only {
                f64::from(instance.priority)
            } else {
                weight_of(instance)
            };
            cumulative += weight;
            if draw <= cumulative {
                return Selection {
                    instance: instance.clone(),
                    reason: format!("Weighted selection (weight: {weight:.2})"),
                };
            }
        }

        Selection {
            instance: candidates[0].clone(),
            reason: "Weighted selection (fallback)".to_string(),
        }
    }

    fn select_least_connections(candidates: &[Instance]) -> Selection {
        let chosen = candidates
            .iter()
            .fold(None::<&Instance>, |best, candidate| match best {
                None => Some(candidate),
                Some(best) => {
                    if prefer_min(
                        f64::from(candidate.current_load),
                        candidate,
                        f64::from(best.current_load),
                        best,
                    ) {
                        Some(candidate)
                    } else {
                        Some(best)
                    }
                }
            })
            .expect("candidates checked non-empty");

        Selection {
            instance: chosen.clone(),
            reason: format!("Least connections (load: {})", chosen.current_load),
        }
    }

    fn select_least_response_time(candidates: &[Instance]) -> Selection {
        let measured: Vec<&Instance> = candidates
            .iter()
            .filter(|i| i.avg_response_ms > 0.0)
            .collect();

        if measured.is_empty() {
            return Selection {
                instance: candidates[0].clone(),
                reason: "Least response time (no data, fallback)".to_string(),
            };
        }

        let chosen = measured
            .into_iter()
            .fold(None::<&Instance>, |best, candidate| match best {
                None => Some(candidate),
                Some(best) => {
                    if prefer_min(
                        candidate.avg_response_ms,
                        candidate,
                        best.avg_response_ms,
                        best,
                    ) {
                        Some(candidate)
                    } else {
                        Some(best)
                    }
                }
            })
            .expect("measured checked non-empty");

        Selection {
            instance: chosen.clone(),
            reason: format!("Least response time ({:.0}ms)", chosen.avg_response_ms),
        }
    }

    fn select_health_based(candidates: &[Instance]) -> Selection {
        let chosen = candidates
            .iter()
            .fold(None::<(&Instance, f64)>, |best, candidate| {
                let score = Self::health_score(candidate);
                match best {
                    None => Some((candidate, score)),
                    Some((best_inst, best_score)) => {
                        if prefer_max(score, candidate, best_score, best_inst) {
                            Some((candidate, score))
                        } else {
                            Some((best_inst, best_score))
                        }
                    }
                }
            })
            .expect("candidates checked non-empty");

        Selection {
            instance: chosen.0.clone(),
            reason: format!("Health-based selection (score={:.3})", chosen.1),
        }
    }

    fn select_random(&self, candidates: &[Instance]) -> Selection {
        let index = {
            let mut rng = self.rng.lock().expect("selector rng lock poisoned");
            rng.gen_range(0..candidates.len())
        };
        Selection {
            instance: candidates[index].clone(),
            reason: "Random selection".to_string(),
        }
    }
}

/// Tie-break rule shared by the minimizing disciplines: smaller metric wins,
/// then higher priority, then lower instance id.
fn prefer_min(
    candidate_metric: f64,
    candidate: &Instance,
    best_metric: f64,
    best: &Instance,
) -> bool {
    if candidate_metric < best_metric {
        return true;
    }
    if candidate_metric > best_metric {
        return false;
    }
    tie_break(candidate, best)
}

/// Tie-break rule shared by the maximizing disciplines: larger metric wins,
/// then higher priority, then lower instance id.
fn prefer_max(
    candidate_metric: f64,
    candidate: &Instance,
    best_metric: f64,
    best: &Instance,
) -> bool {
    if candidate_metric > best_metric {
        return true;
    }
    if candidate_metric < best_metric {
        return false;
    }
    tie_break(candidate, best)
}

fn tie_break(candidate: &Instance, best: &Instance) -> bool {
    if candidate.priority != best.priority {
        return candidate.priority > best.priority;
    }
    candidate.instance_id < best.instance_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProviderKind, RegisterInstance};
    use chrono::Utc;
    use std::collections::HashMap;

    fn instance(id: &str) -> Instance {
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
        .into_instance(Utc::now())
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let selector = Selector::new();
        let candidates = vec![instance("a"), instance("b"), instance("c")];

        let picks: Vec<String> = (0..5)
            .map(|_| {
                selector
                    .select(&candidates, SelectionStrategy::RoundRobin)
                    .unwrap()
                    .instance
                    .instance_id
            })
            .collect();

        assert_eq!(picks, vec!["a", "b", "c", "a", "b"]);
    }

    #[test]
    fn round_robin_counters_are_per_model_key() {
        let selector = Selector::new();
        let openai = vec![instance("a"), instance("b")];
        let mut claude = instance("x");
        claude.provider = ProviderKind::Anthropic;
        claude.model = "claude-3-sonnet".to_string();
        let mut claude2 = instance("y");
        claude2.provider = ProviderKind::Anthropic;
        claude2.model = "claude-3-sonnet".to_string();
        let anthropic = vec![claude, claude2];

        assert_eq!(
            selector
                .select(&openai, SelectionStrategy::RoundRobin)
                .unwrap()
                .instance
                .instance_id,
            "a"
        );
        // A different (provider, model) key starts its own cycle.
        assert_eq!(
            selector
                .select(&anthropic, SelectionStrategy::RoundRobin)
                .unwrap()
                .instance
                .instance_id,
            "x"
        );
        assert_eq!(
            selector
                .select(&openai, SelectionStrategy::RoundRobin)
                .unwrap()
                .instance
                .instance_id,
            "b"
        );
    }

    #[test]
    fn least_connections_picks_lowest_load() {
        let selector = Selector::new();
        let mut a = instance("a");
        a.current_load = 5;
        let mut b = instance("b");
        b.current_load = 2;

        let selection = selector
            .select(&[a, b], SelectionStrategy::LeastConnections)
            .unwrap();
        assert_eq!(selection.instance.instance_id, "b");
        assert!(selection.reason.contains("load: 2"));
    }

    #[test]
    fn least_connections_ties_break_on_priority_then_id() {
        let selector = Selector::new();
        let mut a = instance("a");
        a.current_load = 3;
        let mut b = instance("b");
        b.current_load = 3;
        b.priority = 5;

        let selection = selector
            .select(&[a.clone(), b.clone()], SelectionStrategy::LeastConnections)
            .unwrap();
        assert_eq!(selection.instance.instance_id, "b");

        // Equal priority: the lexicographically smaller id wins.
        b.priority = a.priority;
        let selection = selector
            .select(&[b, a], SelectionStrategy::LeastConnections)
            .unwrap();
        assert_eq!(selection.instance.instance_id, "a");
    }

    #[test]
    fn least_response_time_ignores_unmeasured_unless_all_are() {
        let selector = Selector::new();
        let a = instance("a"); // no latency data
        let mut b = instance("b");
        b.avg_response_ms = 900.0;
        let mut c = instance("c");
        c.avg_response_ms = 400.0;

        let selection = selector
            .select(
                &[a.clone(), b, c],
                SelectionStrategy::LeastResponseTime,
            )
            .unwrap();
        assert_eq!(selection.instance.instance_id, "c");

        let selection = selector
            .select(&[a], SelectionStrategy::LeastResponseTime)
            .unwrap();
        assert_eq!(selection.instance.instance_id, "a");
        assert!(selection.reason.contains("fallback"));
    }

    #[test]
    fn health_based_prefers_fast_healthy_unloaded() {
        let selector = Selector::new();
        let mut a = instance("a");
        a.success_rate = 99.0;
        a.current_load = 0;
        a.avg_response_ms = 400.0;
        a.is_healthy = true;
        let mut b = instance("b");
        b.success_rate = 80.0;
        b.current_load = 5;
        b.avg_response_ms = 1200.0;
        b.is_healthy = true;

        let selection = selector
            .select(&[a, b], SelectionStrategy::HealthBased)
            .unwrap();
        assert_eq!(selection.instance.instance_id, "a");
        assert!(selection.reason.contains("score="));
    }

    #[test]
    fn health_based_is_deterministic_for_fixed_state() {
        let selector = Selector::new();
        let mut a = instance("a");
        a.success_rate = 90.0;
        a.is_healthy = true;
        let mut b = instance("b");
        b.success_rate = 70.0;
        b.is_healthy = true;
        let candidates = vec![a, b];

        let first = selector
            .select(&candidates, SelectionStrategy::HealthBased)
            .unwrap();
        for _ in 0..10 {
            let again = selector
                .select(&candidates, SelectionStrategy::HealthBased)
                .unwrap();
            assert_eq!(again.instance.instance_id, first.instance.instance_id);
        }
    }

    #[test]
    fn weighted_is_deterministic_with_seed() {
        let mut a = instance("a");
        a.success_rate = 90.0;
        a.priority = 3;
        let mut b = instance("b");
        b.success_rate = 50.0;
        let candidates = vec![a, b];

        let first: Vec<String> = {
            let selector = Selector::with_seed(7);
            (0..8)
                .map(|_| {
                    selector
                        .select(&candidates, SelectionStrategy::Weighted)
                        .unwrap()
                        .instance
                        .instance_id
                })
                .collect()
        };
        let second: Vec<String> = {
            let selector = Selector::with_seed(7);
            (0..8)
                .map(|_| {
                    selector
                        .select(&candidates, SelectionStrategy::Weighted)
                        .unwrap()
                        .instance
                        .instance_id
                })
                .collect()
        };
        assert_eq!(first, second);
    }

    #[test]
    fn weighted_falls_back_to_priority_when_rates_are_zero() {
        let selector = Selector::with_seed(1);
        let mut a = instance("a");
        a.priority = 0;
        let mut b = instance("b");
        b.priority = 10;

        // Every draw lands on the only instance with weight.
        for _ in 0..5 {
            let selection = selector
                .select(&[a.clone(), b.clone()], SelectionStrategy::Weighted)
                .unwrap();
            assert_eq!(selection.instance.instance_id, "b");
        }
    }

    #[test]
    fn empty_candidates_is_no_capacity() {
        let selector = Selector::new();
        let err = selector
            .select(&[], SelectionStrategy::RoundRobin)
            .unwrap_err();
        assert!(matches!(err, FleetError::NoCapacity(_)));
    }
}
