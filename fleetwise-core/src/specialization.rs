//! # Model Specialization Registry
//!
//! Static, reloadable knowledge about which (provider, model) pairs excel or
//! struggle at which query types, plus their cost and quality profile. The
//! router overlays this knowledge on live instance state when applying the
//! specialization and balanced strategies.
//!
//! Consumers are read-only and must tolerate missing entries: an unknown
//! model is simply "no specialization" with the default cost.

use crate::classify::QueryType;
use crate::models::ProviderKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Cost assumed for models without a specialization entry, per 1k tokens.
pub const DEFAULT_COST_PER_1K_TOKENS: f64 = 0.01;

/// Capability profile of one (provider, model) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpecialization {
    pub provider: ProviderKind,
    pub model: String,
    pub strengths: Vec<QueryType>,
    pub weaknesses: Vec<QueryType>,
    pub cost_per_1k_tokens: f64,
    pub average_response_ms: f64,
    /// Quality in `[0, 1]`
    pub quality_score: f64,
    pub max_tokens: u32,
    pub supports_streaming: bool,
    pub supports_functions: bool,
}

impl ModelSpecialization {
    pub fn is_strong_at(&self, query_type: QueryType) -> bool {
        self.strengths.contains(&query_type)
    }

    pub fn is_weak_at(&self, query_type: QueryType) -> bool {
        self.weaknesses.contains(&query_type)
    }
}

/// Lookup of model capability profiles, keyed by (provider, model).
///
/// May be reloaded live via [`SpecializationRegistry::replace_all`]; readers
/// always see a consistent snapshot.
pub struct SpecializationRegistry {
    inner: RwLock<HashMap<(ProviderKind, String), ModelSpecialization>>,
}

impl Default for SpecializationRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl SpecializationRegistry {
    pub fn empty() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Registry seeded with the built-in capability profiles.
    pub fn with_defaults() -> Self {
        let registry = Self::empty();
        for spec in default_specializations() {
            registry.insert(spec);
        }
        registry
    }

    pub fn insert(&self, spec: ModelSpecialization) {
        self.inner
            .write()
            .expect("specialization lock poisoned")
            .insert((spec.provider, spec.model.clone()), spec);
    }

    /// Swap the whole profile set, e.g. on configuration reload.
    pub fn replace_all(&self, specs: Vec<ModelSpecialization>) {
        let mut inner = self.inner.write().expect("specialization lock poisoned");
        inner.clear();
        for spec in specs {
            inner.insert((spec.provider, spec.model.clone()), spec);
        }
    }

    pub fn get(&self, provider: ProviderKind, model: &str) -> Option<ModelSpecialization> {
        self.inner
            .read()
            .expect("specialization lock poisoned")
            .get(&(provider, model.to_string()))
            .cloned()
    }

    /// Cost per 1k tokens for the pair, defaulting when unknown.
    pub fn cost_per_1k(&self, provider: ProviderKind, model: &str) -> f64 {
        self.get(provider, model)
            .map(|s| s.cost_per_1k_tokens)
            .unwrap_or(DEFAULT_COST_PER_1K_TOKENS)
    }

    /// Profiles listing `query_type` among their strengths, best first
    /// (higher quality, then cheaper).
    pub fn best_for(&self, query_type: QueryType) -> Vec<ModelSpecialization> {
        let inner = self.inner.read().expect("specialization lock poisoned");
        let mut suitable: Vec<ModelSpecialization> = inner
            .values()
            .filter(|s| s.is_strong_at(query_type))
            .cloned()
            .collect();
        suitable.sort_by(|a, b| {
            b.quality_score
                .partial_cmp(&a.quality_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    a.cost_per_1k_tokens
                        .partial_cmp(&b.cost_per_1k_tokens)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });
        suitable
    }
}

fn default_specializations() -> Vec<ModelSpecialization> {
    vec![
        // GLM-4: strongest on Chinese content.
        ModelSpecialization {
            provider: ProviderKind::Zai,
            model: "glm-4".to_string(),
            strengths: vec![
                QueryType::ChineseContent,
                QueryType::General,
                QueryType::SimpleQa,
            ],
            weaknesses: vec![QueryType::CodeGeneration, QueryType::Multimodal],
            cost_per_1k_tokens: 0.01,
            average_response_ms: 800.0,
            quality_score: 0.85,
            max_tokens: 8000,
            supports_streaming: true,
            supports_functions: false,
        },
        // GPT-4: general reasoning and code.
        ModelSpecialization {
            provider: ProviderKind::OpenAi,
            model: "gpt-4".to_string(),
            strengths: vec![
                QueryType::ComplexReasoning,
                QueryType::CodeGeneration,
                QueryType::DataAnalysis,
                QueryType::Research,
            ],
            weaknesses: vec![QueryType::ChineseContent],
            cost_per_1k_tokens: 0.03,
            average_response_ms: 1200.0,
            quality_score: 0.95,
            max_tokens: 8000,
            supports_streaming: true,
            supports_functions: true,
        },
        // GPT-3.5: cost-effective for simple tasks.
        ModelSpecialization {
            provider: ProviderKind::OpenAi,
            model: "gpt-3.5-turbo".to_string(),
            strengths: vec![
                QueryType::SimpleQa,
                QueryType::Translation,
                QueryType::Summarization,
            ],
            weaknesses: vec![QueryType::ComplexReasoning, QueryType::CodeGeneration],
            cost_per_1k_tokens: 0.002,
            average_response_ms: 600.0,
            quality_score: 0.80,
            max_tokens: 4000,
            supports_streaming: true,
            supports_functions: true,
        },
        // Claude: analysis and creative writing.
        ModelSpecialization {
            provider: ProviderKind::Anthropic,
            model: "claude-3-sonnet".to_string(),
            strengths: vec![
                QueryType::ComplexReasoning,
                QueryType::CreativeWriting,
                QueryType::DataAnalysis,
                QueryType::Research,
            ],
            weaknesses: vec![QueryType::ChineseContent],
            cost_per_1k_tokens: 0.015,
            average_response_ms: 1000.0,
            quality_score: 0.92,
            max_tokens: 4000,
            supports_streaming: false,
            supports_functions: true,
        },
        // Perplexity: research and current information.
        ModelSpecialization {
            provider: ProviderKind::Perplexity,
            model: "perplexity-online".to_string(),
            strengths: vec![QueryType::Research, QueryType::DataAnalysis],
            weaknesses: vec![QueryType::CodeGeneration, QueryType::Automation],
            cost_per_1k_tokens: 0.02,
            average_response_ms: 2000.0,
            quality_score: 0.88,
            max_tokens: 4000,
            supports_streaming: false,
            supports_functions: false,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_entries_fall_back_to_default_cost() {
        let registry = SpecializationRegistry::with_defaults();
        assert!(registry.get(ProviderKind::OpenAi, "gpt-99").is_none());
        assert_eq!(
            registry.cost_per_1k(ProviderKind::OpenAi, "gpt-99"),
            DEFAULT_COST_PER_1K_TOKENS
        );
    }

    #[test]
    fn best_for_sorts_by_quality_then_cost() {
        let registry = SpecializationRegistry::with_defaults();
        let best = registry.best_for(QueryType::ComplexReasoning);
        assert_eq!(best[0].model, "gpt-4");
        assert_eq!(best[1].model, "claude-3-sonnet");
    }

    #[test]
    fn replace_all_swaps_the_profile_set() {
        let registry = SpecializationRegistry::with_defaults();
        assert!(registry.get(ProviderKind::OpenAi, "gpt-4").is_some());

        registry.replace_all(vec![ModelSpecialization {
            provider: ProviderKind::OpenAi,
            model: "gpt-5".to_string(),
            strengths: vec![QueryType::General],
            weaknesses: vec![],
            cost_per_1k_tokens: 0.05,
            average_response_ms: 900.0,
            quality_score: 0.99,
            max_tokens: 16_000,
            supports_streaming: true,
            supports_functions: true,
        }]);

        assert!(registry.get(ProviderKind::OpenAi, "gpt-4").is_none());
        assert!(registry.get(ProviderKind::OpenAi, "gpt-5").is_some());
    }

    #[test]
    fn chinese_content_prefers_glm() {
        let registry = SpecializationRegistry::with_defaults();
        let best = registry.best_for(QueryType::ChineseContent);
        assert_eq!(best[0].model, "glm-4");
    }
}
