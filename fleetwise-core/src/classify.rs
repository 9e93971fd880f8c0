//! # Query Classifier
//!
//! Analyzes an incoming query and produces the [`QueryAnalysis`] the router
//! bases its policy on: query type, complexity, language, a token budget
//! estimate, and requirement flags.
//!
//! ## Decision procedure
//!
//! Each pattern set votes for its query type (every match counts); the
//! presence of Han ideographs adds two extra votes for Chinese content so
//! that mixed translation prompts classify deterministically. The
//! highest-voted type wins, falling back to `General` when nothing matched.
//!
//! Complexity is voted from the query length bucket, question words
//! ("why"/"how" lean medium), and analytical verbs (lean high, double
//! weight); ties resolve toward the lower level.
//!
//! Classification is a pure function of the query text and the static
//! pattern sets: no I/O, no suspension, and repeated runs agree on every
//! derived field.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Instant;
use uuid::Uuid;

/// Query classification types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    /// Basic single-turn Q&A
    SimpleQa,
    /// Multi-step reasoning and analysis
    ComplexReasoning,
    /// Programming tasks
    CodeGeneration,
    /// Creative content
    CreativeWriting,
    /// Data processing and math
    DataAnalysis,
    Translation,
    Summarization,
    Research,
    /// Chinese language content
    ChineseContent,
    /// Image and document analysis
    Multimodal,
    /// Device automation tasks
    Automation,
    General,
}

/// Query complexity levels, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryComplexity {
    VeryLow = 1,
    Low = 2,
    Medium = 3,
    High = 4,
    VeryHigh = 5,
}

impl QueryComplexity {
    pub fn level(self) -> u8 {
        self as u8
    }
}

/// Result of query analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAnalysis {
    pub query_id: String,
    pub query_type: QueryType,
    pub complexity: QueryComplexity,
    /// Advisory; does not gate routing by itself
    pub language: String,
    /// Token budget for prompt plus response, never below 50
    pub estimated_tokens: u32,
    pub requires_code: bool,
    pub requires_reasoning: bool,
    pub requires_creativity: bool,
    pub requires_data_analysis: bool,
    pub requires_automation: bool,
    pub confidence: f64,
    pub processing_ms: f64,
}

impl QueryAnalysis {
    /// Minimal analysis used when classification does not finish inside the
    /// routing deadline.
    pub fn fallback() -> Self {
        Self {
            query_id: Uuid::new_v4().simple().to_string(),
            query_type: QueryType::General,
            complexity: QueryComplexity::Medium,
            language: "english".to_string(),
            estimated_tokens: 100,
            requires_code: false,
            requires_reasoning: false,
            requires_creativity: false,
            requires_data_analysis: false,
            requires_automation: false,
            confidence: 0.5,
            processing_ms: 0.0,
        }
    }
}

struct TypePatterns {
    query_type: QueryType,
    patterns: Vec<Regex>,
}

fn type_patterns() -> &'static [TypePatterns] {
    static PATTERNS: OnceLock<Vec<TypePatterns>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let set = |query_type, patterns: &[&str]| TypePatterns {
            query_type,
            patterns: patterns
                .iter()
                .map(|p| Regex::new(p).expect("static pattern must compile"))
                .collect(),
        };
        vec![
            set(
                QueryType::CodeGeneration,
                &[
                    r"(?i)\b(code|program|function|script|algorithm|debug)\b",
                    r"(?i)\b(python|java|javascript|cpp|html|css)\b",
                    r"(?i)\b(for|while|if.*else|def|class|import)\b",
                    r"(?i)\b(write.*code|create.*function|implement)\b",
                ],
            ),
            set(
                QueryType::ChineseContent,
                &[r"[\u{4e00}-\u{9fff}]", r"中文|汉语|汉字"],
            ),
            set(
                QueryType::Translation,
                &[
                    r"(?i)\b(translate|translation)\b|翻译|译成",
                    r"(?i)\b(from.*to|in.*language)\b",
                ],
            ),
            set(
                QueryType::DataAnalysis,
                &[
                    r"(?i)\b(analyze|calculate|compute|statistics|graph)\b",
                    r"(?i)\b(data|numbers|percentage|average)\b",
                    r"(?i)\b(chart|plot|visualize)\b",
                ],
            ),
            set(
                QueryType::CreativeWriting,
                &[
                    r"(?i)\b(write|create|story|poem|creative)\b",
                    r"(?i)\b(imagine|design|compose|draft)\b",
                ],
            ),
            set(
                QueryType::Summarization,
                &[
                    r"(?i)\b(summarize|summary|brief|concise)\b",
                    r"(?i)\b(in.*short|key.*points|overview)\b",
                ],
            ),
            set(
                QueryType::Research,
                &[
                    r"(?i)\b(research|study|investigate|find.*information)\b",
                    r"(?i)\b(recent|latest|current.*state|survey)\b",
                ],
            ),
            set(
                QueryType::Automation,
                &[
                    r"(?i)\b(automation|adb|android|app.*test)\b",
                    r"(?i)\b(tap|swipe|click|scroll|screenshot)\b",
                    r"(?i)\bmobile.*automation\b",
                ],
            ),
        ]
    })
}

fn cjk_pattern() -> &'static Regex {
    static CJK: OnceLock<Regex> = OnceLock::new();
    CJK.get_or_init(|| Regex::new(r"[\u{4e00}-\u{9fff}]").expect("static pattern must compile"))
}

fn question_pattern() -> &'static Regex {
    static QUESTION: OnceLock<Regex> = OnceLock::new();
    QUESTION.get_or_init(|| Regex::new(r"(?i)\b(why|how)\b").expect("static pattern must compile"))
}

fn analytical_pattern() -> &'static Regex {
    static ANALYTICAL: OnceLock<Regex> = OnceLock::new();
    ANALYTICAL.get_or_init(|| {
        Regex::new(r"(?i)\b(analyze|evaluate|compare|synthesize)\b")
            .expect("static pattern must compile")
    })
}

fn code_pattern() -> &'static Regex {
    static CODE: OnceLock<Regex> = OnceLock::new();
    CODE.get_or_init(|| {
        Regex::new(r"(?i)\b(code|program|function|script)\b").expect("static pattern must compile")
    })
}

fn creative_pattern() -> &'static Regex {
    static CREATIVE: OnceLock<Regex> = OnceLock::new();
    CREATIVE.get_or_init(|| {
        Regex::new(r"(?i)\b(create|design|imagine|story|poem)\b")
            .expect("static pattern must compile")
    })
}

fn data_pattern() -> &'static Regex {
    static DATA: OnceLock<Regex> = OnceLock::new();
    DATA.get_or_init(|| {
        Regex::new(r"(?i)\b(analyze|calculate|statistics|data)\b")
            .expect("static pattern must compile")
    })
}

fn automation_pattern() -> &'static Regex {
    static AUTOMATION: OnceLock<Regex> = OnceLock::new();
    AUTOMATION.get_or_init(|| {
        Regex::new(r"(?i)\b(automation|adb|android|tap|swipe)\b")
            .expect("static pattern must compile")
    })
}

/// Pure query analyzer over the static pattern sets.
#[derive(Debug, Default, Clone, Copy)]
pub struct QueryClassifier;

impl QueryClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a raw query.
    pub fn analyze(&self, query: &str) -> QueryAnalysis {
        let started = Instant::now();

        let query_type = classify_type(query);
        let complexity = classify_complexity(query);
        let estimated_tokens = estimate_tokens(query);
        let language = detect_language(query);

        let requires_code =
            query_type == QueryType::CodeGeneration || code_pattern().is_match(query);
        let requires_reasoning = complexity >= QueryComplexity::Medium
            || matches!(
                query_type,
                QueryType::ComplexReasoning | QueryType::Research
            )
            || analytical_pattern().is_match(query)
            || question_pattern().is_match(query);
        let requires_creativity =
            query_type == QueryType::CreativeWriting || creative_pattern().is_match(query);
        let requires_data_analysis =
            query_type == QueryType::DataAnalysis || data_pattern().is_match(query);
        let requires_automation =
            query_type == QueryType::Automation || automation_pattern().is_match(query);

        let mut confidence: f64 = 0.7;
        if query_type != QueryType::General {
            confidence += 0.2;
        }
        if query.len() > 50 {
            confidence += 0.1;
        }

        QueryAnalysis {
            query_id: Uuid::new_v4().simple().to_string(),
            query_type,
            complexity,
            language,
            estimated_tokens,
            requires_code,
            requires_reasoning,
            requires_creativity,
            requires_data_analysis,
            requires_automation,
            confidence: confidence.min(1.0),
            processing_ms: started.elapsed().as_secs_f64() * 1000.0,
        }
    }
}

fn classify_type(query: &str) -> QueryType {
    let mut best = QueryType::General;
    let mut best_votes = 0usize;

    for set in type_patterns() {
        let mut votes: usize = set
            .patterns
            .iter()
            .map(|p| p.find_iter(query).count())
            .sum();
        // Han ideographs push mixed prompts toward Chinese content.
        if set.query_type == QueryType::ChineseContent && cjk_pattern().is_match(query) {
            votes += 2;
        }
        if votes > best_votes {
            best_votes = votes;
            best = set.query_type;
        }
    }

    if best_votes >= 1 {
        best
    } else {
        QueryType::General
    }
}

fn classify_complexity(query: &str) -> QueryComplexity {
    use QueryComplexity::*;

    let mut votes = [0u32; 5];
    let vote = |votes: &mut [u32; 5], level: QueryComplexity, weight: u32| {
        votes[level.level() as usize - 1] += weight;
    };

    let length_bucket = match query.len() {
        0..=20 => VeryLow,
        21..=100 => Low,
        101..=300 => Medium,
        301..=600 => High,
        _ => VeryHigh,
    };
    vote(&mut votes, length_bucket, 1);

    if question_pattern().is_match(query) {
        vote(&mut votes, Medium, 1);
    }
    if analytical_pattern().is_match(query) {
        vote(&mut votes, High, 2);
    }

    // Ties resolve toward the lower level.
    let (winner, _) = votes
        .iter()
        .enumerate()
        .fold((0usize, 0u32), |(best_idx, best_votes), (idx, &v)| {
            if v > best_votes {
                (idx, v)
            } else {
                (best_idx, best_votes)
            }
        });
    match winner {
        0 => VeryLow,
        1 => Low,
        2 => Medium,
        3 => High,
        _ => VeryHigh,
    }
}

/// Rough budget: ~4 chars per token for English, ~1.5 for Chinese, times 2.5
/// to leave room for the response.
fn estimate_tokens(query: &str) -> u32 {
    let cjk_chars = cjk_pattern().find_iter(query).count();
    let total_chars = query.chars().count();
    let english_chars = total_chars.saturating_sub(cjk_chars);

    let prompt_tokens = (english_chars as f64 / 4.0 + cjk_chars as f64 / 1.5).ceil();
    let budget = (prompt_tokens * 2.5) as u32;
    budget.max(50)
}

fn detect_language(query: &str) -> String {
    let cjk_chars = cjk_pattern().find_iter(query).count();
    let non_space: usize = query.chars().filter(|c| !c.is_whitespace()).count();
    if cjk_chars as f64 / non_space.max(1) as f64 > 0.3 {
        "chinese".to_string()
    } else {
        "english".to_string()
    }
}
