//! Deterministic keyword-based prompt analysis
//!
//! Used whenever the remote classifier is unavailable, slow, or returns
//! something unparseable. Identical prompts always produce identical
//! analyses.

use std::collections::{BTreeMap, BTreeSet};

use super::types::{AnalysisSource, Category, Complexity, PromptAnalysis};
use crate::registry::{BackendConfig, SpecializationProfile};
use crate::strategy;

/// Keyword density is multiplied by this before clamping to 1.0
const DENSITY_SCALE: f64 = 5.0;

/// Second-best score must reach this for a prompt to count as mixed
const MIXED_FLOOR: f64 = 0.3;

/// Mixed score as a multiple of the second-best category score
const MIXED_FACTOR: f64 = 1.5;

/// Score conversational prompts get even without greeting keywords
const CONVERSATIONAL_BASELINE: f64 = 0.1;

/// Share of the affinity taken from the category-specific profile score
const CATEGORY_BONUS: f64 = 0.2;

/// Token-count upper bounds (exclusive) for simple, moderate, and complex
const COMPLEXITY_BUCKETS: [usize; 3] = [12, 40, 120];

const CREATIVE_KEYWORDS: &[&str] = &[
    "story", "poem", "poetry", "write", "imagine", "creative", "fiction", "novel",
    "character", "song", "lyrics", "brainstorm", "invent", "narrative", "plot",
    "fantasy", "metaphor", "slogan", "tagline", "script", "dialogue", "describe",
    "compose", "haiku", "essay", "dragon", "artistic",
];

const TECHNICAL_KEYWORDS: &[&str] = &[
    "code", "function", "bug", "error", "compile", "compiler", "rust", "python",
    "javascript", "typescript", "java", "api", "database", "sql", "algorithm",
    "implement", "debug", "deploy", "server", "class", "struct", "library",
    "framework", "fix", "refactor", "test", "kubernetes", "docker", "http",
    "async", "thread", "memory", "performance", "query", "regex", "script",
];

const REASONING_KEYWORDS: &[&str] = &[
    "analyze", "analyse", "analysis", "compare", "why", "explain", "evaluate",
    "reason", "prove", "calculate", "tradeoff", "tradeoffs", "pros", "cons",
    "strategy", "data", "statistics", "assess", "implications", "cause",
    "impact", "versus", "vs", "difference", "logic", "evidence", "solve",
    "derive", "estimate", "critique",
];

const CONVERSATIONAL_KEYWORDS: &[&str] = &[
    "hi", "hello", "hey", "thanks", "thank", "chat", "howdy", "morning",
    "evening", "you", "feel", "favorite", "opinion",
];

const TOPIC_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "coding",
        &[
            "code", "function", "compile", "rust", "python", "javascript", "typescript",
            "debug", "refactor", "api", "struct", "class", "regex",
        ],
    ),
    (
        strategy::MATHEMATICS_TOPIC,
        &[
            "math", "mathematics", "equation", "integral", "derivative", "theorem",
            "proof", "prove", "algebra", "calculus", "matrix", "probability", "calculate",
        ],
    ),
    (
        "writing",
        &["story", "poem", "essay", "novel", "lyrics", "script", "haiku", "blog"],
    ),
    (
        "research",
        &["research", "study", "paper", "literature", "sources", "evidence", "survey"],
    ),
    (
        "data",
        &["data", "dataset", "statistics", "csv", "chart", "regression", "metrics"],
    ),
    (
        "business",
        &["market", "revenue", "startup", "pricing", "customer", "sales", "roi"],
    ),
];

/// Split a prompt into lowercase alphanumeric tokens
pub fn tokenize(prompt: &str) -> Vec<String> {
    prompt
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn keyword_score(tokens: &[String], keywords: &[&str]) -> f64 {
    if tokens.is_empty() {
        return 0.0;
    }
    let matches = tokens
        .iter()
        .filter(|t| keywords.contains(&t.as_str()))
        .count();
    (matches as f64 / tokens.len() as f64 * DENSITY_SCALE).min(1.0)
}

/// Complexity bucket for a token count
pub fn complexity_for(token_count: usize) -> Complexity {
    let [simple, moderate, complex] = COMPLEXITY_BUCKETS;
    if token_count < simple {
        Complexity::Simple
    } else if token_count < moderate {
        Complexity::Moderate
    } else if token_count < complex {
        Complexity::Complex
    } else {
        Complexity::Expert
    }
}

/// Affinity of a backend profile for a prompt with the given signals
///
/// The base is the profile averaged over the creative/technical/reasoning
/// signals; a share of the category-specific score is blended in on top.
pub fn affinity(
    profile: &SpecializationProfile,
    creativity: f64,
    technical: f64,
    reasoning: f64,
    category: Category,
) -> f64 {
    let mass = creativity + technical + reasoning;
    let base = if mass > 0.0 {
        (creativity * profile.creative
            + technical * profile.technical
            + reasoning * profile.reasoning)
            / mass
    } else {
        profile.conversational
    };
    ((1.0 - CATEGORY_BONUS) * base + CATEGORY_BONUS * profile.score_for(category)).clamp(0.0, 1.0)
}

/// Affinities of every backend for the given signals
pub fn affinities(
    backends: &[&BackendConfig],
    creativity: f64,
    technical: f64,
    reasoning: f64,
    category: Category,
) -> BTreeMap<String, f64> {
    backends
        .iter()
        .map(|b| {
            (
                b.id.clone(),
                affinity(&b.specialization, creativity, technical, reasoning, category),
            )
        })
        .collect()
}

/// Topics whose keyword group appears in the tokens
pub fn detect_topics(tokens: &[String]) -> BTreeSet<String> {
    TOPIC_KEYWORDS
        .iter()
        .filter(|(_, keywords)| tokens.iter().any(|t| keywords.contains(&t.as_str())))
        .map(|(topic, _)| topic.to_string())
        .collect()
}

/// Pick the category with the highest score; ties go to the earlier entry of
/// [`Category::PRIORITY`]. Returns the category and its margin over the runner-up.
fn pick_category(
    creativity: f64,
    technical: f64,
    reasoning: f64,
    conversational: f64,
) -> (Category, f64) {
    let mut signals = [creativity, technical, reasoning];
    signals.sort_by(|a, b| b.total_cmp(a));
    let second = signals[1];
    let mixed = if second >= MIXED_FLOOR {
        (second * MIXED_FACTOR).min(1.0)
    } else {
        0.0
    };
    let conversational = conversational.max(CONVERSATIONAL_BASELINE);

    let score_of = |category: Category| match category {
        Category::Technical => technical,
        Category::Creative => creativity,
        Category::Analytical => reasoning,
        Category::Mixed => mixed,
        Category::Conversational => conversational,
    };

    let mut best = Category::PRIORITY[0];
    for category in Category::PRIORITY.iter().skip(1) {
        if score_of(*category) > score_of(best) {
            best = *category;
        }
    }

    let runner_up = Category::PRIORITY
        .iter()
        .filter(|c| **c != best)
        .map(|c| score_of(*c))
        .fold(0.0_f64, f64::max);

    (best, score_of(best) - runner_up)
}

/// Analyze a prompt with keyword heuristics only
pub fn analyze(prompt: &str, backends: &[&BackendConfig]) -> PromptAnalysis {
    let tokens = tokenize(prompt);

    let creativity = keyword_score(&tokens, CREATIVE_KEYWORDS);
    let technical = keyword_score(&tokens, TECHNICAL_KEYWORDS);
    let reasoning = keyword_score(&tokens, REASONING_KEYWORDS);
    let conversational = keyword_score(&tokens, CONVERSATIONAL_KEYWORDS);

    let (category, margin) = pick_category(creativity, technical, reasoning, conversational);
    let complexity = complexity_for(tokens.len());
    let topics = detect_topics(&tokens);
    let (suggested_strategy, _) = strategy::suggest(category, complexity, &topics);

    PromptAnalysis {
        category,
        complexity,
        creativity,
        technical,
        reasoning,
        per_backend_affinity: affinities(backends, creativity, technical, reasoning, category),
        topics,
        suggested_strategy,
        estimated_duration_ms: complexity.estimated_duration().as_millis() as u64,
        confidence: (0.5 + margin / 2.0).clamp(0.3, 0.9),
        source: AnalysisSource::Heuristic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Strategy;

    fn backends() -> Vec<BackendConfig> {
        vec![
            BackendConfig::new("coder", "http://c", "m")
                .with_specialization(SpecializationProfile::new(0.3, 0.95, 0.7, 0.4)),
            BackendConfig::new("writer", "http://w", "m")
                .with_specialization(SpecializationProfile::new(0.95, 0.3, 0.5, 0.7)),
        ]
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("Fix my Rust-code, please!"),
            vec!["fix", "my", "rust", "code", "please"]
        );
        assert!(tokenize("  ...  ").is_empty());
    }

    #[test]
    fn test_technical_prompt() {
        let configs = backends();
        let refs: Vec<&BackendConfig> = configs.iter().collect();
        let analysis = analyze("fix this rust compile error in my function", &refs);

        assert_eq!(analysis.category, Category::Technical);
        assert_eq!(analysis.complexity, Complexity::Simple);
        assert!(analysis.has_topic("coding"));
        assert_eq!(analysis.suggested_strategy, Strategy::Parallel);
        assert!(analysis.affinity("coder").unwrap() > analysis.affinity("writer").unwrap());
        assert_eq!(analysis.source, AnalysisSource::Heuristic);
    }

    #[test]
    fn test_creative_prompt() {
        let configs = backends();
        let refs: Vec<&BackendConfig> = configs.iter().collect();
        let analysis = analyze("write a short story about a dragon", &refs);

        assert_eq!(analysis.category, Category::Creative);
        assert!(analysis.affinity("writer").unwrap() > analysis.affinity("coder").unwrap());
    }

    #[test]
    fn test_empty_prompt_is_conversational_simple() {
        let analysis = analyze("", &[]);
        assert_eq!(analysis.category, Category::Conversational);
        assert_eq!(analysis.complexity, Complexity::Simple);
        assert!(analysis.per_backend_affinity.is_empty());
    }

    #[test]
    fn test_tie_prefers_technical_over_creative() {
        let (category, margin) = pick_category(0.25, 0.25, 0.0, 0.0);
        assert_eq!(category, Category::Technical);
        assert!(margin.abs() < 1e-9);
    }

    #[test]
    fn test_mixed_when_two_signals_are_strong() {
        let (category, _) = pick_category(0.0, 0.9, 0.7, 0.0);
        assert_eq!(category, Category::Mixed);

        let (category, _) = pick_category(0.0, 0.9, 0.2, 0.0);
        assert_eq!(category, Category::Technical);
    }

    #[test]
    fn test_complexity_buckets() {
        assert_eq!(complexity_for(0), Complexity::Simple);
        assert_eq!(complexity_for(11), Complexity::Simple);
        assert_eq!(complexity_for(12), Complexity::Moderate);
        assert_eq!(complexity_for(40), Complexity::Complex);
        assert_eq!(complexity_for(500), Complexity::Expert);
    }

    #[test]
    fn test_affinity_in_unit_range() {
        let profile = SpecializationProfile::new(1.0, 1.0, 1.0, 1.0);
        for category in Category::PRIORITY {
            let value = affinity(&profile, 1.0, 1.0, 1.0, category);
            assert!((0.0..=1.0).contains(&value));
        }
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let configs = backends();
        let refs: Vec<&BackendConfig> = configs.iter().collect();
        let prompt = "compare the tradeoffs of async rust versus threads for a server";
        assert_eq!(analyze(prompt, &refs), analyze(prompt, &refs));
    }
}
