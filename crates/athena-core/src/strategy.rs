//! Aggregation strategies and the fixed strategy rule table

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::analysis::{Category, Complexity};

/// Policy for combining backend outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// All backends concurrently, outputs concatenated
    Parallel,
    /// One backend after another, each seeing the previous output
    Sequential,
    /// All backends concurrently, agreement-weighted merge
    Consensus,
    /// All backends concurrently, merged by recommendation weights
    Weighted,
    /// Parallel, stopping early once one response is good enough
    Adaptive,
}

impl Strategy {
    pub const ALL: [Strategy; 5] = [
        Strategy::Parallel,
        Strategy::Sequential,
        Strategy::Consensus,
        Strategy::Weighted,
        Strategy::Adaptive,
    ];

    /// Whether every backend is dispatched up front
    pub fn is_concurrent(&self) -> bool {
        !matches!(self, Self::Sequential)
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parallel => write!(f, "parallel"),
            Self::Sequential => write!(f, "sequential"),
            Self::Consensus => write!(f, "consensus"),
            Self::Weighted => write!(f, "weighted"),
            Self::Adaptive => write!(f, "adaptive"),
        }
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "parallel" => Ok(Self::Parallel),
            "sequential" => Ok(Self::Sequential),
            "consensus" => Ok(Self::Consensus),
            "weighted" => Ok(Self::Weighted),
            "adaptive" => Ok(Self::Adaptive),
            _ => Err(format!("Unknown strategy: {}", s)),
        }
    }
}

/// The rule of the strategy table that produced a choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyRule {
    TechnicalComplex,
    TechnicalSimple,
    Mathematical,
    Creative,
    Analytical,
    ExpertComplexity,
    DefaultHighComplexity,
    DefaultLowComplexity,
}

impl StrategyRule {
    /// Short human-readable description used in decision traces
    pub fn describe(&self) -> &'static str {
        match self {
            Self::TechnicalComplex => "technical prompt with high complexity",
            Self::TechnicalSimple => "technical prompt with low complexity",
            Self::Mathematical => "mathematics topic detected",
            Self::Creative => "creative prompt",
            Self::Analytical => "analytical prompt",
            Self::ExpertComplexity => "expert complexity",
            Self::DefaultHighComplexity => "default rule, complexity above midpoint",
            Self::DefaultLowComplexity => "default rule, complexity at or below midpoint",
        }
    }
}

/// Topic that routes prompts to consensus
pub const MATHEMATICS_TOPIC: &str = "mathematics";

/// Apply the fixed rule table
///
/// Category rules are checked before the complexity rules so that a
/// technical prompt of high complexity resolves to weighted rather than
/// consensus.
pub fn suggest(
    category: Category,
    complexity: Complexity,
    topics: &BTreeSet<String>,
) -> (Strategy, StrategyRule) {
    if category == Category::Technical {
        return if complexity.is_high() {
            (Strategy::Weighted, StrategyRule::TechnicalComplex)
        } else {
            (Strategy::Parallel, StrategyRule::TechnicalSimple)
        };
    }
    if topics.contains(MATHEMATICS_TOPIC) {
        return (Strategy::Consensus, StrategyRule::Mathematical);
    }
    match category {
        Category::Creative => return (Strategy::Parallel, StrategyRule::Creative),
        Category::Analytical => return (Strategy::Weighted, StrategyRule::Analytical),
        _ => {}
    }
    if complexity == Complexity::Expert {
        return (Strategy::Consensus, StrategyRule::ExpertComplexity);
    }
    if complexity.is_high() {
        (Strategy::Weighted, StrategyRule::DefaultHighComplexity)
    } else {
        (Strategy::Parallel, StrategyRule::DefaultLowComplexity)
    }
}
