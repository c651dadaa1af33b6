//! Types produced by prompt analysis

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::registry::BackendId;
use crate::strategy::Strategy;

/// Broad category of a prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Creative,
    Technical,
    Analytical,
    Conversational,
    Mixed,
}

impl Category {
    /// All categories in tie-break priority order (highest priority first)
    pub const PRIORITY: [Category; 5] = [
        Category::Technical,
        Category::Creative,
        Category::Analytical,
        Category::Mixed,
        Category::Conversational,
    ];
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creative => write!(f, "creative"),
            Self::Technical => write!(f, "technical"),
            Self::Analytical => write!(f, "analytical"),
            Self::Conversational => write!(f, "conversational"),
            Self::Mixed => write!(f, "mixed"),
        }
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "creative" => Ok(Self::Creative),
            "technical" => Ok(Self::Technical),
            "analytical" => Ok(Self::Analytical),
            "conversational" => Ok(Self::Conversational),
            "mixed" => Ok(Self::Mixed),
            _ => Err(format!("Unknown prompt category: {}", s)),
        }
    }
}

/// Classification of prompt complexity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    /// Short factual questions, greetings
    Simple,
    /// Standard requests with some context
    Moderate,
    /// Multi-part requests, design questions
    Complex,
    /// Long, specialized, or open-ended research-grade requests
    Expert,
}

impl Complexity {
    /// Whether the complexity is above the midpoint of the scale
    pub fn is_high(&self) -> bool {
        matches!(self, Self::Complex | Self::Expert)
    }

    /// Rough wall-clock estimate for answering a prompt of this complexity
    pub fn estimated_duration(&self) -> Duration {
        match self {
            Self::Simple => Duration::from_secs(5),
            Self::Moderate => Duration::from_secs(10),
            Self::Complex => Duration::from_secs(20),
            Self::Expert => Duration::from_secs(40),
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simple => write!(f, "simple"),
            Self::Moderate => write!(f, "moderate"),
            Self::Complex => write!(f, "complex"),
            Self::Expert => write!(f, "expert"),
        }
    }
}

impl std::str::FromStr for Complexity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "simple" => Ok(Self::Simple),
            "moderate" | "medium" => Ok(Self::Moderate),
            "complex" => Ok(Self::Complex),
            "expert" => Ok(Self::Expert),
            _ => Err(format!("Unknown complexity level: {}", s)),
        }
    }
}

/// Which path produced an analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSource {
    Classifier,
    Heuristic,
}

/// Result of analyzing one prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptAnalysis {
    pub category: Category,
    pub complexity: Complexity,
    /// Creative signal in [0, 1]
    pub creativity: f64,
    /// Technical signal in [0, 1]
    pub technical: f64,
    /// Reasoning signal in [0, 1]
    pub reasoning: f64,
    /// Affinity of each backend for this prompt, in [0, 1]
    pub per_backend_affinity: BTreeMap<BackendId, f64>,
    pub topics: BTreeSet<String>,
    pub suggested_strategy: Strategy,
    /// Estimated wall-clock time to answer, in milliseconds
    pub estimated_duration_ms: u64,
    /// How sure the analyzer is about the category, in [0, 1]
    pub confidence: f64,
    pub source: AnalysisSource,
}

impl PromptAnalysis {
    /// Affinity of a backend, if the analysis scored it
    pub fn affinity(&self, backend_id: &str) -> Option<f64> {
        self.per_backend_affinity.get(backend_id).copied()
    }

    /// Whether a topic was detected
    pub fn has_topic(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }

    pub fn estimated_duration(&self) -> Duration {
        Duration::from_millis(self.estimated_duration_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_parse() {
        assert_eq!("Technical".parse::<Category>().unwrap(), Category::Technical);
        assert_eq!(" mixed ".parse::<Category>().unwrap(), Category::Mixed);
        assert!("coding".parse::<Category>().is_err());
    }

    #[test]
    fn test_complexity_parse_accepts_medium_alias() {
        assert_eq!("medium".parse::<Complexity>().unwrap(), Complexity::Moderate);
        assert_eq!("EXPERT".parse::<Complexity>().unwrap(), Complexity::Expert);
    }

    #[test]
    fn test_complexity_midpoint() {
        assert!(!Complexity::Simple.is_high());
        assert!(!Complexity::Moderate.is_high());
        assert!(Complexity::Complex.is_high());
        assert!(Complexity::Expert.is_high());
    }

    #[test]
    fn test_category_serde_snake_case() {
        let json = serde_json::to_string(&Category::Conversational).unwrap();
        assert_eq!(json, "\"conversational\"");
    }
}
