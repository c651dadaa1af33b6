//! Recommendation of backends, weights, and strategy

pub mod engine;
pub mod history;
pub mod types;

pub use engine::DecisionEngine;
pub use history::{HistoryRecord, RecommendationHistory};
pub use types::{CurrentSelection, DecisionStep, Recommendation};
