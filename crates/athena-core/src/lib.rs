//! Athena Core Library
//!
//! Multi-backend LLM orchestration:
//! - Prompt analysis (remote classifier with heuristic fallback)
//! - Backend and strategy recommendation with an explainable decision trace
//! - Learning from reported outcomes (SQLite or in-memory persistence)
//! - Streaming orchestration with cancellation, timeouts, and reconnection
//! - Strategy-aware response synthesis

pub mod analysis;
pub mod athena;
pub mod config;
pub mod decision;
pub mod error;
pub mod learning;
pub mod orchestration;
pub mod registry;
pub mod strategy;
pub mod synthesis;
pub mod transport;

pub use athena::{Athena, AthenaBuilder, OutcomeContext, Plan};
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::analysis::{Category, Complexity, PromptAnalysis};
    pub use crate::athena::{Athena, AthenaBuilder, OutcomeContext, Plan};
    pub use crate::config::Config;
    pub use crate::decision::{CurrentSelection, Recommendation};
    pub use crate::error::{Error, Result};
    pub use crate::orchestration::{OrchestrationEvent, OrchestrationHandle, SynthesisResult};
    pub use crate::registry::{BackendConfig, ModelRegistry};
    pub use crate::strategy::Strategy;
}
