//! Learning from orchestration outcomes
//!
//! Outcomes are folded into (category, backend set, strategy) patterns and
//! rolling per-backend and per-strategy quality windows. The decision engine
//! reads them through immutable snapshots.

pub mod persistence;
pub mod store;
pub mod types;

pub use persistence::{MemoryPersistence, Persistence, SqlitePersistence};
pub use store::{LearningStore, Outcome};
pub use types::{
    LearningPattern, LearningSnapshot, LearningSummary, PatternKey, PerformanceWindow,
};
