//! Recommendation types

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::analysis::Category;
use crate::registry::BackendId;
use crate::strategy::Strategy;

/// One explained decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionStep {
    pub question: String,
    pub answer: String,
    pub confidence: f64,
    pub evidence: Vec<String>,
}

impl DecisionStep {
    pub fn new(question: impl Into<String>, answer: impl Into<String>, confidence: f64) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
            confidence: confidence.clamp(0.0, 1.0),
            evidence: Vec::new(),
        }
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence.push(evidence.into());
        self
    }
}

/// The backends and strategy currently chosen by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentSelection {
    pub backends: Vec<BackendId>,
    pub strategy: Strategy,
}

impl CurrentSelection {
    pub fn new(backends: Vec<BackendId>, strategy: Strategy) -> Self {
        Self { backends, strategy }
    }
}

/// Which backends to call, how to weight them, and how to combine their outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub category: Category,
    /// Ordered by rank; empty only when no backend is available
    pub selected_backends: Vec<BackendId>,
    pub strategy: Strategy,
    /// Parallel to `selected_backends`; sums to its length
    pub weights: Vec<f64>,
    pub per_backend_confidence: BTreeMap<BackendId, f64>,
    pub overall_confidence: f64,
    pub decision_trace: Vec<DecisionStep>,
    /// Advisory: whether confidence clears the auto-apply threshold
    pub auto_apply_eligible: bool,
    /// Set when the engine could not decide and returned its default
    pub fallback: bool,
    /// Whether this differs from the selection the caller passed in
    pub differs_from_current: Option<bool>,
}

impl Recommendation {
    pub fn is_empty(&self) -> bool {
        self.selected_backends.is_empty()
    }

    /// Weight of a selected backend
    pub fn weight_of(&self, backend_id: &str) -> Option<f64> {
        self.selected_backends
            .iter()
            .position(|b| b == backend_id)
            .and_then(|i| self.weights.get(i).copied())
    }

    /// Selected backends paired with their weights
    pub fn weighted_backends(&self) -> impl Iterator<Item = (&BackendId, f64)> {
        self.selected_backends
            .iter()
            .zip(self.weights.iter().copied())
    }

    pub fn confidence_of(&self, backend_id: &str) -> Option<f64> {
        self.per_backend_confidence.get(backend_id).copied()
    }

    /// Whether the structural guarantees of an issued recommendation hold
    ///
    /// At least one backend, one weight per backend with the weights summing
    /// to the backend count, and every confidence in [0, 1].
    pub fn is_well_formed(&self) -> bool {
        let unit = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        let n = self.selected_backends.len();
        n > 0
            && self.weights.len() == n
            && self.weights.iter().all(|w| w.is_finite() && *w >= 0.0)
            && (self.weights.iter().sum::<f64>() - n as f64).abs() < 1e-6
            && unit(self.overall_confidence)
            && self.per_backend_confidence.values().all(|c| unit(*c))
    }

    /// Whether the selection matches a caller-supplied one (order-insensitive)
    pub fn matches(&self, current: &CurrentSelection) -> bool {
        let mut ours = self.selected_backends.clone();
        let mut theirs = current.backends.clone();
        ours.sort();
        theirs.sort();
        ours == theirs && self.strategy == current.strategy
    }
}
