//! Types for learned orchestration patterns and performance statistics

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::Category;
use crate::registry::BackendId;
use crate::strategy::Strategy;

/// Current serialization format of [`LearningSnapshot`]
pub const SNAPSHOT_VERSION: u32 = 1;

/// Identity of a learning pattern
///
/// The backend set is kept sorted and deduplicated so that the same set
/// given in a different order maps to the same pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatternKey {
    pub category: Category,
    pub backends: Vec<BackendId>,
    pub strategy: Strategy,
}

impl PatternKey {
    pub fn new(category: Category, backends: &[BackendId], strategy: Strategy) -> Self {
        let mut backends = backends.to_vec();
        backends.sort();
        backends.dedup();
        Self {
            category,
            backends,
            strategy,
        }
    }
}

/// A learned (category, backend set, strategy) combination and how well it worked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningPattern {
    pub category: Category,
    /// Sorted, deduplicated backend ids
    pub backends: Vec<BackendId>,
    pub strategy: Strategy,
    /// Average quality over all uses, in [0, 1]
    pub success_score: f64,
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl LearningPattern {
    /// Create a pattern from its first observed outcome
    pub fn new(key: PatternKey, quality: f64, now: DateTime<Utc>) -> Self {
        Self {
            category: key.category,
            backends: key.backends,
            strategy: key.strategy,
            success_score: quality,
            usage_count: 1,
            created_at: now,
            last_used_at: now,
        }
    }

    pub fn key(&self) -> PatternKey {
        PatternKey::new(self.category, &self.backends, self.strategy)
    }

    pub fn matches(&self, key: &PatternKey) -> bool {
        self.category == key.category
            && self.strategy == key.strategy
            && self.backends == key.backends
    }

    /// Fold another pattern with the same key into this one
    fn merge(&mut self, other: &LearningPattern) {
        let total = (self.usage_count + other.usage_count) as f64;
        self.success_score = (self.success_score * self.usage_count as f64
            + other.success_score * other.usage_count as f64)
            / total;
        self.usage_count += other.usage_count;
        self.created_at = self.created_at.min(other.created_at);
        self.last_used_at = self.last_used_at.max(other.last_used_at);
    }

    /// Fold one more outcome into the running average
    pub fn record(&mut self, quality: f64, now: DateTime<Utc>) {
        let count = self.usage_count as f64;
        self.success_score = (self.success_score * count + quality) / (count + 1.0);
        self.usage_count += 1;
        self.last_used_at = now;
    }

    /// Whether the pattern has gone unused for longer than `ttl`
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.last_used_at > ttl
    }
}

/// Bounded rolling window of quality samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl PerformanceWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Add a sample, dropping the oldest when full
    pub fn push(&mut self, quality: f64) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(quality);
    }

    /// Change the capacity, keeping the newest samples
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn sum(&self) -> f64 {
        self.samples.iter().sum()
    }

    /// Mean quality, if any samples exist
    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.sum() / self.samples.len() as f64)
    }

    /// Share of samples at or above `threshold`
    pub fn success_rate(&self, threshold: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.successes(threshold) as f64 / self.samples.len() as f64)
    }

    pub fn successes(&self, threshold: f64) -> usize {
        self.samples.iter().filter(|q| **q >= threshold).count()
    }

    /// Drop samples outside [0, 1]; returns how many were removed
    fn retain_valid(&mut self) -> usize {
        let before = self.samples.len();
        self.samples.retain(|q| is_unit(*q));
        self.capacity = self.capacity.max(1);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
        before - self.samples.len()
    }
}

fn is_unit(value: f64) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}

/// Immutable view of the learning store
///
/// Strategy statistics are keyed by the strategy's snake_case name so the
/// JSON form stays a plain object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningSnapshot {
    #[serde(default = "snapshot_version")]
    pub version: u32,
    #[serde(default)]
    pub patterns: Vec<LearningPattern>,
    #[serde(default)]
    pub model_stats: BTreeMap<BackendId, PerformanceWindow>,
    #[serde(default)]
    pub strategy_stats: BTreeMap<String, PerformanceWindow>,
}

fn snapshot_version() -> u32 {
    SNAPSHOT_VERSION
}

impl Default for LearningSnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            patterns: Vec::new(),
            model_stats: BTreeMap::new(),
            strategy_stats: BTreeMap::new(),
        }
    }
}

impl LearningSnapshot {
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty() && self.model_stats.is_empty() && self.strategy_stats.is_empty()
    }

    /// Highest-scoring pattern for a category; ties go to the most recently used
    pub fn best_pattern(&self, category: Category) -> Option<&LearningPattern> {
        self.patterns
            .iter()
            .filter(|p| p.category == category)
            .max_by(|a, b| {
                a.success_score
                    .total_cmp(&b.success_score)
                    .then(a.last_used_at.cmp(&b.last_used_at))
            })
    }

    /// Repair a snapshot read from storage
    ///
    /// Patterns with a score outside [0, 1], no uses, or no backends are
    /// dropped. Backend sets are re-sorted, and patterns that then share a
    /// key are merged into one. Out-of-range window samples are dropped.
    /// Returns the number of patterns removed.
    pub fn sanitize(&mut self) -> usize {
        let before = self.patterns.len();
        let mut kept: Vec<LearningPattern> = Vec::with_capacity(before);

        for mut pattern in self.patterns.drain(..) {
            if !is_unit(pattern.success_score) || pattern.usage_count == 0 {
                continue;
            }
            let key = pattern.key();
            if key.backends.is_empty() {
                continue;
            }
            pattern.backends = key.backends.clone();
            match kept.iter_mut().find(|p| p.matches(&key)) {
                Some(existing) => existing.merge(&pattern),
                None => kept.push(pattern),
            }
        }
        self.patterns = kept;

        self.model_stats.retain(|id, _| !id.trim().is_empty());
        for window in self
            .model_stats
            .values_mut()
            .chain(self.strategy_stats.values_mut())
        {
            window.retain_valid();
        }
        self.strategy_stats
            .retain(|name, _| name.parse::<Strategy>().is_ok());

        before - self.patterns.len()
    }

    /// Average observed quality of a backend
    pub fn backend_performance(&self, backend_id: &str) -> Option<f64> {
        self.model_stats.get(backend_id).and_then(PerformanceWindow::average)
    }

    /// Average observed quality of a strategy
    pub fn strategy_performance(&self, strategy: Strategy) -> Option<f64> {
        self.strategy_stats
            .get(&strategy.to_string())
            .and_then(PerformanceWindow::average)
    }

    /// Share of a backend's outcomes scoring at least `threshold`
    pub fn backend_success_rate(&self, backend_id: &str, threshold: f64) -> Option<f64> {
        self.model_stats
            .get(backend_id)
            .and_then(|w| w.success_rate(threshold))
    }

    /// Share of a strategy's outcomes scoring at least `threshold`
    pub fn strategy_success_rate(&self, strategy: Strategy, threshold: f64) -> Option<f64> {
        self.strategy_stats
            .get(&strategy.to_string())
            .and_then(|w| w.success_rate(threshold))
    }
}

/// Aggregate view of the learning store
#[derive(Debug, Clone, PartialEq)]
pub struct LearningSummary {
    pub pattern_count: usize,
    pub backend_count: usize,
    pub strategy_count: usize,
    /// Outcomes currently held in the strategy windows
    pub sample_count: usize,
    /// Mean quality over those outcomes, 0.0 when there are none
    pub average_quality: f64,
    /// Share of those outcomes at or above the success threshold, 0.0 when there are none
    pub success_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_pattern_key_is_order_insensitive() {
        let a = PatternKey::new(
            Category::Technical,
            &["b".to_string(), "a".to_string(), "b".to_string()],
            Strategy::Weighted,
        );
        let b = PatternKey::new(
            Category::Technical,
            &["a".to_string(), "b".to_string()],
            Strategy::Weighted,
        );
        assert_eq!(a, b);
        assert_eq!(a.backends, vec!["a", "b"]);
    }

    #[test]
    fn test_pattern_running_average() {
        let key = PatternKey::new(Category::Creative, &["a".to_string()], Strategy::Parallel);
        let mut pattern = LearningPattern::new(key, 0.5, at(0));
        pattern.record(1.0, at(10));
        assert!((pattern.success_score - 0.75).abs() < 1e-12);
        pattern.record(0.0, at(20));
        assert!((pattern.success_score - 0.5).abs() < 1e-12);
        assert_eq!(pattern.usage_count, 3);
        assert_eq!(pattern.last_used_at, at(20));
        assert_eq!(pattern.created_at, at(0));
    }

    #[test]
    fn test_pattern_expiry() {
        let key = PatternKey::new(Category::Creative, &["a".to_string()], Strategy::Parallel);
        let pattern = LearningPattern::new(key, 0.5, at(0));
        let ttl = chrono::Duration::days(30);
        assert!(!pattern.is_expired(at(86_400 * 29), ttl));
        assert!(pattern.is_expired(at(86_400 * 31), ttl));
    }

    #[test]
    fn test_window_is_bounded() {
        let mut window = PerformanceWindow::new(3);
        for q in [0.1, 0.2, 0.9, 0.9, 0.9] {
            window.push(q);
        }
        assert_eq!(window.len(), 3);
        assert!((window.average().unwrap() - 0.9).abs() < 1e-12);
        assert_eq!(window.success_rate(0.6), Some(1.0));

        window.resize(1);
        assert_eq!(window.len(), 1);
        assert_eq!(PerformanceWindow::new(5).average(), None);
    }

    #[test]
    fn test_best_pattern_tie_prefers_recent() {
        let older = LearningPattern::new(
            PatternKey::new(Category::Technical, &["a".to_string()], Strategy::Parallel),
            0.9,
            at(0),
        );
        let newer = LearningPattern::new(
            PatternKey::new(Category::Technical, &["b".to_string()], Strategy::Weighted),
            0.9,
            at(100),
        );
        let snapshot = LearningSnapshot {
            patterns: vec![older, newer.clone()],
            ..LearningSnapshot::default()
        };
        assert_eq!(snapshot.best_pattern(Category::Technical), Some(&newer));
        assert_eq!(snapshot.best_pattern(Category::Creative), None);
    }

    #[test]
    fn test_success_rates_per_backend_and_strategy() {
        let mut backend = PerformanceWindow::new(10);
        for q in [0.9, 0.3, 0.7, 0.5] {
            backend.push(q);
        }
        let mut strategy = PerformanceWindow::new(10);
        strategy.push(0.2);

        let snapshot = LearningSnapshot {
            model_stats: [("a".to_string(), backend)].into(),
            strategy_stats: [("consensus".to_string(), strategy)].into(),
            ..LearningSnapshot::default()
        };
        assert_eq!(snapshot.backend_success_rate("a", 0.6), Some(0.5));
        assert_eq!(snapshot.backend_success_rate("a", 0.95), Some(0.0));
        assert_eq!(snapshot.backend_success_rate("missing", 0.6), None);
        assert_eq!(snapshot.strategy_success_rate(Strategy::Consensus, 0.6), Some(0.0));
        assert_eq!(snapshot.strategy_success_rate(Strategy::Parallel, 0.6), None);
    }

    #[test]
    fn test_sanitize_repairs_stored_patterns() {
        let valid = |backends: &[&str], score: f64, usage: u64, secs: i64| LearningPattern {
            category: Category::Technical,
            backends: backends.iter().map(|b| b.to_string()).collect(),
            strategy: Strategy::Weighted,
            success_score: score,
            usage_count: usage,
            created_at: at(secs),
            last_used_at: at(secs),
        };
        let mut window = PerformanceWindow::new(4);
        window.samples.extend([0.5, 3.0, f64::NAN, 1.0]);

        let mut snapshot = LearningSnapshot {
            patterns: vec![
                valid(&["z", "a"], 7.5, 0, 0),
                valid(&["z", "a"], 0.4, 1, 0),
                valid(&["a", "z"], 1.0, 3, 50),
                valid(&[], 0.9, 2, 0),
                valid(&["b"], f64::NAN, 2, 0),
            ],
            model_stats: [("a".to_string(), window)].into(),
            strategy_stats: [("bogus".to_string(), PerformanceWindow::new(4))].into(),
            ..LearningSnapshot::default()
        };

        assert_eq!(snapshot.sanitize(), 4);
        assert_eq!(snapshot.patterns.len(), 1);
        let merged = &snapshot.patterns[0];
        assert_eq!(merged.backends, vec!["a", "z"]);
        assert_eq!(merged.usage_count, 4);
        assert!((merged.success_score - 0.85).abs() < 1e-12);
        assert_eq!(merged.created_at, at(0));
        assert_eq!(merged.last_used_at, at(50));

        assert_eq!(snapshot.model_stats["a"].len(), 2);
        assert!(snapshot.strategy_stats.is_empty());
    }

    #[test]
    fn test_snapshot_tolerates_missing_fields() {
        let snapshot: LearningSnapshot = serde_json::from_str("{}").unwrap();
        assert_eq!(snapshot, LearningSnapshot::default());
    }
}
