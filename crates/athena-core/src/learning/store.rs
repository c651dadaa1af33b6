//! Persisted learning store
//!
//! Readers take an `Arc<LearningSnapshot>` and never block writers for
//! longer than a pointer swap. Writers are serialized by an async mutex held
//! across the persistence call, so the persisted blob always matches the
//! snapshot that was swapped in.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::persistence::Persistence;
use super::types::{
    LearningPattern, LearningSnapshot, LearningSummary, PatternKey, PerformanceWindow,
};
use crate::analysis::Category;
use crate::config::LearningConfig;
use crate::error::{Error, Result};
use crate::registry::BackendId;
use crate::strategy::Strategy;

/// One observed orchestration outcome
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub category: Category,
    pub backends: Vec<BackendId>,
    pub strategy: Strategy,
    /// Overall quality in [0, 1]
    pub quality: f64,
    /// Per-backend quality; backends not listed get the overall quality
    pub backend_quality: BTreeMap<BackendId, f64>,
}

impl Outcome {
    pub fn new(
        category: Category,
        backends: Vec<BackendId>,
        strategy: Strategy,
        quality: f64,
    ) -> Self {
        Self {
            category,
            backends,
            strategy,
            quality,
            backend_quality: BTreeMap::new(),
        }
    }

    pub fn with_backend_quality(mut self, backend_quality: BTreeMap<BackendId, f64>) -> Self {
        self.backend_quality = backend_quality;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            return Err(Error::InvalidInput("outcome has no backends".into()));
        }
        let in_range = |q: f64| q.is_finite() && (0.0..=1.0).contains(&q);
        if !in_range(self.quality) {
            return Err(Error::InvalidInput(format!(
                "quality score {} is outside [0, 1]",
                self.quality
            )));
        }
        if let Some((id, q)) = self.backend_quality.iter().find(|(_, q)| !in_range(**q)) {
            return Err(Error::InvalidInput(format!(
                "quality score {} for backend '{}' is outside [0, 1]",
                q, id
            )));
        }
        Ok(())
    }
}

/// Bounded, persisted store of learning patterns and performance windows
pub struct LearningStore {
    config: LearningConfig,
    persistence: Arc<dyn Persistence>,
    current: RwLock<Arc<LearningSnapshot>>,
    writer: Mutex<()>,
}

impl LearningStore {
    /// Create an empty store; nothing is read until [`Self::load`]
    pub fn new(config: LearningConfig, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            config,
            persistence,
            current: RwLock::new(Arc::new(LearningSnapshot::default())),
            writer: Mutex::new(()),
        }
    }

    /// Create a store and load its persisted state
    pub async fn open(config: LearningConfig, persistence: Arc<dyn Persistence>) -> Self {
        let store = Self::new(config, persistence);
        store.load().await;
        store
    }

    /// Load persisted state, pruning expired patterns
    ///
    /// Missing data yields an empty store. Unreadable or corrupt data is
    /// logged and also yields an empty store. Returns the number of patterns
    /// kept.
    pub async fn load(&self) -> usize {
        self.load_at(Utc::now()).await
    }

    pub async fn load_at(&self, now: DateTime<Utc>) -> usize {
        let _guard = self.writer.lock().await;

        let mut snapshot = match self.read_persisted().await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!(key = %self.config.storage_key, "No persisted learning data");
                LearningSnapshot::default()
            }
            Err(e) => {
                warn!(
                    key = %self.config.storage_key,
                    error = %e,
                    code = e.code(),
                    "Learning data unreadable, starting empty"
                );
                LearningSnapshot::default()
            }
        };

        let pruned = self.prune(&mut snapshot, now);
        self.enforce_bounds(&mut snapshot);
        let count = snapshot.patterns.len();
        self.swap(snapshot);

        info!(patterns = count, pruned = pruned, "Learning store loaded");
        count
    }

    async fn read_persisted(&self) -> Result<Option<LearningSnapshot>> {
        let Some(value) = self.persistence.get(&self.config.storage_key).await? else {
            return Ok(None);
        };
        let mut snapshot: LearningSnapshot = serde_json::from_value(value)
            .map_err(|e| Error::StoreCorruption(e.to_string()))?;
        let dropped = snapshot.sanitize();
        if dropped > 0 {
            warn!(
                key = %self.config.storage_key,
                dropped = dropped,
                "Dropped invalid or duplicate persisted patterns"
            );
        }
        Ok(Some(snapshot))
    }

    /// Current immutable view
    pub fn snapshot(&self) -> Arc<LearningSnapshot> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&*guard)
    }

    /// Highest-scoring pattern for a category
    pub fn get_pattern(&self, category: Category) -> Option<LearningPattern> {
        self.snapshot().best_pattern(category).cloned()
    }

    /// Fold an outcome into the store and persist it
    ///
    /// Returns the updated (or newly created) pattern.
    pub async fn record_outcome(&self, outcome: Outcome) -> Result<LearningPattern> {
        self.record_outcome_at(outcome, Utc::now()).await
    }

    pub async fn record_outcome_at(
        &self,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<LearningPattern> {
        outcome.validate()?;
        let _guard = self.writer.lock().await;

        let mut snapshot = (*self.snapshot()).clone();
        self.prune(&mut snapshot, now);

        let key = PatternKey::new(outcome.category, &outcome.backends, outcome.strategy);
        let pattern = match snapshot.patterns.iter_mut().find(|p| p.matches(&key)) {
            Some(existing) => {
                existing.record(outcome.quality, now);
                existing.clone()
            }
            None => {
                let created = LearningPattern::new(key, outcome.quality, now);
                snapshot.patterns.push(created.clone());
                created
            }
        };

        let window_size = self.config.window_size;
        for backend_id in &pattern.backends {
            let quality = outcome
                .backend_quality
                .get(backend_id)
                .copied()
                .unwrap_or(outcome.quality);
            snapshot
                .model_stats
                .entry(backend_id.clone())
                .or_insert_with(|| PerformanceWindow::new(window_size))
                .push(quality);
        }
        snapshot
            .strategy_stats
            .entry(outcome.strategy.to_string())
            .or_insert_with(|| PerformanceWindow::new(window_size))
            .push(outcome.quality);

        self.enforce_bounds(&mut snapshot);

        debug!(
            category = %pattern.category,
            strategy = %pattern.strategy,
            backends = ?pattern.backends,
            success_score = pattern.success_score,
            usage_count = pattern.usage_count,
            "Recorded orchestration outcome"
        );

        let value = serde_json::to_value(&snapshot)?;
        self.swap(snapshot);
        self.persistence.set(&self.config.storage_key, value).await?;

        Ok(pattern)
    }

    /// Drop patterns unused for longer than the TTL; returns how many were removed
    pub async fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let _guard = self.writer.lock().await;

        let mut snapshot = (*self.snapshot()).clone();
        let pruned = self.prune(&mut snapshot, now);
        if pruned == 0 {
            return Ok(0);
        }

        let value = serde_json::to_value(&snapshot)?;
        self.swap(snapshot);
        self.persistence.set(&self.config.storage_key, value).await?;
        Ok(pruned)
    }

    /// Share of a backend's recent outcomes at or above the success threshold
    pub fn backend_success_rate(&self, backend_id: &str) -> Option<f64> {
        self.snapshot()
            .backend_success_rate(backend_id, self.config.success_threshold)
    }

    /// Share of a strategy's recent outcomes at or above the success threshold
    pub fn strategy_success_rate(&self, strategy: Strategy) -> Option<f64> {
        self.snapshot()
            .strategy_success_rate(strategy, self.config.success_threshold)
    }

    /// Aggregate counts, average quality, and success rate
    pub fn summary(&self) -> LearningSummary {
        let snapshot = self.snapshot();
        let sample_count: usize = snapshot.strategy_stats.values().map(|w| w.len()).sum();
        let quality_sum: f64 = snapshot.strategy_stats.values().map(|w| w.sum()).sum();
        let successes: usize = snapshot
            .strategy_stats
            .values()
            .map(|w| w.successes(self.config.success_threshold))
            .sum();
        let ratio = |part: f64| {
            if sample_count == 0 {
                0.0
            } else {
                part / sample_count as f64
            }
        };

        LearningSummary {
            pattern_count: snapshot.patterns.len(),
            backend_count: snapshot.model_stats.len(),
            strategy_count: snapshot.strategy_stats.len(),
            sample_count,
            average_quality: ratio(quality_sum),
            success_rate: ratio(successes as f64),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    fn swap(&self, snapshot: LearningSnapshot) {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(snapshot);
    }

    fn prune(&self, snapshot: &mut LearningSnapshot, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::days(self.config.ttl_days);
        let before = snapshot.patterns.len();
        snapshot.patterns.retain(|p| !p.is_expired(now, ttl));
        before - snapshot.patterns.len()
    }

    /// Apply the capacity cap and window size
    ///
    /// Eviction removes the lowest success score first; ties go to the
    /// pattern that was used least recently.
    fn enforce_bounds(&self, snapshot: &mut LearningSnapshot) {
        while snapshot.patterns.len() > self.config.capacity {
            let victim = snapshot
                .patterns
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.success_score
                        .total_cmp(&b.success_score)
                        .then(a.last_used_at.cmp(&b.last_used_at))
                })
                .map(|(i, _)| i);
            match victim {
                Some(i) => {
                    let evicted = snapshot.patterns.remove(i);
                    debug!(
                        category = %evicted.category,
                        success_score = evicted.success_score,
                        "Evicted learning pattern"
                    );
                }
                None => break,
            }
        }

        let window_size = self.config.window_size;
        for window in snapshot
            .model_stats
            .values_mut()
            .chain(snapshot.strategy_stats.values_mut())
        {
            if window.capacity() != window_size {
                window.resize(window_size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::persistence::MemoryPersistence;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn ids(names: &[&str]) -> Vec<BackendId> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn config(capacity: usize) -> LearningConfig {
        LearningConfig {
            capacity,
            ..LearningConfig::default()
        }
    }

    #[tokio::test]
    async fn test_record_creates_then_updates() {
        let store = LearningStore::new(config(10), Arc::new(MemoryPersistence::new()));

        let outcome = Outcome::new(Category::Technical, ids(&["b", "a"]), Strategy::Weighted, 0.6);
        let first = store.record_outcome_at(outcome, at(0)).await.unwrap();
        assert_eq!(first.usage_count, 1);
        assert_eq!(first.backends, ids(&["a", "b"]));

        let outcome = Outcome::new(Category::Technical, ids(&["a", "b"]), Strategy::Weighted, 1.0);
        let second = store.record_outcome_at(outcome, at(5)).await.unwrap();
        assert_eq!(second.usage_count, 2);
        assert!((second.success_score - 0.8).abs() < 1e-12);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_evicts_lowest_then_oldest() {
        let store = LearningStore::new(config(2), Arc::new(MemoryPersistence::new()));

        store
            .record_outcome_at(
                Outcome::new(Category::Creative, ids(&["a"]), Strategy::Parallel, 0.4),
                at(0),
            )
            .await
            .unwrap();
        store
            .record_outcome_at(
                Outcome::new(Category::Creative, ids(&["b"]), Strategy::Parallel, 0.4),
                at(10),
            )
            .await
            .unwrap();
        store
            .record_outcome_at(
                Outcome::new(Category::Creative, ids(&["c"]), Strategy::Parallel, 0.9),
                at(20),
            )
            .await
            .unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.patterns.len(), 2);
        let kept: Vec<_> = snapshot.patterns.iter().map(|p| p.backends[0].as_str()).collect();
        assert_eq!(kept, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_rejects_invalid_quality() {
        let store = LearningStore::new(config(10), Arc::new(MemoryPersistence::new()));
        let result = store
            .record_outcome(Outcome::new(Category::Creative, ids(&["a"]), Strategy::Parallel, 1.5))
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));

        let result = store
            .record_outcome(Outcome::new(Category::Creative, vec![], Strategy::Parallel, 0.5))
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_per_backend_quality_feeds_model_stats() {
        let store = LearningStore::new(config(10), Arc::new(MemoryPersistence::new()));
        let outcome = Outcome::new(Category::Analytical, ids(&["a", "b"]), Strategy::Consensus, 0.7)
            .with_backend_quality([("a".to_string(), 1.0)].into());
        store.record_outcome(outcome).await.unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.backend_performance("a"), Some(1.0));
        assert_eq!(snapshot.backend_performance("b"), Some(0.7));
        assert_eq!(snapshot.strategy_performance(Strategy::Consensus), Some(0.7));
    }

    #[tokio::test]
    async fn test_load_round_trip_and_ttl_prune() {
        let persistence = Arc::new(MemoryPersistence::new());
        let store = LearningStore::new(config(10), persistence.clone());
        store
            .record_outcome_at(
                Outcome::new(Category::Creative, ids(&["a"]), Strategy::Parallel, 0.9),
                at(0),
            )
            .await
            .unwrap();
        store
            .record_outcome_at(
                Outcome::new(Category::Technical, ids(&["b"]), Strategy::Weighted, 0.8),
                at(86_400 * 20),
            )
            .await
            .unwrap();

        let reloaded = LearningStore::new(config(10), persistence.clone());
        assert_eq!(reloaded.load_at(at(86_400 * 21)).await, 2);
        assert_eq!(*reloaded.snapshot(), *store.snapshot());

        // The creative pattern is now 35 days old
        let pruned = LearningStore::new(config(10), persistence);
        assert_eq!(pruned.load_at(at(86_400 * 35)).await, 1);
        assert!(pruned.get_pattern(Category::Creative).is_none());
        assert!(pruned.get_pattern(Category::Technical).is_some());
    }

    #[tokio::test]
    async fn test_corrupt_data_resets_to_empty() {
        let persistence = Arc::new(MemoryPersistence::new());
        persistence
            .set("athena.learning", json!({"patterns": "not a list"}))
            .await
            .unwrap();

        let store = LearningStore::open(config(10), persistence).await;
        assert!(store.is_empty());

        // Still writable after the reset
        store
            .record_outcome(Outcome::new(Category::Creative, ids(&["a"]), Strategy::Parallel, 0.5))
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_summary() {
        let store = LearningStore::new(config(10), Arc::new(MemoryPersistence::new()));
        assert_eq!(store.summary().average_quality, 0.0);

        store
            .record_outcome(Outcome::new(Category::Creative, ids(&["a"]), Strategy::Parallel, 0.4))
            .await
            .unwrap();
        store
            .record_outcome(Outcome::new(
                Category::Technical,
                ids(&["a", "b"]),
                Strategy::Weighted,
                0.8,
            ))
            .await
            .unwrap();

        let summary = store.summary();
        assert_eq!(summary.pattern_count, 2);
        assert_eq!(summary.backend_count, 2);
        assert_eq!(summary.strategy_count, 2);
        assert_eq!(summary.sample_count, 2);
        assert!((summary.average_quality - 0.6).abs() < 1e-12);
        assert_eq!(summary.success_rate, 0.5);

        assert_eq!(store.backend_success_rate("a"), Some(0.5));
        assert_eq!(store.backend_success_rate("b"), Some(1.0));
        assert_eq!(store.strategy_success_rate(Strategy::Parallel), Some(0.0));
        assert_eq!(store.strategy_success_rate(Strategy::Consensus), None);
    }

    #[tokio::test]
    async fn test_success_rate_follows_configured_threshold() {
        let strict = LearningConfig {
            success_threshold: 0.9,
            ..config(10)
        };
        let store = LearningStore::new(strict, Arc::new(MemoryPersistence::new()));
        store
            .record_outcome(Outcome::new(Category::Creative, ids(&["a"]), Strategy::Parallel, 0.8))
            .await
            .unwrap();
        assert_eq!(store.backend_success_rate("a"), Some(0.0));
        assert_eq!(store.summary().success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_load_repairs_invalid_patterns() {
        let persistence = Arc::new(MemoryPersistence::new());
        persistence
            .set(
                "athena.learning",
                json!({
                    "version": 1,
                    "patterns": [{
                        "category": "technical",
                        "backends": ["z", "a"],
                        "strategy": "weighted",
                        "success_score": 7.5,
                        "usage_count": 0,
                        "created_at": "2024-01-01T00:00:00Z",
                        "last_used_at": "2024-01-01T00:00:00Z"
                    }, {
                        "category": "creative",
                        "backends": ["z", "a"],
                        "strategy": "parallel",
                        "success_score": 0.7,
                        "usage_count": 2,
                        "created_at": "2024-01-01T00:00:00Z",
                        "last_used_at": "2024-01-01T00:00:00Z"
                    }]
                }),
            )
            .await
            .unwrap();

        let store = LearningStore::new(config(10), persistence);
        let loaded_at = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        assert_eq!(store.load_at(loaded_at).await, 1);
        assert!(store.get_pattern(Category::Technical).is_none());

        let creative = store.get_pattern(Category::Creative).unwrap();
        assert_eq!(creative.backends, ids(&["a", "z"]));

        // The repaired key matches later outcomes for the same set
        let updated = store
            .record_outcome_at(
                Outcome::new(Category::Creative, ids(&["a", "z"]), Strategy::Parallel, 1.0),
                loaded_at,
            )
            .await
            .unwrap();
        assert_eq!(updated.usage_count, 3);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_prune_expired_persists_removal() {
        let persistence = Arc::new(MemoryPersistence::new());
        let store = LearningStore::new(config(10), persistence.clone());
        store
            .record_outcome_at(
                Outcome::new(Category::Creative, ids(&["a"]), Strategy::Parallel, 0.9),
                at(0),
            )
            .await
            .unwrap();
        store
            .record_outcome_at(
                Outcome::new(Category::Technical, ids(&["b"]), Strategy::Weighted, 0.8),
                at(86_400 * 20),
            )
            .await
            .unwrap();

        assert_eq!(store.prune_expired(at(86_400 * 10)).await.unwrap(), 0);
        assert_eq!(store.prune_expired(at(86_400 * 31)).await.unwrap(), 1);
        assert!(store.get_pattern(Category::Creative).is_none());

        let reloaded = LearningStore::new(config(10), persistence);
        assert_eq!(reloaded.load_at(at(86_400 * 31)).await, 1);
        assert_eq!(*reloaded.snapshot(), *store.snapshot());
    }

    #[tokio::test]
    async fn test_snapshot_is_stable_across_writes() {
        let store = LearningStore::new(config(10), Arc::new(MemoryPersistence::new()));
        let before = store.snapshot();
        store
            .record_outcome(Outcome::new(Category::Creative, ids(&["a"]), Strategy::Parallel, 0.4))
            .await
            .unwrap();
        assert!(before.is_empty());
        assert_eq!(store.snapshot().patterns.len(), 1);
    }
}
