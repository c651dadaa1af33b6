//! TTL cache of prompt analyses
//!
//! Keyed by the SHA-256 of the normalized prompt. Only a latency
//! optimization: a hit returns exactly what a fresh analysis would.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;

use super::types::PromptAnalysis;

/// Cache key for a prompt: lowercased, whitespace collapsed, hashed
pub fn cache_key(prompt: &str) -> String {
    let normalized = prompt
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ");
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

struct Entry {
    analysis: PromptAnalysis,
    inserted_at: Instant,
}

/// Bounded analysis cache; the oldest entry is evicted first
pub struct AnalysisCache {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<HashMap<String, Entry>>,
}

impl AnalysisCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a fresh entry, dropping it if expired
    pub fn get(&self, key: &str) -> Option<PromptAnalysis> {
        let Ok(mut entries) = self.entries.lock() else {
            return None;
        };
        match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.analysis.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: String, analysis: PromptAnalysis) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };

        let ttl = self.ttl;
        entries.retain(|_, e| e.inserted_at.elapsed() < ttl);

        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key,
            Entry {
                analysis,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::heuristic;

    fn sample(prompt: &str) -> PromptAnalysis {
        heuristic::analyze(prompt, &[])
    }

    #[test]
    fn test_cache_key_normalizes_case_and_whitespace() {
        assert_eq!(cache_key("Hello   World"), cache_key("hello world"));
        assert_eq!(cache_key("  hello\tworld\n"), cache_key("hello world"));
        assert_ne!(cache_key("hello world"), cache_key("hello there"));
        assert_eq!(cache_key("x").len(), 64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = AnalysisCache::new(Duration::from_secs(10), 8);
        cache.insert(cache_key("a"), sample("a"));
        assert!(cache.get(&cache_key("a")).is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get(&cache_key("a")).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest() {
        let cache = AnalysisCache::new(Duration::from_secs(60), 2);
        cache.insert("first".into(), sample("first"));
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.insert("second".into(), sample("second"));
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.insert("third".into(), sample("third"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("first").is_none());
        assert!(cache.get("second").is_some());
        assert!(cache.get("third").is_some());
    }
}
