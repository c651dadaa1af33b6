//! Bounded, persisted log of issued recommendations
//!
//! Each record is later paired with the quality the caller reported for
//! that request, which makes the log usable for auditing how often
//! recommendations turned out well.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::types::Recommendation;
use crate::analysis::cache_key;
use crate::error::{Error, Result};
use crate::learning::Persistence;

/// One issued recommendation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub request_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    /// Hash of the normalized prompt; prompts themselves are not stored
    pub prompt_hash: String,
    pub recommendation: Recommendation,
    pub outcome_quality: Option<f64>,
}

impl HistoryRecord {
    fn is_valid(&self) -> bool {
        self.recommendation.is_well_formed()
            && self
                .outcome_quality
                .is_none_or(|q| q.is_finite() && (0.0..=1.0).contains(&q))
    }
}

/// Recommendation log, oldest first
pub struct RecommendationHistory {
    capacity: usize,
    storage_key: String,
    persistence: Arc<dyn Persistence>,
    records: RwLock<VecDeque<HistoryRecord>>,
}

impl RecommendationHistory {
    pub fn new(
        capacity: usize,
        storage_key: impl Into<String>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        Self {
            capacity: capacity.max(1),
            storage_key: storage_key.into(),
            persistence,
            records: RwLock::new(VecDeque::new()),
        }
    }

    /// Load persisted records; unreadable data yields an empty log
    pub async fn load(&self) -> usize {
        let loaded = match self.persistence.get(&self.storage_key).await {
            Ok(Some(value)) => serde_json::from_value::<VecDeque<HistoryRecord>>(value)
                .map_err(|e| Error::StoreCorruption(e.to_string())),
            Ok(None) => Ok(VecDeque::new()),
            Err(e) => Err(e),
        };

        let mut records = loaded.unwrap_or_else(|e| {
            warn!(
                key = %self.storage_key,
                error = %e,
                "Recommendation history unreadable, starting empty"
            );
            VecDeque::new()
        });
        let before = records.len();
        records.retain(HistoryRecord::is_valid);
        if records.len() < before {
            warn!(
                key = %self.storage_key,
                dropped = before - records.len(),
                "Dropped malformed history records"
            );
        }
        while records.len() > self.capacity {
            records.pop_front();
        }

        let count = records.len();
        *self.records.write().await = records;
        count
    }

    /// Append a recommendation, dropping the oldest record when full
    pub async fn record(
        &self,
        request_id: Uuid,
        prompt: &str,
        recommendation: &Recommendation,
    ) -> Result<()> {
        let mut records = self.records.write().await;
        records.push_back(HistoryRecord {
            request_id,
            recorded_at: Utc::now(),
            prompt_hash: cache_key(prompt),
            recommendation: recommendation.clone(),
            outcome_quality: None,
        });
        while records.len() > self.capacity {
            records.pop_front();
        }

        debug!(request_id = %request_id, size = records.len(), "Recorded recommendation");
        self.persist(&records).await
    }

    /// Attach an outcome to a recorded request; returns false if it is unknown
    pub async fn attach_outcome(&self, request_id: Uuid, quality: f64) -> Result<bool> {
        let mut records = self.records.write().await;
        let Some(record) = records.iter_mut().rev().find(|r| r.request_id == request_id) else {
            return Ok(false);
        };
        record.outcome_quality = Some(quality);
        self.persist(&records).await?;
        Ok(true)
    }

    pub async fn get(&self, request_id: Uuid) -> Option<HistoryRecord> {
        self.records
            .read()
            .await
            .iter()
            .rev()
            .find(|r| r.request_id == request_id)
            .cloned()
    }

    /// Most recent records, newest first
    pub async fn recent(&self, limit: usize) -> Vec<HistoryRecord> {
        self.records
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Mean reported quality of records that have an outcome
    pub async fn average_quality(&self) -> Option<f64> {
        let records = self.records.read().await;
        let qualities: Vec<f64> = records.iter().filter_map(|r| r.outcome_quality).collect();
        if qualities.is_empty() {
            return None;
        }
        Some(qualities.iter().sum::<f64>() / qualities.len() as f64)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn persist(&self, records: &VecDeque<HistoryRecord>) -> Result<()> {
        let value = serde_json::to_value(records)?;
        self.persistence.set(&self.storage_key, value).await
    }
}
