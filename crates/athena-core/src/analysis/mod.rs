//! Prompt analysis
//!
//! [`PromptAnalyzer::analyze`] never fails. The remote classifier is tried
//! first under a timeout; a timeout, transport error, or unparseable reply
//! falls back to the deterministic heuristic analyzer.

pub mod cache;
pub mod classifier;
pub mod heuristic;
pub mod types;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::AnalyzerConfig;
use crate::error::{Error, Result};
use crate::registry::{BackendConfig, ModelRegistry};
use crate::strategy;

pub use cache::{AnalysisCache, cache_key};
pub use classifier::{Classifier, ClassifierVerdict, RemoteClassifier, extract_first_json_object};
pub use types::{AnalysisSource, Category, Complexity, PromptAnalysis};

/// Turns prompts into [`PromptAnalysis`] values
pub struct PromptAnalyzer {
    config: AnalyzerConfig,
    registry: Arc<ModelRegistry>,
    classifier: Option<Arc<dyn Classifier>>,
    cache: Option<AnalysisCache>,
}

impl PromptAnalyzer {
    /// Create a heuristic-only analyzer
    pub fn new(config: AnalyzerConfig, registry: Arc<ModelRegistry>) -> Self {
        let cache = config
            .cache_enabled
            .then(|| AnalysisCache::new(config.cache_ttl(), config.cache_capacity));
        Self {
            config,
            registry,
            classifier: None,
            cache,
        }
    }

    /// Use a remote classifier as the primary path
    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn has_classifier(&self) -> bool {
        self.classifier.is_some()
    }

    /// Analyze a prompt
    pub async fn analyze(&self, prompt: &str) -> PromptAnalysis {
        let backends = self.registry.available();

        if prompt.trim().is_empty() {
            return heuristic::analyze(prompt, &backends);
        }

        let Some(classifier) = &self.classifier else {
            return heuristic::analyze(prompt, &backends);
        };

        let key = cache_key(prompt);
        if let Some(cache) = &self.cache
            && let Some(hit) = cache.get(&key)
        {
            debug!(cache_key = %key, "Analysis cache hit");
            return hit;
        }

        match self.classify(classifier.as_ref(), prompt).await {
            Ok(verdict) => {
                let analysis = from_verdict(prompt, verdict, &backends);
                if let Some(cache) = &self.cache {
                    cache.insert(key, analysis.clone());
                }
                analysis
            }
            Err(e) => {
                warn!(
                    error = %e,
                    code = e.code(),
                    "Classifier unavailable, using heuristic analysis"
                );
                heuristic::analyze(prompt, &backends)
            }
        }
    }

    async fn classify(
        &self,
        classifier: &dyn Classifier,
        prompt: &str,
    ) -> Result<ClassifierVerdict> {
        let timeout = self.config.classifier_timeout();
        match tokio::time::timeout(timeout, classifier.classify(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ClassifierTimeout(timeout.as_millis() as u64)),
        }
    }
}

/// Build an analysis from a classifier verdict
///
/// Affinities always come from the static profiles; topics are the union of
/// the classifier's and the keyword-detected ones.
fn from_verdict(
    prompt: &str,
    verdict: ClassifierVerdict,
    backends: &[&BackendConfig],
) -> PromptAnalysis {
    let tokens = heuristic::tokenize(prompt);
    let mut topics = verdict.topics;
    topics.extend(heuristic::detect_topics(&tokens));

    let suggested_strategy = verdict
        .suggested_strategy
        .unwrap_or_else(|| strategy::suggest(verdict.category, verdict.complexity, &topics).0);

    PromptAnalysis {
        category: verdict.category,
        complexity: verdict.complexity,
        creativity: verdict.creativity,
        technical: verdict.technical,
        reasoning: verdict.reasoning,
        per_backend_affinity: heuristic::affinities(
            backends,
            verdict.creativity,
            verdict.technical,
            verdict.reasoning,
            verdict.category,
        ),
        topics,
        suggested_strategy,
        estimated_duration_ms: verdict.complexity.estimated_duration().as_millis() as u64,
        confidence: verdict.confidence,
        source: AnalysisSource::Classifier,
    }
}
