//! Athena facade
//!
//! Wires the analyzer, decision engine, learning store, history, and
//! executor together. Nothing here is global: every collaborator is passed
//! to the builder or constructed from the configuration it is given.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::analysis::{Category, Classifier, PromptAnalysis, PromptAnalyzer, RemoteClassifier};
use crate::config::Config;
use crate::decision::{CurrentSelection, DecisionEngine, Recommendation, RecommendationHistory};
use crate::error::{Error, Result};
use crate::learning::{LearningPattern, LearningStore, MemoryPersistence, Outcome, Persistence};
use crate::orchestration::{OrchestrationExecutor, OrchestrationHandle};
use crate::registry::{BackendId, ModelRegistry};
use crate::strategy::Strategy;
use crate::transport::{HttpTransport, Transport};

/// A recommendation issued for one prompt
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    /// Id under which the recommendation was logged and will be executed
    pub request_id: Uuid,
    pub prompt: String,
    pub analysis: PromptAnalysis,
    pub recommendation: Recommendation,
}

/// Optional detail attached to an outcome report
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutcomeContext {
    /// Category of the prompt; re-analyzed when absent
    pub category: Option<Category>,
    /// Per-backend quality; the overall quality is used for unlisted backends
    pub backend_scores: BTreeMap<BackendId, f64>,
    /// Request the outcome belongs to, for the recommendation history
    pub request_id: Option<Uuid>,
}

impl OutcomeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_backend_score(mut self, backend_id: impl Into<String>, quality: f64) -> Self {
        self.backend_scores.insert(backend_id.into(), quality);
        self
    }

    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }
}

/// Builder for [`Athena`]
#[derive(Default)]
pub struct AthenaBuilder {
    config: Config,
    registry: Option<ModelRegistry>,
    transport: Option<Arc<dyn Transport>>,
    persistence: Option<Arc<dyn Persistence>>,
    classifier: Option<Arc<dyn Classifier>>,
}

impl AthenaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Use this registry instead of the one built from the configuration
    pub fn with_registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Defaults to an HTTP transport over the registry
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Defaults to in-memory persistence
    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Defaults to a remote classifier when one is configured, else heuristics only
    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Validate the configuration and load persisted state
    pub async fn build(self) -> Result<Athena> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| Error::ConfigError(e.to_string()))?;

        let registry = Arc::new(match self.registry {
            Some(registry) => registry,
            None => config.registry()?,
        });
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(Arc::clone(&registry))?),
        };
        let persistence: Arc<dyn Persistence> = self
            .persistence
            .unwrap_or_else(|| Arc::new(MemoryPersistence::new()));

        let classifier = self.classifier.or_else(|| {
            config.analyzer.classifier_backend.as_ref().map(|backend_id| {
                Arc::new(RemoteClassifier::new(Arc::clone(&transport), backend_id.clone()))
                    as Arc<dyn Classifier>
            })
        });
        let mut analyzer = PromptAnalyzer::new(config.analyzer.clone(), Arc::clone(&registry));
        if let Some(classifier) = classifier {
            analyzer = analyzer.with_classifier(classifier);
        }

        let learning = LearningStore::open(config.learning.clone(), Arc::clone(&persistence)).await;
        let history = RecommendationHistory::new(
            config.learning.history_capacity,
            config.learning.history_key.clone(),
            persistence,
        );
        history.load().await;

        info!(
            backends = registry.available().len(),
            patterns = learning.len(),
            classifier = analyzer.has_classifier(),
            "Athena ready"
        );

        Ok(Athena {
            engine: DecisionEngine::new(config.decision.clone(), Arc::clone(&registry)),
            executor: OrchestrationExecutor::new(config.executor.clone(), transport),
            config,
            registry,
            analyzer,
            learning,
            history,
        })
    }
}

/// Analysis, recommendation, orchestration, and learning behind one handle
pub struct Athena {
    config: Config,
    registry: Arc<ModelRegistry>,
    analyzer: PromptAnalyzer,
    engine: DecisionEngine,
    learning: LearningStore,
    history: RecommendationHistory,
    executor: OrchestrationExecutor,
}

impl Athena {
    pub fn builder() -> AthenaBuilder {
        AthenaBuilder::new()
    }

    /// Analyze a prompt and recommend backends and a strategy
    ///
    /// Never fails: analysis falls back to heuristics and the engine to its
    /// default recommendation. A history write failure is logged only.
    pub async fn recommend(&self, prompt: &str, current: Option<&CurrentSelection>) -> Plan {
        let analysis = self.analyzer.analyze(prompt).await;
        let snapshot = self.learning.snapshot();
        let recommendation = self.engine.recommend(
            &analysis,
            &self.registry.available_ids(),
            current,
            &snapshot,
        );

        let request_id = Uuid::new_v4();
        if let Err(e) = self.history.record(request_id, prompt, &recommendation).await {
            warn!(request_id = %request_id, error = %e, "Failed to record recommendation");
        }

        info!(
            request_id = %request_id,
            category = %recommendation.category,
            strategy = %recommendation.strategy,
            backends = recommendation.selected_backends.len(),
            confidence = recommendation.overall_confidence,
            "Recommendation issued"
        );

        Plan {
            request_id,
            prompt: prompt.to_string(),
            analysis,
            recommendation,
        }
    }

    /// Execute a plan; events and the final answer come through the handle
    pub fn orchestrate(&self, plan: &Plan) -> Result<OrchestrationHandle> {
        self.executor
            .execute_with_id(plan.request_id, &plan.recommendation, &plan.prompt)
    }

    /// Report how well a run went
    ///
    /// Updates the learning store and, when the context names a request,
    /// attaches the quality to its history record.
    pub async fn record_outcome(
        &self,
        prompt: &str,
        backends: &[BackendId],
        strategy: Strategy,
        quality: f64,
        context: Option<OutcomeContext>,
    ) -> Result<LearningPattern> {
        let context = context.unwrap_or_default();
        let category = match context.category {
            Some(category) => category,
            None => self.analyzer.analyze(prompt).await.category,
        };

        let outcome = Outcome::new(category, backends.to_vec(), strategy, quality)
            .with_backend_quality(context.backend_scores);
        let pattern = self.learning.record_outcome(outcome).await?;

        if let Some(request_id) = context.request_id
            && !self.history.attach_outcome(request_id, quality).await?
        {
            warn!(request_id = %request_id, "Outcome reported for unknown request");
        }
        Ok(pattern)
    }

    /// Report the quality of an executed plan
    pub async fn record_plan_outcome(&self, plan: &Plan, quality: f64) -> Result<LearningPattern> {
        let context = OutcomeContext::new()
            .with_category(plan.recommendation.category)
            .with_request_id(plan.request_id);
        self.record_outcome(
            &plan.prompt,
            &plan.recommendation.selected_backends,
            plan.recommendation.strategy,
            quality,
            Some(context),
        )
        .await
    }

    /// Cancel a running request; false if it is unknown or already finished
    pub fn cancel(&self, request_id: Uuid) -> bool {
        self.executor.cancel(request_id)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn learning(&self) -> &LearningStore {
        &self.learning
    }

    pub fn history(&self) -> &RecommendationHistory {
        &self.history
    }

    pub fn executor(&self) -> &OrchestrationExecutor {
        &self.executor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BackendConfig, SpecializationProfile};
    use crate::transport::{BackendScript, ScriptedTransport};

    fn registry() -> ModelRegistry {
        let mut registry = ModelRegistry::new();
        registry.register(
            BackendConfig::new("coder", "http://localhost:1", "coder-model")
                .with_specialization(SpecializationProfile::new(0.2, 0.95, 0.6, 0.3)),
        );
        registry.register(
            BackendConfig::new("writer", "http://localhost:2", "writer-model")
                .with_specialization(SpecializationProfile::new(0.95, 0.2, 0.4, 0.7)),
        );
        registry
    }

    fn transport() -> ScriptedTransport {
        ScriptedTransport::new()
            .with_backend("coder", BackendScript::reply("use a hash map"))
            .with_backend("writer", BackendScript::reply("once upon a time"))
    }

    async fn athena(transport: &ScriptedTransport) -> Athena {
        Athena::builder()
            .with_registry(registry())
            .with_transport(Arc::new(transport.clone()))
            .build()
            .await
            .unwrap()
    }

    async fn athena_with(persistence: Arc<dyn Persistence>) -> Athena {
        Athena::builder()
            .with_registry(registry())
            .with_transport(Arc::new(transport()))
            .with_persistence(persistence)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_recommend_orchestrate_and_learn() {
        let transport = transport();
        let athena = athena(&transport).await;

        let plan = athena
            .recommend("Implement a function to debug this rust code", None)
            .await;
        assert!(!plan.recommendation.is_empty());
        assert_eq!(athena.history().len().await, 1);

        let result = athena.orchestrate(&plan).unwrap().result().await.unwrap();
        assert_eq!(result.request_id, plan.request_id);
        assert!(!result.text.is_empty());

        let pattern = athena.record_plan_outcome(&plan, 0.9).await.unwrap();
        assert_eq!(pattern.usage_count, 1);
        assert_eq!(athena.learning().len(), 1);

        let record = athena.history().get(plan.request_id).await.unwrap();
        assert_eq!(record.outcome_quality, Some(0.9));
    }

    #[tokio::test]
    async fn test_record_outcome_rejects_bad_quality() {
        let athena = athena(&transport()).await;
        let result = athena
            .record_outcome("hi", &["coder".to_string()], Strategy::Parallel, 1.5, None)
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(athena.learning().is_empty());
    }

    #[tokio::test]
    async fn test_record_outcome_uses_context_category() {
        let athena = athena(&transport()).await;
        let context = OutcomeContext::new()
            .with_category(Category::Analytical)
            .with_backend_score("coder", 0.2);
        let pattern = athena
            .record_outcome(
                "write a poem",
                &["coder".to_string(), "writer".to_string()],
                Strategy::Weighted,
                0.8,
                Some(context),
            )
            .await
            .unwrap();
        assert_eq!(pattern.category, Category::Analytical);

        let snapshot = athena.learning().snapshot();
        assert_eq!(snapshot.backend_performance("coder"), Some(0.2));
        assert_eq!(snapshot.backend_performance("writer"), Some(0.8));
    }

    #[tokio::test]
    async fn test_learning_survives_rebuild() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());

        let first = athena_with(Arc::clone(&persistence)).await;
        let plan = first.recommend("write a short story about a dragon", None).await;
        first.record_plan_outcome(&plan, 1.0).await.unwrap();

        let second = athena_with(persistence).await;
        assert_eq!(second.learning().len(), 1);
        assert_eq!(second.history().len().await, 1);
    }

    #[tokio::test]
    async fn test_cancel_unknown_request() {
        let athena = athena(&transport()).await;
        assert!(!athena.cancel(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = Config::default();
        config.decision.max_backends = 0;
        let result = Athena::builder()
            .with_config(config)
            .with_registry(registry())
            .with_transport(Arc::new(transport()))
            .build()
            .await;
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }
}
