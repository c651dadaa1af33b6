//! Meta-orchestration decision engine
//!
//! Combines a prompt analysis with a learning snapshot into a
//! [`Recommendation`]: which backends to call, how much to trust each, and
//! which strategy merges their outputs. Pure and synchronous; identical
//! inputs give identical recommendations.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use super::types::{CurrentSelection, DecisionStep, Recommendation};
use crate::analysis::{Complexity, PromptAnalysis};
use crate::config::DecisionConfig;
use crate::error::{Error, Result};
use crate::learning::{LearningPattern, LearningSnapshot};
use crate::registry::{BackendId, ModelRegistry};
use crate::strategy::{self, Strategy};

/// Backends taken by the fallback recommendation
const FALLBACK_BACKENDS: usize = 2;

/// Confidence reported by the fallback recommendation
const FALLBACK_CONFIDENCE: f64 = 0.5;

/// A backend with its ranking inputs
#[derive(Debug, Clone)]
struct Ranked {
    id: BackendId,
    affinity: f64,
    performance: f64,
    score: f64,
}

/// Produces recommendations
pub struct DecisionEngine {
    config: DecisionConfig,
    registry: Arc<ModelRegistry>,
}

impl DecisionEngine {
    pub fn new(config: DecisionConfig, registry: Arc<ModelRegistry>) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    /// Number of backends to select for a complexity level, before capping
    pub fn target_count(complexity: Complexity) -> usize {
        match complexity {
            Complexity::Simple => 2,
            Complexity::Moderate => 3,
            Complexity::Complex => 4,
            Complexity::Expert => 5,
        }
    }

    /// Recommend backends, weights, and a strategy
    ///
    /// Never fails: if the decision cannot be made, a deterministic fallback
    /// (first backends, parallel, neutral confidence) is returned with
    /// `fallback` set. With no available backends the selection is empty.
    pub fn recommend(
        &self,
        analysis: &PromptAnalysis,
        available: &[BackendId],
        current: Option<&CurrentSelection>,
        learning: &LearningSnapshot,
    ) -> Recommendation {
        let available = dedup(available);

        if available.is_empty() {
            warn!(category = %analysis.category, "No backends available for recommendation");
            return self.fallback(
                analysis,
                &available,
                current,
                "no backends are available".to_string(),
            );
        }

        match self.try_recommend(analysis, &available, current, learning) {
            Ok(recommendation) => {
                debug!(
                    category = %recommendation.category,
                    strategy = %recommendation.strategy,
                    backends = ?recommendation.selected_backends,
                    confidence = recommendation.overall_confidence,
                    auto_apply = recommendation.auto_apply_eligible,
                    "Recommendation ready"
                );
                recommendation
            }
            Err(e) => {
                warn!(error = %e, code = e.code(), "Recommendation failed, using fallback");
                self.fallback(analysis, &available, current, e.to_string())
            }
        }
    }

    fn try_recommend(
        &self,
        analysis: &PromptAnalysis,
        available: &[BackendId],
        current: Option<&CurrentSelection>,
        learning: &LearningSnapshot,
    ) -> Result<Recommendation> {
        let category = analysis.category;
        let mut trace = Vec::with_capacity(6);

        // Category detection
        let mut step = DecisionStep::new(
            "What kind of prompt is this?",
            format!("{} with {} complexity", category, analysis.complexity),
            analysis.confidence,
        )
        .with_evidence(format!(
            "creativity {:.2}, technical {:.2}, reasoning {:.2}",
            analysis.creativity, analysis.technical, analysis.reasoning
        ))
        .with_evidence(format!("analyzed by {:?}", analysis.source).to_lowercase());
        if !analysis.topics.is_empty() {
            let topics: Vec<&str> = analysis.topics.iter().map(String::as_str).collect();
            step = step.with_evidence(format!("topics: {}", topics.join(", ")));
        }
        trace.push(step);

        // Ranking
        let ranked = self.rank(analysis, available, learning)?;
        let count = Self::target_count(analysis.complexity)
            .min(self.config.max_backends)
            .min(ranked.len())
            .max(1);

        // Pattern lookup
        let best_pattern = learning.best_pattern(category);
        let override_pattern = self.pattern_override(best_pattern, available, &mut trace);

        let selected: Vec<&Ranked> = match override_pattern {
            Some(pattern) => ranked
                .iter()
                .filter(|r| pattern.backends.contains(&r.id))
                .collect(),
            None => ranked.iter().take(count).collect(),
        };
        if selected.is_empty() {
            return Err(Error::RecommendationFailed("selection came out empty".into()));
        }

        let mut step = DecisionStep::new(
            "Which backends fit this prompt best?",
            join_ids(selected.iter().map(|r| &r.id)),
            mean(selected.iter().map(|r| r.score)),
        );
        for r in &ranked {
            step = step.with_evidence(format!(
                "{}: affinity {:.2}, performance {:.2}, score {:.3}",
                r.id, r.affinity, r.performance, r.score
            ));
        }
        if override_pattern.is_none() {
            step = step.with_evidence(format!(
                "took top {} for {} complexity",
                selected.len(),
                analysis.complexity
            ));
        }
        trace.push(step);

        // Strategy
        let (strategy, step) = match override_pattern {
            Some(pattern) => (
                pattern.strategy,
                DecisionStep::new(
                    "Which strategy should combine the outputs?",
                    pattern.strategy.to_string(),
                    pattern.success_score,
                )
                .with_evidence("reused from learned pattern"),
            ),
            None => {
                let (strategy, rule) =
                    strategy::suggest(category, analysis.complexity, &analysis.topics);
                let mut step = DecisionStep::new(
                    "Which strategy should combine the outputs?",
                    strategy.to_string(),
                    analysis.confidence,
                )
                .with_evidence(rule.describe());
                if analysis.suggested_strategy != strategy {
                    step = step.with_evidence(format!(
                        "analyzer suggested {}",
                        analysis.suggested_strategy
                    ));
                }
                (strategy, step)
            }
        };
        trace.push(step);

        // Weights
        let (weights, step) = self.weights(analysis, &selected);
        trace.push(step);

        let selected_backends: Vec<BackendId> = selected.iter().map(|r| r.id.clone()).collect();
        let per_backend_confidence: BTreeMap<BackendId, f64> = selected
            .iter()
            .map(|r| (r.id.clone(), r.score.clamp(0.0, 1.0)))
            .collect();

        // Overall confidence
        let mut overall = mean(selected.iter().map(|r| r.score.clamp(0.0, 1.0)));
        if let Some(pattern) = best_pattern {
            overall = 0.5 * overall + 0.5 * pattern.success_score;
        }
        if analysis.complexity == Complexity::Expert {
            overall -= self.config.expert_confidence_penalty;
        }
        let overall = overall.clamp(0.0, 1.0);

        if !overall.is_finite() || weights.iter().any(|w| !w.is_finite()) {
            return Err(Error::RecommendationFailed(
                "non-finite confidence or weight".into(),
            ));
        }

        let differs_from_current = current.map(|c| {
            let differs = !same_selection(&selected_backends, strategy, c);
            trace.push(
                DecisionStep::new(
                    "How does this compare to the current selection?",
                    if differs {
                        "differs from the current selection"
                    } else {
                        "matches the current selection"
                    },
                    overall,
                )
                .with_evidence(format!(
                    "current: {} with {}",
                    join_ids(c.backends.iter()),
                    c.strategy
                )),
            );
            differs
        });

        Ok(Recommendation {
            category,
            selected_backends,
            strategy,
            weights,
            per_backend_confidence,
            overall_confidence: overall,
            decision_trace: trace,
            auto_apply_eligible: overall >= self.config.auto_apply_threshold,
            fallback: false,
            differs_from_current,
        })
    }

    /// Score every available backend; ties keep the order of `available`
    fn rank(
        &self,
        analysis: &PromptAnalysis,
        available: &[BackendId],
        learning: &LearningSnapshot,
    ) -> Result<Vec<Ranked>> {
        let mut ranked = Vec::with_capacity(available.len());
        for id in available {
            let affinity = analysis
                .affinity(id)
                .unwrap_or(self.config.default_performance);
            let performance = learning
                .backend_performance(id)
                .unwrap_or(self.config.default_performance);
            let score = self.config.affinity_weight * affinity
                + self.config.performance_weight * performance;
            if !score.is_finite() {
                return Err(Error::RecommendationFailed(format!(
                    "backend '{}' has a non-finite score",
                    id
                )));
            }
            ranked.push(Ranked {
                id: id.clone(),
                affinity,
                performance,
                score,
            });
        }
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(ranked)
    }

    /// Decide whether the category's best pattern overrides ranking
    fn pattern_override<'a>(
        &self,
        best: Option<&'a LearningPattern>,
        available: &[BackendId],
        trace: &mut Vec<DecisionStep>,
    ) -> Option<&'a LearningPattern> {
        let question = "Has a similar request worked well before?";

        let Some(pattern) = best else {
            trace.push(DecisionStep::new(question, "no learned pattern", FALLBACK_CONFIDENCE));
            return None;
        };

        let evidence = format!(
            "{} with {}: score {:.2} over {} uses",
            join_ids(pattern.backends.iter()),
            pattern.strategy,
            pattern.success_score,
            pattern.usage_count
        );

        if pattern.success_score <= self.config.pattern_override_threshold {
            trace.push(
                DecisionStep::new(
                    question,
                    "best pattern is below the reuse threshold",
                    pattern.success_score,
                )
                .with_evidence(evidence),
            );
            return None;
        }

        let missing: Vec<&BackendId> = pattern
            .backends
            .iter()
            .filter(|b| !available.contains(b))
            .collect();
        if !missing.is_empty() {
            trace.push(
                DecisionStep::new(
                    question,
                    "pattern skipped, some of its backends are unavailable",
                    pattern.success_score,
                )
                .with_evidence(evidence)
                .with_evidence(format!("unavailable: {}", join_ids(missing.into_iter()))),
            );
            return None;
        }

        let cap = self.config.max_backends.max(1);
        if pattern.backends.len() > cap {
            trace.push(
                DecisionStep::new(
                    question,
                    "pattern skipped, it uses more backends than allowed",
                    pattern.success_score,
                )
                .with_evidence(evidence)
                .with_evidence(format!("limit is {} backends", cap)),
            );
            return None;
        }

        trace.push(
            DecisionStep::new(question, "reusing learned pattern", pattern.success_score)
                .with_evidence(evidence),
        );
        Some(pattern)
    }

    /// Normalized weights for the selected backends, with the weighting step
    fn weights(&self, analysis: &PromptAnalysis, selected: &[&Ranked]) -> (Vec<f64>, DecisionStep) {
        let mut evidence = Vec::new();

        let raw: Vec<f64> = selected
            .iter()
            .map(|r| {
                let strong = self.registry.get(&r.id).is_some_and(|b| {
                    b.specialization.score_for(analysis.category)
                        >= self.config.strong_specialization
                });
                if strong {
                    evidence.push(format!(
                        "{} is strong at {} prompts (x{})",
                        r.id, analysis.category, self.config.category_multiplier
                    ));
                    r.score.max(0.0) * self.config.category_multiplier
                } else {
                    r.score.max(0.0)
                }
            })
            .collect();

        let mut weights = normalize(&raw);

        if analysis.complexity == Complexity::Expert && weights.len() > 1 {
            let top = weights
                .iter()
                .enumerate()
                .fold(0, |best, (i, w)| if *w > weights[best] { i } else { best });
            weights[top] *= self.config.expert_top_boost;
            weights = normalize(&weights);
            evidence.push(format!(
                "expert complexity: boosted {} (x{})",
                selected[top].id, self.config.expert_top_boost
            ));
        }

        let answer = selected
            .iter()
            .zip(&weights)
            .map(|(r, w)| format!("{} {:.2}", r.id, w))
            .collect::<Vec<_>>()
            .join(", ");

        let mut step = DecisionStep::new(
            "How much should each backend count?",
            answer,
            mean(raw.iter().copied()).min(1.0),
        );
        step.evidence = evidence;
        (weights, step)
    }

    /// Deterministic recommendation used when no proper decision can be made
    fn fallback(
        &self,
        analysis: &PromptAnalysis,
        available: &[BackendId],
        current: Option<&CurrentSelection>,
        reason: String,
    ) -> Recommendation {
        let selected_backends: Vec<BackendId> = available
            .iter()
            .take(FALLBACK_BACKENDS.min(self.config.max_backends.max(1)))
            .cloned()
            .collect();
        let strategy = Strategy::Parallel;

        Recommendation {
            category: analysis.category,
            weights: vec![1.0; selected_backends.len()],
            per_backend_confidence: selected_backends
                .iter()
                .map(|id| (id.clone(), FALLBACK_CONFIDENCE))
                .collect(),
            overall_confidence: FALLBACK_CONFIDENCE,
            decision_trace: vec![
                DecisionStep::new(
                    "Could a recommendation be computed?",
                    "no, using the default selection",
                    FALLBACK_CONFIDENCE,
                )
                .with_evidence(reason),
            ],
            auto_apply_eligible: FALLBACK_CONFIDENCE >= self.config.auto_apply_threshold,
            fallback: true,
            differs_from_current: current.map(|c| !same_selection(&selected_backends, strategy, c)),
            selected_backends,
            strategy,
        }
    }
}

/// Scale weights to sum to their count; all-zero input gives equal weights
fn normalize(raw: &[f64]) -> Vec<f64> {
    let n = raw.len() as f64;
    let sum: f64 = raw.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        return vec![1.0; raw.len()];
    }
    raw.iter().map(|w| w * n / sum).collect()
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}

fn dedup(ids: &[BackendId]) -> Vec<BackendId> {
    let mut seen = HashSet::new();
    ids.iter().filter(|id| seen.insert(id.as_str())).cloned().collect()
}

fn join_ids<'a>(ids: impl Iterator<Item = &'a BackendId>) -> String {
    ids.map(String::as_str).collect::<Vec<_>>().join(", ")
}

fn same_selection(backends: &[BackendId], strategy: Strategy, current: &CurrentSelection) -> bool {
    let mut ours = backends.to_vec();
    let mut theirs = current.backends.clone();
    ours.sort();
    theirs.sort();
    ours == theirs && strategy == current.strategy
}
