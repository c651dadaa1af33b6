//! Response synthesis
//!
//! Pure merge of per-backend outputs into one answer, following the same
//! strategy rules the executor runs. A "successful" output with blank text
//! counts as a failure; if nothing usable is left the result is
//! [`Error::AllBackendsFailed`], never an empty string.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::registry::BackendId;
use crate::strategy::Strategy;

/// Share of a sentence's words already in the primary answer above which
/// it is not repeated as an additional point
const NOVELTY_COVERAGE: f64 = 0.5;

/// Sentences shorter than this are never promoted to additional points
const MIN_POINT_WORDS: usize = 3;

/// Output of one backend
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisInput {
    pub backend_id: BackendId,
    pub weight: f64,
    pub text: String,
    pub success: bool,
    pub error: Option<String>,
}

impl SynthesisInput {
    pub fn succeeded(backend_id: impl Into<String>, weight: f64, text: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            weight,
            text: text.into(),
            success: true,
            error: None,
        }
    }

    pub fn failed(backend_id: impl Into<String>, weight: f64, error: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            weight,
            text: String::new(),
            success: false,
            error: Some(error.into()),
        }
    }

    fn is_usable(&self) -> bool {
        self.success && !self.text.trim().is_empty()
    }

    fn failure_reason(&self) -> String {
        match &self.error {
            Some(error) => format!("{}: {}", self.backend_id, error),
            None if self.success => format!("{}: empty response", self.backend_id),
            None => format!("{}: failed", self.backend_id),
        }
    }
}

/// How much one backend shaped the final answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub backend_id: BackendId,
    /// Share of the final answer in [0, 1]; shares of usable outputs sum to 1
    pub share: f64,
    /// Mean agreement with the other responses (consensus only)
    pub agreement: Option<f64>,
    /// Flagged as disagreeing with the rest (consensus only)
    pub outlier: bool,
    /// Whether the output was usable at all
    pub usable: bool,
}

/// Final answer with per-backend contributions
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisOutput {
    pub text: String,
    /// In input order
    pub contributions: Vec<Contribution>,
}

/// Merge backend outputs according to a strategy
pub fn synthesize(
    strategy: Strategy,
    inputs: &[SynthesisInput],
    outlier_threshold: f64,
) -> Result<SynthesisOutput> {
    let usable: Vec<usize> = (0..inputs.len()).filter(|i| inputs[*i].is_usable()).collect();

    if usable.is_empty() {
        return Err(Error::AllBackendsFailed {
            failures: inputs.iter().map(SynthesisInput::failure_reason).collect(),
        });
    }

    let mut contributions: Vec<Contribution> = inputs
        .iter()
        .map(|input| Contribution {
            backend_id: input.backend_id.clone(),
            share: 0.0,
            agreement: None,
            outlier: false,
            usable: input.is_usable(),
        })
        .collect();

    let text = match strategy {
        Strategy::Parallel | Strategy::Adaptive => {
            let share = 1.0 / usable.len() as f64;
            for &i in &usable {
                contributions[i].share = share;
            }
            concatenate(inputs, &usable, |input| format!("### {}", input.backend_id))
        }
        Strategy::Sequential => {
            let last = usable[usable.len() - 1];
            contributions[last].share = 1.0;
            inputs[last].text.trim().to_string()
        }
        Strategy::Weighted => {
            let mut order = usable.clone();
            order.sort_by(|a, b| inputs[*b].weight.total_cmp(&inputs[*a].weight));

            let shares = proportional(order.iter().map(|i| inputs[*i].weight.max(0.0)));
            for (&i, share) in order.iter().zip(&shares) {
                contributions[i].share = *share;
            }
            let share_of = |id: &str| {
                contributions
                    .iter()
                    .find(|c| c.backend_id == id)
                    .map(|c| c.share)
                    .unwrap_or(0.0)
            };
            concatenate(inputs, &order, |input| {
                format!(
                    "### {} ({:.0}%)",
                    input.backend_id,
                    share_of(&input.backend_id) * 100.0
                )
            })
        }
        Strategy::Consensus => consensus(inputs, &usable, outlier_threshold, &mut contributions),
    };

    Ok(SynthesisOutput {
        text,
        contributions,
    })
}

/// Join the selected outputs under headers; a single output is returned as is
fn concatenate(
    inputs: &[SynthesisInput],
    order: &[usize],
    header: impl Fn(&SynthesisInput) -> String,
) -> String {
    if let [only] = order {
        return inputs[*only].text.trim().to_string();
    }
    order
        .iter()
        .map(|i| format!("{}\n\n{}", header(&inputs[*i]), inputs[*i].text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Scale non-negative values to sum to 1; all-zero input gives equal shares
fn proportional(values: impl Iterator<Item = f64>) -> Vec<f64> {
    let values: Vec<f64> = values.collect();
    let sum: f64 = values.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        let equal = 1.0 / values.len().max(1) as f64;
        return vec![equal; values.len()];
    }
    values.iter().map(|v| v / sum).collect()
}

/// Lowercase alphanumeric words
pub fn word_set(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Jaccard similarity of two word sets; two empty sets are identical
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Agreement-weighted merge
///
/// The response agreeing most with the others is the primary answer.
/// Sentences from other agreeing responses that the primary does not
/// already cover are appended as additional points. Outliers (only
/// decidable with three or more responses) are appended as divergent views.
fn consensus(
    inputs: &[SynthesisInput],
    usable: &[usize],
    outlier_threshold: f64,
    contributions: &mut [Contribution],
) -> String {
    if let [only] = usable {
        contributions[*only].share = 1.0;
        contributions[*only].agreement = Some(1.0);
        return inputs[*only].text.trim().to_string();
    }

    let sets: Vec<BTreeSet<String>> = usable.iter().map(|i| word_set(&inputs[*i].text)).collect();
    let agreement: Vec<f64> = (0..usable.len())
        .map(|a| {
            let total: f64 = (0..usable.len())
                .filter(|b| *b != a)
                .map(|b| jaccard(&sets[a], &sets[b]))
                .sum();
            total / (usable.len() - 1) as f64
        })
        .collect();

    let decidable = usable.len() >= 3;
    let shares = proportional(agreement.iter().copied());
    for (k, &i) in usable.iter().enumerate() {
        contributions[i].agreement = Some(agreement[k]);
        contributions[i].share = shares[k];
        contributions[i].outlier = decidable && agreement[k] < outlier_threshold;
    }

    // Highest agreement; ties go to the earlier response
    let primary = (0..usable.len()).fold(0, |best, k| {
        if agreement[k] > agreement[best] { k } else { best }
    });

    let mut text = inputs[usable[primary]].text.trim().to_string();
    let primary_words = &sets[primary];

    let mut seen = BTreeSet::new();
    let mut points = Vec::new();
    for (k, &i) in usable.iter().enumerate() {
        if k == primary || contributions[i].outlier {
            continue;
        }
        for sentence in sentences(&inputs[i].text) {
            let words = word_set(sentence);
            if words.len() < MIN_POINT_WORDS {
                continue;
            }
            let covered = words.intersection(primary_words).count() as f64 / words.len() as f64;
            if covered < NOVELTY_COVERAGE && seen.insert(sentence.to_lowercase()) {
                points.push(format!("- {} ({})", sentence, inputs[i].backend_id));
            }
        }
    }
    if !points.is_empty() {
        text.push_str("\n\n### Additional points\n\n");
        text.push_str(&points.join("\n"));
    }

    for (k, &i) in usable.iter().enumerate() {
        if contributions[i].outlier {
            text.push_str(&format!(
                "\n\n### Divergent view: {} (agreement {:.2})\n\n{}",
                inputs[i].backend_id,
                agreement[k],
                inputs[i].text.trim()
            ));
        }
    }

    text
}

fn sentences(text: &str) -> impl Iterator<Item = &str> {
    text.split_inclusive(['.', '!', '?', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: f64 = 0.15;

    fn shares(output: &SynthesisOutput) -> Vec<f64> {
        output.contributions.iter().map(|c| c.share).collect()
    }

    #[test]
    fn test_all_failed_is_an_error() {
        let inputs = vec![
            SynthesisInput::failed("a", 1.0, "timed out"),
            SynthesisInput::succeeded("b", 1.0, "   "),
        ];
        match synthesize(Strategy::Parallel, &inputs, THRESHOLD) {
            Err(Error::AllBackendsFailed { failures }) => {
                assert_eq!(failures, vec!["a: timed out", "b: empty response"]);
            }
            other => panic!("expected AllBackendsFailed, got {:?}", other),
        }
        assert!(synthesize(Strategy::Consensus, &[], THRESHOLD).is_err());
    }

    #[test]
    fn test_parallel_concatenates_successes() {
        let inputs = vec![
            SynthesisInput::succeeded("a", 1.0, "alpha"),
            SynthesisInput::failed("b", 1.0, "boom"),
            SynthesisInput::succeeded("c", 1.0, "gamma\n"),
        ];
        let output = synthesize(Strategy::Parallel, &inputs, THRESHOLD).unwrap();
        assert_eq!(output.text, "### a\n\nalpha\n\n### c\n\ngamma");
        assert_eq!(shares(&output), vec![0.5, 0.0, 0.5]);
        assert!(!output.contributions[1].usable);
    }

    #[test]
    fn test_single_success_is_returned_as_is() {
        let inputs = vec![
            SynthesisInput::failed("a", 1.0, "boom"),
            SynthesisInput::succeeded("b", 1.0, "only answer"),
        ];
        for strategy in Strategy::ALL {
            let output = synthesize(strategy, &inputs, THRESHOLD).unwrap();
            assert_eq!(output.text, "only answer");
            assert_eq!(output.contributions[1].share, 1.0);
        }
    }

    #[test]
    fn test_sequential_returns_last_link() {
        let inputs = vec![
            SynthesisInput::succeeded("draft", 1.0, "first draft"),
            SynthesisInput::succeeded("edit", 1.0, "edited version"),
        ];
        let output = synthesize(Strategy::Sequential, &inputs, THRESHOLD).unwrap();
        assert_eq!(output.text, "edited version");
        assert_eq!(shares(&output), vec![0.0, 1.0]);
    }

    #[test]
    fn test_weighted_orders_by_weight() {
        let inputs = vec![
            SynthesisInput::succeeded("light", 0.5, "minor"),
            SynthesisInput::succeeded("heavy", 1.5, "major"),
        ];
        let output = synthesize(Strategy::Weighted, &inputs, THRESHOLD).unwrap();
        assert_eq!(output.text, "### heavy (75%)\n\nmajor\n\n### light (25%)\n\nminor");
        assert_eq!(shares(&output), vec![0.25, 0.75]);
    }

    #[test]
    fn test_jaccard() {
        let a = word_set("The cat sat");
        let b = word_set("the cat ran");
        assert!((jaccard(&a, &b) - 0.5).abs() < 1e-12);
        assert_eq!(jaccard(&BTreeSet::new(), &BTreeSet::new()), 1.0);
    }

    #[test]
    fn test_consensus_flags_outlier_with_three_responses() {
        let inputs = vec![
            SynthesisInput::succeeded("a", 1.0, "The answer is 42 because of the derivation."),
            SynthesisInput::succeeded(
                "b",
                1.0,
                "The answer is 42 because of the derivation shown.",
            ),
            SynthesisInput::succeeded("c", 1.0, "Bananas grow quickly in tropical climates."),
        ];
        let output = synthesize(Strategy::Consensus, &inputs, THRESHOLD).unwrap();

        assert!(!output.contributions[0].outlier);
        assert!(!output.contributions[1].outlier);
        assert!(output.contributions[2].outlier);
        assert!(output.text.starts_with("The answer is 42"));
        assert!(output.text.contains("### Divergent view: c"));
        assert!(output.text.contains("Bananas"));

        let total: f64 = shares(&output).iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(output.contributions[2].share < output.contributions[0].share);
    }

    #[test]
    fn test_consensus_two_responses_has_no_outliers() {
        let inputs = vec![
            SynthesisInput::succeeded("a", 1.0, "completely different words here"),
            SynthesisInput::succeeded("b", 1.0, "nothing shared at all"),
        ];
        let output = synthesize(Strategy::Consensus, &inputs, THRESHOLD).unwrap();
        assert!(output.contributions.iter().all(|c| !c.outlier));
        // Zero agreement everywhere gives equal shares
        assert_eq!(shares(&output), vec![0.5, 0.5]);
        assert!(output.text.starts_with("completely different words here"));
        assert!(output.text.contains("### Additional points"));
        assert!(output.text.contains("- nothing shared at all (b)"));
    }

    #[test]
    fn test_consensus_does_not_repeat_covered_sentences() {
        let inputs = vec![
            SynthesisInput::succeeded("a", 1.0, "Rust has ownership. It prevents data races."),
            SynthesisInput::succeeded(
                "b",
                1.0,
                "Rust has ownership. It prevents data races. Borrowing rules apply everywhere.",
            ),
            SynthesisInput::succeeded("c", 1.0, "Rust has ownership and it prevents data races."),
        ];
        let output = synthesize(Strategy::Consensus, &inputs, THRESHOLD).unwrap();
        assert_eq!(output.text.matches("prevents data races").count(), 1);
    }
}
