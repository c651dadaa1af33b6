//! Remote prompt classifier
//!
//! A fast backend is asked to classify the prompt against a strict JSON
//! schema. Its reply is parsed defensively: the first well-formed JSON
//! object in the text is extracted and validated into a
//! [`ClassifierVerdict`]. Anything else is an error, which the analyzer
//! answers by falling back to the heuristic path.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::types::{Category, Complexity};
use crate::error::{Error, Result};
use crate::strategy::Strategy;
use crate::transport::{CompletionRequest, Message, Transport};

/// Upper bound on classifier output; the schema is small
const CLASSIFIER_MAX_TOKENS: usize = 300;

const CLASSIFIER_SYSTEM_PROMPT: &str = r#"You classify prompts for a multi-model orchestrator.
Reply with exactly one JSON object and nothing else, matching this schema:
{
  "category": "creative" | "technical" | "analytical" | "conversational" | "mixed",
  "complexity": "simple" | "moderate" | "complex" | "expert",
  "creativity": number between 0 and 1,
  "technical": number between 0 and 1,
  "reasoning": number between 0 and 1,
  "topics": array of short lowercase strings,
  "suggested_strategy": "parallel" | "sequential" | "consensus" | "weighted" | "adaptive",
  "confidence": number between 0 and 1
}"#;

/// Validated classifier output
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierVerdict {
    pub category: Category,
    pub complexity: Complexity,
    pub creativity: f64,
    pub technical: f64,
    pub reasoning: f64,
    pub topics: BTreeSet<String>,
    pub suggested_strategy: Option<Strategy>,
    pub confidence: f64,
}

/// Raw shape of the classifier reply, before validation
#[derive(Debug, Deserialize)]
struct RawVerdict {
    category: String,
    complexity: String,
    #[serde(default)]
    creativity: f64,
    #[serde(default)]
    technical: f64,
    #[serde(default)]
    reasoning: f64,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    suggested_strategy: Option<String>,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    0.7
}

fn unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

impl ClassifierVerdict {
    /// Parse and validate a classifier reply
    ///
    /// Scores are clamped to [0, 1]. An unknown category or complexity is an
    /// error; an unknown strategy is dropped so the rule table decides.
    pub fn parse(reply: &str) -> Result<Self> {
        let object = extract_first_json_object(reply)
            .ok_or_else(|| Error::AnalysisFailed("no JSON object in classifier reply".into()))?;

        let raw: RawVerdict = serde_json::from_str(object)
            .map_err(|e| Error::AnalysisFailed(format!("malformed classifier reply: {}", e)))?;

        let category = raw.category.parse::<Category>().map_err(Error::AnalysisFailed)?;
        let complexity = raw
            .complexity
            .parse::<Complexity>()
            .map_err(Error::AnalysisFailed)?;

        Ok(Self {
            category,
            complexity,
            creativity: unit(raw.creativity),
            technical: unit(raw.technical),
            reasoning: unit(raw.reasoning),
            topics: raw
                .topics
                .into_iter()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
            suggested_strategy: raw.suggested_strategy.and_then(|s| s.parse().ok()),
            confidence: unit(raw.confidence),
        })
    }
}

/// Find the first balanced `{...}` that parses as JSON
///
/// Braces inside string literals are ignored. Candidates that balance but
/// fail to parse are skipped.
pub fn extract_first_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut search_from = 0;

    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        let mut end = None;

        for (i, &b) in bytes.iter().enumerate().skip(start) {
            if in_string {
                match b {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }

        let Some(end) = end else {
            search_from = start + 1;
            continue;
        };
        let candidate = &text[start..=end];
        if serde_json::from_str::<serde_json::Value>(candidate).is_ok() {
            return Some(candidate);
        }
        search_from = start + 1;
    }
    None
}

/// Classifies prompts
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, prompt: &str) -> Result<ClassifierVerdict>;
}

/// Classifier backed by a single-shot completion on a configured backend
pub struct RemoteClassifier {
    transport: Arc<dyn Transport>,
    backend_id: String,
}

impl RemoteClassifier {
    pub fn new(transport: Arc<dyn Transport>, backend_id: impl Into<String>) -> Self {
        Self {
            transport,
            backend_id: backend_id.into(),
        }
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }
}

#[async_trait]
impl Classifier for RemoteClassifier {
    async fn classify(&self, prompt: &str) -> Result<ClassifierVerdict> {
        let request = CompletionRequest::new(
            &self.backend_id,
            vec![
                Message::system(CLASSIFIER_SYSTEM_PROMPT),
                Message::user(prompt),
            ],
        )
        .with_max_tokens(CLASSIFIER_MAX_TOKENS)
        .with_temperature(0.0);

        let reply = self.transport.complete(request).await?;
        debug!(backend = %self.backend_id, reply_len = reply.len(), "Classifier replied");
        ClassifierVerdict::parse(&reply)
    }
}
