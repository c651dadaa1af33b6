//! Per-request orchestration state

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::decision::Recommendation;
use crate::registry::BackendId;
use crate::strategy::Strategy;
use crate::synthesis::SynthesisInput;
use crate::transport::Message;

/// Lifecycle of one backend call within a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    Queued,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl BackendState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Allowed moves: queued to streaming, streaming to completed or failed,
    /// and cancelled from either live state. A queued call whose dispatch
    /// cannot happen fails directly.
    pub fn can_transition_to(&self, next: BackendState) -> bool {
        use BackendState::*;
        matches!(
            (self, next),
            (Queued, Streaming)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Streaming, Completed)
                | (Streaming, Failed)
                | (Streaming, Cancelled)
        )
    }
}

impl std::fmt::Display for BackendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Streaming => write!(f, "streaming"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One backend's call within a request
#[derive(Debug, Clone)]
pub struct BackendRun {
    pub backend_id: BackendId,
    pub weight: f64,
    /// Confidence the recommendation gave this backend
    pub confidence: f64,
    pub state: BackendState,
    /// Output received so far
    pub buffer: String,
    /// Messages of the current dispatch, replayed on reconnect
    pub messages: Vec<Message>,
    pub dispatch_count: u32,
    pub dispatched_at: Option<Instant>,
    pub deadline: Option<Instant>,
    pub finished_at: Option<Instant>,
    pub error: Option<String>,
}

/// Final state of one backend call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendTrace {
    pub backend_id: BackendId,
    pub state: BackendState,
    /// From first dispatch to the terminal state; absent if never dispatched
    pub latency: Option<Duration>,
    pub error: Option<String>,
    pub dispatch_count: u32,
}

/// Everything the executor tracks for one request
#[derive(Debug)]
pub struct OrchestrationSession {
    pub request_id: Uuid,
    pub prompt: String,
    pub strategy: Strategy,
    pub created_at: DateTime<Utc>,
    pub started: Instant,
    runs: Vec<BackendRun>,
}

impl OrchestrationSession {
    pub fn new(
        request_id: Uuid,
        prompt: impl Into<String>,
        recommendation: &Recommendation,
    ) -> Self {
        let runs = recommendation
            .weighted_backends()
            .map(|(backend_id, weight)| BackendRun {
                backend_id: backend_id.clone(),
                weight,
                confidence: recommendation.confidence_of(backend_id).unwrap_or(0.5),
                state: BackendState::Queued,
                buffer: String::new(),
                messages: Vec::new(),
                dispatch_count: 0,
                dispatched_at: None,
                deadline: None,
                finished_at: None,
                error: None,
            })
            .collect();

        Self {
            request_id,
            prompt: prompt.into(),
            strategy: recommendation.strategy,
            created_at: Utc::now(),
            started: Instant::now(),
            runs,
        }
    }

    pub fn runs(&self) -> &[BackendRun] {
        &self.runs
    }

    pub fn run(&self, index: usize) -> &BackendRun {
        &self.runs[index]
    }

    pub fn position(&self, backend_id: &str) -> Option<usize> {
        self.runs.iter().position(|r| r.backend_id == backend_id)
    }

    pub fn total(&self) -> usize {
        self.runs.len()
    }

    /// Calls in a terminal state
    pub fn completed_count(&self) -> usize {
        self.runs.iter().filter(|r| r.state.is_terminal()).count()
    }

    pub fn all_terminal(&self) -> bool {
        self.runs.iter().all(|r| r.state.is_terminal())
    }

    /// Indices of calls currently streaming
    pub fn streaming(&self) -> Vec<usize> {
        self.indices(|r| r.state == BackendState::Streaming)
    }

    /// Indices of calls not yet in a terminal state
    pub fn live(&self) -> Vec<usize> {
        self.indices(|r| !r.state.is_terminal())
    }

    pub fn next_queued(&self) -> Option<usize> {
        self.runs.iter().position(|r| r.state == BackendState::Queued)
    }

    /// Earliest timeout among streaming calls
    pub fn next_deadline(&self) -> Option<Instant> {
        self.runs
            .iter()
            .filter(|r| r.state == BackendState::Streaming)
            .filter_map(|r| r.deadline)
            .min()
    }

    /// Start (or restart) a call; the deadline is kept across restarts
    pub fn mark_dispatched(
        &mut self,
        index: usize,
        messages: Vec<Message>,
        deadline: Instant,
    ) -> bool {
        let run = &mut self.runs[index];
        match run.state {
            BackendState::Queued => {
                run.state = BackendState::Streaming;
                run.dispatched_at = Some(Instant::now());
                run.deadline = Some(deadline);
            }
            BackendState::Streaming => {}
            other => {
                warn!(
                    backend = %run.backend_id,
                    state = %other,
                    "Refusing to dispatch finished call"
                );
                return false;
            }
        }
        run.messages = messages;
        run.buffer.clear();
        run.dispatch_count += 1;
        true
    }

    /// Append streamed output; ignored unless the call is streaming
    pub fn append(&mut self, index: usize, text: &str) -> bool {
        let run = &mut self.runs[index];
        if run.state != BackendState::Streaming {
            return false;
        }
        run.buffer.push_str(text);
        true
    }

    /// Move a call to a terminal state; invalid moves are ignored
    pub fn finish(&mut self, index: usize, state: BackendState, error: Option<String>) -> bool {
        let run = &mut self.runs[index];
        if !state.is_terminal() || !run.state.can_transition_to(state) {
            warn!(
                request_id = %self.request_id,
                backend = %run.backend_id,
                from = %run.state,
                to = %state,
                "Ignoring invalid state transition"
            );
            return false;
        }
        run.state = state;
        run.finished_at = Some(Instant::now());
        run.error = error;
        true
    }

    pub fn traces(&self) -> Vec<BackendTrace> {
        self.runs
            .iter()
            .map(|r| BackendTrace {
                backend_id: r.backend_id.clone(),
                state: r.state,
                latency: match (r.dispatched_at, r.finished_at) {
                    (Some(start), Some(end)) => Some(end.saturating_duration_since(start)),
                    _ => None,
                },
                error: r.error.clone(),
                dispatch_count: r.dispatch_count,
            })
            .collect()
    }

    /// Completed calls contribute their output; everything else counts as failed
    pub fn synthesis_inputs(&self) -> Vec<SynthesisInput> {
        self.runs
            .iter()
            .map(|r| match r.state {
                BackendState::Completed => {
                    SynthesisInput::succeeded(&r.backend_id, r.weight, r.buffer.clone())
                }
                state => SynthesisInput::failed(
                    &r.backend_id,
                    r.weight,
                    r.error.clone().unwrap_or_else(|| state.to_string()),
                ),
            })
            .collect()
    }

    fn indices(&self, predicate: impl Fn(&BackendRun) -> bool) -> Vec<usize> {
        (0..self.runs.len()).filter(|i| predicate(&self.runs[*i])).collect()
    }
}
