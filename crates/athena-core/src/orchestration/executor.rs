//! Request execution
//!
//! Each request runs on its own task with its own multiplexed stream. The
//! task owns the session, drives per-backend state from incoming frames,
//! enforces per-backend timeouts, reconnects after transport loss, and
//! hands the finished outputs to synthesis.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{EventSink, OrchestrationEvent, OrchestrationPhase};
use super::session::{BackendState, BackendTrace, OrchestrationSession};
use crate::config::ExecutorConfig;
use crate::decision::Recommendation;
use crate::error::{Error, Result};
use crate::strategy::Strategy;
use crate::synthesis::{self, Contribution};
use crate::transport::{FrameKind, Frame, Message, StreamSession, Transport, backoff_delay};

/// Instruction appended for every link of a sequential chain after the first
const SEQUENTIAL_FOLLOW_UP: &str =
    "Review the answer above and improve it. Reply with the complete improved answer.";

/// Final outcome of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisResult {
    pub request_id: Uuid,
    pub strategy: Strategy,
    pub text: String,
    pub contributions: Vec<Contribution>,
    /// Per-backend final state, in selection order
    pub backends: Vec<BackendTrace>,
    pub elapsed: Duration,
}

impl SynthesisResult {
    /// Backends whose output made it into the answer
    pub fn succeeded(&self) -> impl Iterator<Item = &BackendTrace> {
        self.backends
            .iter()
            .filter(|t| t.state == BackendState::Completed)
    }
}

/// Caller's side of a running request
#[derive(Debug)]
pub struct OrchestrationHandle {
    pub request_id: Uuid,
    /// Closes when the request finishes or is cancelled
    pub events: mpsc::UnboundedReceiver<OrchestrationEvent>,
    task: JoinHandle<Result<SynthesisResult>>,
}

impl OrchestrationHandle {
    /// Wait for the final answer
    pub async fn result(self) -> Result<SynthesisResult> {
        self.task
            .await
            .map_err(|e| Error::Transport(format!("orchestration task ended abnormally: {}", e)))?
    }

    /// Drain every event, then wait for the final answer
    pub async fn collect(mut self) -> (Vec<OrchestrationEvent>, Result<SynthesisResult>) {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        (events, self.result().await)
    }
}

struct ActiveRequest {
    token: CancellationToken,
    events: EventSink,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs recommendations against the backends
#[derive(Clone)]
pub struct OrchestrationExecutor {
    config: ExecutorConfig,
    transport: Arc<dyn Transport>,
    active: Arc<Mutex<HashMap<Uuid, ActiveRequest>>>,
}

impl OrchestrationExecutor {
    pub fn new(config: ExecutorConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Start a request under a fresh id
    pub fn execute(
        &self,
        recommendation: &Recommendation,
        prompt: &str,
    ) -> Result<OrchestrationHandle> {
        self.execute_with_id(Uuid::new_v4(), recommendation, prompt)
    }

    /// Start a request under a caller-chosen id
    ///
    /// Must be called from within a tokio runtime.
    pub fn execute_with_id(
        &self,
        request_id: Uuid,
        recommendation: &Recommendation,
        prompt: &str,
    ) -> Result<OrchestrationHandle> {
        if recommendation.is_empty() {
            return Err(Error::NoBackendsAvailable);
        }

        let (events, receiver) = EventSink::channel();
        let token = CancellationToken::new();
        {
            let mut active = lock(&self.active);
            if active.contains_key(&request_id) {
                return Err(Error::InvalidInput(format!(
                    "request {} is already running",
                    request_id
                )));
            }
            active.insert(
                request_id,
                ActiveRequest {
                    token: token.clone(),
                    events: events.clone(),
                },
            );
        }

        let run = RequestRun {
            config: self.config.clone(),
            transport: Arc::clone(&self.transport),
            session: OrchestrationSession::new(request_id, prompt, recommendation),
            events,
            token,
        };
        let active = Arc::clone(&self.active);
        let task = tokio::spawn(async move {
            let result = run.execute().await;
            lock(&active).remove(&request_id);
            result
        });

        Ok(OrchestrationHandle {
            request_id,
            events: receiver,
            task,
        })
    }

    /// Cancel a running request
    ///
    /// Returns false if the request is unknown or already finished. Once
    /// this returns true no further event for the request is delivered.
    pub fn cancel(&self, request_id: Uuid) -> bool {
        let Some(request) = lock(&self.active).remove(&request_id) else {
            return false;
        };
        request.events.close();
        request.token.cancel();
        info!(request_id = %request_id, "Cancelled orchestration");
        true
    }

    pub fn is_active(&self, request_id: Uuid) -> bool {
        lock(&self.active).contains_key(&request_id)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }
}

/// State of one running request, owned by its task
struct RequestRun {
    config: ExecutorConfig,
    transport: Arc<dyn Transport>,
    session: OrchestrationSession,
    events: EventSink,
    token: CancellationToken,
}

impl RequestRun {
    async fn execute(mut self) -> Result<SynthesisResult> {
        let request_id = self.session.request_id;
        info!(
            request_id = %request_id,
            strategy = %self.session.strategy,
            backends = self.session.total(),
            "Starting orchestration"
        );

        let result = match self.drive().await {
            Ok(()) if self.token.is_cancelled() => Err(Error::Cancelled(request_id)),
            Ok(()) => self.synthesize(),
            Err(e) => Err(e),
        };

        if matches!(result, Err(Error::Cancelled(_))) {
            for index in self.session.live() {
                self.session.finish(index, BackendState::Cancelled, None);
            }
        }
        self.events.close();
        result
    }

    /// Run calls until every backend is in a terminal state
    async fn drive(&mut self) -> Result<()> {
        let Some(mut stream) = self.connect(false).await? else {
            return Ok(());
        };

        self.progress(OrchestrationPhase::Dispatching);
        let opening = vec![Message::user(self.session.prompt.clone())];
        if self.session.strategy.is_concurrent() {
            for index in 0..self.session.total() {
                self.dispatch(index, opening.clone(), &stream);
            }
        } else {
            self.dispatch(0, opening, &stream);
        }

        while !self.session.all_terminal() {
            let deadline = self.session.next_deadline();
            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    return Err(Error::Cancelled(self.session.request_id));
                }
                frame = stream.frames.recv() => match frame {
                    Some(frame) => self.on_frame(frame, &stream),
                    None => {
                        warn!(request_id = %self.session.request_id, "Transport connection lost");
                        match self.connect(true).await? {
                            Some(reconnected) => {
                                stream = reconnected;
                                self.redispatch(&stream);
                            }
                            None => break,
                        }
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.expire(Instant::now(), Some(&stream));
                }
            }
        }

        Ok(())
    }

    /// Open the request's stream, retrying with exponential backoff
    ///
    /// Returns `None` once every backend is terminal, either because their
    /// timeouts passed while waiting or because the attempts ran out.
    async fn connect(&mut self, reconnecting: bool) -> Result<Option<StreamSession>> {
        let request_id = self.session.request_id;
        let mut last_error = if reconnecting {
            "transport connection lost".to_string()
        } else {
            match self.transport.open_stream(request_id).await {
                Ok(stream) => return Ok(Some(stream)),
                Err(e) => {
                    warn!(request_id = %request_id, error = %e, "Failed to open stream");
                    e.to_string()
                }
            }
        };

        let base = Duration::from_millis(self.config.reconnect_base_delay_ms);
        let max = Duration::from_millis(self.config.reconnect_max_delay_ms);

        for attempt in 1..=self.config.reconnect_max_attempts {
            self.progress(OrchestrationPhase::Reconnecting);
            let delay = backoff_delay(attempt, base, max);
            debug!(
                request_id = %request_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Waiting to reconnect"
            );

            tokio::select! {
                _ = self.token.cancelled() => return Err(Error::Cancelled(request_id)),
                _ = sleep(delay) => {}
            }

            self.expire(Instant::now(), None);
            if self.session.all_terminal() {
                return Ok(None);
            }

            match self.transport.open_stream(request_id).await {
                Ok(stream) => {
                    info!(request_id = %request_id, attempt, "Reconnected");
                    return Ok(Some(stream));
                }
                Err(e) => {
                    warn!(request_id = %request_id, attempt, error = %e, "Reconnect failed");
                    last_error = e.to_string();
                }
            }
        }

        for index in self.session.live() {
            let backend_id = self.session.run(index).backend_id.clone();
            let error = Error::BackendConnection {
                backend_id,
                message: last_error.clone(),
            };
            self.fail(index, error.to_string(), None);
        }
        Ok(None)
    }

    fn dispatch(&mut self, index: usize, messages: Vec<Message>, stream: &StreamSession) {
        let deadline = Instant::now() + self.config.backend_timeout();
        if !self.session.mark_dispatched(index, messages.clone(), deadline) {
            return;
        }

        let backend_id = self.session.run(index).backend_id.clone();
        // A closed stream surfaces as transport loss; the call is replayed on reconnect
        if let Err(e) = stream.dispatch(&backend_id, messages) {
            debug!(
                request_id = %self.session.request_id,
                backend = %backend_id,
                error = %e,
                "Dispatch deferred"
            );
        }
        debug!(request_id = %self.session.request_id, backend = %backend_id, "Dispatched backend");
        self.emit(OrchestrationEvent::BackendDispatched { backend_id });
    }

    /// Replay every streaming call on a fresh stream, discarding partial output
    fn redispatch(&mut self, stream: &StreamSession) {
        for index in self.session.streaming() {
            let messages = self.session.run(index).messages.clone();
            self.dispatch(index, messages, stream);
        }
    }

    fn on_frame(&mut self, frame: Frame, stream: &StreamSession) {
        let Some(index) = self.session.position(&frame.backend_id) else {
            debug!(
                request_id = %self.session.request_id,
                backend = %frame.backend_id,
                "Discarding frame for unselected backend"
            );
            return;
        };
        if self.session.run(index).state != BackendState::Streaming {
            debug!(
                request_id = %self.session.request_id,
                backend = %frame.backend_id,
                "Discarding late frame"
            );
            return;
        }

        match frame.kind {
            FrameKind::Chunk(text) => {
                self.session.append(index, &text);
                self.emit(OrchestrationEvent::Partial {
                    backend_id: frame.backend_id,
                    text,
                });
            }
            FrameKind::Complete => {
                self.session.finish(index, BackendState::Completed, None);
                let run = self.session.run(index);
                debug!(
                    request_id = %self.session.request_id,
                    backend = %run.backend_id,
                    "Backend completed"
                );
                self.emit(OrchestrationEvent::BackendDone {
                    backend_id: run.backend_id.clone(),
                    final_text: run.buffer.clone(),
                    success: true,
                });
                self.progress(OrchestrationPhase::Streaming);

                match self.session.strategy {
                    Strategy::Sequential => self.advance_chain(index, stream),
                    Strategy::Adaptive => self.check_early_stop(index, stream),
                    _ => {}
                }
            }
            FrameKind::Error(message) => self.fail(index, message, None),
        }
    }

    /// Move a call to failed; cancels it on the stream when one is given
    fn fail(&mut self, index: usize, message: String, stream: Option<&StreamSession>) {
        if !self.session.finish(index, BackendState::Failed, Some(message.clone())) {
            return;
        }
        let run = self.session.run(index);
        let backend_id = run.backend_id.clone();
        let final_text = run.buffer.clone();
        warn!(
            request_id = %self.session.request_id,
            backend = %backend_id,
            error = %message,
            "Backend failed"
        );

        if let Some(stream) = stream {
            stream.cancel(&backend_id);
        }
        self.emit(OrchestrationEvent::Error {
            backend_id: Some(backend_id.clone()),
            message,
        });
        self.emit(OrchestrationEvent::BackendDone {
            backend_id,
            final_text,
            success: false,
        });

        if self.session.strategy == Strategy::Sequential {
            self.abort_chain();
        }
        self.progress(OrchestrationPhase::Streaming);
    }

    /// Fail every streaming call whose deadline has passed
    fn expire(&mut self, now: Instant, stream: Option<&StreamSession>) {
        for index in self.session.streaming() {
            let run = self.session.run(index);
            if run.deadline.is_some_and(|deadline| deadline <= now) {
                let error = Error::BackendTimeout {
                    backend_id: run.backend_id.clone(),
                    timeout_secs: self.config.backend_timeout_secs,
                };
                self.fail(index, error.to_string(), stream);
            }
        }
    }

    /// Send the next link of a sequential chain, with the previous answer as context
    fn advance_chain(&mut self, completed: usize, stream: &StreamSession) {
        let Some(next) = self.session.next_queued() else {
            return;
        };
        let messages = vec![
            Message::user(self.session.prompt.clone()),
            Message::assistant(self.session.run(completed).buffer.clone()),
            Message::user(SEQUENTIAL_FOLLOW_UP),
        ];
        self.dispatch(next, messages, stream);
    }

    /// Links after a failure are never started
    fn abort_chain(&mut self) {
        while let Some(index) = self.session.next_queued() {
            self.session.finish(
                index,
                BackendState::Cancelled,
                Some("chain aborted after an earlier failure".to_string()),
            );
            self.emit(OrchestrationEvent::BackendDone {
                backend_id: self.session.run(index).backend_id.clone(),
                final_text: String::new(),
                success: false,
            });
        }
    }

    /// Stop the remaining calls once a response is confident enough
    ///
    /// Response confidence is the backend's recommended confidence scaled by
    /// completeness, which saturates at the configured word count.
    fn check_early_stop(&mut self, completed: usize, stream: &StreamSession) {
        let run = self.session.run(completed);
        let words = run.buffer.split_whitespace().count();
        let completeness =
            (words as f64 / self.config.adaptive_complete_words.max(1) as f64).min(1.0);
        let confidence = run.confidence * completeness;
        if confidence < self.config.adaptive_confidence_threshold {
            return;
        }

        let leader = run.backend_id.clone();
        info!(
            request_id = %self.session.request_id,
            backend = %leader,
            confidence,
            "Confident response, stopping remaining backends"
        );
        for index in self.session.live() {
            let backend_id = self.session.run(index).backend_id.clone();
            let reason = format!(
                "stopped early after {} answered with confidence {:.2}",
                leader, confidence
            );
            if self.session.finish(index, BackendState::Cancelled, Some(reason)) {
                stream.cancel(&backend_id);
                self.emit(OrchestrationEvent::BackendDone {
                    backend_id,
                    final_text: String::new(),
                    success: false,
                });
            }
        }
        self.progress(OrchestrationPhase::Streaming);
    }

    fn synthesize(&self) -> Result<SynthesisResult> {
        let request_id = self.session.request_id;
        self.progress(OrchestrationPhase::Synthesizing);

        match synthesis::synthesize(
            self.session.strategy,
            &self.session.synthesis_inputs(),
            self.config.consensus_outlier_threshold,
        ) {
            Ok(output) => {
                let elapsed = self.session.started.elapsed();
                info!(
                    request_id = %request_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Orchestration complete"
                );
                self.emit(OrchestrationEvent::SynthesisDone {
                    text: output.text.clone(),
                });
                Ok(SynthesisResult {
                    request_id,
                    strategy: self.session.strategy,
                    text: output.text,
                    contributions: output.contributions,
                    backends: self.session.traces(),
                    elapsed,
                })
            }
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "Orchestration failed");
                self.emit(OrchestrationEvent::Error {
                    backend_id: None,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn emit(&self, event: OrchestrationEvent) {
        self.events.emit(event);
    }

    fn progress(&self, phase: OrchestrationPhase) {
        self.emit(OrchestrationEvent::Progress {
            completed: self.session.completed_count(),
            total: self.session.total(),
            phase,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Category;
    use crate::decision::DecisionStep;
    use crate::transport::{BackendScript, MessageRole, ScriptedTransport};

    fn recommendation(strategy: Strategy, backends: &[(&str, f64)]) -> Recommendation {
        Recommendation {
            category: Category::Conversational,
            selected_backends: backends.iter().map(|(id, _)| id.to_string()).collect(),
            strategy,
            weights: vec![1.0; backends.len()],
            per_backend_confidence: backends
                .iter()
                .map(|(id, confidence)| (id.to_string(), *confidence))
                .collect(),
            overall_confidence: 0.6,
            decision_trace: vec![DecisionStep::new("q", "a", 0.6)],
            auto_apply_eligible: false,
            fallback: false,
            differs_from_current: None,
        }
    }

    fn executor(transport: &ScriptedTransport) -> OrchestrationExecutor {
        OrchestrationExecutor::new(ExecutorConfig::default(), Arc::new(transport.clone()))
    }

    fn state_of(result: &SynthesisResult, backend_id: &str) -> BackendState {
        result
            .backends
            .iter()
            .find(|t| t.backend_id == backend_id)
            .map(|t| t.state)
            .unwrap()
    }

    #[tokio::test]
    async fn test_empty_recommendation_is_rejected() {
        let transport = ScriptedTransport::new();
        let result = executor(&transport).execute(&recommendation(Strategy::Parallel, &[]), "hi");
        assert!(matches!(result, Err(Error::NoBackendsAvailable)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_dispatches_together_and_concatenates() {
        let transport = ScriptedTransport::new()
            .with_backend("a", BackendScript::reply("alpha").with_delay(Duration::from_millis(30)))
            .with_backend("b", BackendScript::reply("beta"));
        let executor = executor(&transport);

        let handle = executor
            .execute(&recommendation(Strategy::Parallel, &[("a", 0.8), ("b", 0.6)]), "hi")
            .unwrap();
        let (events, result) = handle.collect().await;
        let result = result.unwrap();

        assert_eq!(result.text, "### a\n\nalpha\n\n### b\n\nbeta");
        assert_eq!(result.succeeded().count(), 2);

        let dispatches = transport.dispatches();
        assert_eq!(dispatches.len(), 2);
        assert_eq!(dispatches[0].at, dispatches[1].at);

        let first_partial = events
            .iter()
            .position(|e| matches!(e, OrchestrationEvent::Partial { .. }))
            .unwrap();
        let dispatched = events
            .iter()
            .filter(|e| matches!(e, OrchestrationEvent::BackendDispatched { .. }))
            .count();
        assert_eq!(dispatched, 2);
        let dispatched_before_output = events[..first_partial]
            .iter()
            .filter(|e| matches!(e, OrchestrationEvent::BackendDispatched { .. }))
            .count();
        assert_eq!(dispatched_before_output, 2);
        assert!(matches!(
            events.last(),
            Some(OrchestrationEvent::SynthesisDone { .. })
        ));
        assert_eq!(executor.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_failure_does_not_abort_others() {
        let transport = ScriptedTransport::new()
            .with_backend("good", BackendScript::reply("fine"))
            .with_backend("bad", BackendScript::failing("boom"));

        let handle = executor(&transport)
            .execute(&recommendation(Strategy::Parallel, &[("bad", 0.5), ("good", 0.5)]), "hi")
            .unwrap();
        let (events, result) = handle.collect().await;
        let result = result.unwrap();

        assert_eq!(result.text, "fine");
        assert_eq!(state_of(&result, "bad"), BackendState::Failed);
        assert_eq!(result.backends[0].error.as_deref(), Some("boom"));
        assert!(events.contains(&OrchestrationEvent::Error {
            backend_id: Some("bad".into()),
            message: "boom".into(),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_waits_for_each_link() {
        let transport = ScriptedTransport::new()
            .with_backend(
                "draft",
                BackendScript::reply("first draft").with_delay(Duration::from_millis(40)),
            )
            .with_backend("edit", BackendScript::reply("polished"));

        let handle = executor(&transport)
            .execute(
                &recommendation(Strategy::Sequential, &[("draft", 0.7), ("edit", 0.7)]),
                "write",
            )
            .unwrap();
        let result = handle.result().await.unwrap();
        assert_eq!(result.text, "polished");

        let dispatches = transport.dispatches();
        let finishes = transport.finishes();
        assert_eq!(dispatches.len(), 2);
        assert_eq!(dispatches[1].backend_id, "edit");
        assert!(dispatches[1].at >= finishes[0].at);

        let context = &dispatches[1].messages;
        assert_eq!(context[1].role, MessageRole::Assistant);
        assert_eq!(context[1].content, "first draft");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_failure_aborts_chain() {
        let transport = ScriptedTransport::new()
            .with_backend("draft", BackendScript::failing("down"))
            .with_backend("edit", BackendScript::reply("never"));

        let handle = executor(&transport)
            .execute(
                &recommendation(Strategy::Sequential, &[("draft", 0.7), ("edit", 0.7)]),
                "write",
            )
            .unwrap();
        let result = handle.result().await;

        assert!(matches!(result, Err(Error::AllBackendsFailed { .. })));
        assert_eq!(transport.dispatches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_only_the_slow_backend() {
        let transport = ScriptedTransport::new()
            .with_backend("fast", BackendScript::reply("quick"))
            .with_backend("slow", BackendScript::hanging());
        let config = ExecutorConfig {
            backend_timeout_secs: 1,
            ..ExecutorConfig::default()
        };
        let executor = OrchestrationExecutor::new(config, Arc::new(transport.clone()));

        let handle = executor
            .execute(&recommendation(Strategy::Consensus, &[("fast", 0.7), ("slow", 0.7)]), "hi")
            .unwrap();
        let result = handle.result().await.unwrap();

        assert_eq!(result.text, "quick");
        assert_eq!(state_of(&result, "slow"), BackendState::Failed);
        assert!(result.backends[1].error.as_deref().unwrap().contains("timed out"));
        // Let the transport journal catch up with the cancel command
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(transport.cancels().iter().any(|(_, b)| b == "slow"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_stops_after_confident_answer() {
        let long_answer = "word ".repeat(50);
        let transport = ScriptedTransport::new()
            .with_backend("sure", BackendScript::reply(long_answer.clone()))
            .with_backend("slow", BackendScript::reply("late").with_delay(Duration::from_secs(5)));

        let handle = executor(&transport)
            .execute(&recommendation(Strategy::Adaptive, &[("sure", 0.9), ("slow", 0.5)]), "hi")
            .unwrap();
        let result = handle.result().await.unwrap();

        assert_eq!(result.text, long_answer.trim());
        assert_eq!(state_of(&result, "slow"), BackendState::Cancelled);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(transport.cancels().iter().any(|(_, b)| b == "slow"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_waits_when_answer_is_short() {
        let transport = ScriptedTransport::new()
            .with_backend("sure", BackendScript::reply("too short"))
            .with_backend("slow", BackendScript::reply("late").with_delay(Duration::from_secs(5)));

        let handle = executor(&transport)
            .execute(&recommendation(Strategy::Adaptive, &[("sure", 0.9), ("slow", 0.5)]), "hi")
            .unwrap();
        let result = handle.result().await.unwrap();
        assert_eq!(state_of(&result, "slow"), BackendState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_events() {
        let transport = ScriptedTransport::new()
            .with_backend("a", BackendScript::reply("late").with_delay(Duration::from_secs(10)));
        let executor = executor(&transport);

        let mut handle = executor
            .execute(&recommendation(Strategy::Parallel, &[("a", 0.5)]), "hi")
            .unwrap();
        let request_id = handle.request_id;

        loop {
            match handle.events.recv().await {
                Some(OrchestrationEvent::BackendDispatched { .. }) => break,
                Some(_) => continue,
                None => panic!("stream closed before dispatch"),
            }
        }

        assert!(executor.cancel(request_id));
        assert!(!executor.cancel(request_id));

        let (remaining, result) = handle.collect().await;
        assert!(remaining.iter().all(|e| !matches!(
            e,
            OrchestrationEvent::Partial { .. }
                | OrchestrationEvent::BackendDone { .. }
                | OrchestrationEvent::SynthesisDone { .. }
        )));
        assert!(matches!(result, Err(Error::Cancelled(id)) if id == request_id));
        assert!(!executor.is_active(request_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_replays_streaming_calls() {
        let transport = ScriptedTransport::new()
            .with_backend(
                "a",
                BackendScript::reply("answer").with_delay(Duration::from_millis(100)),
            )
            .with_connection_drop(Duration::from_millis(50));

        let handle = executor(&transport)
            .execute(&recommendation(Strategy::Parallel, &[("a", 0.5)]), "hi")
            .unwrap();
        let (events, result) = handle.collect().await;
        let result = result.unwrap();

        assert_eq!(result.text, "answer");
        assert_eq!(result.backends[0].dispatch_count, 2);
        assert_eq!(transport.dispatches().len(), 2);
        assert!(events.iter().any(|e| matches!(
            e,
            OrchestrationEvent::Progress {
                phase: OrchestrationPhase::Reconnecting,
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_reconnects_fail_all_backends() {
        let transport = ScriptedTransport::new()
            .with_backend("a", BackendScript::reply("answer"))
            .with_failing_opens(3);
        let config = ExecutorConfig {
            reconnect_max_attempts: 2,
            ..ExecutorConfig::default()
        };
        let executor = OrchestrationExecutor::new(config, Arc::new(transport.clone()));

        let handle = executor
            .execute(&recommendation(Strategy::Parallel, &[("a", 0.5)]), "hi")
            .unwrap();
        match handle.result().await {
            Err(Error::AllBackendsFailed { failures }) => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].contains("connection error"));
            }
            other => panic!("expected AllBackendsFailed, got {:?}", other),
        }
        assert!(transport.dispatches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_are_independent() {
        let transport = ScriptedTransport::new()
            .with_backend(
                "a",
                BackendScript::reply("shared").with_delay(Duration::from_millis(20)),
            );
        let executor = executor(&transport);
        let rec = recommendation(Strategy::Parallel, &[("a", 0.5)]);

        let first = executor.execute(&rec, "one").unwrap();
        let second = executor.execute(&rec, "two").unwrap();
        assert!(executor.cancel(first.request_id));

        assert!(first.result().await.is_err());
        assert_eq!(second.result().await.unwrap().text, "shared");
    }
}
