//! In-process transport with scripted backend behavior
//!
//! Every backend gets a script: how long until its first chunk, what it
//! streams, and whether it then completes, fails, or hangs. All waiting
//! goes through `tokio::time`, so tests can run with paused time. Dropped
//! connections and failed reconnects can be scripted per stream.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::types::{CompletionRequest, Message};
use super::{Frame, StreamSession, Transport, serve_commands};
use crate::error::{Error, Result};
use crate::registry::BackendId;

const DEFAULT_FIRST_CHUNK_DELAY: Duration = Duration::from_millis(10);
const DEFAULT_CHUNK_INTERVAL: Duration = Duration::from_millis(5);

/// How a scripted call ends after its chunks
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedOutcome {
    Complete,
    Fail(String),
    /// Never completes; only a timeout or cancellation ends the call
    Hang,
}

/// Behavior of one backend
#[derive(Debug, Clone, PartialEq)]
pub struct BackendScript {
    pub first_chunk_delay: Duration,
    pub chunk_interval: Duration,
    pub chunks: Vec<String>,
    pub outcome: ScriptedOutcome,
}

impl BackendScript {
    /// Stream `text` as a single chunk, then complete
    pub fn reply(text: impl Into<String>) -> Self {
        Self::chunks(vec![text.into()])
    }

    /// Stream the given chunks in order, then complete
    pub fn chunks(chunks: Vec<String>) -> Self {
        Self {
            first_chunk_delay: DEFAULT_FIRST_CHUNK_DELAY,
            chunk_interval: DEFAULT_CHUNK_INTERVAL,
            chunks,
            outcome: ScriptedOutcome::Complete,
        }
    }

    /// Fail after the delay without streaming anything
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            outcome: ScriptedOutcome::Fail(message.into()),
            ..Self::chunks(Vec::new())
        }
    }

    /// Stream nothing and never finish
    pub fn hanging() -> Self {
        Self {
            outcome: ScriptedOutcome::Hang,
            ..Self::chunks(Vec::new())
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.first_chunk_delay = delay;
        self
    }

    pub fn with_chunk_interval(mut self, interval: Duration) -> Self {
        self.chunk_interval = interval;
        self
    }

    pub fn with_outcome(mut self, outcome: ScriptedOutcome) -> Self {
        self.outcome = outcome;
        self
    }
}

/// A dispatch observed by the transport
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    pub request_id: Uuid,
    pub backend_id: BackendId,
    pub messages: Vec<Message>,
    pub at: Instant,
}

/// A call that reached the end of its script
#[derive(Debug, Clone)]
pub struct FinishRecord {
    pub request_id: Uuid,
    pub backend_id: BackendId,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct Journal {
    dispatches: Vec<DispatchRecord>,
    finishes: Vec<FinishRecord>,
    cancels: Vec<(Uuid, BackendId)>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Deterministic transport driven by per-backend scripts
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    scripts: HashMap<BackendId, BackendScript>,
    completions: HashMap<BackendId, (Duration, std::result::Result<String, String>)>,
    connection_drops: Arc<Mutex<VecDeque<Duration>>>,
    failing_opens: Arc<AtomicU32>,
    journal: Arc<Mutex<Journal>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a backend's streaming behavior
    pub fn with_backend(mut self, backend_id: impl Into<String>, script: BackendScript) -> Self {
        self.scripts.insert(backend_id.into(), script);
        self
    }

    /// Script a backend's single-shot completion
    pub fn with_completion(
        mut self,
        backend_id: impl Into<String>,
        delay: Duration,
        reply: std::result::Result<String, String>,
    ) -> Self {
        self.completions.insert(backend_id.into(), (delay, reply));
        self
    }

    /// The next opened stream drops its connection after `after`
    pub fn with_connection_drop(self, after: Duration) -> Self {
        lock(&self.connection_drops).push_back(after);
        self
    }

    /// The next `count` calls to `open_stream` fail
    pub fn with_failing_opens(self, count: u32) -> Self {
        self.failing_opens.store(count, Ordering::SeqCst);
        self
    }

    /// Every dispatch seen so far, in order
    pub fn dispatches(&self) -> Vec<DispatchRecord> {
        lock(&self.journal).dispatches.clone()
    }

    /// Every call that ran its script to the end, in order
    pub fn finishes(&self) -> Vec<FinishRecord> {
        lock(&self.journal).finishes.clone()
    }

    /// Every cancel command seen so far, in order
    pub fn cancels(&self) -> Vec<(Uuid, BackendId)> {
        lock(&self.journal).cancels.clone()
    }

    fn take_failing_open(&self) -> bool {
        self.failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

async fn run_script(
    request_id: Uuid,
    backend_id: BackendId,
    script: Option<BackendScript>,
    frames: mpsc::UnboundedSender<Frame>,
    journal: Arc<Mutex<Journal>>,
) {
    let Some(script) = script else {
        let _ = frames.send(Frame::error(
            &backend_id,
            Error::UnknownBackend(backend_id.clone()).to_string(),
        ));
        return;
    };

    tokio::time::sleep(script.first_chunk_delay).await;
    for (i, chunk) in script.chunks.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(script.chunk_interval).await;
        }
        let _ = frames.send(Frame::chunk(&backend_id, chunk));
    }

    match script.outcome {
        ScriptedOutcome::Complete => {
            lock(&journal).finishes.push(FinishRecord {
                request_id,
                backend_id: backend_id.clone(),
                at: Instant::now(),
            });
            let _ = frames.send(Frame::complete(&backend_id));
        }
        ScriptedOutcome::Fail(message) => {
            let _ = frames.send(Frame::error(&backend_id, message));
        }
        ScriptedOutcome::Hang => std::future::pending::<()>().await,
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let (delay, reply) = self
            .completions
            .get(&request.backend_id)
            .cloned()
            .ok_or_else(|| Error::UnknownBackend(request.backend_id.clone()))?;

        tokio::time::sleep(delay).await;
        reply.map_err(Error::BackendApi)
    }

    async fn open_stream(&self, request_id: Uuid) -> Result<StreamSession> {
        if self.take_failing_open() {
            return Err(Error::Transport("scripted open failure".to_string()));
        }

        let (command_tx, mut command_rx) = mpsc::unbounded_channel();
        let (journal_tx, journal_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let root = CancellationToken::new();

        if let Some(after) = lock(&self.connection_drops).pop_front() {
            let root = root.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                root.cancel();
            });
        }

        // Record commands before they reach the dispatcher
        let journal = Arc::clone(&self.journal);
        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                match &command {
                    super::StreamCommand::Dispatch {
                        backend_id,
                        messages,
                    } => lock(&journal).dispatches.push(DispatchRecord {
                        request_id,
                        backend_id: backend_id.clone(),
                        messages: messages.clone(),
                        at: Instant::now(),
                    }),
                    super::StreamCommand::Cancel { backend_id } => {
                        lock(&journal).cancels.push((request_id, backend_id.clone()))
                    }
                }
                if journal_tx.send(command).is_err() {
                    break;
                }
            }
        });

        let scripts = self.scripts.clone();
        let journal = Arc::clone(&self.journal);
        tokio::spawn(serve_commands(
            request_id,
            journal_rx,
            frame_tx,
            root,
            move |backend_id, _messages, frames| {
                run_script(
                    request_id,
                    backend_id.clone(),
                    scripts.get(&backend_id).cloned(),
                    frames,
                    Arc::clone(&journal),
                )
            },
        ));

        Ok(StreamSession {
            commands: command_tx,
            frames: frame_rx,
        })
    }
}
