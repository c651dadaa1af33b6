//! Backend transport
//!
//! Two shapes of traffic go over a transport:
//! - single-shot completions, used by the remote classifier
//! - a per-request multiplexed stream: the executor sends dispatch/cancel
//!   commands and receives chunk/complete/error frames tagged by backend
//!
//! Dropping the command sender closes the stream and cancels every
//! in-flight call on it. The frame receiver yielding `None` while the
//! executor still holds the command sender means the transport was lost.

pub mod http;
pub mod scripted;
pub mod streaming;
pub mod types;

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::registry::BackendId;

pub use http::HttpTransport;
pub use scripted::{BackendScript, ScriptedOutcome, ScriptedTransport};
pub use types::{CompletionRequest, Message, MessageRole};

/// Command sent from the executor to the transport
#[derive(Debug, Clone, PartialEq)]
pub enum StreamCommand {
    /// Start (or restart) a streaming call to a backend
    Dispatch {
        backend_id: BackendId,
        messages: Vec<Message>,
    },
    /// Abort the in-flight call to a backend, if any
    Cancel { backend_id: BackendId },
}

/// Payload of a frame
#[derive(Debug, Clone, PartialEq)]
pub enum FrameKind {
    /// Incremental output
    Chunk(String),
    /// The backend finished; its output is the concatenation of its chunks
    Complete,
    /// The backend call failed
    Error(String),
}

/// A frame received from the transport, tagged by backend
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub backend_id: BackendId,
    pub kind: FrameKind,
}

impl Frame {
    pub fn chunk(backend_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            kind: FrameKind::Chunk(text.into()),
        }
    }

    pub fn complete(backend_id: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            kind: FrameKind::Complete,
        }
    }

    pub fn error(backend_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            kind: FrameKind::Error(message.into()),
        }
    }
}

/// Both ends of one request's multiplexed stream, as seen by the executor
#[derive(Debug)]
pub struct StreamSession {
    pub commands: mpsc::UnboundedSender<StreamCommand>,
    pub frames: mpsc::UnboundedReceiver<Frame>,
}

impl StreamSession {
    /// Send a dispatch command
    pub fn dispatch(&self, backend_id: &str, messages: Vec<Message>) -> Result<()> {
        self.commands
            .send(StreamCommand::Dispatch {
                backend_id: backend_id.to_string(),
                messages,
            })
            .map_err(|_| Error::Transport("stream closed".to_string()))
    }

    /// Send a cancel command; a closed stream has nothing left to cancel
    pub fn cancel(&self, backend_id: &str) {
        let _ = self.commands.send(StreamCommand::Cancel {
            backend_id: backend_id.to_string(),
        });
    }
}

/// Connection to the language-model backends
#[async_trait]
pub trait Transport: Send + Sync {
    /// Single-shot request/response
    async fn complete(&self, request: CompletionRequest) -> Result<String>;

    /// Open a multiplexed stream for one request
    async fn open_stream(&self, request_id: Uuid) -> Result<StreamSession>;
}

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at `max`
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(max)
}

/// Serve one stream's command channel until it closes or `root` is cancelled
///
/// Each dispatch runs `start` on its own task under a child token of
/// `root`; re-dispatching a backend cancels its previous call. On exit all
/// calls are cancelled, so every frame sender is dropped once they unwind.
pub(crate) async fn serve_commands<F, Fut>(
    request_id: Uuid,
    mut commands: mpsc::UnboundedReceiver<StreamCommand>,
    frames: mpsc::UnboundedSender<Frame>,
    root: CancellationToken,
    mut start: F,
) where
    F: FnMut(BackendId, Vec<Message>, mpsc::UnboundedSender<Frame>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut calls: HashMap<BackendId, CancellationToken> = HashMap::new();

    loop {
        tokio::select! {
            _ = root.cancelled() => break,
            command = commands.recv() => match command {
                Some(StreamCommand::Dispatch { backend_id, messages }) => {
                    if let Some(previous) = calls.remove(&backend_id) {
                        previous.cancel();
                    }
                    let token = root.child_token();
                    calls.insert(backend_id.clone(), token.clone());
                    debug!(
                        request_id = %request_id,
                        backend = %backend_id,
                        "Starting backend call"
                    );

                    let call = start(backend_id, messages, frames.clone());
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = token.cancelled() => {}
                            _ = call => {}
                        }
                    });
                }
                Some(StreamCommand::Cancel { backend_id }) => {
                    if let Some(token) = calls.remove(&backend_id) {
                        debug!(
                            request_id = %request_id,
                            backend = %backend_id,
                            "Cancelling backend call"
                        );
                        token.cancel();
                    }
                }
                None => break,
            }
        }
    }

    root.cancel();
    debug!(request_id = %request_id, "Stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(250);
        let max = Duration::from_millis(4000);
        assert_eq!(backoff_delay(1, base, max), Duration::from_millis(250));
        assert_eq!(backoff_delay(2, base, max), Duration::from_millis(500));
        assert_eq!(backoff_delay(4, base, max), Duration::from_millis(2000));
        assert_eq!(backoff_delay(10, base, max), max);
        assert_eq!(backoff_delay(0, base, max), base);
    }

    #[tokio::test]
    async fn test_serve_commands_cancel_stops_call() {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
        let root = CancellationToken::new();

        tokio::spawn(serve_commands(
            Uuid::new_v4(),
            cmd_rx,
            frame_tx,
            root,
            |backend_id, _messages, frames| async move {
                let _ = frames.send(Frame::chunk(&backend_id, "first"));
                std::future::pending::<()>().await;
            },
        ));

        cmd_tx
            .send(StreamCommand::Dispatch {
                backend_id: "a".into(),
                messages: vec![Message::user("hi")],
            })
            .unwrap();
        assert_eq!(frame_rx.recv().await, Some(Frame::chunk("a", "first")));

        drop(cmd_tx);
        // Every sender is released once the stream closes
        assert_eq!(frame_rx.recv().await, None);
    }
}
