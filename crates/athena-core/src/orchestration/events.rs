//! Orchestration event stream
//!
//! Events for one request go to the receiver held by the caller's
//! `OrchestrationHandle`. Once the sink is closed (on cancellation or when
//! the request finishes) nothing more is delivered.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::registry::BackendId;

/// Stage of a request, reported with progress events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationPhase {
    Dispatching,
    Streaming,
    Reconnecting,
    Synthesizing,
}

impl std::fmt::Display for OrchestrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dispatching => write!(f, "dispatching"),
            Self::Streaming => write!(f, "streaming"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Synthesizing => write!(f, "synthesizing"),
        }
    }
}

/// Event emitted while a request runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    /// Backends in a terminal state out of all selected
    Progress {
        completed: usize,
        total: usize,
        phase: OrchestrationPhase,
    },
    /// A call was sent to a backend
    BackendDispatched { backend_id: BackendId },
    /// Incremental output from a backend
    Partial { backend_id: BackendId, text: String },
    /// A backend reached a terminal state
    BackendDone {
        backend_id: BackendId,
        final_text: String,
        success: bool,
    },
    /// The final answer
    SynthesisDone { text: String },
    Error {
        backend_id: Option<BackendId>,
        message: String,
    },
}

/// Sending half of a request's event stream
///
/// Clones share one underlying sender; closing any clone closes them all.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<OrchestrationEvent>>>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OrchestrationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                sender: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Deliver an event; returns false if the sink is closed or the receiver is gone
    pub fn emit(&self, event: OrchestrationEvent) -> bool {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Stop delivery; once this returns no further event reaches the receiver
    pub fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_stops_delivery() {
        let (sink, mut rx) = EventSink::channel();
        let clone = sink.clone();

        assert!(sink.emit(OrchestrationEvent::SynthesisDone { text: "a".into() }));
        clone.close();
        assert!(sink.is_closed());
        assert!(!sink.emit(OrchestrationEvent::SynthesisDone { text: "b".into() }));

        assert_eq!(
            rx.recv().await,
            Some(OrchestrationEvent::SynthesisDone { text: "a".into() })
        );
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = OrchestrationEvent::Progress {
            completed: 1,
            total: 3,
            phase: OrchestrationPhase::Streaming,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["phase"], "streaming");
    }
}
