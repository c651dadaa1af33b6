//! Orchestration
//!
//! Runs a recommendation: dispatches backend calls according to the
//! strategy, streams progress to the caller, and synthesizes the outputs.

pub mod events;
pub mod executor;
pub mod session;

pub use events::{EventSink, OrchestrationEvent, OrchestrationPhase};
pub use executor::{OrchestrationExecutor, OrchestrationHandle, SynthesisResult};
pub use session::{BackendRun, BackendState, BackendTrace, OrchestrationSession};
