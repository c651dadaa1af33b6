//! Error types for Athena

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using Athena's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Athena error types
///
/// Most variants are recoverable inside the core: analysis errors fall back
/// to the heuristic analyzer, recommendation errors fall back to a default
/// recommendation, and per-backend errors only fail that backend. Only
/// [`Error::AllBackendsFailed`] is meant to reach the caller of an
/// orchestration.
#[derive(Error, Debug)]
pub enum Error {
    // Analysis errors (E100-E199)
    #[error("Prompt analysis failed: {0}")]
    AnalysisFailed(String),

    #[error("Classifier timed out after {0} ms")]
    ClassifierTimeout(u64),

    // Decision errors (E200-E299)
    #[error("Recommendation failed: {0}")]
    RecommendationFailed(String),

    // Backend errors (E300-E399)
    #[error("Backend '{backend_id}' timed out after {timeout_secs} seconds")]
    BackendTimeout { backend_id: String, timeout_secs: u64 },

    #[error("Backend '{backend_id}' connection error: {message}")]
    BackendConnection { backend_id: String, message: String },

    #[error("Backend API error: {0}")]
    BackendApi(String),

    #[error("Rate limited. Waiting {0} seconds before retry.")]
    RateLimited(u64),

    #[error("Backend '{0}' is not registered or not enabled")]
    UnknownBackend(String),

    #[error("All backends failed: {}", .failures.join("; "))]
    AllBackendsFailed { failures: Vec<String> },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Network error: {0}. Check your internet connection.")]
    NetworkError(#[from] reqwest::Error),

    // Orchestration errors (E400-E499)
    #[error("Request {0} was cancelled")]
    Cancelled(Uuid),

    #[error("No backends available for orchestration")]
    NoBackendsAvailable,

    // Store errors (E500-E599)
    #[error("Learning store data is corrupt: {0}")]
    StoreCorruption(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::AnalysisFailed(_) => "E100",
            Self::ClassifierTimeout(_) => "E101",
            Self::RecommendationFailed(_) => "E200",
            Self::BackendTimeout { .. } => "E300",
            Self::BackendConnection { .. } => "E301",
            Self::BackendApi(_) => "E302",
            Self::RateLimited(_) => "E303",
            Self::UnknownBackend(_) => "E304",
            Self::AllBackendsFailed { .. } => "E305",
            Self::Transport(_) => "E306",
            Self::NetworkError(_) => "E307",
            Self::Cancelled(_) => "E400",
            Self::NoBackendsAvailable => "E401",
            Self::StoreCorruption(_) => "E500",
            Self::DatabaseError(_) => "E501",
            Self::Serialization(_) => "E502",
            Self::ConfigError(_) => "E600",
            Self::InvalidInput(_) => "E800",
            Self::Io(_) => "E9999",
        }
    }

    /// Whether the core can route around this error without failing the request
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::AllBackendsFailed { .. }
                | Self::NoBackendsAvailable
                | Self::Cancelled(_)
                | Self::ConfigError(_)
                | Self::InvalidInput(_)
        )
    }

    /// Whether this error is scoped to a single backend call
    pub fn is_backend_scoped(&self) -> bool {
        matches!(
            self,
            Self::BackendTimeout { .. }
                | Self::BackendConnection { .. }
                | Self::BackendApi(_)
                | Self::RateLimited(_)
                | Self::NetworkError(_)
        )
    }
}
