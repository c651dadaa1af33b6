//! Backend registry and static capability profiles
//!
//! The registry is the read-only catalog of language-model backends the
//! orchestrator may call. Each backend carries a [`SpecializationProfile`],
//! the static per-backend scores the analyzer turns into affinities.

use std::env;

use serde::{Deserialize, Serialize};

use crate::analysis::Category;
use crate::error::{Error, Result};

/// Identifier of a backend (e.g. "openai-gpt4o")
pub type BackendId = String;

/// Static specialization scores of a backend, each in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpecializationProfile {
    /// Creative writing, ideation, storytelling
    pub creative: f64,
    /// Code, systems, and other technical work
    pub technical: f64,
    /// Analysis, math, and multi-step reasoning
    pub reasoning: f64,
    /// Casual dialogue and short answers
    pub conversational: f64,
}

impl SpecializationProfile {
    /// Create a new profile, clamping every score to [0, 1]
    pub fn new(creative: f64, technical: f64, reasoning: f64, conversational: f64) -> Self {
        Self {
            creative: creative.clamp(0.0, 1.0),
            technical: technical.clamp(0.0, 1.0),
            reasoning: reasoning.clamp(0.0, 1.0),
            conversational: conversational.clamp(0.0, 1.0),
        }
    }

    /// A profile with no particular strength
    pub fn balanced() -> Self {
        Self::new(0.5, 0.5, 0.5, 0.5)
    }

    /// The profile dimension that matters for a prompt category
    pub fn score_for(&self, category: Category) -> f64 {
        match category {
            Category::Creative => self.creative,
            Category::Technical => self.technical,
            Category::Analytical => self.reasoning,
            Category::Conversational => self.conversational,
            Category::Mixed => (self.creative + self.technical + self.reasoning) / 3.0,
        }
    }

    fn is_valid(&self) -> bool {
        [self.creative, self.technical, self.reasoning, self.conversational]
            .iter()
            .all(|s| s.is_finite() && (0.0..=1.0).contains(s))
    }
}

impl Default for SpecializationProfile {
    fn default() -> Self {
        Self::balanced()
    }
}

fn default_enabled() -> bool {
    true
}

fn default_max_tokens() -> usize {
    4096
}

fn default_temperature() -> f32 {
    0.7
}

/// Configuration of one backend
#[derive(Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique backend identifier
    pub id: BackendId,
    /// Disabled backends are never selected
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Base URL of an OpenAI-compatible API (e.g. "https://api.openai.com/v1")
    pub endpoint: String,
    /// Model name sent in requests
    pub model: String,
    /// Environment variable holding the API credential
    #[serde(default)]
    pub credential_env: Option<String>,
    /// Credential injected at runtime; never read from or written to config files
    #[serde(skip)]
    pub credential: Option<String>,
    /// Maximum tokens to generate
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Static specialization scores
    #[serde(default)]
    pub specialization: SpecializationProfile,
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("id", &self.id)
            .field("enabled", &self.enabled)
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("credential_env", &self.credential_env)
            .field("credential", &self.credential.as_ref().map(|_| "***"))
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("specialization", &self.specialization)
            .finish()
    }
}

impl BackendConfig {
    /// Create a new enabled backend with a balanced profile
    pub fn new(
        id: impl Into<String>,
        endpoint: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            endpoint: endpoint.into(),
            model: model.into(),
            credential_env: None,
            credential: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            specialization: SpecializationProfile::balanced(),
        }
    }

    /// Set the specialization profile
    pub fn with_specialization(mut self, profile: SpecializationProfile) -> Self {
        self.specialization = profile;
        self
    }

    /// Set the environment variable the credential is read from
    pub fn with_credential_env(mut self, var: impl Into<String>) -> Self {
        self.credential_env = Some(var.into());
        self
    }

    /// Inject a credential directly (tests, embedding applications)
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Set generation limits
    pub fn with_limits(mut self, max_tokens: usize, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    /// Mark the backend as disabled
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Resolve the credential: injected value first, then the environment
    pub fn resolved_credential(&self) -> Option<String> {
        self.credential.clone().or_else(|| {
            self.credential_env
                .as_deref()
                .and_then(|var| env::var(var).ok())
        })
    }

    /// Validate identifiers, limits, and profile ranges
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::ConfigError("backend id must not be empty".into()));
        }
        if self.endpoint.trim().is_empty() {
            return Err(Error::ConfigError(format!(
                "backend '{}' has an empty endpoint",
                self.id
            )));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(Error::ConfigError(format!(
                "backend '{}' temperature must be between 0.0 and 2.0",
                self.id
            )));
        }
        if !self.specialization.is_valid() {
            return Err(Error::ConfigError(format!(
                "backend '{}' specialization scores must be within [0, 1]",
                self.id
            )));
        }
        Ok(())
    }
}

/// Registry of configured backends
///
/// Registration order is preserved; it is the tie-break order for ranking.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    backends: Vec<BackendConfig>,
}

impl ModelRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            backends: Vec::new(),
        }
    }

    /// Build a registry from configured backends, rejecting duplicates
    pub fn from_configs(configs: Vec<BackendConfig>) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            config.validate()?;
            if registry.get(&config.id).is_some() {
                return Err(Error::ConfigError(format!(
                    "backend '{}' is configured more than once",
                    config.id
                )));
            }
            registry.backends.push(config);
        }
        Ok(registry)
    }

    /// Create a registry with well-known hosted backends
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register(
            BackendConfig::new("openai", "https://api.openai.com/v1", "gpt-4o")
                .with_credential_env("OPENAI_API_KEY")
                .with_specialization(SpecializationProfile::new(0.8, 0.85, 0.8, 0.85)),
        );

        registry.register(
            BackendConfig::new(
                "anthropic",
                "https://openrouter.ai/api/v1",
                "anthropic/claude-sonnet-4",
            )
            .with_credential_env("OPENROUTER_API_KEY")
            .with_specialization(SpecializationProfile::new(0.9, 0.9, 0.85, 0.8)),
        );

        registry.register(
            BackendConfig::new(
                "gemini",
                "https://generativelanguage.googleapis.com/v1beta/openai",
                "gemini-2.0-flash",
            )
            .with_credential_env("GEMINI_API_KEY")
            .with_specialization(SpecializationProfile::new(0.75, 0.75, 0.85, 0.75)),
        );

        registry.register(
            BackendConfig::new("deepseek", "https://api.deepseek.com/v1", "deepseek-chat")
                .with_credential_env("DEEPSEEK_API_KEY")
                .with_specialization(SpecializationProfile::new(0.55, 0.9, 0.85, 0.6)),
        );

        registry.register(
            BackendConfig::new("mistral", "https://api.mistral.ai/v1", "mistral-large-latest")
                .with_credential_env("MISTRAL_API_KEY")
                .with_specialization(SpecializationProfile::new(0.7, 0.7, 0.7, 0.8)),
        );

        registry
    }

    /// Register a backend, replacing any backend with the same id in place
    pub fn register(&mut self, backend: BackendConfig) {
        match self.backends.iter_mut().find(|b| b.id == backend.id) {
            Some(existing) => *existing = backend,
            None => self.backends.push(backend),
        }
    }

    /// Get a backend by id
    pub fn get(&self, id: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.id == id)
    }

    /// Get all backends, enabled or not, in registration order
    pub fn all(&self) -> impl Iterator<Item = &BackendConfig> {
        self.backends.iter()
    }

    /// Enabled backends in registration order
    pub fn available(&self) -> Vec<&BackendConfig> {
        self.backends.iter().filter(|b| b.enabled).collect()
    }

    /// Ids of enabled backends in registration order
    pub fn available_ids(&self) -> Vec<BackendId> {
        self.available().into_iter().map(|b| b.id.clone()).collect()
    }

    /// Number of registered backends
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
