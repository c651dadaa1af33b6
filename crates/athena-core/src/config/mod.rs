//! Configuration management with file persistence
//!
//! Every tunable constant of the analyzer, decision engine, learning store,
//! and executor lives here. Defaults reproduce the canonical values; a TOML
//! file may override any of them.

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::registry::{BackendConfig, ModelRegistry};

/// Athena configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub decision: DecisionConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Backend used as the remote classifier (heuristic only when unset)
    pub classifier_backend: Option<String>,
    pub classifier_timeout_ms: u64,
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            classifier_backend: None,
            classifier_timeout_ms: 1500,
            cache_enabled: true,
            cache_ttl_secs: 300,
            cache_capacity: 256,
        }
    }
}

impl AnalyzerConfig {
    pub fn classifier_timeout(&self) -> Duration {
        Duration::from_millis(self.classifier_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// Hard cap on selected backends per request
    pub max_backends: usize,
    /// Weight of prompt affinity in the ranking score
    pub affinity_weight: f64,
    /// Weight of learned performance in the ranking score
    pub performance_weight: f64,
    /// Learned performance assumed for backends without history
    pub default_performance: f64,
    /// Pattern score above which a learned pattern overrides fresh ranking
    pub pattern_override_threshold: f64,
    /// Overall confidence at or above which a recommendation may be auto-applied
    pub auto_apply_threshold: f64,
    /// Multiplier for backends strong in the prompt's category
    pub category_multiplier: f64,
    /// Profile score at which a backend counts as strong in a category
    pub strong_specialization: f64,
    /// Boost applied to the top-weighted backend for expert prompts
    pub expert_top_boost: f64,
    /// Confidence penalty for expert prompts
    pub expert_confidence_penalty: f64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            max_backends: 5,
            affinity_weight: 0.7,
            performance_weight: 0.3,
            default_performance: 0.5,
            pattern_override_threshold: 0.8,
            auto_apply_threshold: 0.85,
            category_multiplier: 1.3,
            strong_specialization: 0.8,
            expert_top_boost: 1.2,
            expert_confidence_penalty: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Maximum number of learning patterns kept
    pub capacity: usize,
    /// Patterns unused for longer than this are pruned on load
    pub ttl_days: i64,
    /// Samples kept per rolling performance window
    pub window_size: usize,
    /// Quality at or above which a sample counts as a success
    pub success_threshold: f64,
    /// Persistence key of the learning snapshot
    pub storage_key: String,
    /// Maximum number of recommendation history records kept
    pub history_capacity: usize,
    /// Persistence key of the recommendation history
    pub history_key: String,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            ttl_days: 30,
            window_size: 100,
            success_threshold: 0.6,
            storage_key: "athena.learning".to_string(),
            history_capacity: 200,
            history_key: "athena.recommendation_history".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Per-backend call timeout
    pub backend_timeout_secs: u64,
    /// Response confidence at which adaptive runs stop the remaining backends
    pub adaptive_confidence_threshold: f64,
    /// Word count at which a response counts as complete for adaptive runs
    pub adaptive_complete_words: usize,
    /// Reconnection attempts after transport loss
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Agreement below which a consensus response is flagged as an outlier
    pub consensus_outlier_threshold: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            backend_timeout_secs: 60,
            adaptive_confidence_threshold: 0.75,
            adaptive_complete_words: 40,
            reconnect_max_attempts: 5,
            reconnect_base_delay_ms: 250,
            reconnect_max_delay_ms: 4000,
            consensus_outlier_threshold: 0.15,
        }
    }
}

impl ExecutorConfig {
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("ATHENA_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("athena")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or the defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_toml(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let d = &self.decision;
        if d.max_backends == 0 {
            return Err(anyhow!("decision.max_backends must be at least 1"));
        }
        for (name, value) in [
            ("decision.affinity_weight", d.affinity_weight),
            ("decision.performance_weight", d.performance_weight),
            ("decision.default_performance", d.default_performance),
            ("decision.pattern_override_threshold", d.pattern_override_threshold),
            ("decision.auto_apply_threshold", d.auto_apply_threshold),
            ("decision.strong_specialization", d.strong_specialization),
            ("decision.expert_confidence_penalty", d.expert_confidence_penalty),
            (
                "executor.adaptive_confidence_threshold",
                self.executor.adaptive_confidence_threshold,
            ),
            (
                "executor.consensus_outlier_threshold",
                self.executor.consensus_outlier_threshold,
            ),
            ("learning.success_threshold", self.learning.success_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be between 0.0 and 1.0", name));
            }
        }
        if d.category_multiplier < 1.0 || d.expert_top_boost < 1.0 {
            return Err(anyhow!(
                "decision multipliers must be at least 1.0 (got {} and {})",
                d.category_multiplier,
                d.expert_top_boost
            ));
        }
        if self.learning.capacity == 0 || self.learning.window_size == 0 {
            return Err(anyhow!(
                "learning.capacity and learning.window_size must be at least 1"
            ));
        }
        if self.learning.ttl_days <= 0 {
            return Err(anyhow!("learning.ttl_days must be positive"));
        }
        if self.executor.backend_timeout_secs == 0 {
            return Err(anyhow!("executor.backend_timeout_secs must be positive"));
        }
        for backend in &self.backends {
            if backend.credential.is_some() {
                return Err(anyhow!(
                    "Credentials for backend '{}' must be provided via environment variables, not stored in configuration",
                    backend.id
                ));
            }
        }
        Ok(())
    }

    /// Build the backend registry; the built-in backends are used when none are configured
    pub fn registry(&self) -> crate::Result<ModelRegistry> {
        if self.backends.is_empty() {
            Ok(ModelRegistry::with_defaults())
        } else {
            ModelRegistry::from_configs(self.backends.clone())
        }
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "analyzer.classifier_backend" => Ok(self
                .analyzer
                .classifier_backend
                .clone()
                .unwrap_or_else(|| "(heuristic only)".to_string())),
            "analyzer.classifier_timeout_ms" => Ok(self.analyzer.classifier_timeout_ms.to_string()),
            "analyzer.cache_enabled" => Ok(self.analyzer.cache_enabled.to_string()),
            "decision.max_backends" => Ok(self.decision.max_backends.to_string()),
            "decision.auto_apply_threshold" => Ok(self.decision.auto_apply_threshold.to_string()),
            "learning.capacity" => Ok(self.learning.capacity.to_string()),
            "learning.ttl_days" => Ok(self.learning.ttl_days.to_string()),
            "executor.backend_timeout_secs" => Ok(self.executor.backend_timeout_secs.to_string()),
            "executor.adaptive_confidence_threshold" => {
                Ok(self.executor.adaptive_confidence_threshold.to_string())
            }
            _ => Err(anyhow!("Unknown configuration key: {}", key)),
        }
    }

    /// Set a configuration value by key
    ///
    /// The configuration is left untouched unless the result validates.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut updated = self.clone();
        updated.apply(key, value)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "analyzer.classifier_backend" => {
                self.analyzer.classifier_backend =
                    Some(value.to_string()).filter(|v| !v.is_empty());
            }
            "analyzer.classifier_timeout_ms" => {
                self.analyzer.classifier_timeout_ms = value
                    .parse()
                    .with_context(|| format!("Invalid classifier_timeout_ms value: {}", value))?;
            }
            "analyzer.cache_enabled" => {
                self.analyzer.cache_enabled = value
                    .parse()
                    .with_context(|| format!("Invalid cache_enabled value: {}", value))?;
            }
            "decision.max_backends" => {
                let max: usize = value
                    .parse()
                    .with_context(|| format!("Invalid max_backends value: {}", value))?;
                if max == 0 {
                    return Err(anyhow!("max_backends must be at least 1"));
                }
                self.decision.max_backends = max;
            }
            "decision.auto_apply_threshold" => {
                let threshold: f64 = value
                    .parse()
                    .with_context(|| format!("Invalid auto_apply_threshold value: {}", value))?;
                if !(0.0..=1.0).contains(&threshold) {
                    return Err(anyhow!("Auto-apply threshold must be between 0.0 and 1.0"));
                }
                self.decision.auto_apply_threshold = threshold;
            }
            "learning.capacity" => {
                self.learning.capacity = value
                    .parse()
                    .with_context(|| format!("Invalid capacity value: {}", value))?;
            }
            "learning.ttl_days" => {
                self.learning.ttl_days = value
                    .parse()
                    .with_context(|| format!("Invalid ttl_days value: {}", value))?;
            }
            "executor.backend_timeout_secs" => {
                self.executor.backend_timeout_secs = value
                    .parse()
                    .with_context(|| format!("Invalid backend_timeout_secs value: {}", value))?;
            }
            "executor.adaptive_confidence_threshold" => {
                let threshold: f64 = value.parse().with_context(|| {
                    format!("Invalid adaptive_confidence_threshold value: {}", value)
                })?;
                if !(0.0..=1.0).contains(&threshold) {
                    return Err(anyhow!(
                        "Adaptive confidence threshold must be between 0.0 and 1.0"
                    ));
                }
                self.executor.adaptive_confidence_threshold = threshold;
            }
            _ => return Err(anyhow!("Unknown configuration key: {}", key)),
        }
        Ok(())
    }
}
