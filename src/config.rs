//! Configuration management
//!
//! All configurable parameters in one place with environment variable
//! overrides. Sensible defaults, configurable in production.

use serde::{Deserialize, Serialize};
use std::env;

use crate::constants::*;

/// Sampling and learning parameters stored alongside the reranker weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankerConfig {
    /// Candidate pool size requested from the retriever
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Number of memories selected for injection. Expected `top_m <= top_k`;
    /// the type does not enforce it, callers must respect it.
    #[serde(default = "default_top_m")]
    pub top_m: usize,

    /// Gumbel-Softmax temperature, must be > 0
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Learning rate scaling the policy-gradient update, must be > 0
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,

    /// Reward baseline subtracted before the advantage is formed
    #[serde(default = "default_baseline")]
    pub baseline: f32,
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_top_m() -> usize {
    DEFAULT_TOP_M
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

fn default_learning_rate() -> f32 {
    DEFAULT_LEARNING_RATE
}

fn default_baseline() -> f32 {
    DEFAULT_BASELINE
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            top_m: default_top_m(),
            temperature: default_temperature(),
            learning_rate: default_learning_rate(),
            baseline: default_baseline(),
        }
    }
}

/// How the two minimum reflection thresholds combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReflectionMode {
    /// Both `min_turns` AND `min_inactivity_ms` must be met
    Strict,
    /// Either `min_turns` OR `min_inactivity_ms` suffices
    Relaxed,
}

/// Thresholds governing when buffered dialogue is staged for extraction
///
/// Invariant: `max_turns >= min_turns` and
/// `max_inactivity_ms >= min_inactivity_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionConfig {
    #[serde(default = "default_min_turns")]
    pub min_turns: usize,

    #[serde(default = "default_max_turns")]
    pub max_turns: usize,

    #[serde(default = "default_min_inactivity_ms")]
    pub min_inactivity_ms: u64,

    #[serde(default = "default_max_inactivity_ms")]
    pub max_inactivity_ms: u64,

    #[serde(default = "default_mode")]
    pub mode: ReflectionMode,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_min_turns() -> usize {
    DEFAULT_MIN_TURNS
}

fn default_max_turns() -> usize {
    DEFAULT_MAX_TURNS
}

fn default_min_inactivity_ms() -> u64 {
    DEFAULT_MIN_INACTIVITY_MS
}

fn default_max_inactivity_ms() -> u64 {
    DEFAULT_MAX_INACTIVITY_MS
}

fn default_mode() -> ReflectionMode {
    ReflectionMode::Strict
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            min_turns: default_min_turns(),
            max_turns: default_max_turns(),
            min_inactivity_ms: default_min_inactivity_ms(),
            max_inactivity_ms: default_max_inactivity_ms(),
            mode: default_mode(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Embedding dimension D; every vector crossing the engine boundary must
    /// have this length
    pub dimension: usize,

    #[serde(default)]
    pub reranker: RerankerConfig,

    /// Gradient samples accumulated before a weight update is applied
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Frobenius-norm ceiling applied to each transform after a batch update
    #[serde(default = "default_clip_threshold")]
    pub clip_threshold: f32,

    #[serde(default)]
    pub reflection: ReflectionConfig,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_clip_threshold() -> f32 {
    DEFAULT_CLIP_THRESHOLD
}

impl EngineConfig {
    /// Config with defaults for the given embedding dimension
    pub fn for_dimension(dimension: usize) -> Self {
        Self {
            dimension,
            reranker: RerankerConfig::default(),
            batch_size: default_batch_size(),
            clip_threshold: default_clip_threshold(),
            reflection: ReflectionConfig::default(),
        }
    }

    /// Load from environment variables, starting from defaults
    ///
    /// Recognized variables (all optional):
    /// - `REFLECTIVE_TOP_K`, `REFLECTIVE_TOP_M`, `REFLECTIVE_TEMPERATURE`
    /// - `REFLECTIVE_LEARNING_RATE`, `REFLECTIVE_BASELINE`
    /// - `REFLECTIVE_BATCH_SIZE`, `REFLECTIVE_CLIP_THRESHOLD`
    /// - `REFLECTIVE_MIN_TURNS`, `REFLECTIVE_MAX_TURNS`
    /// - `REFLECTIVE_MIN_INACTIVITY_MS`, `REFLECTIVE_MAX_INACTIVITY_MS`
    /// - `REFLECTIVE_REFLECTION_MODE` ("strict" | "relaxed")
    pub fn from_env(dimension: usize) -> Self {
        let mut config = Self::for_dimension(dimension);

        fn parse_var<T: std::str::FromStr>(name: &str, target: &mut T) {
            if let Ok(raw) = env::var(name) {
                match raw.parse() {
                    Ok(v) => *target = v,
                    Err(_) => tracing::warn!(var = name, value = %raw, "Ignoring unparseable env override"),
                }
            }
        }

        parse_var("REFLECTIVE_TOP_K", &mut config.reranker.top_k);
        parse_var("REFLECTIVE_TOP_M", &mut config.reranker.top_m);
        parse_var("REFLECTIVE_TEMPERATURE", &mut config.reranker.temperature);
        parse_var("REFLECTIVE_LEARNING_RATE", &mut config.reranker.learning_rate);
        parse_var("REFLECTIVE_BASELINE", &mut config.reranker.baseline);
        parse_var("REFLECTIVE_BATCH_SIZE", &mut config.batch_size);
        parse_var("REFLECTIVE_CLIP_THRESHOLD", &mut config.clip_threshold);
        parse_var("REFLECTIVE_MIN_TURNS", &mut config.reflection.min_turns);
        parse_var("REFLECTIVE_MAX_TURNS", &mut config.reflection.max_turns);
        parse_var("REFLECTIVE_MIN_INACTIVITY_MS", &mut config.reflection.min_inactivity_ms);
        parse_var("REFLECTIVE_MAX_INACTIVITY_MS", &mut config.reflection.max_inactivity_ms);

        if let Ok(raw) = env::var("REFLECTIVE_REFLECTION_MODE") {
            match raw.to_lowercase().as_str() {
                "strict" => config.reflection.mode = ReflectionMode::Strict,
                "relaxed" => config.reflection.mode = ReflectionMode::Relaxed,
                other => tracing::warn!(value = other, "Ignoring unknown reflection mode"),
            }
        }

        config
    }

    /// Fail fast on invariant violations; warn on suspicious-but-legal values
    pub fn validate(&self) -> crate::errors::Result<()> {
        use crate::errors::MemoryError;

        if self.dimension == 0 {
            return Err(MemoryError::InvalidConfig {
                field: "dimension".to_string(),
                reason: "embedding dimension must be positive".to_string(),
            });
        }
        if self.reranker.temperature <= 0.0 || !self.reranker.temperature.is_finite() {
            return Err(MemoryError::InvalidConfig {
                field: "temperature".to_string(),
                reason: format!("must be a positive finite value, got {}", self.reranker.temperature),
            });
        }
        if self.reranker.learning_rate <= 0.0 || !self.reranker.learning_rate.is_finite() {
            return Err(MemoryError::InvalidConfig {
                field: "learning_rate".to_string(),
                reason: format!("must be a positive finite value, got {}", self.reranker.learning_rate),
            });
        }
        if self.batch_size == 0 {
            return Err(MemoryError::InvalidConfig {
                field: "batch_size".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.reflection.max_turns < self.reflection.min_turns {
            return Err(MemoryError::InvalidConfig {
                field: "reflection.max_turns".to_string(),
                reason: "max_turns must be >= min_turns".to_string(),
            });
        }
        if self.reflection.max_inactivity_ms < self.reflection.min_inactivity_ms {
            return Err(MemoryError::InvalidConfig {
                field: "reflection.max_inactivity_ms".to_string(),
                reason: "max_inactivity_ms must be >= min_inactivity_ms".to_string(),
            });
        }

        if self.reranker.top_m > self.reranker.top_k {
            tracing::warn!(
                top_m = self.reranker.top_m,
                top_k = self.reranker.top_k,
                "top_m exceeds top_k; every candidate will always be selected"
            );
        }

        Ok(())
    }
}
