//! Configuration Types
//!
//! All configuration structures with sensible defaults.
//! Supports global (user config dir) and project (.rulectl/) level configuration.

use serde::{Deserialize, Serialize};

use crate::constants::{analysis, checkpoint, network, rate_limit, scheduler};
use crate::types::{Result, RulectlError};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration version
    pub version: String,

    /// File discovery and per-file analysis settings
    pub analysis: AnalysisConfig,

    /// LLM provider settings
    pub llm: LlmConfig,

    /// Outbound request throttling
    pub rate_limit: RateLimitConfig,

    /// Batch grouping and worker pool
    pub batching: BatchingConfig,

    /// Partial-failure tolerance per phase
    pub failure: FailureConfig,

    /// Checkpointing and resume behavior
    pub session: SessionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            analysis: AnalysisConfig::default(),
            llm: LlmConfig::default(),
            rate_limit: RateLimitConfig::default(),
            batching: BatchingConfig::default(),
            failure: FailureConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Config {
    /// Validate configuration values are within acceptable ranges.
    /// Returns `RulectlError::Config` on validation failure.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(RulectlError::Config(format!(
                "LLM temperature must be between 0.0 and 2.0, got {}",
                self.llm.temperature
            )));
        }

        if self.llm.timeout_secs == 0 {
            return Err(RulectlError::Config(
                "LLM timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.rate_limit.requests_per_minute == Some(0) {
            return Err(RulectlError::Config(
                "rate_limit.requests_per_minute must be greater than 0".to_string(),
            ));
        }

        if self.rate_limit.multiplier < 1.0 {
            return Err(RulectlError::Config(format!(
                "rate_limit.multiplier must be at least 1.0, got {}",
                self.rate_limit.multiplier
            )));
        }

        if self.rate_limit.max_consecutive_failures == 0 {
            return Err(RulectlError::Config(
                "rate_limit.max_consecutive_failures must be greater than 0".to_string(),
            ));
        }

        if self.batching.batch_size == 0 || self.batching.concurrency == 0 {
            return Err(RulectlError::Config(
                "batching.batch_size and batching.concurrency must be greater than 0".to_string(),
            ));
        }

        if !(self.failure.max_failure_ratio > 0.0 && self.failure.max_failure_ratio <= 1.0) {
            return Err(RulectlError::Config(format!(
                "failure.max_failure_ratio must be in (0.0, 1.0], got {}",
                self.failure.max_failure_ratio
            )));
        }

        if self.session.checkpoint_every_items == 0 {
            return Err(RulectlError::Config(
                "session.checkpoint_every_items must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

// =============================================================================
// Analysis Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Glob patterns to exclude (relative to the repository root)
    pub exclude: Vec<String>,

    /// Maximum file size in bytes
    pub max_file_size: u64,

    /// Characters of file content sent to the backend per file
    pub max_file_chars: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            exclude: vec![
                "node_modules/**".to_string(),
                "dist/**".to_string(),
                ".git/**".to_string(),
                "target/**".to_string(),
                "vendor/**".to_string(),
                "__pycache__/**".to_string(),
                ".venv/**".to_string(),
                "build/**".to_string(),
                ".rulectl/**".to_string(),
            ],
            max_file_size: analysis::MAX_FILE_SIZE,
            max_file_chars: analysis::MAX_FILE_CHARS,
        }
    }
}

// =============================================================================
// LLM Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name: anthropic, openai, ollama
    pub provider: String,

    /// Model name (provider default when unset)
    pub model: Option<String>,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Temperature for LLM generation (0.0 = deterministic)
    pub temperature: f32,

    /// Maximum tokens to generate per request
    pub max_tokens: usize,

    /// Custom API endpoint
    pub api_base: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: None,
            timeout_secs: network::DEFAULT_TIMEOUT_SECS,
            temperature: 0.0,
            max_tokens: 4096,
            api_base: None,
        }
    }
}

// =============================================================================
// Rate Limit Configuration
// =============================================================================

/// Throttling strategy for outbound backend calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitStrategy {
    /// Same wait before every request
    Constant,
    /// Delay multiplies on failure, resets after sustained success
    Exponential,
    /// Sliding-window budget plus failure-driven backoff
    #[default]
    Adaptive,
}

impl std::fmt::Display for RateLimitStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimitStrategy::Constant => write!(f, "constant"),
            RateLimitStrategy::Exponential => write!(f, "exponential"),
            RateLimitStrategy::Adaptive => write!(f, "adaptive"),
        }
    }
}

impl std::str::FromStr for RateLimitStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "constant" => Ok(RateLimitStrategy::Constant),
            "exponential" => Ok(RateLimitStrategy::Exponential),
            "adaptive" => Ok(RateLimitStrategy::Adaptive),
            _ => Err(format!(
                "Unknown rate limit strategy: {}. Valid values: constant, exponential, adaptive",
                s
            )),
        }
    }
}

/// Rate limit settings. Unset budget fields fall back to the provider's defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub strategy: RateLimitStrategy,

    /// Requests allowed per rolling minute
    pub requests_per_minute: Option<u32>,

    /// Base delay in milliseconds
    pub base_delay_ms: Option<u64>,

    /// Delay ceiling in milliseconds
    pub max_delay_ms: Option<u64>,

    /// Backoff multiplier on rate-limit failures
    pub multiplier: f64,

    /// Random jitter bound in milliseconds
    pub jitter_ms: u64,

    /// Consecutive successes before backoff decays
    pub decay_after_successes: u32,

    /// Consecutive failures before the phase is escalated to Failed
    pub max_consecutive_failures: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            strategy: RateLimitStrategy::default(),
            requests_per_minute: None,
            base_delay_ms: None,
            max_delay_ms: None,
            multiplier: rate_limit::BACKOFF_MULTIPLIER,
            jitter_ms: rate_limit::JITTER_MS,
            decay_after_successes: rate_limit::DECAY_AFTER_SUCCESSES,
            max_consecutive_failures: rate_limit::MAX_CONSECUTIVE_FAILURES,
        }
    }
}

// =============================================================================
// Batching Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Group items into batches with an inter-batch delay
    pub enabled: bool,

    /// Items per batch
    pub batch_size: usize,

    /// Delay between batches in milliseconds
    pub delay_between_batches_ms: u64,

    /// Maximum in-flight items within a batch
    pub concurrency: usize,

    /// Retries for a transiently failing item
    pub max_item_retries: u32,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: scheduler::BATCH_SIZE,
            delay_between_batches_ms: scheduler::BATCH_DELAY_MS,
            concurrency: scheduler::CONCURRENCY,
            max_item_retries: scheduler::MAX_ITEM_RETRIES,
        }
    }
}

// =============================================================================
// Failure Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureConfig {
    /// A phase fails when more than this fraction of its items failed
    pub max_failure_ratio: f64,

    /// A phase fails as soon as this many items failed (unbounded when unset)
    pub max_failed_items: Option<usize>,
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self {
            max_failure_ratio: scheduler::MAX_FAILURE_RATIO,
            max_failed_items: None,
        }
    }
}

// =============================================================================
// Session Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Persist progress after this many completed items
    pub checkpoint_every_items: usize,

    /// Persist progress at least this often (seconds)
    pub checkpoint_every_secs: u64,

    /// Bounded wait for the state directory lock (seconds)
    pub lock_timeout_secs: u64,

    /// Resume an unfinished session without asking
    pub auto_resume: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            checkpoint_every_items: checkpoint::EVERY_ITEMS,
            checkpoint_every_secs: checkpoint::EVERY_SECS,
            lock_timeout_secs: checkpoint::LOCK_TIMEOUT_SECS,
            auto_resume: false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
