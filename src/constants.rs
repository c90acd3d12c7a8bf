//! Global Constants
//!
//! Centralized constants for configuration and tuning.
//! All magic numbers should be defined here with documentation.

/// Rate limiter constants
pub mod rate_limit {
    /// Length of the adaptive sliding window (seconds)
    pub const WINDOW_SECS: u64 = 60;

    /// Multiplier applied to the delay on each rate-limit failure
    pub const BACKOFF_MULTIPLIER: f64 = 2.0;

    /// Upper bound of random jitter added to an inflated delay (milliseconds)
    pub const JITTER_MS: u64 = 100;

    /// Consecutive successes before an inflated delay decays one step
    pub const DECAY_AFTER_SUCCESSES: u32 = 3;

    /// Consecutive failures before the current phase is escalated to Failed
    pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

    /// Hard ceiling on any single computed wait (milliseconds)
    pub const MAX_DELAY_CEILING_MS: u64 = 60_000;
}

/// Per-provider request budgets
pub mod provider_budget {
    /// Anthropic: (requests per minute, base delay ms, max delay ms)
    pub const ANTHROPIC: (u32, u64, u64) = (5, 1_000, 60_000);

    /// OpenAI: (requests per minute, base delay ms, max delay ms)
    pub const OPENAI: (u32, u64, u64) = (60, 500, 30_000);

    /// Ollama runs locally, so the budget only protects the host
    pub const OLLAMA: (u32, u64, u64) = (120, 0, 10_000);

    /// Anything else: conservative
    pub const DEFAULT: (u32, u64, u64) = (5, 1_000, 60_000);
}

/// Batch scheduler constants
pub mod scheduler {
    /// Items per batch group
    pub const BATCH_SIZE: usize = 3;

    /// Delay between batch groups (milliseconds)
    pub const BATCH_DELAY_MS: u64 = 2_000;

    /// Maximum in-flight items within a batch group
    pub const CONCURRENCY: usize = 2;

    /// Retries for a transiently failing item
    pub const MAX_ITEM_RETRIES: u32 = 2;

    /// Fraction of failed items above which a phase fails
    pub const MAX_FAILURE_RATIO: f64 = 0.5;
}

/// Checkpoint constants
pub mod checkpoint {
    /// Persist progress after this many completed items
    pub const EVERY_ITEMS: usize = 10;

    /// Persist progress at least this often (seconds)
    pub const EVERY_SECS: u64 = 30;

    /// Bounded wait for the session directory lock (seconds)
    pub const LOCK_TIMEOUT_SECS: u64 = 5;

    /// Poll interval while waiting for the lock (milliseconds)
    pub const LOCK_RETRY_MS: u64 = 100;

    /// Current progress/cache schema version
    pub const SCHEMA_VERSION: u32 = 1;
}

/// On-disk layout
pub mod paths {
    /// State directory under the analyzed repository
    pub const STATE_DIR: &str = ".rulectl";

    /// Session and phase records
    pub const PROGRESS_FILE: &str = "progress.json";

    /// Per-phase cache directory
    pub const CACHE_DIR: &str = "cache";

    /// Lock sentinel
    pub const LOCK_FILE: &str = ".lock";

    /// Final synthesized rules report
    pub const RULES_FILE: &str = "rules.json";

    /// Project-level configuration
    pub const CONFIG_FILE: &str = "config.toml";
}

/// File analysis constants
pub mod analysis {
    /// Maximum file size to analyze (1MB)
    pub const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Characters of file content included in a prompt
    pub const MAX_FILE_CHARS: usize = 12_000;
}

/// HTTP/Network constants
pub mod network {
    /// Default request timeout (seconds)
    pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

    /// Timeout for a single `git log` invocation (seconds)
    pub const GIT_TIMEOUT_SECS: u64 = 30;
}

/// Published list prices, USD per million tokens
pub mod pricing {
    /// (model prefix, input, output); first matching prefix wins
    pub const MODELS: &[(&str, f64, f64)] = &[
        ("claude-opus-4", 15.0, 75.0),
        ("claude-sonnet-4", 3.0, 15.0),
        ("claude-3-5-haiku", 0.8, 4.0),
        ("claude-3-haiku", 0.25, 1.25),
        ("gpt-4o-mini", 0.15, 0.6),
        ("gpt-4o", 2.5, 10.0),
    ];
}
