//! Unified Error Type System
//!
//! Centralized error types for the entire application.
//! Provides error classification for retry decisions and exit-code mapping.
//!
//! ## Error Categories
//!
//! - **Transient**: Temporary issues that may resolve (retry)
//! - **RateLimit**: API rate limiting (wait and retry through the limiter)
//! - **TokenLimit**: Context too large (item failure)
//! - **Auth**: Authentication failures (fail fast)
//! - **Network**: Connectivity issues (retry with backoff)
//! - **Unavailable**: Provider unavailable
//!
//! ## Pipeline Taxonomy
//!
//! | Class              | Variant                         | Outcome                    |
//! |--------------------|---------------------------------|----------------------------|
//! | transient/backend  | `LlmError` (retryable category) | retried per item           |
//! | item-permanent     | `LlmError` (other categories)   | recorded in `failed_items` |
//! | state-durability   | `StateDurability`               | fatal, exit 1              |
//! | state-corruption   | reported via `Loaded::Corrupted`| restart with warning       |
//! | concurrent-access  | `StateLocked`                   | fatal, exit 1              |

use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Error Categories
// =============================================================================

/// Error categories for retry routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rate limited - back off through the limiter, then retry
    RateLimit,
    /// Context/token limit exceeded - the item cannot succeed
    TokenLimit,
    /// Authentication failed - fail fast, don't retry
    Auth,
    /// Network/connectivity issues - retry with backoff
    Network,
    /// Provider unavailable
    Unavailable,
    /// Invalid request - don't retry, fix request
    BadRequest,
    /// Parsing LLM response failed - may succeed on another attempt
    ParseError,
    /// Temporary server issues - retry same provider
    Transient,
    /// Unknown error - conservative retry
    Unknown,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimit => write!(f, "RATE_LIMIT"),
            Self::TokenLimit => write!(f, "TOKEN_LIMIT"),
            Self::Auth => write!(f, "AUTH"),
            Self::Network => write!(f, "NETWORK"),
            Self::Unavailable => write!(f, "UNAVAILABLE"),
            Self::BadRequest => write!(f, "BAD_REQUEST"),
            Self::ParseError => write!(f, "PARSE_ERROR"),
            Self::Transient => write!(f, "TRANSIENT"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl ErrorCategory {
    /// Check if this category is worth another attempt on the same item
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::Network | Self::Transient | Self::ParseError | Self::Unknown
        )
    }
}

// =============================================================================
// LLM Error
// =============================================================================

/// Backend error with category, context, and retry hints
#[derive(Debug, Clone)]
pub struct LlmError {
    /// Error category for routing decisions
    pub category: ErrorCategory,
    /// Detailed error message
    pub message: String,
    /// Provider that produced the error
    pub provider: Option<String>,
    /// Suggested wait time before retry (if applicable)
    pub retry_after: Option<Duration>,
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(provider) = &self.provider {
            write!(f, "[{}:{}] {}", provider, self.category, self.message)
        } else {
            write!(f, "[{}] {}", self.category, self.message)
        }
    }
}

impl std::error::Error for LlmError {}

impl LlmError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            provider: None,
            retry_after: None,
        }
    }

    pub fn with_provider(
        category: ErrorCategory,
        message: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            category,
            message: message.into(),
            provider: Some(provider.into()),
            retry_after: None,
        }
    }

    /// Add suggested retry delay
    pub fn retry_after(mut self, duration: Duration) -> Self {
        self.retry_after = Some(duration);
        self
    }

    pub fn is_rate_limit(&self) -> bool {
        self.category == ErrorCategory::RateLimit
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }
}

// =============================================================================
// Error Classifier
// =============================================================================

static RETRY_AFTER_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)retry[- ]after[^0-9]{0,8}(\d+)").ok());

/// Error classifier for backend error routing
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classify an error message from any provider
    pub fn classify(message: &str, provider: &str) -> LlmError {
        let lower = message.to_lowercase();

        if lower.contains("rate limit")
            || lower.contains("rate_limit")
            || lower.contains("429")
            || lower.contains("too many requests")
            || lower.contains("quota exceeded")
            || lower.contains("overloaded")
        {
            let wait = Self::parse_retry_after(message).unwrap_or(Duration::from_secs(30));
            return LlmError::with_provider(ErrorCategory::RateLimit, message, provider)
                .retry_after(wait);
        }

        if lower.contains("token")
            && (lower.contains("limit") || lower.contains("exceed") || lower.contains("maximum"))
            || lower.contains("context length")
            || lower.contains("too large")
        {
            return LlmError::with_provider(ErrorCategory::TokenLimit, message, provider);
        }

        if lower.contains("401")
            || lower.contains("403")
            || lower.contains("api key")
            || lower.contains("invalid key")
            || lower.contains("unauthorized")
            || lower.contains("authentication")
        {
            return LlmError::with_provider(ErrorCategory::Auth, message, provider);
        }

        if lower.contains("network")
            || lower.contains("connection")
            || lower.contains("dns")
            || lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("unreachable")
        {
            return LlmError::with_provider(ErrorCategory::Network, message, provider)
                .retry_after(Duration::from_secs(5));
        }

        if lower.contains("500")
            || lower.contains("502")
            || lower.contains("503")
            || lower.contains("504")
            || lower.contains("server error")
            || lower.contains("temporar")
        {
            return LlmError::with_provider(ErrorCategory::Transient, message, provider)
                .retry_after(Duration::from_secs(2));
        }

        if lower.contains("service unavailable") || lower.contains("not found") {
            return LlmError::with_provider(ErrorCategory::Unavailable, message, provider);
        }

        if lower.contains("400")
            || lower.contains("bad request")
            || lower.contains("invalid")
            || lower.contains("malformed")
        {
            return LlmError::with_provider(ErrorCategory::BadRequest, message, provider);
        }

        if lower.contains("parse") || lower.contains("json") || lower.contains("syntax") {
            return LlmError::with_provider(ErrorCategory::ParseError, message, provider)
                .retry_after(Duration::from_secs(1));
        }

        LlmError::with_provider(ErrorCategory::Unknown, message, provider)
    }

    /// Classify HTTP status code directly (more accurate than string matching)
    pub fn classify_http_status(status: u16, message: &str, provider: &str) -> LlmError {
        match status {
            429 | 529 => {
                let wait = Self::parse_retry_after(message).unwrap_or(Duration::from_secs(30));
                LlmError::with_provider(ErrorCategory::RateLimit, message, provider)
                    .retry_after(wait)
            }
            401 | 403 => LlmError::with_provider(ErrorCategory::Auth, message, provider),
            400 | 413 | 422 => LlmError::with_provider(ErrorCategory::BadRequest, message, provider),
            500 | 502 | 503 | 504 => {
                LlmError::with_provider(ErrorCategory::Transient, message, provider)
                    .retry_after(Duration::from_secs(5))
            }
            404 => LlmError::with_provider(ErrorCategory::Unavailable, message, provider),
            _ => LlmError::with_provider(ErrorCategory::Unknown, message, provider),
        }
    }

    /// Classify an application error raised while calling a provider
    pub fn classify_error(err: &RulectlError, provider: &str) -> LlmError {
        match err {
            RulectlError::Llm(llm_err) => llm_err.clone(),
            RulectlError::LlmApi(msg) => Self::classify(msg, provider),
            RulectlError::Timeout { .. } => {
                LlmError::with_provider(ErrorCategory::Network, err.to_string(), provider)
                    .retry_after(Duration::from_secs(5))
            }
            RulectlError::Io(_) => {
                LlmError::with_provider(ErrorCategory::BadRequest, err.to_string(), provider)
            }
            RulectlError::Json(_) => {
                LlmError::with_provider(ErrorCategory::ParseError, err.to_string(), provider)
            }
            RulectlError::Config(_) => {
                LlmError::with_provider(ErrorCategory::Auth, err.to_string(), provider)
            }
            _ => LlmError::with_provider(ErrorCategory::Unknown, err.to_string(), provider),
        }
    }

    /// Extract a `retry-after: N` hint (seconds) from an error body
    pub fn parse_retry_after(message: &str) -> Option<Duration> {
        let pattern = RETRY_AFTER_PATTERN.as_ref()?;
        let secs: u64 = pattern.captures(message)?.get(1)?.as_str().parse().ok()?;
        Some(Duration::from_secs(secs))
    }
}

// =============================================================================
// Item Error
// =============================================================================

/// How the scheduler should treat a failed work item
#[derive(Debug, Clone, PartialEq)]
pub enum ItemErrorKind {
    /// Provider rejected the call for rate reasons; back off and retry
    RateLimited { retry_after: Option<Duration> },
    /// Timeout or transient failure; retry
    Transient,
    /// The item itself cannot be processed; record and move on
    Permanent,
}

/// Failure of one work item
#[derive(Debug, Clone, PartialEq)]
pub struct ItemError {
    pub kind: ItemErrorKind,
    pub message: String,
}

impl std::fmt::Display for ItemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ItemError {}

impl ItemError {
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: ItemErrorKind::RateLimited { retry_after },
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ItemErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ItemErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self.kind, ItemErrorKind::RateLimited { .. })
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, ItemErrorKind::Permanent)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self.kind {
            ItemErrorKind::RateLimited { retry_after } => retry_after,
            _ => None,
        }
    }

    /// Classify an error raised while calling `provider`
    pub fn from_error(err: &RulectlError, provider: &str) -> Self {
        ErrorClassifier::classify_error(err, provider).into()
    }
}

impl From<LlmError> for ItemError {
    fn from(err: LlmError) -> Self {
        let message = err.to_string();
        if err.is_rate_limit() {
            Self::rate_limited(message, err.retry_after)
        } else if err.is_retryable() {
            Self::transient(message)
        } else {
            Self::permanent(message)
        }
    }
}

// =============================================================================
// Exit Codes
// =============================================================================

/// Process exit codes
pub mod exit_code {
    /// Analysis completed
    pub const SUCCESS: u8 = 0;
    /// Fatal environment error (state not writable, config invalid, lock held)
    pub const FATAL: u8 = 1;
    /// A phase failed after exhausting retries
    pub const PHASE_FAILED: u8 = 2;
    /// A resumable session exists and no resume decision was given
    pub const RESUME_REQUIRED: u8 = 3;
    /// Interrupted by the user
    pub const INTERRUPTED: u8 = 130;
}

// =============================================================================
// Application Error
// =============================================================================

#[derive(Debug, Error)]
pub enum RulectlError {
    // -------------------------------------------------------------------------
    // System Errors (auto From impl)
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // -------------------------------------------------------------------------
    // Backend Errors
    // -------------------------------------------------------------------------
    /// Structured LLM error with category and retry hints
    #[error("LLM error: {0}")]
    Llm(LlmError),

    /// Simple LLM API error (classified later by `ErrorClassifier`)
    #[error("LLM API error: {0}")]
    LlmApi(String),

    #[error("Timeout after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    // -------------------------------------------------------------------------
    // State Errors
    // -------------------------------------------------------------------------
    /// Another process holds the session directory lock
    #[error(
        "Analysis state at {} is locked by another rulectl process (waited {:?})",
        .path.display(),
        .waited
    )]
    StateLocked { path: PathBuf, waited: Duration },

    /// Durable state could not be written
    #[error(
        "Failed to persist analysis state to {}: {message}{}",
        .path.display(),
        .last_checkpoint
            .as_deref()
            .map(|t| format!(" (last checkpoint: {})", t))
            .unwrap_or_default()
    )]
    StateDurability {
        path: PathBuf,
        message: String,
        last_checkpoint: Option<String>,
    },

    /// Illegal phase transition or inconsistent session
    #[error("Session error: {0}")]
    Session(String),

    // -------------------------------------------------------------------------
    // Pipeline Errors
    // -------------------------------------------------------------------------
    #[error(
        "Phase {phase} failed: {reason} ({completed} completed, {failed} failed; progress saved)"
    )]
    PhaseFailed {
        phase: String,
        reason: String,
        completed: usize,
        failed: usize,
    },

    #[error("Interrupted during {phase}; progress saved, rerun with --resume to continue")]
    Interrupted { phase: String },

    #[error(
        "An unfinished analysis exists ({summary}). Rerun with --resume to continue or --fresh to discard it"
    )]
    ResumeRequired { summary: String },

    // -------------------------------------------------------------------------
    // Domain Errors
    // -------------------------------------------------------------------------
    #[error("Config error: {0}")]
    Config(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Git error: {0}")]
    Git(String),
}

impl From<LlmError> for RulectlError {
    fn from(err: LlmError) -> Self {
        RulectlError::Llm(err)
    }
}

pub type Result<T> = std::result::Result<T, RulectlError>;

// =============================================================================
// Helper Functions
// =============================================================================

impl RulectlError {
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    pub fn durability(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::StateDurability {
            path: path.into(),
            message: err.to_string(),
            last_checkpoint: None,
        }
    }

    /// Attach the last successful checkpoint time to a durability failure
    pub fn with_last_checkpoint(self, at: impl Into<String>) -> Self {
        match self {
            Self::StateDurability { path, message, .. } => Self::StateDurability {
                path,
                message,
                last_checkpoint: Some(at.into()),
            },
            other => other,
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::PhaseFailed { .. } => exit_code::PHASE_FAILED,
            Self::ResumeRequired { .. } => exit_code::RESUME_REQUIRED,
            Self::Interrupted { .. } => exit_code::INTERRUPTED,
            _ => exit_code::FATAL,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_display() {
        assert_eq!(ErrorCategory::RateLimit.to_string(), "RATE_LIMIT");
        assert_eq!(ErrorCategory::TokenLimit.to_string(), "TOKEN_LIMIT");
        assert_eq!(ErrorCategory::Auth.to_string(), "AUTH");
    }

    #[test]
    fn test_error_category_retryable() {
        assert!(ErrorCategory::RateLimit.is_retryable());
        assert!(ErrorCategory::Network.is_retryable());
        assert!(ErrorCategory::Transient.is_retryable());
        assert!(ErrorCategory::ParseError.is_retryable());
        assert!(!ErrorCategory::Auth.is_retryable());
        assert!(!ErrorCategory::BadRequest.is_retryable());
        assert!(!ErrorCategory::TokenLimit.is_retryable());
    }

    #[test]
    fn test_classify_rate_limit() {
        let err = ErrorClassifier::classify("Rate limit exceeded, please retry", "anthropic");
        assert_eq!(err.category, ErrorCategory::RateLimit);
        assert!(err.is_rate_limit());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_rate_limit_with_retry_after() {
        let err = ErrorClassifier::classify("429 Too Many Requests; retry-after: 12", "openai");
        assert!(err.is_rate_limit());
        assert_eq!(err.retry_after, Some(Duration::from_secs(12)));
    }

    #[test]
    fn test_classify_token_limit() {
        let err = ErrorClassifier::classify("Token limit exceeded: 150000 > 128000", "openai");
        assert_eq!(err.category, ErrorCategory::TokenLimit);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_classify_auth() {
        let err = ErrorClassifier::classify("Invalid API key provided", "openai");
        assert_eq!(err.category, ErrorCategory::Auth);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_classify_network() {
        let err = ErrorClassifier::classify("Connection timed out after 30s", "ollama");
        assert_eq!(err.category, ErrorCategory::Network);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_http_status() {
        let rate_limit = ErrorClassifier::classify_http_status(429, "Rate limited", "test");
        assert_eq!(rate_limit.category, ErrorCategory::RateLimit);

        let auth = ErrorClassifier::classify_http_status(401, "Unauthorized", "test");
        assert_eq!(auth.category, ErrorCategory::Auth);

        let server_error = ErrorClassifier::classify_http_status(500, "Server error", "test");
        assert_eq!(server_error.category, ErrorCategory::Transient);
    }

    #[test]
    fn test_classify_timeout_error() {
        let err = RulectlError::timeout("LLM request", Duration::from_secs(5));
        let classified = ErrorClassifier::classify_error(&err, "openai");
        assert_eq!(classified.category, ErrorCategory::Network);
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let failed = RulectlError::PhaseFailed {
            phase: "file_analysis".to_string(),
            reason: "too many failures".to_string(),
            completed: 3,
            failed: 7,
        };
        let locked = RulectlError::StateLocked {
            path: PathBuf::from(".rulectl"),
            waited: Duration::from_secs(5),
        };
        assert_eq!(failed.exit_code(), exit_code::PHASE_FAILED);
        assert_eq!(locked.exit_code(), exit_code::FATAL);
        assert_ne!(failed.exit_code(), locked.exit_code());
        assert_ne!(failed.exit_code(), exit_code::SUCCESS);
    }

    #[test]
    fn test_durability_carries_last_checkpoint() {
        let err = RulectlError::durability("/tmp/x/progress.json", "disk full")
            .with_last_checkpoint("2026-01-01T00:00:00Z");
        let msg = err.to_string();
        assert!(msg.contains("disk full"));
        assert!(msg.contains("last checkpoint: 2026-01-01T00:00:00Z"));
    }

    #[test]
    fn test_llm_error_display() {
        let err = LlmError::with_provider(ErrorCategory::RateLimit, "Too many requests", "openai");
        assert_eq!(err.to_string(), "[openai:RATE_LIMIT] Too many requests");
    }

    #[test]
    fn test_item_error_from_llm_error() {
        let limited: ItemError = ErrorClassifier::classify_http_status(
            429,
            "slow down, retry-after: 12",
            "anthropic",
        )
        .into();
        assert!(limited.is_rate_limit());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(12)));

        let transient: ItemError = LlmError::new(ErrorCategory::Network, "reset").into();
        assert_eq!(transient.kind, ItemErrorKind::Transient);
        assert!(transient.is_retryable());

        let permanent: ItemError = LlmError::new(ErrorCategory::TokenLimit, "too big").into();
        assert_eq!(permanent.kind, ItemErrorKind::Permanent);
        assert!(!permanent.is_retryable());
    }

    #[test]
    fn test_item_error_from_timeout() {
        let err = RulectlError::timeout("LLM request", Duration::from_secs(1));
        let item = ItemError::from_error(&err, "openai");
        assert_eq!(item.kind, ItemErrorKind::Transient);
    }
}
