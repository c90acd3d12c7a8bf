//! AI Integration Layer
//!
//! LLM providers, the per-file analysis backend, token accounting, and the
//! rate limiter that gates every outbound call.

pub mod backend;
pub mod json;
pub mod provider;
pub mod rate_limiter;
pub mod timeout;
pub mod usage;

pub use backend::{AnalysisBackend, LlmAnalysisBackend};
pub use provider::{
    ErrorCategory, ErrorClassifier, LlmError, LlmProvider, LlmResponse, ProviderConfig,
    SharedProvider, TokenUsage, create_provider,
};
pub use rate_limiter::{Permit, RateLimiter, RateLimiterConfig, RateLimiterStatus};
pub use timeout::{TimeoutConfig, with_timeout};
pub use usage::{PhaseUsage, SharedUsage, UsageSummary, UsageTracker};
