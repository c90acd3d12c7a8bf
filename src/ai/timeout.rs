//! Timeout Helpers
//!
//! Wraps async operations so a hung backend call or `git` process surfaces
//! as a classified, retryable `RulectlError::Timeout`.

use std::future::Future;
use std::time::Duration;

use crate::constants::network as net_constants;
use crate::types::{Result, RulectlError};

/// Per-operation timeouts
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Timeout for one LLM API request
    pub llm_request: Duration,
    /// Timeout for one `git` invocation
    pub git_command: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            llm_request: Duration::from_secs(net_constants::DEFAULT_TIMEOUT_SECS),
            git_command: Duration::from_secs(net_constants::GIT_TIMEOUT_SECS),
        }
    }
}

impl TimeoutConfig {
    pub fn with_llm_request_secs(mut self, secs: u64) -> Self {
        self.llm_request = Duration::from_secs(secs);
        self
    }
}

/// Execute an async operation with a timeout
///
/// Returns `RulectlError::Timeout` if the operation doesn't complete in time.
pub async fn with_timeout<T, F>(timeout: Duration, future: F, operation_name: &str) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(RulectlError::timeout(operation_name, timeout)),
    }
}
