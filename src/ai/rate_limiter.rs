//! Outbound Request Rate Limiter
//!
//! Throttles calls into the analysis backend. The limiter never sleeps:
//! `acquire` returns how long the caller must wait, and the caller owns the wait.
//!
//! ## Strategies
//!
//! - **Constant**: every request waits `base_delay`
//! - **Exponential**: failures multiply the delay up to `max_delay`;
//!   `decay_after` consecutive successes reset it to `base_delay`
//! - **Adaptive** (default): a sliding window of granted slots bounded by
//!   `requests_per_minute`, plus a failure-driven spacing delay that inflates on
//!   rate-limit errors and decays after consecutive successes
//!
//! ## Reservations
//!
//! An adaptive `Permit::Wait(d)` reserves the slot at `now + d`. The caller
//! proceeds after waiting without calling `acquire` again, so concurrent
//! workers get staggered slots instead of a thundering herd.

use rand::Rng;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::{RateLimitConfig, RateLimitStrategy};
use crate::constants::{provider_budget, rate_limit as rl_constants};

/// Smallest non-zero backoff step, used when the base delay is zero
const MIN_BACKOFF: Duration = Duration::from_millis(100);

/// Outcome of `RateLimiter::acquire`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Send now
    Proceed,
    /// Send after this long; the slot is already reserved
    Wait(Duration),
}

impl Permit {
    pub fn delay(&self) -> Duration {
        match self {
            Permit::Proceed => Duration::ZERO,
            Permit::Wait(d) => *d,
        }
    }
}

/// Resolved limiter settings
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub strategy: RateLimitStrategy,
    pub requests_per_minute: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: Duration,
    pub decay_after: u32,
    pub max_consecutive_failures: u32,
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::for_provider("default")
    }
}

impl RateLimiterConfig {
    /// Built-in budget for a provider
    pub fn for_provider(provider: &str) -> Self {
        let (rpm, base_ms, max_ms) = match provider.to_lowercase().as_str() {
            "anthropic" | "claude" => provider_budget::ANTHROPIC,
            "openai" => provider_budget::OPENAI,
            "ollama" => provider_budget::OLLAMA,
            _ => provider_budget::DEFAULT,
        };
        Self {
            strategy: RateLimitStrategy::Adaptive,
            requests_per_minute: rpm,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms.min(rl_constants::MAX_DELAY_CEILING_MS)),
            multiplier: rl_constants::BACKOFF_MULTIPLIER,
            jitter: Duration::from_millis(rl_constants::JITTER_MS),
            decay_after: rl_constants::DECAY_AFTER_SUCCESSES,
            max_consecutive_failures: rl_constants::MAX_CONSECUTIVE_FAILURES,
            window: Duration::from_secs(rl_constants::WINDOW_SECS),
        }
    }

    /// Provider budget overlaid with user settings
    pub fn from_settings(settings: &RateLimitConfig, provider: &str) -> Self {
        let mut config = Self::for_provider(provider);
        config.strategy = settings.strategy;
        if let Some(rpm) = settings.requests_per_minute {
            config.requests_per_minute = rpm.max(1);
        }
        if let Some(base_ms) = settings.base_delay_ms {
            config.base_delay = Duration::from_millis(base_ms);
        }
        if let Some(max_ms) = settings.max_delay_ms {
            config.max_delay = Duration::from_millis(max_ms);
        }
        config.max_delay = config.max_delay.max(config.base_delay);
        config.multiplier = settings.multiplier.max(1.0);
        config.jitter = Duration::from_millis(settings.jitter_ms);
        config.decay_after = settings.decay_after_successes.max(1);
        config.max_consecutive_failures = settings.max_consecutive_failures.max(1);
        config
    }
}

/// Point-in-time view of limiter state
#[derive(Debug, Clone)]
pub struct RateLimiterStatus {
    pub strategy: RateLimitStrategy,
    pub requests_in_window: usize,
    pub requests_per_minute: u32,
    pub current_delay: Duration,
    pub consecutive_failures: u32,
    pub rate_limited_total: u64,
}

#[derive(Debug)]
struct LimiterState {
    /// Granted slots, oldest first (may lie in the future)
    grants: VecDeque<Instant>,
    /// Adaptive spacing delay, or the current exponential delay
    delay: Duration,
    consecutive_failures: u32,
    consecutive_successes: u32,
    rate_limited_total: u64,
}

/// Thread-safe rate limiter shared by all workers of a phase
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let delay = match config.strategy {
            RateLimitStrategy::Adaptive => Duration::ZERO,
            RateLimitStrategy::Constant | RateLimitStrategy::Exponential => config.base_delay,
        };
        Self {
            config,
            state: Mutex::new(LimiterState {
                grants: VecDeque::new(),
                delay,
                consecutive_failures: 0,
                consecutive_successes: 0,
                rate_limited_total: 0,
            }),
        }
    }

    /// Ask for permission to send one request
    pub fn acquire(&self) -> Permit {
        self.acquire_at(Instant::now())
    }

    /// `acquire` against an explicit clock reading
    pub fn acquire_at(&self, now: Instant) -> Permit {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let wait = match self.config.strategy {
            RateLimitStrategy::Constant | RateLimitStrategy::Exponential => state.delay,
            RateLimitStrategy::Adaptive => {
                let slot = self.next_slot(&mut state, now);
                state.grants.push_back(slot);
                slot.saturating_duration_since(now)
            }
        };

        if wait.is_zero() {
            Permit::Proceed
        } else {
            tracing::debug!(
                strategy = %self.config.strategy,
                wait_ms = wait.as_millis() as u64,
                "Rate limiter: request delayed"
            );
            Permit::Wait(wait)
        }
    }

    /// Earliest slot honoring the window budget and the spacing delay
    fn next_slot(&self, state: &mut LimiterState, now: Instant) -> Instant {
        let window = self.config.window;
        while let Some(&oldest) = state.grants.front() {
            if oldest + window <= now {
                state.grants.pop_front();
            } else {
                break;
            }
        }

        let mut slot = now;
        let budget = self.config.requests_per_minute.max(1) as usize;
        if state.grants.len() >= budget {
            let anchor = state.grants[state.grants.len() - budget];
            slot = slot.max(anchor + window);
        }
        if let Some(&last) = state.grants.back() {
            slot = slot.max(last + state.delay);
        }
        slot
    }

    /// Record a successful request
    pub fn on_success(&self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        state.consecutive_failures = 0;
        state.consecutive_successes += 1;

        if state.consecutive_successes < self.config.decay_after {
            return;
        }
        state.consecutive_successes = 0;

        match self.config.strategy {
            RateLimitStrategy::Constant => {}
            RateLimitStrategy::Exponential => {
                state.delay = self.config.base_delay;
            }
            RateLimitStrategy::Adaptive => {
                if state.delay.is_zero() {
                    return;
                }
                let decayed = state.delay.div_f64(self.config.multiplier);
                state.delay = if decayed < self.min_backoff() {
                    Duration::ZERO
                } else {
                    decayed
                };
                tracing::debug!(
                    delay_ms = state.delay.as_millis() as u64,
                    "Rate limiter: backoff decayed"
                );
            }
        }
    }

    /// Record a failed request
    pub fn on_failure(&self, is_rate_limit_error: bool) {
        self.on_failure_with_hint(is_rate_limit_error, None);
    }

    /// Record a failed request, honoring a server-provided retry hint
    pub fn on_failure_with_hint(&self, is_rate_limit_error: bool, retry_after: Option<Duration>) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        state.consecutive_successes = 0;
        state.consecutive_failures += 1;
        if is_rate_limit_error {
            state.rate_limited_total += 1;
        }

        match self.config.strategy {
            RateLimitStrategy::Constant => {}
            RateLimitStrategy::Exponential => {
                let next = state
                    .delay
                    .max(self.config.base_delay)
                    .max(self.min_backoff())
                    .mul_f64(self.config.multiplier);
                state.delay = next.min(self.config.max_delay);
            }
            RateLimitStrategy::Adaptive => {
                if !is_rate_limit_error {
                    return;
                }
                let inflated = state
                    .delay
                    .mul_f64(self.config.multiplier)
                    .max(self.min_backoff())
                    + self.jitter();
                let hinted = retry_after.map_or(inflated, |hint| inflated.max(hint));
                state.delay = hinted.min(self.config.max_delay);
                tracing::warn!(
                    delay_ms = state.delay.as_millis() as u64,
                    consecutive_failures = state.consecutive_failures,
                    "Rate limited by backend, backing off"
                );
            }
        }
    }

    /// True once consecutive failures reach the configured ceiling
    pub fn is_exhausted(&self) -> bool {
        let state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.consecutive_failures >= self.config.max_consecutive_failures
    }

    pub fn status(&self) -> RateLimiterStatus {
        let state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        RateLimiterStatus {
            strategy: self.config.strategy,
            requests_in_window: state
                .grants
                .iter()
                .filter(|&&g| g + self.config.window > now)
                .count(),
            requests_per_minute: self.config.requests_per_minute,
            current_delay: state.delay,
            consecutive_failures: state.consecutive_failures,
            rate_limited_total: state.rate_limited_total,
        }
    }

    fn min_backoff(&self) -> Duration {
        self.config.base_delay.max(MIN_BACKOFF)
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.config.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}
