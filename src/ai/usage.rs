//! Token Usage Accounting
//!
//! Accumulates provider-reported token counts per phase. Shared by every
//! component that calls the LLM so a run can report what it spent.
//!
//! ```ignore
//! let usage = Arc::new(UsageTracker::new("anthropic", "claude-sonnet-4-20250514"));
//! usage.record("file_analysis", &response.usage);
//! let summary = usage.snapshot();
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::provider::TokenUsage;
use crate::constants::pricing;

/// Calls and tokens attributed to one phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseUsage {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl PhaseUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    fn add(&mut self, usage: &TokenUsage) {
        self.calls += 1;
        self.input_tokens += u64::from(usage.input_tokens);
        self.output_tokens += u64::from(usage.output_tokens);
    }

    fn merge(&mut self, other: &PhaseUsage) {
        self.calls += other.calls;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Point-in-time usage report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseUsage>,
    #[serde(default)]
    pub total: PhaseUsage,
    /// None when the model has no known price
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost_usd: Option<f64>,
}

impl UsageSummary {
    pub fn is_empty(&self) -> bool {
        self.total.calls == 0
    }
}

/// Thread-safe per-phase token accumulator
#[derive(Debug)]
pub struct UsageTracker {
    provider: String,
    model: String,
    phases: Mutex<BTreeMap<String, PhaseUsage>>,
}

/// Tracker shared by the analysis backend and the synthesizer
pub type SharedUsage = Arc<UsageTracker>;

impl UsageTracker {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            phases: Mutex::new(BTreeMap::new()),
        }
    }

    fn phases(&self) -> MutexGuard<'_, BTreeMap<String, PhaseUsage>> {
        self.phases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attribute one completed call to `phase`
    pub fn record(&self, phase: &str, usage: &TokenUsage) {
        self.phases().entry(phase.to_string()).or_default().add(usage);
    }

    /// Replace the counters with a saved summary
    pub fn restore(&self, summary: &UsageSummary) {
        *self.phases() = summary.phases.clone();
    }

    pub fn snapshot(&self) -> UsageSummary {
        let phases = self.phases().clone();
        let mut total = PhaseUsage::default();
        for usage in phases.values() {
            total.merge(usage);
        }
        UsageSummary {
            estimated_cost_usd: estimate_cost(&self.provider, &self.model, &total),
            phases,
            total,
        }
    }
}

/// List-price estimate; local providers cost nothing
pub fn estimate_cost(provider: &str, model: &str, usage: &PhaseUsage) -> Option<f64> {
    if provider.eq_ignore_ascii_case("ollama") {
        return Some(0.0);
    }
    let model = model.to_lowercase();
    let (_, input, output) = pricing::MODELS
        .iter()
        .find(|(prefix, _, _)| model.starts_with(prefix))?;
    Some(
        usage.input_tokens as f64 / 1_000_000.0 * input
            + usage.output_tokens as f64 / 1_000_000.0 * output,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_accumulates_per_phase() {
        let tracker = UsageTracker::new("anthropic", "claude-sonnet-4-20250514");
        tracker.record("file_analysis", &TokenUsage::new(1_000, 200));
        tracker.record("file_analysis", &TokenUsage::new(500, 100));
        tracker.record("rule_synthesis", &TokenUsage::new(2_000, 400));

        let summary = tracker.snapshot();
        assert_eq!(
            summary.phases["file_analysis"],
            PhaseUsage {
                calls: 2,
                input_tokens: 1_500,
                output_tokens: 300,
            }
        );
        assert_eq!(summary.total.calls, 3);
        assert_eq!(summary.total.total_tokens(), 4_200);

        // 3500 in at $3/M plus 700 out at $15/M
        let cost = summary.estimated_cost_usd.unwrap();
        assert!((cost - 0.021).abs() < 1e-9);
    }

    #[test]
    fn test_concurrent_recording() {
        let tracker = Arc::new(UsageTracker::new("openai", "gpt-4o-mini"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let t = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        t.record("file_analysis", &TokenUsage::new(10, 5));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let summary = tracker.snapshot();
        assert_eq!(summary.total.calls, 800);
        assert_eq!(summary.total.input_tokens, 8_000);
        assert_eq!(summary.total.output_tokens, 4_000);
    }

    #[test]
    fn test_restore_continues_saved_counts() {
        let first = UsageTracker::new("anthropic", "claude-3-haiku-20240307");
        first.record("file_analysis", &TokenUsage::new(100, 10));
        let saved = first.snapshot();

        let resumed = UsageTracker::new("anthropic", "claude-3-haiku-20240307");
        resumed.restore(&saved);
        resumed.record("file_analysis", &TokenUsage::new(100, 10));
        assert_eq!(resumed.snapshot().phases["file_analysis"].calls, 2);
    }

    #[test]
    fn test_cost_estimates() {
        let usage = PhaseUsage {
            calls: 1,
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
        };
        assert_eq!(estimate_cost("ollama", "llama3.2", &usage), Some(0.0));
        assert_eq!(estimate_cost("openai", "gpt-4o-mini-2024-07-18", &usage), Some(0.75));
        assert_eq!(estimate_cost("openai", "gpt-4o", &usage), Some(12.5));
        assert_eq!(estimate_cost("anthropic", "some-future-model", &usage), None);
        assert!(UsageTracker::new("openai", "gpt-4o").snapshot().is_empty());
    }
}
