//! Batch Scheduler
//!
//! Drives the remaining items of a resumable phase through the rate limiter
//! and a bounded worker pool:
//!
//! ```text
//! remaining items ─► batches of N ─► buffer_unordered(concurrency)
//!                                        │ acquire ─► wait ─► process_one
//!                                        ▼
//!                               single writer: record, checkpoint
//! ```
//!
//! Items already present in `PhaseState::results` are never re-run. Failed
//! items are retried on the next run of the phase.

use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::phase::AnalysisPhase;
use super::progress::ProgressTracker;
use super::types::{FailedItem, PhaseProgress};
use crate::ai::rate_limiter::RateLimiter;
use crate::config::Config;
use crate::constants::{checkpoint, scheduler};
use crate::types::{ItemError, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Floor for the time-based checkpoint interval
const MIN_CHECKPOINT_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub batch_size: usize,
    /// When off, all items form one group with no inter-batch delay
    pub batching: bool,
    pub batch_delay: Duration,
    pub concurrency: usize,
    pub max_item_retries: u32,
    pub max_failure_ratio: f64,
    pub max_failed_items: Option<usize>,
    pub checkpoint_every_items: usize,
    pub checkpoint_every: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: scheduler::BATCH_SIZE,
            batching: true,
            batch_delay: Duration::from_millis(scheduler::BATCH_DELAY_MS),
            concurrency: scheduler::CONCURRENCY,
            max_item_retries: scheduler::MAX_ITEM_RETRIES,
            max_failure_ratio: scheduler::MAX_FAILURE_RATIO,
            max_failed_items: None,
            checkpoint_every_items: checkpoint::EVERY_ITEMS,
            checkpoint_every: Duration::from_secs(checkpoint::EVERY_SECS),
        }
    }
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            batch_size: config.batching.batch_size.max(1),
            batching: config.batching.enabled,
            batch_delay: Duration::from_millis(config.batching.delay_between_batches_ms),
            concurrency: config.batching.concurrency.max(1),
            max_item_retries: config.batching.max_item_retries,
            max_failure_ratio: config.failure.max_failure_ratio,
            max_failed_items: config.failure.max_failed_items,
            checkpoint_every_items: config.session.checkpoint_every_items.max(1),
            checkpoint_every: Duration::from_secs(config.session.checkpoint_every_secs),
        }
    }
}

// =============================================================================
// Batches
// =============================================================================

/// One group of items and the pause that follows it
#[derive(Debug, Clone, PartialEq)]
pub struct BatchDescriptor {
    pub index: usize,
    pub items: Vec<String>,
    pub delay_after: Duration,
}

impl BatchDescriptor {
    /// Split `remaining` into groups; the last group has no trailing delay
    pub fn plan(remaining: Vec<String>, config: &SchedulerConfig) -> Vec<Self> {
        if remaining.is_empty() {
            return Vec::new();
        }
        if !config.batching {
            return vec![Self {
                index: 0,
                items: remaining,
                delay_after: Duration::ZERO,
            }];
        }

        let size = config.batch_size.max(1);
        let count = remaining.len().div_ceil(size);
        let mut items = remaining.into_iter();
        (0..count)
            .map(|index| Self {
                index,
                items: items.by_ref().take(size).collect(),
                delay_after: if index + 1 < count {
                    config.batch_delay
                } else {
                    Duration::ZERO
                },
            })
            .collect()
    }
}

// =============================================================================
// State & Outcome
// =============================================================================

/// Mutable state of one resumable phase
///
/// `results` is the authoritative set of completed items; it is persisted
/// as the phase cache before the matching progress counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseState {
    pub progress: PhaseProgress,
    pub results: BTreeMap<String, Value>,
}

impl PhaseState {
    pub fn new(progress: PhaseProgress, results: BTreeMap<String, Value>) -> Self {
        let mut state = Self { progress, results };
        state.sync_counts();
        state
    }

    /// Items not yet completed, in input order, without duplicates
    pub fn remaining(&self, items: &[String]) -> Vec<String> {
        let mut seen = BTreeSet::new();
        items
            .iter()
            .filter(|item| !self.results.contains_key(*item) && seen.insert(item.as_str()))
            .cloned()
            .collect()
    }

    fn record_success(&mut self, item: String, value: Value) {
        self.progress.failed_items.retain(|f| f.item != item);
        self.results.insert(item, value);
        self.sync_counts();
    }

    fn record_failure(&mut self, item: String, reason: String) {
        self.progress.failed_items.retain(|f| f.item != item);
        self.progress.failed_items.push(FailedItem { item, reason });
    }

    fn sync_counts(&mut self) {
        self.progress.completed_count = self.results.len();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PhaseOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// Durable destination for phase progress
pub trait ProgressSink: Send {
    /// Persist `state`; an error aborts the phase
    fn persist(&mut self, state: &PhaseState) -> Result<()>;
}

impl<F> ProgressSink for F
where
    F: FnMut(&PhaseState) -> Result<()> + Send,
{
    fn persist(&mut self, state: &PhaseState) -> Result<()> {
        self(state)
    }
}

// =============================================================================
// Shutdown
// =============================================================================

/// Trigger side of a shutdown signal
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

/// Cloneable, awaitable shutdown signal
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn channel() -> (ShutdownHandle, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownHandle { tx }, Shutdown { rx })
    }

    /// A signal that never fires
    pub fn never() -> Self {
        Self::channel().1
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal fires; never resolves if the handle is dropped
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

// =============================================================================
// Scheduler
// =============================================================================

fn lock(slot: &Mutex<Option<String>>) -> MutexGuard<'_, Option<String>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum ItemOutcome {
    Done(Value),
    Failed(ItemError),
    Exhausted,
}

pub struct BatchScheduler {
    config: SchedulerConfig,
    limiter: Option<Arc<RateLimiter>>,
    shutdown: Shutdown,
    progress: Option<ProgressTracker>,
}

impl BatchScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            limiter: None,
            shutdown: Shutdown::never(),
            progress: None,
        }
    }

    /// Gate every call through `limiter`
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_progress(mut self, progress: ProgressTracker) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Process every item of `items` not already completed in `state`
    ///
    /// Returns `Err` only when `sink` fails; every other failure is folded
    /// into `state` and the outcome.
    pub async fn run_phase<F, Fut>(
        &self,
        phase: AnalysisPhase,
        items: &[String],
        state: &mut PhaseState,
        process_one: F,
        sink: &mut dyn ProgressSink,
    ) -> Result<PhaseOutcome>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = std::result::Result<Value, ItemError>>,
    {
        state.progress.total_count = items.len();
        state.sync_counts();
        let remaining = state.remaining(items);
        let batches = BatchDescriptor::plan(remaining.clone(), &self.config);

        info!(
            phase = %phase,
            total = items.len(),
            completed = state.progress.completed_count,
            remaining = remaining.len(),
            batches = batches.len(),
            "Scheduling phase items"
        );

        let mut shutdown = self.shutdown.clone();
        let mut unsaved = 0usize;
        let every = self.config.checkpoint_every.max(MIN_CHECKPOINT_INTERVAL);
        let mut ticker = time::interval_at(time::Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let in_flight = Mutex::new(None::<String>);

        for batch in batches {
            if shutdown.is_triggered() {
                return self.cancel(phase, state, sink);
            }
            debug!(phase = %phase, batch = batch.index, size = batch.items.len(), "Starting batch");

            let process_one = &process_one;
            let in_flight = &in_flight;
            let mut results = stream::iter(batch.items)
                .map(|item| {
                    *lock(in_flight) = Some(item.clone());
                    async move {
                        let outcome = self.process_with_retry(&item, process_one).await;
                        (item, outcome)
                    }
                })
                .buffer_unordered(self.config.concurrency.max(1));

            loop {
                let next = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => None,
                    _ = ticker.tick() => {
                        if unsaved > 0 {
                            state.progress.current_item = lock(in_flight).clone();
                            sink.persist(state)?;
                            unsaved = 0;
                        }
                        continue;
                    }
                    next = results.next() => Some(next),
                };
                let Some(next) = next else {
                    drop(results);
                    return self.cancel(phase, state, sink);
                };
                let Some((item, outcome)) = next else {
                    break;
                };

                {
                    let mut slot = lock(in_flight);
                    if slot.as_deref() == Some(item.as_str()) {
                        *slot = None;
                    }
                    state.progress.current_item = slot.clone();
                }

                let label = item.clone();
                match outcome {
                    ItemOutcome::Done(value) => state.record_success(item, value),
                    ItemOutcome::Failed(err) => {
                        warn!(phase = %phase, item = %item, error = %err, "Item failed");
                        state.record_failure(item, err.message);
                        let failed = state.progress.failed_count();
                        if let Some(max) = self.config.max_failed_items
                            && failed > max
                        {
                            drop(results);
                            let reason = format!("{} items failed (limit {})", failed, max);
                            return self.finish_failed(state, sink, reason);
                        }
                    }
                    ItemOutcome::Exhausted => {
                        drop(results);
                        return self.finish_failed(
                            state,
                            sink,
                            "rate limiter exhausted after repeated consecutive failures".to_string(),
                        );
                    }
                }
                self.report(state, &label);

                unsaved += 1;
                if unsaved >= self.config.checkpoint_every_items {
                    sink.persist(state)?;
                    unsaved = 0;
                    ticker.reset();
                }
            }

            if !batch.delay_after.is_zero() {
                let pause = time::sleep(batch.delay_after);
                tokio::pin!(pause);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return self.cancel(phase, state, sink),
                        _ = ticker.tick() => {
                            if unsaved > 0 {
                                sink.persist(state)?;
                                unsaved = 0;
                            }
                        }
                        _ = &mut pause => break,
                    }
                }
            }
        }

        state.progress.current_item = None;
        let failed = state.progress.failed_count();
        let total = state.progress.total_count;
        if total > 0 && failed as f64 / total as f64 > self.config.max_failure_ratio {
            return self.finish_failed(
                state,
                sink,
                format!(
                    "{} of {} items failed (max ratio {})",
                    failed, total, self.config.max_failure_ratio
                ),
            );
        }

        sink.persist(state)?;
        info!(
            phase = %phase,
            completed = state.progress.completed_count,
            failed,
            "Phase items processed"
        );
        Ok(PhaseOutcome::Completed)
    }

    async fn process_with_retry<F, Fut>(&self, item: &str, process_one: &F) -> ItemOutcome
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = std::result::Result<Value, ItemError>>,
    {
        let mut attempt = 0u32;
        loop {
            if let Some(limiter) = &self.limiter {
                if limiter.is_exhausted() {
                    return ItemOutcome::Exhausted;
                }
                let delay = limiter.acquire().delay();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }

            match process_one(item.to_string()).await {
                Ok(value) => {
                    if let Some(limiter) = &self.limiter {
                        limiter.on_success();
                    }
                    return ItemOutcome::Done(value);
                }
                Err(err) => {
                    // Permanent errors are about the item, not the backend
                    if let Some(limiter) = &self.limiter
                        && err.is_retryable()
                    {
                        limiter.on_failure_with_hint(err.is_rate_limit(), err.retry_after());
                    }
                    if err.is_retryable() && attempt < self.config.max_item_retries {
                        attempt += 1;
                        debug!(item, attempt, error = %err, "Retrying item");
                        continue;
                    }
                    return ItemOutcome::Failed(err);
                }
            }
        }
    }

    fn report(&self, state: &PhaseState, item: &str) {
        if let Some(progress) = &self.progress {
            progress.update_progress(
                state.progress.completed_count,
                state.progress.failed_count(),
                item,
            );
        }
    }

    fn finish_failed(
        &self,
        state: &mut PhaseState,
        sink: &mut dyn ProgressSink,
        reason: String,
    ) -> Result<PhaseOutcome> {
        state.progress.current_item = None;
        sink.persist(state)?;
        Ok(PhaseOutcome::Failed(reason))
    }

    /// Flush durable progress; in-flight items are not counted
    fn cancel(
        &self,
        phase: AnalysisPhase,
        state: &mut PhaseState,
        sink: &mut dyn ProgressSink,
    ) -> Result<PhaseOutcome> {
        warn!(
            phase = %phase,
            completed = state.progress.completed_count,
            "Cancelled, saving progress"
        );
        if let Err(e) = sink.persist(state) {
            warn!(error = %e, "Failed to save progress on cancel");
        }
        Ok(PhaseOutcome::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::rate_limiter::RateLimiterConfig;
    use crate::config::RateLimitStrategy;
    use crate::types::RulectlError;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn items(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("item-{:03}", i)).collect()
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            batch_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Records every persisted snapshot
    #[derive(Default, Clone)]
    struct Recorder {
        snapshots: Arc<Mutex<Vec<(usize, usize)>>>,
    }

    impl ProgressSink for Recorder {
        fn persist(&mut self, state: &PhaseState) -> Result<()> {
            self.snapshots
                .lock()
                .unwrap()
                .push((state.progress.completed_count, state.progress.failed_count()));
            Ok(())
        }
    }

    #[test]
    fn test_plan_batches() {
        let config = SchedulerConfig {
            batch_size: 3,
            batch_delay: Duration::from_millis(5),
            ..Default::default()
        };
        let batches = BatchDescriptor::plan(items(7), &config);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].items.len(), 3);
        assert_eq!(batches[2].items, vec!["item-006"]);
        assert_eq!(batches[0].delay_after, Duration::from_millis(5));
        assert_eq!(batches[2].delay_after, Duration::ZERO);

        let single = BatchDescriptor::plan(
            items(7),
            &SchedulerConfig {
                batching: false,
                ..config
            },
        );
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].items.len(), 7);
        assert!(BatchDescriptor::plan(Vec::new(), &SchedulerConfig::default()).is_empty());
    }

    #[tokio::test]
    async fn test_failures_below_ratio_complete() {
        let scheduler = BatchScheduler::new(fast_config());
        let mut state = PhaseState::default();
        let mut sink = Recorder::default();

        let outcome = scheduler
            .run_phase(
                AnalysisPhase::FileAnalysis,
                &items(10),
                &mut state,
                |item: String| async move {
                    if item.ends_with('3') || item.ends_with('7') {
                        Err(ItemError::permanent("unparseable"))
                    } else {
                        Ok(json!({"file": item}))
                    }
                },
                &mut sink,
            )
            .await
            .unwrap();

        assert_eq!(outcome, PhaseOutcome::Completed);
        assert_eq!(state.progress.completed_count, 8);
        assert_eq!(state.progress.failed_count(), 2);
        assert_eq!(state.progress.total_count, 10);
        assert_eq!(sink.snapshots.lock().unwrap().last(), Some(&(8, 2)));
    }

    #[tokio::test]
    async fn test_failures_above_ratio_fail() {
        let scheduler = BatchScheduler::new(fast_config());
        let mut state = PhaseState::default();
        let mut sink = Recorder::default();

        let outcome = scheduler
            .run_phase(
                AnalysisPhase::FileAnalysis,
                &items(10),
                &mut state,
                |item: String| async move {
                    let n: usize = item[5..].parse().unwrap();
                    if n < 6 {
                        Err(ItemError::permanent("bad"))
                    } else {
                        Ok(json!(n))
                    }
                },
                &mut sink,
            )
            .await
            .unwrap();

        assert!(matches!(outcome, PhaseOutcome::Failed(_)));
        assert_eq!(state.progress.failed_count(), 6);
        assert_eq!(state.progress.completed_count, 4);
    }

    #[tokio::test]
    async fn test_max_failed_items_checked_eagerly() {
        let config = SchedulerConfig {
            concurrency: 1,
            max_failed_items: Some(2),
            ..fast_config()
        };
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut state = PhaseState::default();

        let outcome = BatchScheduler::new(config)
            .run_phase(
                AnalysisPhase::GitAnalysis,
                &items(10),
                &mut state,
                move |_item: String| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(ItemError::permanent("nope")) }
                },
                &mut Recorder::default(),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, PhaseOutcome::Failed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_transient_errors_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut state = PhaseState::default();

        let outcome = BatchScheduler::new(fast_config())
            .run_phase(
                AnalysisPhase::FileAnalysis,
                &items(1),
                &mut state,
                move |_item: String| {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 2 {
                            Err(ItemError::rate_limited("429", None))
                        } else {
                            Ok(json!("ok"))
                        }
                    }
                },
                &mut Recorder::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, PhaseOutcome::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(state.progress.failed_items.is_empty());
    }

    #[tokio::test]
    async fn test_resume_processes_only_remaining() {
        let all = items(150);
        let mut results = BTreeMap::new();
        for item in &all[..45] {
            results.insert(item.clone(), json!(true));
        }
        let progress = PhaseProgress {
            completed_count: 45,
            total_count: 150,
            failed_items: vec![
                FailedItem {
                    item: all[45].clone(),
                    reason: "timeout".into(),
                },
                FailedItem {
                    item: all[46].clone(),
                    reason: "timeout".into(),
                },
            ],
            current_item: Some(all[47].clone()),
        };
        let mut state = PhaseState::new(progress, results);
        assert_eq!(state.remaining(&all).len(), 105);

        let processed = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&processed);
        let mut sink = Recorder::default();
        let config = SchedulerConfig {
            batch_size: 10,
            concurrency: 4,
            ..fast_config()
        };

        let outcome = BatchScheduler::new(config)
            .run_phase(
                AnalysisPhase::FileAnalysis,
                &all,
                &mut state,
                move |item: String| {
                    seen.lock().unwrap().push(item.clone());
                    async move { Ok(json!(item)) }
                },
                &mut sink,
            )
            .await
            .unwrap();

        assert_eq!(outcome, PhaseOutcome::Completed);
        let processed = processed.lock().unwrap();
        assert_eq!(processed.len(), 105);
        assert!(!processed.contains(&all[0]));
        assert!(processed.contains(&all[45]));
        assert_eq!(state.progress.completed_count, 150);
        assert!(state.progress.failed_items.is_empty());

        let snapshots = sink.snapshots.lock().unwrap();
        assert!(snapshots.len() >= 10);
        assert!(snapshots.windows(2).all(|w| w[0].0 <= w[1].0));
        assert!(snapshots[0].0 >= 45);
    }

    #[tokio::test]
    async fn test_cancel_flushes_progress() {
        let (handle, shutdown) = Shutdown::channel();
        let handle = Arc::new(handle);
        let trigger = Arc::clone(&handle);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut state = PhaseState::default();
        let mut sink = Recorder::default();
        let config = SchedulerConfig {
            batch_size: 100,
            concurrency: 1,
            ..fast_config()
        };

        let outcome = BatchScheduler::new(config)
            .with_shutdown(shutdown)
            .run_phase(
                AnalysisPhase::FileAnalysis,
                &items(20),
                &mut state,
                move |item: String| {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    let trigger = Arc::clone(&trigger);
                    async move {
                        if n >= 5 {
                            trigger.trigger();
                            tokio::time::sleep(Duration::from_secs(3600)).await;
                        }
                        Ok(json!(item))
                    }
                },
                &mut sink,
            )
            .await
            .unwrap();

        assert_eq!(outcome, PhaseOutcome::Cancelled);
        assert_eq!(state.progress.completed_count, 5);
        assert_eq!(sink.snapshots.lock().unwrap().last(), Some(&(5, 0)));
        drop(handle);
    }

    #[tokio::test]
    async fn test_limiter_exhaustion_fails_phase() {
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
            strategy: RateLimitStrategy::Constant,
            base_delay: Duration::ZERO,
            max_consecutive_failures: 3,
            ..RateLimiterConfig::default()
        }));
        let mut state = PhaseState::default();

        let outcome = BatchScheduler::new(SchedulerConfig {
            concurrency: 1,
            ..fast_config()
        })
        .with_limiter(limiter)
        .run_phase(
            AnalysisPhase::FileAnalysis,
            &items(5),
            &mut state,
            |_item: String| async { Err(ItemError::transient("connection reset")) },
            &mut Recorder::default(),
        )
        .await
        .unwrap();

        match outcome {
            PhaseOutcome::Failed(reason) => assert!(reason.contains("exhausted")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_permanent_failures_do_not_exhaust_limiter() {
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
            strategy: RateLimitStrategy::Constant,
            base_delay: Duration::ZERO,
            ..RateLimiterConfig::default()
        }));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut state = PhaseState::default();

        let outcome = BatchScheduler::new(SchedulerConfig {
            concurrency: 1,
            ..fast_config()
        })
        .with_limiter(Arc::clone(&limiter))
        .run_phase(
            AnalysisPhase::FileAnalysis,
            &items(100),
            &mut state,
            move |item: String| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    let n: usize = item[5..].parse().unwrap();
                    if (10..15).contains(&n) {
                        Err(ItemError::permanent("unparseable"))
                    } else {
                        Ok(json!(n))
                    }
                }
            },
            &mut Recorder::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, PhaseOutcome::Completed);
        assert_eq!(state.progress.completed_count, 95);
        assert_eq!(state.progress.failed_count(), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 100);
        assert_eq!(limiter.status().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_time_checkpoint_while_item_in_flight() {
        let config = SchedulerConfig {
            batching: false,
            concurrency: 2,
            checkpoint_every_items: 10,
            checkpoint_every: Duration::from_millis(50),
            ..fast_config()
        };
        let items = vec!["a".to_string(), "b".to_string()];
        let mut state = PhaseState::default();
        let mut sink = Recorder::default();
        let view = sink.clone();

        let scheduler = BatchScheduler::new(config);
        let run = scheduler.run_phase(
            AnalysisPhase::FileAnalysis,
            &items,
            &mut state,
            |item: String| async move {
                if item == "b" {
                    tokio::time::sleep(Duration::from_millis(600)).await;
                }
                Ok(json!(item))
            },
            &mut sink,
        );
        let observe = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            view.snapshots.lock().unwrap().clone()
        };
        let (outcome, early) = tokio::join!(run, observe);

        assert_eq!(outcome.unwrap(), PhaseOutcome::Completed);
        assert_eq!(early.last(), Some(&(1, 0)));
        assert_eq!(sink.snapshots.lock().unwrap().last(), Some(&(2, 0)));
    }

    #[tokio::test]
    async fn test_current_item_tracks_dispatched_item() {
        let config = SchedulerConfig {
            batching: false,
            concurrency: 2,
            checkpoint_every_items: 1,
            ..fast_config()
        };
        let items = vec!["a".to_string(), "b".to_string()];
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let mut sink = move |state: &PhaseState| -> Result<()> {
            log.lock().unwrap().push((
                state.progress.completed_count,
                state.progress.current_item.clone(),
            ));
            Ok(())
        };

        let outcome = BatchScheduler::new(config)
            .run_phase(
                AnalysisPhase::FileAnalysis,
                &items,
                &mut PhaseState::default(),
                |item: String| async move {
                    if item == "b" {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                    Ok(json!(item))
                },
                &mut sink,
            )
            .await
            .unwrap();

        assert_eq!(outcome, PhaseOutcome::Completed);
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (1, Some("b".to_string())));
        assert_eq!(seen.last(), Some(&(2, None)));
    }

    #[tokio::test]
    async fn test_sink_error_is_fatal() {
        let config = SchedulerConfig {
            checkpoint_every_items: 1,
            ..fast_config()
        };
        let mut failing = |_: &PhaseState| -> Result<()> {
            Err(RulectlError::durability("/tmp/progress.json", "disk full"))
        };
        let result = BatchScheduler::new(config)
            .run_phase(
                AnalysisPhase::FileAnalysis,
                &items(3),
                &mut PhaseState::default(),
                |item: String| async move { Ok(json!(item)) },
                &mut failing,
            )
            .await;
        assert!(matches!(result, Err(RulectlError::StateDurability { .. })));
    }
}
