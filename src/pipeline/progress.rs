//! Progress Events
//!
//! Broadcast of phase and item progress. The pipeline emits events whether
//! or not anything listens; the CLI subscribes to render them.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use super::phase::AnalysisPhase;

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    PhaseStarted {
        phase: AnalysisPhase,
        total_items: usize,
        /// Items already completed by an earlier run
        resumed_at: usize,
    },
    ItemProgress {
        phase: AnalysisPhase,
        completed: usize,
        failed: usize,
        total: usize,
        current_item: String,
    },
    PhaseCompleted {
        phase: AnalysisPhase,
        elapsed: Duration,
    },
    Message {
        level: MessageLevel,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct ProgressState {
    pub phase: Option<AnalysisPhase>,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
    pub current_item: String,
    /// Items per second in the current phase
    pub throughput: f32,
}

/// Cloneable handle for emitting progress
#[derive(Clone)]
pub struct ProgressTracker {
    state: Arc<RwLock<ProgressState>>,
    sender: broadcast::Sender<ProgressEvent>,
    phase_start: Arc<RwLock<Option<(Instant, usize)>>>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            state: Arc::new(RwLock::new(ProgressState::default())),
            sender,
            phase_start: Arc::new(RwLock::new(None)),
        }
    }

    /// Send an event; dropped when no renderer is attached
    #[inline]
    fn emit(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    pub fn state(&self) -> ProgressState {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn start_phase(&self, phase: AnalysisPhase, total_items: usize, resumed_at: usize) {
        *self
            .phase_start
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some((Instant::now(), resumed_at));
        *self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = ProgressState {
            phase: Some(phase),
            completed: resumed_at,
            total: total_items,
            ..Default::default()
        };
        self.emit(ProgressEvent::PhaseStarted {
            phase,
            total_items,
            resumed_at,
        });
    }

    pub fn update_progress(&self, completed: usize, failed: usize, current_item: &str) {
        let throughput = self
            .phase_start
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .map(|(start, base)| {
                completed.saturating_sub(base) as f32 / start.elapsed().as_secs_f32().max(0.1)
            })
            .unwrap_or(0.0);

        let (phase, total) = {
            let mut state = self
                .state
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state.completed = completed;
            state.failed = failed;
            state.current_item = current_item.to_string();
            state.throughput = throughput;
            (state.phase, state.total)
        };

        if let Some(phase) = phase {
            self.emit(ProgressEvent::ItemProgress {
                phase,
                completed,
                failed,
                total,
                current_item: current_item.to_string(),
            });
        }
    }

    pub fn complete_phase(&self, phase: AnalysisPhase) {
        let elapsed = self
            .phase_start
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .map(|(start, _)| start.elapsed())
            .unwrap_or_default();
        self.emit(ProgressEvent::PhaseCompleted { phase, elapsed });
    }

    pub fn message(&self, level: MessageLevel, message: impl Into<String>) {
        self.emit(ProgressEvent::Message {
            level,
            message: message.into(),
        });
    }
}
