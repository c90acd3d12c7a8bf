//! Resumable Analysis Pipeline
//!
//! Runs the analysis phases in order, persisting progress so an interrupted
//! run can continue where it stopped:
//!
//! ```text
//! Setup → StructureAnalysis → FileDiscovery → FileAnalysis* → GitAnalysis*
//!       → RuleSynthesis* → SaveComplete*            (* resumable)
//! ```
//!
//! - [`phase`]: phase order and legal transitions
//! - [`store`]: atomic, locked persistence under `.rulectl/`
//! - [`scheduler`]: rate-limited batches over a bounded worker pool
//! - [`coordinator`]: resume detection and the phase loop
//! - [`stages`]: the work done inside each phase

pub mod coordinator;
pub mod phase;
pub mod progress;
pub mod scheduler;
pub mod stages;
pub mod store;
pub mod types;

pub use coordinator::{
    NonInteractive, ResumeCoordinator, ResumeDecision, ResumeMode, ResumePrompt, RunReport,
};
pub use phase::{AnalysisPhase, CacheIssue, PhaseStateMachine, PhaseStatus};
pub use progress::{MessageLevel, ProgressEvent, ProgressTracker};
pub use scheduler::{
    BatchDescriptor, BatchScheduler, PhaseOutcome, PhaseState, ProgressSink, SchedulerConfig,
    Shutdown, ShutdownHandle,
};
pub use stages::{Collaborators, PhaseRunner, RulesReport};
pub use store::CheckpointStore;
pub use types::{
    CacheEntry, FailedItem, Loaded, PhaseProgress, PhaseRecord, ProgressSummary, RunOptions,
    Session,
};
