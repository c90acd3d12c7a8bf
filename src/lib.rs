//! rulectl - Resumable Codebase Rule Extraction
//!
//! Walks a repository through a fixed sequence of analysis phases and
//! distills the coding conventions it finds into a ranked rules report.
//! Long LLM-backed phases are rate limited, processed in bounded batches,
//! and checkpointed after every item so an interrupted run picks up where
//! it stopped.
//!
//! ## Core Features
//!
//! - **Phased Pipeline**: setup, structure, discovery, per-file analysis,
//!   git history, rule synthesis, save
//! - **Checkpoint/Resume**: atomic writes under `.rulectl/` with an
//!   exclusive directory lock
//! - **Rate Limiting**: constant, exponential, or adaptive pacing of
//!   backend calls
//! - **Providers**: Anthropic, OpenAI, and Ollama backends
//!
//! ## Quick Start
//!
//! ```ignore
//! use rulectl::pipeline::{CheckpointStore, PhaseRunner, ResumeCoordinator, ResumeMode};
//!
//! let store = CheckpointStore::open(&repo, Duration::from_secs(5))?;
//! let runner = PhaseRunner::new(&store, collaborators, scheduler_config, limiter);
//! let report = ResumeCoordinator::new(runner, RunOptions::default())
//!     .run(ResumeMode::Auto, &NonInteractive)
//!     .await?;
//! ```
//!
//! ## Modules
//!
//! - [`pipeline`]: phases, scheduler, checkpoint store, resume decisions
//! - [`ai`]: LLM providers, analysis backend, rate limiter
//! - [`analyzer`]: file discovery, structure summary, git history, synthesis
//! - [`config`]: layered configuration

pub mod ai;
pub mod analyzer;
pub mod cli;
pub mod config;
pub mod constants;
pub mod pipeline;
pub mod types;

// =============================================================================
// Core Re-exports
// =============================================================================

pub use config::{Config, ConfigLoader, RateLimitStrategy};

pub use types::error::{ErrorCategory, Result, RulectlError};

// =============================================================================
// Pipeline Re-exports
// =============================================================================

pub use pipeline::{
    AnalysisPhase, CheckpointStore, PhaseRunner, ResumeCoordinator, ResumeDecision, ResumeMode,
    RunReport, Session,
};

// =============================================================================
// AI Re-exports
// =============================================================================

pub use ai::{LlmProvider, LlmResponse, RateLimiter, TimeoutConfig, with_timeout};

// =============================================================================
// Analyzer Re-exports
// =============================================================================

pub use analyzer::{FileScanner, GitCli, StructureAnalyzer};
