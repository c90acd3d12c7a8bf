//! Resume Coordinator
//!
//! Decides whether a saved session can be continued, applies the resume
//! policy, then drives the phases in order until SaveComplete.
//!
//! ```text
//! detect ─► NoPriorSession ─────────────────────────► fresh Session
//!        ─► ResumableAt ──► confirm / --resume ─────► saved Session
//!                       └─► decline ────────────────► clear, fresh
//!                       └─► non-interactive ────────► ResumeRequired
//!        ─► UnresumableCorrupt(restart_phase) ──────► reset phase, keep Session
//!        ─► UnresumableCorrupt(None) ───────────────► clear, fresh
//! ```

use serde_json::json;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::phase::{AnalysisPhase, CacheIssue, PhaseStateMachine, PhaseStatus};
use super::progress::MessageLevel;
use super::scheduler::PhaseOutcome;
use super::stages::{PhaseRunner, SaveSummary};
use super::store::CheckpointStore;
use super::types::{Loaded, ProgressSummary, RunOptions, Session};
use crate::ai::UsageSummary;
use crate::types::{Result, RulectlError, SessionId};

// =============================================================================
// Decisions
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ResumeDecision {
    NoPriorSession,
    ResumableAt {
        phase: AnalysisPhase,
        summary: ProgressSummary,
    },
    UnresumableCorrupt {
        reasons: Vec<String>,
        /// Phase to restart while keeping the session, if only its own cache is bad
        restart_phase: Option<AnalysisPhase>,
    },
}

/// How a resumable session is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumeMode {
    /// Ask when interactive, refuse otherwise
    #[default]
    Prompt,
    /// Continue without asking
    Auto,
    /// Discard any saved state
    Fresh,
}

/// Interactive confirmation of a resume
pub trait ResumePrompt {
    fn is_interactive(&self) -> bool;

    fn confirm(&self, summary: &ProgressSummary) -> Result<bool>;
}

/// Prompt for environments without a terminal
pub struct NonInteractive;

impl ResumePrompt for NonInteractive {
    fn is_interactive(&self) -> bool {
        false
    }

    fn confirm(&self, _summary: &ProgressSummary) -> Result<bool> {
        Ok(false)
    }
}

/// Result of a completed run
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub session_id: SessionId,
    pub resumed_from: Option<AnalysisPhase>,
    pub rules_path: PathBuf,
    pub rule_count: usize,
    pub failed_items: usize,
    pub usage: UsageSummary,
    /// Calls the backend rejected with a rate-limit error
    pub rate_limited: u64,
}

// =============================================================================
// Coordinator
// =============================================================================

pub struct ResumeCoordinator<'a> {
    runner: PhaseRunner<'a>,
    options: RunOptions,
}

impl<'a> ResumeCoordinator<'a> {
    pub fn new(runner: PhaseRunner<'a>, options: RunOptions) -> Self {
        Self { runner, options }
    }

    fn store(&self) -> &CheckpointStore {
        self.runner.store()
    }

    /// Inspect saved state without changing it
    pub fn detect(&self) -> Result<ResumeDecision> {
        Ok(self.inspect()?.0)
    }

    fn inspect(&self) -> Result<(ResumeDecision, Option<Session>)> {
        let session = match self.store().load()? {
            Loaded::Missing => return Ok((ResumeDecision::NoPriorSession, None)),
            Loaded::Corrupted(reason) => {
                return Ok((
                    ResumeDecision::UnresumableCorrupt {
                        reasons: vec![reason],
                        restart_phase: None,
                    },
                    None,
                ));
            }
            Loaded::Present(session) => session,
        };
        if session.is_complete() {
            return Ok((ResumeDecision::NoPriorSession, None));
        }

        let record = session.current_record();
        let phase = record.phase;
        if !record.resumable {
            let reasons = vec![format!("{} is not resumable", phase)];
            return Ok((
                ResumeDecision::UnresumableCorrupt {
                    reasons,
                    restart_phase: None,
                },
                Some(session),
            ));
        }

        let mut issues = Vec::new();
        for required in phase.required_caches() {
            if let Some(problem) = self.store().load_cache(&session, required)?.problem() {
                issues.push(CacheIssue {
                    phase: required,
                    problem,
                });
            }
        }

        if PhaseStateMachine::can_resume_from(record, &issues) {
            let summary = session.summary();
            return Ok((ResumeDecision::ResumableAt { phase, summary }, Some(session)));
        }

        let mut reasons: Vec<String> = issues.iter().map(|i| i.to_string()).collect();
        if record.status == PhaseStatus::NotStarted {
            reasons.push(format!("{} was never started", phase));
        }
        let restart_phase = issues.iter().all(|i| i.phase == phase).then_some(phase);
        Ok((
            ResumeDecision::UnresumableCorrupt {
                reasons,
                restart_phase,
            },
            Some(session),
        ))
    }

    /// Apply the resume policy and return the session to run
    pub fn prepare(
        &self,
        mode: ResumeMode,
        prompt: &dyn ResumePrompt,
    ) -> Result<(Session, Option<AnalysisPhase>)> {
        let (decision, saved) = self.inspect()?;
        let progress = self.runner.progress();

        match (decision, saved) {
            (ResumeDecision::NoPriorSession, _) => self.fresh(),
            (_, _) if mode == ResumeMode::Fresh => {
                info!("Discarding saved analysis state");
                self.fresh()
            }
            (ResumeDecision::ResumableAt { phase, summary }, Some(session)) => {
                let resume = match mode {
                    ResumeMode::Auto => true,
                    _ if prompt.is_interactive() => prompt.confirm(&summary)?,
                    _ => {
                        return Err(RulectlError::ResumeRequired {
                            summary: summary.to_string(),
                        });
                    }
                };
                if resume {
                    info!(session = %session.session_id, phase = %phase, "Resuming analysis");
                    Ok((session, Some(phase)))
                } else {
                    info!("Resume declined, starting fresh");
                    self.fresh()
                }
            }
            (
                ResumeDecision::UnresumableCorrupt {
                    reasons,
                    restart_phase: Some(phase),
                },
                Some(mut session),
            ) => {
                for reason in &reasons {
                    warn!(phase = %phase, reason = %reason, "Saved state unusable");
                }
                progress.message(
                    MessageLevel::Warning,
                    format!("Restarting {} from scratch: {}", phase, reasons.join("; ")),
                );
                PhaseStateMachine::reset_from(&mut session, phase);
                for later in &AnalysisPhase::ALL[phase.index()..] {
                    self.store().clear_cache(*later)?;
                }
                self.store().save_session(&session)?;
                Ok((session, Some(phase)))
            }
            (ResumeDecision::UnresumableCorrupt { reasons, .. }, _) => {
                for reason in &reasons {
                    warn!(reason = %reason, "Saved state unusable");
                }
                progress.message(
                    MessageLevel::Warning,
                    format!("Starting fresh: {}", reasons.join("; ")),
                );
                self.fresh()
            }
            (ResumeDecision::ResumableAt { .. }, None) => self.fresh(),
        }
    }

    fn fresh(&self) -> Result<(Session, Option<AnalysisPhase>)> {
        if self.store().has_state() {
            self.store().clear()?;
        }
        let session = Session::new(self.store().repo_root(), self.options.clone());
        info!(session = %session.session_id, "Starting new analysis");
        Ok((session, None))
    }

    /// Apply the resume policy, then drive the chosen session to completion
    pub async fn run(&self, mode: ResumeMode, prompt: &dyn ResumePrompt) -> Result<RunReport> {
        let (session, resumed_from) = self.prepare(mode, prompt)?;
        self.run_prepared(session, resumed_from).await
    }

    /// Drive every remaining phase of a prepared session, then clear saved state
    pub async fn run_prepared(
        &self,
        mut session: Session,
        resumed_from: Option<AnalysisPhase>,
    ) -> Result<RunReport> {
        let store = self.store();
        self.runner.usage().restore(&session.token_usage);

        for phase in AnalysisPhase::ALL {
            let status = session.record(phase).status;
            if status == PhaseStatus::Completed {
                continue;
            }
            if status != PhaseStatus::InProgress {
                PhaseStateMachine::begin(&mut session, phase)?;
                if status == PhaseStatus::NotStarted && phase.is_resumable() {
                    store.save_cache(&session, phase, &json!({}))?;
                }
                store.save_session(&session)?;
            }

            let outcome = match self.runner.run(&mut session, phase).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    if PhaseStateMachine::fail(&mut session, phase, &e.to_string()).is_ok()
                        && let Err(save_err) = store.save_session(&session)
                    {
                        warn!(error = %save_err, "Failed to record phase failure");
                    }
                    return Err(e);
                }
            };

            match outcome {
                PhaseOutcome::Completed => {
                    PhaseStateMachine::complete(&mut session, phase)?;
                    session.token_usage = self.runner.usage().snapshot();
                    store.save_session(&session)?;
                    let limiter = self.runner.limiter().status();
                    debug!(
                        phase = %phase,
                        requests_in_window = limiter.requests_in_window,
                        delay_ms = limiter.current_delay.as_millis() as u64,
                        rate_limited = limiter.rate_limited_total,
                        "Rate limiter status"
                    );
                    self.runner.progress().complete_phase(phase);
                    info!(phase = %phase, "Phase completed");
                }
                PhaseOutcome::Failed(reason) => {
                    PhaseStateMachine::fail(&mut session, phase, &reason)?;
                    store.save_session(&session)?;
                    let progress = &session.record(phase).progress;
                    return Err(RulectlError::PhaseFailed {
                        phase: phase.to_string(),
                        reason,
                        completed: progress.completed_count,
                        failed: progress.failed_count(),
                    });
                }
                PhaseOutcome::Cancelled => {
                    return Err(RulectlError::Interrupted {
                        phase: phase.to_string(),
                    });
                }
            }
        }

        let summary: SaveSummary = match store.load_cache(&session, AnalysisPhase::SaveComplete)? {
            Loaded::Present(value) => serde_json::from_value(value)?,
            other => {
                return Err(RulectlError::Session(format!(
                    "final summary is {}",
                    other.problem().unwrap_or_default()
                )));
            }
        };
        let report = RunReport {
            session_id: session.session_id.clone(),
            resumed_from,
            rules_path: summary.rules_path,
            rule_count: summary.rule_count,
            failed_items: session
                .phases
                .iter()
                .map(|r| r.progress.failed_count())
                .sum(),
            usage: session.token_usage.clone(),
            rate_limited: self.runner.limiter().status().rate_limited_total,
        };
        store.clear()?;
        info!(
            rules = report.rule_count,
            tokens = report.usage.total.total_tokens(),
            path = %report.rules_path.display(),
            "Analysis complete"
        );
        Ok(report)
    }
}
