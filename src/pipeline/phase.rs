//! Phase State Machine
//!
//! Ordered pipeline phases, which of them can be resumed, and the legal
//! transitions between phase statuses.
//!
//! ```text
//! Setup → StructureAnalysis → FileDiscovery → FileAnalysis → GitAnalysis
//!       → RuleSynthesis → SaveComplete → (terminal)
//! ```
//!
//! The first three phases are cheap and always restart. The last four keep
//! per-item progress and resume where they stopped.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::types::{PhaseRecord, Session};
use crate::types::{Result, RulectlError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisPhase {
    Setup,
    StructureAnalysis,
    FileDiscovery,
    FileAnalysis,
    GitAnalysis,
    RuleSynthesis,
    SaveComplete,
}

impl AnalysisPhase {
    pub const ALL: [AnalysisPhase; 7] = [
        Self::Setup,
        Self::StructureAnalysis,
        Self::FileDiscovery,
        Self::FileAnalysis,
        Self::GitAnalysis,
        Self::RuleSynthesis,
        Self::SaveComplete,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::StructureAnalysis => "structure_analysis",
            Self::FileDiscovery => "file_discovery",
            Self::FileAnalysis => "file_analysis",
            Self::GitAnalysis => "git_analysis",
            Self::RuleSynthesis => "rule_synthesis",
            Self::SaveComplete => "save_complete",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::Setup => "API key validation and repository setup",
            Self::StructureAnalysis => "Repository structure analysis",
            Self::FileDiscovery => "File discovery and AI review",
            Self::FileAnalysis => "Individual file analysis",
            Self::GitAnalysis => "Git history and file importance analysis",
            Self::RuleSynthesis => "Rule generation and clustering",
            Self::SaveComplete => "Saving results and cleanup",
        }
    }

    pub fn next(&self) -> Option<Self> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Self::FileAnalysis | Self::GitAnalysis | Self::RuleSynthesis | Self::SaveComplete
        )
    }

    /// Cache file stem, for phases that write intermediate output
    pub fn cache_key(&self) -> Option<&'static str> {
        match self {
            Self::Setup => None,
            Self::StructureAnalysis => Some("structure"),
            other => Some(other.as_str()),
        }
    }

    /// Cache-bearing phases up to and including this one
    pub fn required_caches(&self) -> Vec<Self> {
        Self::ALL[..=self.index()]
            .iter()
            .copied()
            .filter(|p| p.cache_key().is_some())
            .collect()
    }
}

impl fmt::Display for AnalysisPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AnalysisPhase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s || p.cache_key() == Some(s))
            .ok_or_else(|| format!("Unknown phase: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotStarted => "not started",
            Self::InProgress => "in progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

/// A cache that failed validation while checking resume eligibility
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheIssue {
    pub phase: AnalysisPhase,
    pub problem: String,
}

impl fmt::Display for CacheIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cache/{}.json {}",
            self.phase.cache_key().unwrap_or(self.phase.as_str()),
            self.problem
        )
    }
}

// =============================================================================
// Transitions
// =============================================================================

/// Transition rules applied to a Session's phase records
pub struct PhaseStateMachine;

impl PhaseStateMachine {
    pub fn next_phase(current: AnalysisPhase) -> Option<AnalysisPhase> {
        current.next()
    }

    pub fn is_resumable(phase: AnalysisPhase) -> bool {
        phase.is_resumable()
    }

    /// A record can be resumed when it stopped mid-way, keeps item progress,
    /// and none of the caches it depends on failed validation.
    pub fn can_resume_from(record: &PhaseRecord, issues: &[CacheIssue]) -> bool {
        let stopped = matches!(record.status, PhaseStatus::InProgress | PhaseStatus::Failed);
        let required = record.phase.required_caches();
        stopped
            && record.resumable
            && !issues.iter().any(|issue| required.contains(&issue.phase))
    }

    /// Enter `phase`, or re-enter it on resume
    pub fn begin(session: &mut Session, phase: AnalysisPhase) -> Result<()> {
        if let Some(earlier) = AnalysisPhase::ALL[..phase.index()]
            .iter()
            .find(|p| session.record(**p).status != PhaseStatus::Completed)
        {
            return Err(RulectlError::Session(format!(
                "cannot start {}: {} is not completed",
                phase, earlier
            )));
        }
        if let Some(other) = session
            .phases
            .iter()
            .find(|r| r.phase != phase && r.status == PhaseStatus::InProgress)
        {
            return Err(RulectlError::Session(format!(
                "cannot start {}: {} is in progress",
                phase, other.phase
            )));
        }

        let record = session.record_mut(phase);
        if record.status == PhaseStatus::Completed {
            return Err(RulectlError::Session(format!(
                "cannot start {}: already completed",
                phase
            )));
        }
        record.status = PhaseStatus::InProgress;
        record.error = None;
        record.completed_at = None;
        record.started_at.get_or_insert_with(Utc::now);
        session.current_phase = phase;
        session.touch();
        Ok(())
    }

    /// Mark `phase` completed and position the session at the next phase
    pub fn complete(session: &mut Session, phase: AnalysisPhase) -> Result<()> {
        let record = session.record_mut(phase);
        if record.status != PhaseStatus::InProgress {
            return Err(RulectlError::Session(format!(
                "cannot complete {}: status is {}",
                phase, record.status
            )));
        }
        record.status = PhaseStatus::Completed;
        record.completed_at = Some(Utc::now());
        record.progress.current_item = None;
        if let Some(next) = phase.next() {
            session.current_phase = next;
        }
        session.touch();
        Ok(())
    }

    pub fn fail(session: &mut Session, phase: AnalysisPhase, reason: &str) -> Result<()> {
        let record = session.record_mut(phase);
        if record.status != PhaseStatus::InProgress {
            return Err(RulectlError::Session(format!(
                "cannot fail {}: status is {}",
                phase, record.status
            )));
        }
        record.status = PhaseStatus::Failed;
        record.error = Some(reason.to_string());
        record.progress.current_item = None;
        session.touch();
        Ok(())
    }

    /// Clear `phase` and every later phase back to NotStarted with zeroed counters
    pub fn reset_from(session: &mut Session, phase: AnalysisPhase) {
        for later in &AnalysisPhase::ALL[phase.index()..] {
            *session.record_mut(*later) = PhaseRecord::new(*later);
        }
        session.current_phase = phase;
        session.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::RunOptions;

    fn session() -> Session {
        Session::new("/tmp/repo", RunOptions::default())
    }

    fn advance_to(session: &mut Session, target: AnalysisPhase) {
        for phase in &AnalysisPhase::ALL[..target.index()] {
            PhaseStateMachine::begin(session, *phase).unwrap();
            PhaseStateMachine::complete(session, *phase).unwrap();
        }
    }

    #[test]
    fn test_linear_order() {
        assert_eq!(
            PhaseStateMachine::next_phase(AnalysisPhase::Setup),
            Some(AnalysisPhase::StructureAnalysis)
        );
        assert_eq!(
            PhaseStateMachine::next_phase(AnalysisPhase::RuleSynthesis),
            Some(AnalysisPhase::SaveComplete)
        );
        assert_eq!(PhaseStateMachine::next_phase(AnalysisPhase::SaveComplete), None);
        for (i, phase) in AnalysisPhase::ALL.iter().enumerate() {
            assert_eq!(phase.index(), i);
        }
    }

    #[test]
    fn test_resumable_phases() {
        let resumable: Vec<_> = AnalysisPhase::ALL
            .iter()
            .filter(|p| PhaseStateMachine::is_resumable(**p))
            .collect();
        assert_eq!(
            resumable,
            vec![
                &AnalysisPhase::FileAnalysis,
                &AnalysisPhase::GitAnalysis,
                &AnalysisPhase::RuleSynthesis,
                &AnalysisPhase::SaveComplete
            ]
        );
    }

    #[test]
    fn test_required_caches() {
        assert!(AnalysisPhase::Setup.required_caches().is_empty());
        assert_eq!(
            AnalysisPhase::FileAnalysis.required_caches(),
            vec![
                AnalysisPhase::StructureAnalysis,
                AnalysisPhase::FileDiscovery,
                AnalysisPhase::FileAnalysis
            ]
        );
        assert_eq!(AnalysisPhase::SaveComplete.required_caches().len(), 6);
    }

    #[test]
    fn test_phase_names_round_trip_through_from_str() {
        for phase in AnalysisPhase::ALL {
            assert_eq!(phase.as_str().parse::<AnalysisPhase>().unwrap(), phase);
        }
        assert_eq!(
            "structure".parse::<AnalysisPhase>().unwrap(),
            AnalysisPhase::StructureAnalysis
        );
        assert!("bogus".parse::<AnalysisPhase>().is_err());
    }

    #[test]
    fn test_can_resume_from() {
        let mut record = PhaseRecord::new(AnalysisPhase::FileAnalysis);
        assert!(!PhaseStateMachine::can_resume_from(&record, &[]));

        record.status = PhaseStatus::InProgress;
        assert!(PhaseStateMachine::can_resume_from(&record, &[]));

        record.status = PhaseStatus::Failed;
        assert!(PhaseStateMachine::can_resume_from(&record, &[]));

        let own = CacheIssue {
            phase: AnalysisPhase::FileAnalysis,
            problem: "missing".into(),
        };
        assert!(!PhaseStateMachine::can_resume_from(&record, &[own]));

        let later = CacheIssue {
            phase: AnalysisPhase::RuleSynthesis,
            problem: "missing".into(),
        };
        assert!(PhaseStateMachine::can_resume_from(&record, &[later]));

        let mut discovery = PhaseRecord::new(AnalysisPhase::FileDiscovery);
        discovery.status = PhaseStatus::InProgress;
        assert!(!PhaseStateMachine::can_resume_from(&discovery, &[]));
    }

    #[test]
    fn test_begin_requires_earlier_phases_completed() {
        let mut session = session();
        let err = PhaseStateMachine::begin(&mut session, AnalysisPhase::FileAnalysis).unwrap_err();
        assert!(err.to_string().contains("setup is not completed"));

        advance_to(&mut session, AnalysisPhase::FileAnalysis);
        PhaseStateMachine::begin(&mut session, AnalysisPhase::FileAnalysis).unwrap();
        assert_eq!(session.current_phase, AnalysisPhase::FileAnalysis);
        assert!(session.validate().is_ok());

        // Re-entry on resume is allowed
        PhaseStateMachine::begin(&mut session, AnalysisPhase::FileAnalysis).unwrap();
    }

    #[test]
    fn test_complete_requires_in_progress() {
        let mut session = session();
        assert!(PhaseStateMachine::complete(&mut session, AnalysisPhase::Setup).is_err());
        PhaseStateMachine::begin(&mut session, AnalysisPhase::Setup).unwrap();
        PhaseStateMachine::complete(&mut session, AnalysisPhase::Setup).unwrap();
        assert_eq!(session.current_phase, AnalysisPhase::StructureAnalysis);
        assert!(PhaseStateMachine::begin(&mut session, AnalysisPhase::Setup).is_err());
    }

    #[test]
    fn test_fail_then_resume() {
        let mut session = session();
        advance_to(&mut session, AnalysisPhase::GitAnalysis);
        PhaseStateMachine::begin(&mut session, AnalysisPhase::GitAnalysis).unwrap();
        PhaseStateMachine::fail(&mut session, AnalysisPhase::GitAnalysis, "too many failures")
            .unwrap();
        let record = session.record(AnalysisPhase::GitAnalysis);
        assert_eq!(record.status, PhaseStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("too many failures"));

        PhaseStateMachine::begin(&mut session, AnalysisPhase::GitAnalysis).unwrap();
        assert!(session.record(AnalysisPhase::GitAnalysis).error.is_none());
    }

    #[test]
    fn test_full_run_completes_session() {
        let mut session = session();
        for phase in AnalysisPhase::ALL {
            PhaseStateMachine::begin(&mut session, phase).unwrap();
            PhaseStateMachine::complete(&mut session, phase).unwrap();
            assert!(session.validate().is_ok());
        }
        assert!(session.is_complete());
        assert_eq!(session.current_phase, AnalysisPhase::SaveComplete);
    }

    #[test]
    fn test_reset_from_zeroes_counters() {
        let mut session = session();
        advance_to(&mut session, AnalysisPhase::FileAnalysis);
        PhaseStateMachine::begin(&mut session, AnalysisPhase::FileAnalysis).unwrap();
        session
            .record_mut(AnalysisPhase::FileAnalysis)
            .progress
            .completed_count = 12;

        PhaseStateMachine::reset_from(&mut session, AnalysisPhase::FileAnalysis);
        let record = session.record(AnalysisPhase::FileAnalysis);
        assert_eq!(record.status, PhaseStatus::NotStarted);
        assert_eq!(record.progress.completed_count, 0);
        assert_eq!(
            session.record(AnalysisPhase::FileDiscovery).status,
            PhaseStatus::Completed
        );
        assert!(session.validate().is_ok());
    }
}
