//! Session Data Types
//!
//! Durable records persisted under `.rulectl/`: the Session with one
//! PhaseRecord per phase in `progress.json`, and one CacheEntry envelope per
//! cache-bearing phase in `cache/<phase>.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;

use super::phase::{AnalysisPhase, PhaseStatus};
use crate::ai::UsageSummary;
use crate::config::RateLimitStrategy;
use crate::constants::checkpoint::SCHEMA_VERSION;
use crate::types::{Result, SessionId};

// =============================================================================
// Load Result
// =============================================================================

/// Outcome of reading a durable file
///
/// Parse and schema failures are values, not errors: the caller treats a
/// corrupted file the same as a missing one for resume purposes.
#[derive(Debug, Clone, PartialEq)]
pub enum Loaded<T> {
    Missing,
    Corrupted(String),
    Present(T),
}

impl<T> Loaded<T> {
    pub fn present(self) -> Option<T> {
        match self {
            Self::Present(value) => Some(value),
            _ => None,
        }
    }

    /// Human-readable problem, if the value is not usable
    pub fn problem(&self) -> Option<String> {
        match self {
            Self::Missing => Some("missing".to_string()),
            Self::Corrupted(reason) => Some(format!("corrupted: {}", reason)),
            Self::Present(_) => None,
        }
    }
}

// =============================================================================
// Phase Record
// =============================================================================

/// Item that failed permanently within a phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub item: String,
    pub reason: String,
}

/// Item counters for a phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub completed_count: usize,
    pub total_count: usize,
    #[serde(default)]
    pub failed_items: Vec<FailedItem>,
    /// In-flight item, for display only
    #[serde(default)]
    pub current_item: Option<String>,
}

impl PhaseProgress {
    pub fn failed_count(&self) -> usize {
        self.failed_items.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: AnalysisPhase,
    pub status: PhaseStatus,
    pub resumable: bool,
    #[serde(default)]
    pub progress: PhaseProgress,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Last phase-level error
    #[serde(default)]
    pub error: Option<String>,
}

impl PhaseRecord {
    pub fn new(phase: AnalysisPhase) -> Self {
        Self {
            phase,
            status: PhaseStatus::NotStarted,
            resumable: phase.is_resumable(),
            progress: PhaseProgress::default(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// Run options captured when the session was created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    pub strategy: RateLimitStrategy,
    pub batch_size: usize,
    pub batching: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: None,
            strategy: RateLimitStrategy::default(),
            batch_size: crate::constants::scheduler::BATCH_SIZE,
            batching: true,
        }
    }
}

/// One analysis run against one repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub version: u32,
    pub session_id: SessionId,
    pub repo_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub current_phase: AnalysisPhase,
    pub phases: Vec<PhaseRecord>,
    #[serde(default)]
    pub options: RunOptions,
    /// LLM tokens spent by this session, across resumes
    #[serde(default)]
    pub token_usage: UsageSummary,
}

impl Session {
    pub fn new(repo_path: impl Into<PathBuf>, options: RunOptions) -> Self {
        let now = Utc::now();
        Self {
            version: SCHEMA_VERSION,
            session_id: SessionId::generate(),
            repo_path: repo_path.into(),
            started_at: now,
            last_updated_at: now,
            current_phase: AnalysisPhase::Setup,
            phases: AnalysisPhase::ALL.iter().map(|p| PhaseRecord::new(*p)).collect(),
            options,
            token_usage: UsageSummary::default(),
        }
    }

    pub fn record(&self, phase: AnalysisPhase) -> &PhaseRecord {
        &self.phases[phase.index()]
    }

    pub fn record_mut(&mut self, phase: AnalysisPhase) -> &mut PhaseRecord {
        &mut self.phases[phase.index()]
    }

    pub fn current_record(&self) -> &PhaseRecord {
        self.record(self.current_phase)
    }

    pub fn touch(&mut self) {
        self.last_updated_at = Utc::now();
    }

    /// Every phase through SaveComplete finished
    pub fn is_complete(&self) -> bool {
        self.phases
            .iter()
            .all(|r| r.status == PhaseStatus::Completed)
    }

    pub fn summary(&self) -> ProgressSummary {
        let record = self.current_record();
        ProgressSummary {
            session_id: self.session_id.clone(),
            started_at: self.started_at,
            phase: self.current_phase,
            status: record.status,
            completed: record.progress.completed_count,
            total: record.progress.total_count,
            failed: record.progress.failed_count(),
        }
    }

    /// Check structural invariants of a loaded session
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.version > SCHEMA_VERSION {
            return Err(format!(
                "schema version {} is newer than supported {}",
                self.version, SCHEMA_VERSION
            ));
        }
        if self.phases.len() != AnalysisPhase::ALL.len() {
            return Err(format!(
                "expected {} phase records, found {}",
                AnalysisPhase::ALL.len(),
                self.phases.len()
            ));
        }

        let mut in_progress = 0;
        let mut earlier_incomplete: Option<AnalysisPhase> = None;
        for (expected, record) in AnalysisPhase::ALL.iter().zip(&self.phases) {
            if record.phase != *expected {
                return Err(format!(
                    "phase record {} out of order (expected {})",
                    record.phase, expected
                ));
            }
            if record.resumable != expected.is_resumable() {
                return Err(format!("phase {} has wrong resumable flag", expected));
            }
            match record.status {
                PhaseStatus::Completed => {
                    if let Some(earlier) = earlier_incomplete {
                        return Err(format!(
                            "phase {} completed before {}",
                            record.phase, earlier
                        ));
                    }
                }
                status => {
                    if status == PhaseStatus::InProgress {
                        in_progress += 1;
                    }
                    earlier_incomplete.get_or_insert(record.phase);
                }
            }
        }
        if in_progress > 1 {
            return Err(format!("{} phases in progress", in_progress));
        }

        let current = self.current_record();
        if in_progress == 1 && current.status != PhaseStatus::InProgress {
            return Err(format!(
                "current phase {} is {} while another phase is in progress",
                self.current_phase, current.status
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Progress Summary
// =============================================================================

/// What a user sees before deciding to resume
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSummary {
    pub session_id: SessionId,
    pub started_at: DateTime<Utc>,
    pub phase: AnalysisPhase,
    pub status: PhaseStatus,
    pub completed: usize,
    pub total: usize,
    pub failed: usize,
}

impl fmt::Display for ProgressSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session {} started {}, {} {}: {}/{} items, {} failed",
            self.session_id.short(),
            self.started_at.format("%Y-%m-%d %H:%M UTC"),
            self.phase,
            self.status,
            self.completed,
            self.total,
            self.failed
        )
    }
}

// =============================================================================
// Cache Entry
// =============================================================================

/// Envelope around a phase's intermediate output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub version: u32,
    pub phase: AnalysisPhase,
    pub session_id: SessionId,
    pub written_at: DateTime<Utc>,
    /// CRC32 of the serialized `data`
    pub checksum: u32,
    pub data: Value,
}

impl CacheEntry {
    pub fn new(session_id: &SessionId, phase: AnalysisPhase, data: Value) -> Result<Self> {
        let checksum = Self::compute_checksum(&data)?;
        Ok(Self {
            version: SCHEMA_VERSION,
            phase,
            session_id: session_id.clone(),
            written_at: Utc::now(),
            checksum,
            data,
        })
    }

    pub fn compute_checksum(data: &Value) -> Result<u32> {
        Ok(crc32fast::hash(&serde_json::to_vec(data)?))
    }

    /// Structural validity against the owning session
    pub fn verify(&self, session_id: &SessionId, phase: AnalysisPhase) -> std::result::Result<(), String> {
        if self.version > SCHEMA_VERSION {
            return Err(format!("unsupported cache version {}", self.version));
        }
        if self.phase != phase {
            return Err(format!("cache belongs to phase {}", self.phase));
        }
        if &self.session_id != session_id {
            return Err(format!(
                "cache belongs to session {}",
                self.session_id.short()
            ));
        }
        let actual = Self::compute_checksum(&self.data).map_err(|e| e.to_string())?;
        if actual != self.checksum {
            return Err(format!(
                "checksum mismatch (stored {:08x}, computed {:08x})",
                self.checksum, actual
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_session_is_valid() {
        let session = Session::new("/tmp/repo", RunOptions::default());
        assert_eq!(session.phases.len(), 7);
        assert_eq!(session.current_phase, AnalysisPhase::Setup);
        assert!(session.validate().is_ok());
        assert!(!session.is_complete());
        assert!(session.record(AnalysisPhase::FileAnalysis).resumable);
        assert!(!session.record(AnalysisPhase::FileDiscovery).resumable);
    }

    #[test]
    fn test_validate_rejects_out_of_order_completion() {
        let mut session = Session::new("/tmp/repo", RunOptions::default());
        session.record_mut(AnalysisPhase::FileAnalysis).status = PhaseStatus::Completed;
        let err = session.validate().unwrap_err();
        assert!(err.contains("completed before"));
    }

    #[test]
    fn test_validate_rejects_two_in_progress() {
        let mut session = Session::new("/tmp/repo", RunOptions::default());
        session.record_mut(AnalysisPhase::Setup).status = PhaseStatus::InProgress;
        session.record_mut(AnalysisPhase::StructureAnalysis).status = PhaseStatus::InProgress;
        assert!(session.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_newer_version() {
        let mut session = Session::new("/tmp/repo", RunOptions::default());
        session.version = SCHEMA_VERSION + 1;
        assert!(session.validate().unwrap_err().contains("newer"));
    }

    #[test]
    fn test_summary_display() {
        let mut session = Session::new("/tmp/repo", RunOptions::default());
        session.current_phase = AnalysisPhase::FileAnalysis;
        let record = session.record_mut(AnalysisPhase::FileAnalysis);
        record.progress.completed_count = 45;
        record.progress.total_count = 150;
        record.progress.failed_items = vec![
            FailedItem {
                item: "a.rs".into(),
                reason: "x".into(),
            };
            2
        ];
        let summary = session.summary();
        assert_eq!((summary.completed, summary.total, summary.failed), (45, 150, 2));
        assert!(summary.to_string().contains("45/150 items, 2 failed"));
    }

    #[test]
    fn test_cache_entry_verification() {
        let id = SessionId::generate();
        let entry = CacheEntry::new(&id, AnalysisPhase::GitAnalysis, json!({"a": 1.25})).unwrap();
        assert!(entry.verify(&id, AnalysisPhase::GitAnalysis).is_ok());
        assert!(entry.verify(&id, AnalysisPhase::FileAnalysis).is_err());
        assert!(
            entry
                .verify(&SessionId::generate(), AnalysisPhase::GitAnalysis)
                .is_err()
        );

        let mut tampered = entry.clone();
        tampered.data = json!({"a": 2});
        assert!(
            tampered
                .verify(&id, AnalysisPhase::GitAnalysis)
                .unwrap_err()
                .contains("checksum")
        );
    }

    #[test]
    fn test_cache_entry_survives_serialization() {
        let id = SessionId::generate();
        let entry = CacheEntry::new(
            &id,
            AnalysisPhase::FileAnalysis,
            json!({"results": {"b.rs": {"score": 0.1}, "a.rs": [1, 2]}}),
        )
        .unwrap();
        let text = serde_json::to_string_pretty(&entry).unwrap();
        let parsed: CacheEntry = serde_json::from_str(&text).unwrap();
        assert!(parsed.verify(&id, AnalysisPhase::FileAnalysis).is_ok());
    }

    #[test]
    fn test_loaded_problem() {
        assert_eq!(Loaded::<()>::Missing.problem().as_deref(), Some("missing"));
        assert!(Loaded::Present(1).problem().is_none());
        assert!(
            Loaded::<()>::Corrupted("bad".into())
                .problem()
                .unwrap()
                .contains("bad")
        );
    }
}
