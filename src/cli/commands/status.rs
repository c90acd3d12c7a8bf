//! Status Command
//!
//! Show saved analysis progress without taking the state lock.

use serde::Serialize;
use std::path::{Path, PathBuf};

use super::start::resolve_repo;
use crate::cli::ui::Output;
use crate::pipeline::{CheckpointStore, Loaded, PhaseRecord, PhaseStatus, ProgressSummary};
use crate::types::Result;

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusReport {
    NoSession {
        report: Option<PathBuf>,
    },
    Corrupted {
        reason: String,
    },
    Session {
        summary: ProgressSummary,
        phases: Vec<PhaseRecord>,
        /// Phases whose cache is missing or unreadable
        cache_problems: Vec<String>,
    },
}

/// Inspect the state directory of `repo`
pub fn collect(repo: &Path) -> Result<StatusReport> {
    let store = CheckpointStore::open_read_only(repo);
    let session = match store.load()? {
        Loaded::Missing => {
            let rules = store.rules_path();
            return Ok(StatusReport::NoSession {
                report: rules.exists().then_some(rules),
            });
        }
        Loaded::Corrupted(reason) => return Ok(StatusReport::Corrupted { reason }),
        Loaded::Present(session) => session,
    };

    let mut cache_problems = Vec::new();
    for record in &session.phases {
        if !record.resumable || record.status == PhaseStatus::NotStarted {
            continue;
        }
        if let (Some(key), Some(problem)) = (
            record.phase.cache_key(),
            store.load_cache(&session, record.phase)?.problem(),
        ) {
            cache_problems.push(format!("{}: {}", key, problem));
        }
    }

    Ok(StatusReport::Session {
        summary: session.summary(),
        phases: session.phases,
        cache_problems,
    })
}

pub fn run(dir: Option<&Path>, format: &str) -> Result<()> {
    let repo = resolve_repo(dir)?;
    let report = collect(&repo)?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let output = Output::new();
    output.header("rulectl status");
    match report {
        StatusReport::NoSession { report } => {
            output.info("No analysis in progress");
            if let Some(path) = report {
                output.field("Last report", path.display());
            }
        }
        StatusReport::Corrupted { reason } => {
            output.warning(&format!("Saved state is unreadable: {}", reason));
            output.info("Run 'rulectl start --fresh' or 'rulectl clean' to discard it");
        }
        StatusReport::Session {
            summary,
            phases,
            cache_problems,
        } => {
            output.field("Session", summary.session_id.short());
            output.field("Started", summary.started_at.format("%Y-%m-%d %H:%M UTC"));
            output.field("Current phase", summary.phase);

            output.section("Phases");
            for record in &phases {
                let counts = if record.progress.total_count > 0 {
                    format!(
                        "{}/{} ({} failed)",
                        record.progress.completed_count,
                        record.progress.total_count,
                        record.progress.failed_count()
                    )
                } else {
                    String::new()
                };
                println!(
                    "  {:<20} {:<12} {}",
                    record.phase.to_string(),
                    record.status.to_string(),
                    counts
                );
            }

            for problem in cache_problems {
                output.warning(&format!("Cache {}", problem));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{AnalysisPhase, RunOptions, Session};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_status_without_session() {
        let dir = TempDir::new().unwrap();
        let report = collect(dir.path()).unwrap();
        assert!(matches!(report, StatusReport::NoSession { report: None }));
    }

    #[test]
    fn test_status_reports_missing_cache() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let store = CheckpointStore::open(&root, Duration::from_secs(1)).unwrap();

        let mut session = Session::new(&root, RunOptions::default());
        for phase in [
            AnalysisPhase::Setup,
            AnalysisPhase::StructureAnalysis,
            AnalysisPhase::FileDiscovery,
        ] {
            session.record_mut(phase).status = PhaseStatus::Completed;
        }
        session.current_phase = AnalysisPhase::FileAnalysis;
        session.record_mut(AnalysisPhase::FileAnalysis).status = PhaseStatus::InProgress;
        store.save_cache(&session, AnalysisPhase::StructureAnalysis, &json!({})).unwrap();
        store.save_cache(&session, AnalysisPhase::FileDiscovery, &json!({})).unwrap();
        store.save_session(&session).unwrap();
        drop(store);

        let StatusReport::Session {
            summary,
            cache_problems,
            ..
        } = collect(&root).unwrap()
        else {
            panic!("expected a session");
        };
        assert_eq!(summary.phase, AnalysisPhase::FileAnalysis);
        assert_eq!(cache_problems, vec!["file_analysis: missing".to_string()]);
    }
}
