//! Phase Stages
//!
//! The work performed inside each phase. Non-resumable phases run to
//! completion in one step and cache their output at the end. Resumable
//! phases hand their items to a [`BatchScheduler`] and persist through a
//! sink that writes the phase cache before the phase record.
//!
//! | Phase             | Items            | Cache                          |
//! |-------------------|------------------|--------------------------------|
//! | Setup             | -                | -                              |
//! | StructureAnalysis | -                | RepositoryStructure            |
//! | FileDiscovery     | -                | DiscoveredFiles                |
//! | FileAnalysis      | discovered files | file -> FileRules              |
//! | GitAnalysis       | analyzed files   | file -> FileHistory            |
//! | RuleSynthesis     | ranked clusters  | cluster key -> SynthesizedRule |
//! | SaveComplete      | -                | SaveSummary                    |

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::phase::AnalysisPhase;
use super::progress::{MessageLevel, ProgressTracker};
use super::scheduler::{BatchScheduler, PhaseOutcome, PhaseState, SchedulerConfig, Shutdown};
use super::store::CheckpointStore;
use super::types::{Loaded, PhaseProgress, Session};
use crate::ai::{AnalysisBackend, RateLimiter, SharedUsage, UsageSummary};
use crate::analyzer::git::{FileHistory, GitAnalyzer, importance_weights};
use crate::analyzer::scanner::{FileDiscovery, FileScanner};
use crate::analyzer::structure::{RepositoryStructure, StructureAnalyzer};
use crate::analyzer::synthesis::{
    FileRules, RuleCluster, RuleSynthesizer, SynthesizedRule, candidate_rules, cluster_rules,
    rank_clusters, score_threshold,
};
use crate::types::{ItemError, Result, RulectlError, SessionId};

/// In-flight git processes for history mining
const LOCAL_CONCURRENCY: usize = 4;

// =============================================================================
// Cached Phase Outputs
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredFiles {
    pub files: Vec<String>,
    /// Config files held back by discovery
    #[serde(default)]
    pub skipped_config: Vec<String>,
    /// Held-back files the review accepted
    #[serde(default)]
    pub reviewed: Vec<String>,
}

impl DiscoveredFiles {
    /// Work items for per-file analysis
    pub fn items(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.files
            .iter()
            .chain(&self.reviewed)
            .filter(|f| seen.insert(f.as_str()))
            .cloned()
            .collect()
    }
}

/// Final report written to `.rulectl/rules.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulesReport {
    pub generated_at: DateTime<Utc>,
    pub session_id: SessionId,
    pub repository: PathBuf,
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    pub rules: Vec<SynthesizedRule>,
    pub stats: ReportStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportStats {
    pub files_discovered: usize,
    pub files_analyzed: usize,
    pub files_failed: usize,
    pub clusters_synthesized: usize,
    pub rules: usize,
    #[serde(default)]
    pub tokens: UsageSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveSummary {
    pub rules_path: PathBuf,
    pub rule_count: usize,
}

// =============================================================================
// Collaborators
// =============================================================================

/// External services the phases call into
#[derive(Clone)]
pub struct Collaborators {
    pub scanner: Arc<FileScanner>,
    pub discovery: Arc<dyn FileDiscovery>,
    pub backend: Arc<dyn AnalysisBackend>,
    pub git: Arc<dyn GitAnalyzer>,
    pub synthesizer: Arc<dyn RuleSynthesizer>,
    /// Token accounting fed by the backend and the synthesizer
    pub usage: SharedUsage,
}

// =============================================================================
// Runner
// =============================================================================

pub struct PhaseRunner<'a> {
    store: &'a CheckpointStore,
    collaborators: Collaborators,
    config: SchedulerConfig,
    limiter: Arc<RateLimiter>,
    shutdown: Shutdown,
    progress: ProgressTracker,
}

impl<'a> PhaseRunner<'a> {
    pub fn new(
        store: &'a CheckpointStore,
        collaborators: Collaborators,
        config: SchedulerConfig,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            store,
            collaborators,
            config,
            limiter,
            shutdown: Shutdown::never(),
            progress: ProgressTracker::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_progress(mut self, progress: ProgressTracker) -> Self {
        self.progress = progress;
        self
    }

    pub fn store(&self) -> &CheckpointStore {
        self.store
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn usage(&self) -> &SharedUsage {
        &self.collaborators.usage
    }

    /// Run `phase`, which must already be InProgress in `session`
    pub async fn run(&self, session: &mut Session, phase: AnalysisPhase) -> Result<PhaseOutcome> {
        if self.shutdown.is_triggered() {
            return Ok(PhaseOutcome::Cancelled);
        }
        debug!(phase = %phase, "Running phase");

        match phase {
            AnalysisPhase::Setup => self.setup().await,
            AnalysisPhase::StructureAnalysis => self.structure_analysis(session),
            AnalysisPhase::FileDiscovery => self.file_discovery(session).await,
            AnalysisPhase::FileAnalysis => self.file_analysis(session).await,
            AnalysisPhase::GitAnalysis => self.git_analysis(session).await,
            AnalysisPhase::RuleSynthesis => self.rule_synthesis(session).await,
            AnalysisPhase::SaveComplete => self.save_complete(session),
        }
    }

    // -------------------------------------------------------------------------
    // Non-resumable phases
    // -------------------------------------------------------------------------

    async fn setup(&self) -> Result<PhaseOutcome> {
        self.progress.start_phase(AnalysisPhase::Setup, 0, 0);
        let root = self.store.repo_root();
        if !root.is_dir() {
            return Err(RulectlError::Repository(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        let backend = &self.collaborators.backend;
        match backend.health_check().await {
            Ok(true) => debug!(backend = backend.name(), "Backend reachable"),
            Ok(false) => {
                warn!(backend = backend.name(), "Backend health check failed");
                self.progress.message(
                    MessageLevel::Warning,
                    format!("{} did not pass its health check", backend.name()),
                );
            }
            Err(e) => warn!(backend = backend.name(), error = %e, "Backend health check errored"),
        }

        if !self.collaborators.git.is_available().await {
            info!(repo = %root.display(), "No git history available, git analysis will be empty");
        }
        Ok(PhaseOutcome::Completed)
    }

    fn structure_analysis(&self, session: &Session) -> Result<PhaseOutcome> {
        let phase = AnalysisPhase::StructureAnalysis;
        self.progress.start_phase(phase, 0, 0);

        let structure =
            StructureAnalyzer::new(&self.collaborators.scanner).analyze(self.store.repo_root())?;
        info!(
            files = structure.total_files,
            markers = structure.build_markers.len(),
            "Repository structure analyzed"
        );
        self.collaborators.backend.set_context(&structure.summary());
        self.store
            .save_cache(session, phase, &serde_json::to_value(&structure)?)?;
        Ok(PhaseOutcome::Completed)
    }

    async fn file_discovery(&self, session: &Session) -> Result<PhaseOutcome> {
        let phase = AnalysisPhase::FileDiscovery;
        self.progress.start_phase(phase, 0, 0);

        let root = self.store.repo_root();
        let files = self.collaborators.discovery.list(root)?;
        let skipped_config = self.collaborators.discovery.skipped_config(root)?;
        let reviewed = match self.collaborators.backend.review_skipped(&skipped_config).await {
            Ok(reviewed) => reviewed,
            Err(e) => {
                warn!(error = %e, skipped = skipped_config.len(), "Config review failed, continuing without it");
                self.progress.message(
                    MessageLevel::Warning,
                    format!("Skipped config review: {}", e),
                );
                Vec::new()
            }
        };

        let discovered = DiscoveredFiles {
            files,
            skipped_config,
            reviewed,
        };
        info!(
            files = discovered.files.len(),
            skipped = discovered.skipped_config.len(),
            reviewed = discovered.reviewed.len(),
            "Files discovered"
        );
        self.store
            .save_cache(session, phase, &serde_json::to_value(&discovered)?)?;
        Ok(PhaseOutcome::Completed)
    }

    // -------------------------------------------------------------------------
    // Resumable phases
    // -------------------------------------------------------------------------

    async fn file_analysis(&self, session: &mut Session) -> Result<PhaseOutcome> {
        if let Some(structure) = self
            .load_optional::<RepositoryStructure>(session, AnalysisPhase::StructureAnalysis)?
        {
            self.collaborators.backend.set_context(&structure.summary());
        }
        let discovered: DiscoveredFiles = self.load_required(session, AnalysisPhase::FileDiscovery)?;

        let backend = &self.collaborators.backend;
        let scheduler = self.llm_scheduler();
        self.run_items(
            session,
            AnalysisPhase::FileAnalysis,
            discovered.items(),
            &scheduler,
            |item: String| async move { backend.process(&item).await },
        )
        .await
    }

    async fn git_analysis(&self, session: &mut Session) -> Result<PhaseOutcome> {
        let analyzed = self.load_results(session, AnalysisPhase::FileAnalysis)?;
        let git = &self.collaborators.git;
        let items: Vec<String> = if git.is_available().await {
            analyzed.into_keys().collect()
        } else {
            Vec::new()
        };

        let scheduler = self.local_scheduler();
        self.run_items(
            session,
            AnalysisPhase::GitAnalysis,
            items,
            &scheduler,
            |item: String| async move {
                let history = git.file_history(&item).await?;
                serde_json::to_value(history).map_err(|e| ItemError::permanent(e.to_string()))
            },
        )
        .await
    }

    async fn rule_synthesis(&self, session: &mut Session) -> Result<PhaseOutcome> {
        let analyses: Vec<FileRules> = self
            .load_results(session, AnalysisPhase::FileAnalysis)?
            .into_iter()
            .filter_map(|(file, value)| match serde_json::from_value(value) {
                Ok(rules) => Some(rules),
                Err(e) => {
                    warn!(file = %file, error = %e, "Ignoring unreadable analysis result");
                    None
                }
            })
            .collect();
        let histories: HashMap<String, FileHistory> = self
            .load_results(session, AnalysisPhase::GitAnalysis)?
            .into_iter()
            .filter_map(|(file, value)| serde_json::from_value(value).ok().map(|h| (file, h)))
            .collect();

        let history_list: Vec<FileHistory> = histories.values().cloned().collect();
        let weights = importance_weights(&history_list);
        let candidates = candidate_rules(&analyses, &histories, &weights);
        let threshold = score_threshold(&candidates);
        let candidate_count = candidates.len();
        let ranked = rank_clusters(cluster_rules(candidates), threshold);
        info!(
            candidates = candidate_count,
            clusters = ranked.len(),
            threshold,
            "Rules clustered"
        );

        let items: Vec<String> = ranked.iter().map(|c| c.key.clone()).collect();
        let clusters: HashMap<String, RuleCluster> =
            ranked.into_iter().map(|c| (c.key.clone(), c)).collect();
        let clusters = &clusters;
        let synthesizer = &self.collaborators.synthesizer;
        let scheduler = self.llm_scheduler();
        self.run_items(
            session,
            AnalysisPhase::RuleSynthesis,
            items,
            &scheduler,
            |key: String| async move {
                let cluster = clusters
                    .get(&key)
                    .ok_or_else(|| ItemError::permanent(format!("unknown cluster {}", key)))?;
                let rule = synthesizer.synthesize(cluster).await?;
                serde_json::to_value(rule).map_err(|e| ItemError::permanent(e.to_string()))
            },
        )
        .await
    }

    fn save_complete(&self, session: &mut Session) -> Result<PhaseOutcome> {
        let phase = AnalysisPhase::SaveComplete;
        self.progress.start_phase(phase, 1, 0);

        let mut rules: Vec<SynthesizedRule> = self
            .load_results(session, AnalysisPhase::RuleSynthesis)?
            .into_values()
            .filter_map(|value| serde_json::from_value(value).ok())
            .collect();
        rules.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.slug.cmp(&b.slug)));

        session.token_usage = self.collaborators.usage.snapshot();
        let analysis = &session.record(AnalysisPhase::FileAnalysis).progress;
        let stats = ReportStats {
            files_discovered: analysis.total_count,
            files_analyzed: analysis.completed_count,
            files_failed: analysis.failed_count(),
            clusters_synthesized: session
                .record(AnalysisPhase::RuleSynthesis)
                .progress
                .completed_count,
            rules: rules.len(),
            tokens: session.token_usage.clone(),
        };
        let report = RulesReport {
            generated_at: Utc::now(),
            session_id: session.session_id.clone(),
            repository: session.repo_path.clone(),
            provider: session.options.provider.clone(),
            model: session.options.model.clone(),
            rules,
            stats,
        };

        let rules_path = self.store.write_report(&report)?;
        info!(path = %rules_path.display(), rules = report.rules.len(), "Rules report written");

        let summary = SaveSummary {
            rules_path,
            rule_count: report.rules.len(),
        };
        self.store
            .save_cache(session, phase, &serde_json::to_value(&summary)?)?;
        let mut record = session.record(phase).clone();
        record.progress = PhaseProgress {
            completed_count: 1,
            total_count: 1,
            ..Default::default()
        };
        self.store.save_phase(session, record)?;
        self.progress.update_progress(1, 0, "rules.json");
        Ok(PhaseOutcome::Completed)
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn llm_scheduler(&self) -> BatchScheduler {
        BatchScheduler::new(self.config.clone())
            .with_limiter(Arc::clone(&self.limiter))
            .with_shutdown(self.shutdown.clone())
            .with_progress(self.progress.clone())
    }

    /// Git runs locally: no limiter, no inter-batch delay
    fn local_scheduler(&self) -> BatchScheduler {
        let config = SchedulerConfig {
            batching: false,
            batch_delay: Duration::ZERO,
            concurrency: self.config.concurrency.max(LOCAL_CONCURRENCY),
            ..self.config.clone()
        };
        BatchScheduler::new(config)
            .with_shutdown(self.shutdown.clone())
            .with_progress(self.progress.clone())
    }

    async fn run_items<F, Fut>(
        &self,
        session: &mut Session,
        phase: AnalysisPhase,
        items: Vec<String>,
        scheduler: &BatchScheduler,
        process_one: F,
    ) -> Result<PhaseOutcome>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<Value, ItemError>>,
    {
        let results = self.load_results(session, phase)?;
        let mut state = PhaseState::new(session.record(phase).progress.clone(), results);
        self.progress
            .start_phase(phase, items.len(), state.progress.completed_count);

        let store = self.store;
        let usage = &self.collaborators.usage;
        let mut sink = |state: &PhaseState| -> Result<()> {
            store.save_cache(session, phase, &serde_json::to_value(&state.results)?)?;
            session.token_usage = usage.snapshot();
            let mut record = session.record(phase).clone();
            record.progress = state.progress.clone();
            store.save_phase(session, record)
        };
        scheduler
            .run_phase(phase, &items, &mut state, process_one, &mut sink)
            .await
    }

    /// Completed items of a resumable phase; empty when the cache is unusable
    fn load_results(&self, session: &Session, phase: AnalysisPhase) -> Result<BTreeMap<String, Value>> {
        match self.store.load_cache(session, phase)? {
            Loaded::Present(Value::Object(map)) => Ok(map.into_iter().collect()),
            Loaded::Present(_) => {
                warn!(phase = %phase, "Phase cache is not a result map, starting empty");
                Ok(BTreeMap::new())
            }
            other => {
                debug!(phase = %phase, problem = ?other.problem(), "No usable phase cache");
                Ok(BTreeMap::new())
            }
        }
    }

    fn load_optional<T: DeserializeOwned>(&self, session: &Session, phase: AnalysisPhase) -> Result<Option<T>> {
        match self.store.load_cache(session, phase)? {
            Loaded::Present(value) => Ok(serde_json::from_value(value).ok()),
            _ => Ok(None),
        }
    }

    fn load_required<T: DeserializeOwned>(&self, session: &Session, phase: AnalysisPhase) -> Result<T> {
        match self.store.load_cache(session, phase)? {
            Loaded::Present(value) => Ok(serde_json::from_value(value)?),
            other => Err(RulectlError::Session(format!(
                "cache for {} is {}",
                phase,
                other.problem().unwrap_or_default()
            ))),
        }
    }
}

// =============================================================================
// Test Doubles
// =============================================================================
