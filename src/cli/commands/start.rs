//! Start Command
//!
//! Run the analysis pipeline against a repository, resuming a saved
//! session when allowed.
//!
//! Usage:
//!   rulectl start [DIR] [--resume | --fresh] [--provider P] [--model M]
//!                 [--rpm N] [--base-delay-ms N] [--strategy S]
//!                 [--batch-size N] [--no-batching] [--concurrency N]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Runtime;
use tracing::{debug, info};

use crate::ai::provider::{ProviderConfig, create_provider};
use crate::ai::{LlmAnalysisBackend, RateLimiter, RateLimiterConfig, TimeoutConfig, UsageTracker};
use crate::analyzer::{FileScanner, GitCli, LlmRuleSynthesizer};
use crate::cli::progress::ConsoleRenderer;
use crate::cli::ui::{Output, TermPrompt};
use crate::config::{Config, ConfigLoader, RateLimitStrategy};
use crate::pipeline::{
    CheckpointStore, Collaborators, PhaseRunner, ProgressTracker, ResumeCoordinator, ResumeMode,
    RunOptions, SchedulerConfig, Shutdown,
};
use crate::types::{Result, RulectlError};

/// Options for `rulectl start`
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub dir: Option<PathBuf>,
    pub resume: bool,
    pub fresh: bool,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub rpm: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub strategy: Option<RateLimitStrategy>,
    pub batch_size: Option<usize>,
    pub no_batching: bool,
    pub concurrency: Option<usize>,
    pub quiet: bool,
}

impl StartOptions {
    /// CLI arguments take precedence over every config layer
    pub fn apply(&self, config: &mut Config) {
        if let Some(provider) = &self.provider {
            config.llm.provider = provider.clone();
        }
        if let Some(model) = &self.model {
            config.llm.model = Some(model.clone());
        }
        if let Some(rpm) = self.rpm {
            config.rate_limit.requests_per_minute = Some(rpm);
        }
        if let Some(delay) = self.base_delay_ms {
            config.rate_limit.base_delay_ms = Some(delay);
        }
        if let Some(strategy) = self.strategy {
            config.rate_limit.strategy = strategy;
        }
        if let Some(size) = self.batch_size {
            config.batching.batch_size = size;
        }
        if self.no_batching {
            config.batching.enabled = false;
        }
        if let Some(concurrency) = self.concurrency {
            config.batching.concurrency = concurrency;
        }
    }

    fn mode(&self, config: &Config) -> ResumeMode {
        if self.fresh {
            ResumeMode::Fresh
        } else if self.resume || config.session.auto_resume {
            ResumeMode::Auto
        } else {
            ResumeMode::Prompt
        }
    }
}

/// Canonical repository root for `dir` (current directory when unset)
pub fn resolve_repo(dir: Option<&Path>) -> Result<PathBuf> {
    let dir = match dir {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir()?,
    };
    dir.canonicalize().map_err(|e| {
        RulectlError::Repository(format!("cannot open {}: {}", dir.display(), e))
    })
}

pub fn run(options: StartOptions) -> Result<()> {
    let repo = resolve_repo(options.dir.as_deref())?;
    let mut config = ConfigLoader::load(&repo)?;
    options.apply(&mut config);
    config.validate()?;

    let output = Output::quiet(options.quiet);
    output.header(&format!("Analyzing {}", repo.display()));

    // Lock polling sleeps the thread, so take it before the runtime exists
    let lock_timeout = Duration::from_secs(config.session.lock_timeout_secs);
    let store = CheckpointStore::open(&repo, lock_timeout)?;
    let (collaborators, limiter) = build_collaborators(&repo, &config)?;

    let (handle, shutdown) = Shutdown::channel();
    let tracker = ProgressTracker::new();
    let events = tracker.subscribe();
    let runner = PhaseRunner::new(&store, collaborators, SchedulerConfig::from(&config), limiter)
        .with_shutdown(shutdown)
        .with_progress(tracker);
    let run_options = RunOptions {
        provider: config.llm.provider.clone(),
        model: config.llm.model.clone(),
        strategy: config.rate_limit.strategy,
        batch_size: config.batching.batch_size,
        batching: config.batching.enabled,
    };
    let coordinator = ResumeCoordinator::new(runner, run_options);

    // The resume prompt owns the terminal until it is answered
    let (session, resumed_from) = coordinator.prepare(options.mode(&config), &TermPrompt::new())?;

    let rt = Runtime::new()?;
    let quiet = options.quiet;
    let report = rt.block_on(async move {
        let signal = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, saving progress");
                handle.trigger();
            }
        });
        let renderer = ConsoleRenderer::new(quiet).spawn(events);

        let result = coordinator.run_prepared(session, resumed_from).await;
        signal.abort();
        drop(coordinator);
        let _ = renderer.await;
        result
    })?;

    output.success("Analysis complete");
    if let Some(phase) = report.resumed_from {
        output.field("Resumed from", phase);
    }
    output.field("Session", report.session_id.short());
    output.field("Rules", report.rule_count);
    if report.failed_items > 0 {
        output.field("Failed items", report.failed_items);
    }
    if !report.usage.is_empty() {
        let total = report.usage.total;
        output.field(
            "Tokens",
            format!(
                "{} in / {} out over {} calls",
                total.input_tokens, total.output_tokens, total.calls
            ),
        );
        if let Some(cost) = report.usage.estimated_cost_usd {
            output.field("Estimated cost", format!("${:.4}", cost));
        }
    }
    if report.rate_limited > 0 {
        output.field("Rate limited", report.rate_limited);
    }
    output.field("Report", report.rules_path.display());
    Ok(())
}

fn build_collaborators(repo: &Path, config: &Config) -> Result<(Collaborators, Arc<RateLimiter>)> {
    let provider = create_provider(&ProviderConfig::from(&config.llm))?;
    info!(provider = provider.name(), model = provider.model(), "Using LLM provider");
    let timeouts = TimeoutConfig::default().with_llm_request_secs(config.llm.timeout_secs);
    let usage = Arc::new(UsageTracker::new(provider.name(), provider.model()));

    let limiter_config = RateLimiterConfig::from_settings(&config.rate_limit, &config.llm.provider);
    debug!(?limiter_config, "Rate limiter configured");
    let limiter = Arc::new(RateLimiter::new(limiter_config));

    let scanner = Arc::new(
        FileScanner::new()
            .with_exclude(&config.analysis.exclude)?
            .with_max_file_size(config.analysis.max_file_size),
    );
    let collaborators = Collaborators {
        scanner: Arc::clone(&scanner),
        discovery: scanner,
        backend: Arc::new(
            LlmAnalysisBackend::new(Arc::clone(&provider), repo)
                .with_max_file_chars(config.analysis.max_file_chars)
                .with_timeout(timeouts.llm_request)
                .with_usage(Arc::clone(&usage)),
        ),
        git: Arc::new(GitCli::new(repo).with_timeout(timeouts.git_command)),
        synthesizer: Arc::new(
            LlmRuleSynthesizer::new(Arc::clone(&provider), timeouts.llm_request)
                .with_usage(Arc::clone(&usage)),
        ),
        usage,
    };
    Ok((collaborators, limiter))
}
