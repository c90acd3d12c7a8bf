//! Git History Analysis
//!
//! Per-file commit statistics mined from `git log --name-status`. Each file
//! is one work item, so a long history scan can be interrupted and resumed
//! like any other phase.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::constants::network;
use crate::types::ItemError;

/// Days of history counted as recent activity
pub const RECENT_DAYS: i64 = 90;

/// Share of the importance score taken by recent activity
pub const RECENCY_WEIGHT: f64 = 0.3;

/// Weight for files with no recorded history
pub const DEFAULT_IMPORTANCE: f64 = 0.1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileHistory {
    pub path: String,
    pub added: u32,
    pub modified: u32,
    pub deleted: u32,
    /// Every recognized status line
    pub total: u32,
    /// Changes within the last [`RECENT_DAYS`]
    pub recent: u32,
    pub last_commit: Option<DateTime<Utc>>,
}

impl FileHistory {
    /// Parse `git log --name-status --pretty=format:%ct` output
    ///
    /// Timestamp lines open a commit; status lines that follow are
    /// attributed to it. Renames and copies count against the file.
    pub fn parse(path: &str, output: &str, now: DateTime<Utc>) -> Self {
        let recent_cutoff = now - ChronoDuration::days(RECENT_DAYS);
        let mut history = Self {
            path: path.to_string(),
            ..Default::default()
        };
        let mut commit_time: Option<DateTime<Utc>> = None;

        for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Ok(secs) = line.parse::<i64>() {
                commit_time = Utc.timestamp_opt(secs, 0).single();
                if let Some(t) = commit_time
                    && history.last_commit.is_none_or(|last| t > last)
                {
                    history.last_commit = Some(t);
                }
                continue;
            }

            let Some((status, _)) = line.split_once('\t') else {
                continue;
            };
            match status.chars().next() {
                Some('A') | Some('C') => history.added += 1,
                Some('M') | Some('R') | Some('T') => history.modified += 1,
                Some('D') => history.deleted += 1,
                _ => continue,
            }
            history.total += 1;
            if commit_time.is_some_and(|t| t >= recent_cutoff) {
                history.recent += 1;
            }
        }
        history
    }
}

/// Per-file history source
#[async_trait]
pub trait GitAnalyzer: Send + Sync {
    /// False when the repository has no usable history
    async fn is_available(&self) -> bool {
        true
    }

    async fn file_history(&self, path: &str) -> std::result::Result<FileHistory, ItemError>;
}

/// `git` subprocess implementation
pub struct GitCli {
    repo_root: PathBuf,
    timeout: Duration,
}

impl GitCli {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            timeout: Duration::from_secs(network::GIT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether `root` is inside a git work tree with `git` on PATH
    pub async fn is_repository(root: &Path) -> bool {
        Command::new("git")
            .args(["rev-parse", "--is-inside-work-tree"])
            .current_dir(root)
            .output()
            .await
            .is_ok_and(|out| out.status.success())
    }
}

#[async_trait]
impl GitAnalyzer for GitCli {
    async fn is_available(&self) -> bool {
        Self::is_repository(&self.repo_root).await
    }

    async fn file_history(&self, path: &str) -> std::result::Result<FileHistory, ItemError> {
        let mut command = Command::new("git");
        command
            .args([
                "log",
                "--follow",
                "--name-status",
                "--pretty=format:%ct",
                "--",
                path,
            ])
            .current_dir(&self.repo_root)
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ItemError::permanent(format!("git failed to start: {}", e))),
            Err(_) => {
                return Err(ItemError::transient(format!(
                    "git log timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ItemError::permanent(format!(
                "git log failed for {}: {}",
                path,
                stderr.trim()
            )));
        }

        let history = FileHistory::parse(path, &String::from_utf8_lossy(&output.stdout), Utc::now());
        debug!(path, total = history.total, recent = history.recent, "File history");
        Ok(history)
    }
}

/// Combine total and recent activity into weights in `[0, 1]`
///
/// Both counts are normalized by their maximum across the repository.
pub fn importance_weights(histories: &[FileHistory]) -> BTreeMap<String, f64> {
    let max_total = histories.iter().map(|h| h.total).max().unwrap_or(0);
    if max_total == 0 {
        return BTreeMap::new();
    }
    let max_recent = histories.iter().map(|h| h.recent).max().unwrap_or(0).max(1);

    histories
        .iter()
        .map(|h| {
            let total = f64::from(h.total) / f64::from(max_total);
            let recent = f64::from(h.recent) / f64::from(max_recent);
            (
                h.path.clone(),
                (1.0 - RECENCY_WEIGHT) * total + RECENCY_WEIGHT * recent,
            )
        })
        .collect()
}
