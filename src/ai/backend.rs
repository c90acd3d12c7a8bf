//! Analysis Backend
//!
//! The per-file analysis call made by the FileAnalysis phase, plus the
//! one-shot review of configuration files held back by discovery.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

use super::provider::SharedProvider;
use super::timeout::with_timeout;
use super::usage::SharedUsage;
use crate::analyzer::synthesis::{FileRules, ProposedRule};
use crate::constants::{analysis, network};
use crate::types::{ItemError, Result, RulectlError};

/// Config files offered to the review call
pub const MAX_REVIEW_FILES: usize = 20;

/// Characters of each config file shown to the review call
pub const REVIEW_PREVIEW_CHARS: usize = 500;

/// Single-item analysis against an external service
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Analyze one repository-relative file
    async fn process(&self, item: &str) -> std::result::Result<Value, ItemError>;

    /// Pick which held-back config files deserve analysis
    async fn review_skipped(&self, files: &[String]) -> Result<Vec<String>>;

    /// Repository summary to quote in later calls
    fn set_context(&self, _summary: &str) {}

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn name(&self) -> &str;
}

/// [`AnalysisBackend`] over an [`LlmProvider`](super::provider::LlmProvider)
pub struct LlmAnalysisBackend {
    provider: SharedProvider,
    repo_root: PathBuf,
    structure: RwLock<String>,
    max_file_chars: usize,
    timeout: Duration,
    usage: Option<SharedUsage>,
}

impl LlmAnalysisBackend {
    pub fn new(provider: SharedProvider, repo_root: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            repo_root: repo_root.into(),
            structure: RwLock::new(String::new()),
            max_file_chars: analysis::MAX_FILE_CHARS,
            timeout: Duration::from_secs(network::DEFAULT_TIMEOUT_SECS),
            usage: None,
        }
    }

    pub fn with_max_file_chars(mut self, max: usize) -> Self {
        self.max_file_chars = max;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attribute the tokens of every call to `usage`
    pub fn with_usage(mut self, usage: SharedUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    fn build_prompt(&self, path: &str, content: &str) -> String {
        let mut prompt = String::new();
        prompt.push_str("# Task\n\n");
        prompt.push_str(
            "Identify the coding conventions this file follows that other files in the \
             repository should also follow. Only report conventions visible in the code. \
             Skip generic advice.\n\n",
        );
        let structure = self
            .structure
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !structure.is_empty() {
            prompt.push_str(&format!("# Repository\n\n{}\n\n", structure));
        }
        prompt.push_str(&format!("# File: {}\n\n```\n{}\n```\n", path, content));
        prompt
    }

    async fn generate(
        &self,
        prompt: &str,
        schema: &Value,
        phase: &str,
        operation: &str,
    ) -> Result<Value> {
        let response = with_timeout(
            self.timeout,
            self.provider.generate(prompt, schema),
            operation,
        )
        .await?;
        if let Some(usage) = &self.usage {
            usage.record(phase, &response.usage);
        }
        debug!(
            provider = self.provider.name(),
            tokens = response.usage.total(),
            elapsed_ms = response.elapsed_ms,
            "{} complete",
            operation
        );
        Ok(response.content)
    }
}

pub fn file_rules_schema() -> Value {
    json!({
        "type": "object",
        "required": ["rules"],
        "additionalProperties": false,
        "properties": {
            "rules": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["slug", "description", "scope_glob", "bullets"],
                    "additionalProperties": false,
                    "properties": {
                        "slug": {"type": "string", "description": "kebab-case identifier"},
                        "description": {"type": "string", "description": "One sentence summary"},
                        "scope_glob": {"type": "string", "description": "Glob of files the rule applies to"},
                        "bullets": {
                            "type": "array",
                            "items": {"type": "string"},
                            "description": "Imperative guidance, at most 120 characters each"
                        },
                        "evidence_lines": {
                            "type": "array",
                            "items": {"type": "integer"},
                            "description": "1-based lines demonstrating the convention"
                        }
                    }
                }
            }
        }
    })
}

fn review_schema() -> Value {
    json!({
        "type": "object",
        "required": ["include"],
        "additionalProperties": false,
        "properties": {
            "include": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Paths worth analyzing for coding conventions"
            }
        }
    })
}

#[derive(Deserialize)]
struct RulesPayload {
    #[serde(default)]
    rules: Vec<ProposedRule>,
}

#[derive(Deserialize)]
struct ReviewPayload {
    #[serde(default)]
    include: Vec<String>,
}

fn truncate_chars(content: &str, max: usize) -> (&str, bool) {
    match content.char_indices().nth(max) {
        Some((idx, _)) => (&content[..idx], true),
        None => (content, false),
    }
}

#[async_trait]
impl AnalysisBackend for LlmAnalysisBackend {
    async fn process(&self, item: &str) -> std::result::Result<Value, ItemError> {
        let path = self.repo_root.join(item);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ItemError::permanent(format!("cannot read {}: {}", item, e)))?;
        if content.trim().is_empty() {
            return Err(ItemError::permanent(format!("{} is empty", item)));
        }

        let (body, truncated) = truncate_chars(&content, self.max_file_chars);
        let body = if truncated {
            format!("{}\n... [truncated]", body)
        } else {
            body.to_string()
        };

        let prompt = self.build_prompt(item, &body);
        let value = self
            .generate(&prompt, &file_rules_schema(), "file_analysis", "file analysis")
            .await
            .map_err(|e| ItemError::from_error(&e, self.provider.name()))?;

        let payload: RulesPayload = serde_json::from_value(value)
            .map_err(|e| ItemError::transient(format!("invalid analysis for {}: {}", item, e)))?;
        let result = FileRules {
            file: item.to_string(),
            rules: payload.rules,
        };
        serde_json::to_value(result).map_err(|e| ItemError::permanent(e.to_string()))
    }

    async fn review_skipped(&self, files: &[String]) -> Result<Vec<String>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }

        let mut prompt = String::from(
            "# Task\n\nThese configuration files were skipped during discovery. List the \
             ones whose content shows project-specific conventions worth analyzing. Leave \
             out generated, vendored, or boilerplate files.\n\n",
        );
        let offered: Vec<&String> = files.iter().take(MAX_REVIEW_FILES).collect();
        for file in &offered {
            let preview = match tokio::fs::read_to_string(self.repo_root.join(file.as_str())).await {
                Ok(content) => truncate_chars(&content, REVIEW_PREVIEW_CHARS).0.to_string(),
                Err(_) => continue,
            };
            prompt.push_str(&format!("## {}\n\n```\n{}\n```\n\n", file, preview));
        }

        let value = self
            .generate(&prompt, &review_schema(), "file_discovery", "config review")
            .await?;
        let payload: ReviewPayload = serde_json::from_value(value)
            .map_err(|e| RulectlError::LlmApi(format!("invalid review response: {}", e)))?;

        let allowed: BTreeSet<&str> = offered.iter().map(|f| f.as_str()).collect();
        let mut included: Vec<String> = payload
            .include
            .into_iter()
            .filter(|f| allowed.contains(f.as_str()))
            .collect();
        included.sort();
        included.dedup();
        Ok(included)
    }

    fn set_context(&self, summary: &str) {
        *self
            .structure
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = summary.to_string();
    }

    async fn health_check(&self) -> Result<bool> {
        self.provider.health_check().await
    }

    fn name(&self) -> &str {
        self.provider.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::provider::{LlmProvider, LlmResponse, TokenUsage};
    use crate::ai::usage::UsageTracker;
    use crate::types::{ErrorClassifier, ItemErrorKind};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct ScriptedProvider {
        reply: std::result::Result<Value, u16>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn generate(&self, _prompt: &str, _schema: &Value) -> Result<LlmResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Ok(v) => Ok(LlmResponse::new(v.clone(), TokenUsage::new(120, 30), Duration::ZERO)),
                Err(status) => Err(RulectlError::Llm(ErrorClassifier::classify_http_status(
                    *status, "scripted", "scripted",
                ))),
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }

        fn model(&self) -> &str {
            "scripted-1"
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
    }

    fn scripted_backend(reply: std::result::Result<Value, u16>) -> (TempDir, LlmAnalysisBackend) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("lib.rs"), "pub fn a() -> Result<(), E> { Ok(()) }\n")
            .unwrap();
        std::fs::write(dir.path().join("app.toml"), "[server]\nport = 1\n").unwrap();
        let provider = Arc::new(ScriptedProvider {
            reply,
            calls: AtomicUsize::new(0),
        });
        let backend = LlmAnalysisBackend::new(provider, dir.path());
        (dir, backend)
    }

    #[tokio::test]
    async fn test_process_wraps_rules() {
        let (_dir, backend) = scripted_backend(Ok(json!({
            "rules": [{
                "slug": "return-result",
                "description": "Return Result",
                "scope_glob": "**/*.rs",
                "bullets": ["Return Result from fallible fns"]
            }]
        })));
        let value = backend.process("lib.rs").await.unwrap();
        let rules: FileRules = serde_json::from_value(value).unwrap();
        assert_eq!(rules.file, "lib.rs");
        assert_eq!(rules.rules.len(), 1);
        assert!(rules.rules[0].evidence_lines.is_empty());
    }

    #[tokio::test]
    async fn test_process_classifies_failures() {
        let (_dir, backend) = scripted_backend(Err(429));
        let err = backend.process("lib.rs").await.unwrap_err();
        assert!(err.is_rate_limit());

        let (_dir, backend) = scripted_backend(Err(401));
        let err = backend.process("lib.rs").await.unwrap_err();
        assert_eq!(err.kind, ItemErrorKind::Permanent);

        let (_dir, backend) = scripted_backend(Ok(json!({"rules": "nope"})));
        let err = backend.process("lib.rs").await.unwrap_err();
        assert_eq!(err.kind, ItemErrorKind::Transient);

        let err = backend.process("missing.rs").await.unwrap_err();
        assert_eq!(err.kind, ItemErrorKind::Permanent);
    }

    #[tokio::test]
    async fn test_review_filters_unknown_paths() {
        let (_dir, backend) = scripted_backend(Ok(json!({"include": ["app.toml", "/etc/passwd"]})));
        let included = backend
            .review_skipped(&["app.toml".to_string()])
            .await
            .unwrap();
        assert_eq!(included, vec!["app.toml"]);
        assert!(backend.review_skipped(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_usage_attributed_to_phase() {
        let (_dir, backend) = scripted_backend(Ok(json!({"rules": [], "include": []})));
        let usage = Arc::new(UsageTracker::new("scripted", "scripted-1"));
        let backend = backend.with_usage(Arc::clone(&usage));

        backend.process("lib.rs").await.unwrap();
        backend.process("lib.rs").await.unwrap();
        backend.review_skipped(&["app.toml".to_string()]).await.unwrap();

        let summary = usage.snapshot();
        assert_eq!(summary.phases["file_analysis"].calls, 2);
        assert_eq!(summary.phases["file_analysis"].input_tokens, 240);
        assert_eq!(summary.phases["file_discovery"].output_tokens, 30);
        assert_eq!(summary.total.total_tokens(), 450);
        assert_eq!(summary.estimated_cost_usd, None);
    }

    #[tokio::test]
    async fn test_context_reaches_prompt() {
        let (_dir, backend) = scripted_backend(Ok(json!({"rules": []})));
        assert!(!backend.build_prompt("lib.rs", "x").contains("# Repository"));
        backend.set_context("Rust library, 3 files");
        assert!(
            backend
                .build_prompt("lib.rs", "x")
                .contains("Rust library, 3 files")
        );
    }

    #[test]
    fn test_truncate_chars_boundary() {
        let (body, truncated) = truncate_chars("héllo", 2);
        assert_eq!(body, "hé");
        assert!(truncated);
        assert_eq!(truncate_chars("abc", 5), ("abc", false));
    }
}
