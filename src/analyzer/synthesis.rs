//! Rule Synthesis
//!
//! Turns per-file rule proposals into a ranked set of repository rules:
//!
//! 1. Attach git edit counts to every proposal ([`candidate_rules`])
//! 2. Group proposals by topic keywords ([`cluster_rules`])
//! 3. Score clusters by support and churn, drop weak ones ([`rank_clusters`])
//! 4. Merge each surviving cluster into one canonical rule ([`choose_canonical`])
//! 5. Let the LLM tighten merged rules ([`LlmRuleSynthesizer`])

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tracing::debug;

use super::git::{DEFAULT_IMPORTANCE, FileHistory};
use crate::ai::provider::SharedProvider;
use crate::ai::timeout::with_timeout;
use crate::ai::usage::SharedUsage;
use crate::types::ItemError;

/// Longest bullet kept in a merged rule
pub const MAX_BULLET_CHARS: usize = 120;

/// Bullets kept in a merged rule
pub const MAX_BULLETS: usize = 5;

const MAX_SCORE: f64 = 10.0;

/// Topic groups, checked in order against slug and description
const KEYWORD_GROUPS: &[(&str, &[&str], &str)] = &[
    (
        "path-handling",
        &["pathlib", "path", "file-path", "directory"],
        "Build and manipulate file paths through the platform path APIs",
    ),
    (
        "git-operations",
        &["git", "repository", "branch", "commit", "repo"],
        "Follow consistent patterns for git repository operations",
    ),
    (
        "error-handling",
        &["error", "exception", "handle", "catch", "result"],
        "Propagate and report errors consistently",
    ),
    (
        "api-management",
        &["api", "key", "credential", "authentication", "token"],
        "Manage API keys and credentials securely",
    ),
    (
        "llm-integration",
        &["llm", "prompt", "model", "generate", "client"],
        "Use the shared client patterns for language-model calls",
    ),
    (
        "build-process",
        &["build", "compile", "executable", "platform", "release"],
        "Follow consistent build and compilation patterns",
    ),
    (
        "testing-patterns",
        &["test", "mock", "fixture", "temporary", "temp"],
        "Use consistent testing patterns and utilities",
    ),
    (
        "configuration",
        &["config", "setting", "env", "environment"],
        "Handle configuration and environment variables consistently",
    ),
    (
        "file-operations",
        &["file", "read", "write", "text", "binary"],
        "Follow consistent patterns for file reading and writing",
    ),
    (
        "validation",
        &["validate", "check", "verify", "ensure", "confirm"],
        "Validate inputs and state at clear boundaries",
    ),
    (
        "data-structures",
        &["struct", "class", "enum", "type", "schema"],
        "Model data with explicit, well-named types",
    ),
    (
        "cli-patterns",
        &["cli", "command", "entry-point", "main", "console"],
        "Follow consistent CLI patterns and entry points",
    ),
    (
        "package-management",
        &["package", "dependency", "install", "requirements", "crate"],
        "Declare and update dependencies consistently",
    ),
    (
        "code-style",
        &["naming", "convention", "format", "style", "pattern"],
        "Follow consistent naming and style conventions",
    ),
];

// =============================================================================
// Types
// =============================================================================

/// One rule as proposed by per-file analysis
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProposedRule {
    pub slug: String,
    pub description: String,
    #[serde(default = "default_scope")]
    pub scope_glob: String,
    #[serde(default)]
    pub bullets: Vec<String>,
    #[serde(default)]
    pub evidence_lines: Vec<u32>,
}

fn default_scope() -> String {
    "**/*".to_string()
}

/// Output of analyzing one file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileRules {
    pub file: String,
    #[serde(default)]
    pub rules: Vec<ProposedRule>,
}

/// A proposal tagged with where it came from and how often that file changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRule {
    #[serde(flatten)]
    pub rule: ProposedRule,
    pub file: String,
    pub edit_count: u32,
    pub importance: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterMeta {
    pub support_files: usize,
    pub total_edits: u32,
    /// `min(10, 2 * support_files + ln(1 + total_edits))`
    pub score: f64,
    /// Mean importance weight of the supporting files
    pub importance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCluster {
    pub key: String,
    pub rules: Vec<CandidateRule>,
    pub meta: ClusterMeta,
}

impl RuleCluster {
    fn new(key: String, rules: Vec<CandidateRule>) -> Self {
        let files: BTreeSet<&str> = rules.iter().map(|r| r.file.as_str()).collect();
        let total_edits = rules.iter().map(|r| r.edit_count).sum::<u32>();
        let mut importance_by_file: BTreeMap<&str, f64> = BTreeMap::new();
        for rule in &rules {
            importance_by_file.insert(rule.file.as_str(), rule.importance);
        }
        let importance = if importance_by_file.is_empty() {
            0.0
        } else {
            importance_by_file.values().sum::<f64>() / importance_by_file.len() as f64
        };

        let meta = ClusterMeta {
            support_files: files.len(),
            total_edits,
            score: (files.len() as f64 * 2.0 + f64::from(total_edits).ln_1p()).min(MAX_SCORE),
            importance,
        };
        Self { key, rules, meta }
    }
}

/// Final rule written to the report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesizedRule {
    pub slug: String,
    pub description: String,
    pub scope_glob: String,
    pub bullets: Vec<String>,
    pub support_files: usize,
    pub score: f64,
}

impl SynthesizedRule {
    fn from_canonical(rule: ProposedRule, meta: &ClusterMeta) -> Self {
        Self {
            slug: rule.slug,
            description: rule.description,
            scope_glob: rule.scope_glob,
            bullets: rule.bullets,
            support_files: meta.support_files,
            score: meta.score,
        }
    }
}

// =============================================================================
// Clustering
// =============================================================================

/// Flatten per-file proposals, attaching edit counts and importance weights
pub fn candidate_rules(
    analyses: &[FileRules],
    histories: &HashMap<String, FileHistory>,
    weights: &BTreeMap<String, f64>,
) -> Vec<CandidateRule> {
    analyses
        .iter()
        .flat_map(|analysis| {
            let edit_count = histories.get(&analysis.file).map_or(0, |h| h.total);
            let importance = weights
                .get(&analysis.file)
                .copied()
                .unwrap_or(DEFAULT_IMPORTANCE);
            analysis.rules.iter().map(move |rule| CandidateRule {
                rule: rule.clone(),
                file: analysis.file.clone(),
                edit_count,
                importance,
            })
        })
        .collect()
}

/// Cluster key: first matching topic group, else the first two slug words
pub fn cluster_key(rule: &ProposedRule) -> String {
    let text = format!("{} {}", rule.slug, rule.description).to_lowercase();
    if let Some((group, _, _)) = KEYWORD_GROUPS
        .iter()
        .find(|(_, keywords, _)| keywords.iter().any(|k| text.contains(k)))
    {
        return (*group).to_string();
    }

    let parts: Vec<&str> = rule.slug.split('-').filter(|p| !p.is_empty()).collect();
    if parts.len() >= 2 {
        format!("{}-{}", parts[0], parts[1])
    } else {
        slugify(&rule.slug)
    }
}

pub fn cluster_rules(candidates: Vec<CandidateRule>) -> BTreeMap<String, RuleCluster> {
    let mut grouped: BTreeMap<String, Vec<CandidateRule>> = BTreeMap::new();
    for candidate in candidates {
        grouped
            .entry(cluster_key(&candidate.rule))
            .or_default()
            .push(candidate);
    }
    grouped
        .into_iter()
        .map(|(key, rules)| (key.clone(), RuleCluster::new(key, rules)))
        .collect()
}

/// Minimum cluster score, lower for young repositories
pub fn score_threshold(candidates: &[CandidateRule]) -> f64 {
    if candidates.is_empty() {
        return 0.0;
    }
    let avg_edits =
        candidates.iter().map(|c| f64::from(c.edit_count)).sum::<f64>() / candidates.len() as f64;
    let files: BTreeSet<&str> = candidates.iter().map(|c| c.file.as_str()).collect();

    if avg_edits <= 2.0 && files.len() <= 10 {
        1.5
    } else if avg_edits <= 5.0 {
        2.0
    } else {
        3.0
    }
}

/// Clusters at or above `threshold`, best first
pub fn rank_clusters(clusters: BTreeMap<String, RuleCluster>, threshold: f64) -> Vec<RuleCluster> {
    let mut ranked: Vec<RuleCluster> = clusters
        .into_values()
        .filter(|c| c.meta.score >= threshold)
        .collect();
    ranked.sort_by(|a, b| {
        b.meta
            .score
            .total_cmp(&a.meta.score)
            .then(b.meta.importance.total_cmp(&a.meta.importance))
            .then(a.key.cmp(&b.key))
    });
    ranked
}

/// Merge a cluster into one rule
///
/// The base is the proposal with the most bullets, ties broken by the lowest
/// mean evidence line. Bullets from every member are trimmed, deduplicated,
/// and capped. The scope is the most common glob among members.
pub fn choose_canonical(cluster: &RuleCluster) -> ProposedRule {
    let mean_line = |r: &CandidateRule| {
        if r.rule.evidence_lines.is_empty() {
            0.0
        } else {
            r.rule.evidence_lines.iter().map(|l| f64::from(*l)).sum::<f64>()
                / r.rule.evidence_lines.len() as f64
        }
    };
    let Some(base) = cluster.rules.iter().min_by(|a, b| {
        b.rule
            .bullets
            .len()
            .cmp(&a.rule.bullets.len())
            .then(mean_line(a).total_cmp(&mean_line(b)))
    }) else {
        return ProposedRule {
            slug: cluster.key.clone(),
            scope_glob: default_scope(),
            ..Default::default()
        };
    };

    let mut canonical = base.rule.clone();
    if cluster.rules.len() > 1 {
        canonical.slug = cluster.key.clone();
        canonical.description = KEYWORD_GROUPS
            .iter()
            .find(|(group, _, _)| *group == cluster.key)
            .map(|(_, _, description)| description.to_string())
            .or_else(|| {
                cluster
                    .rules
                    .iter()
                    .map(|r| &r.rule.description)
                    .max_by_key(|d| d.len())
                    .cloned()
            })
            .unwrap_or(canonical.description);
    }

    let mut seen = BTreeSet::new();
    canonical.bullets = cluster
        .rules
        .iter()
        .flat_map(|r| r.rule.bullets.iter())
        .map(|b| truncate_chars(b, MAX_BULLET_CHARS).trim().to_string())
        .filter(|b| !b.is_empty() && seen.insert(b.clone()))
        .take(MAX_BULLETS)
        .collect();

    let mut glob_counts: Vec<(&str, usize)> = Vec::new();
    for rule in &cluster.rules {
        match glob_counts.iter_mut().find(|(g, _)| *g == rule.rule.scope_glob) {
            Some((_, n)) => *n += 1,
            None => glob_counts.push((&rule.rule.scope_glob, 1)),
        }
    }
    // First-seen glob wins ties
    canonical.scope_glob = glob_counts
        .iter()
        .fold(None::<(&str, usize)>, |best, &(g, n)| match best {
            Some((_, m)) if m >= n => best,
            _ => Some((g, n)),
        })
        .map_or_else(default_scope, |(g, _)| g.to_string());

    canonical
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.to_lowercase().chars() {
        if c.is_alphanumeric() {
            slug.push(c);
        } else if (c.is_whitespace() || c == '-' || c == '_') && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

// =============================================================================
// Synthesizer
// =============================================================================

/// Per-cluster synthesis step
#[async_trait]
pub trait RuleSynthesizer: Send + Sync {
    async fn synthesize(&self, cluster: &RuleCluster) -> std::result::Result<SynthesizedRule, ItemError>;
}

/// Audits merged rules with the LLM; single-proposal clusters pass through
pub struct LlmRuleSynthesizer {
    provider: SharedProvider,
    timeout: Duration,
    usage: Option<SharedUsage>,
}

impl LlmRuleSynthesizer {
    pub fn new(provider: SharedProvider, timeout: Duration) -> Self {
        Self {
            provider,
            timeout,
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: SharedUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    fn build_prompt(cluster: &RuleCluster, merged: &ProposedRule) -> String {
        let originals: Vec<&ProposedRule> = cluster.rules.iter().map(|r| &r.rule).collect();
        let mut prompt = String::new();
        prompt.push_str("# Task\n\n");
        prompt.push_str(
            "Several files proposed similar coding conventions. They were merged \
             mechanically into one rule. Rewrite the merged rule so it is accurate \
             for every original proposal.\n\n",
        );
        prompt.push_str("- Bullets use the imperative voice\n");
        prompt.push_str(&format!(
            "- At most {} bullets, each at most {} characters\n",
            MAX_BULLETS, MAX_BULLET_CHARS
        ));
        prompt.push_str("- Keep the slug in kebab-case\n");
        prompt.push_str("- Keep the scope glob unless it is clearly too wide or too narrow\n\n");
        prompt.push_str(&format!("# Topic\n\n{}\n\n", cluster.key));
        prompt.push_str(&format!(
            "# Merged Rule\n\n```json\n{}\n```\n\n",
            serde_json::to_string_pretty(merged).unwrap_or_default()
        ));
        prompt.push_str(&format!(
            "# Original Proposals\n\n```json\n{}\n```\n",
            serde_json::to_string_pretty(&originals).unwrap_or_default()
        ));
        prompt
    }
}

pub fn audited_rule_schema() -> Value {
    json!({
        "type": "object",
        "required": ["slug", "description", "scope_glob", "bullets"],
        "additionalProperties": false,
        "properties": {
            "slug": {"type": "string", "description": "kebab-case identifier"},
            "description": {"type": "string", "description": "One sentence summary of the rule"},
            "scope_glob": {"type": "string", "description": "Glob of files the rule applies to"},
            "bullets": {
                "type": "array",
                "items": {"type": "string"},
                "maxItems": MAX_BULLETS
            }
        }
    })
}

#[async_trait]
impl RuleSynthesizer for LlmRuleSynthesizer {
    async fn synthesize(&self, cluster: &RuleCluster) -> std::result::Result<SynthesizedRule, ItemError> {
        let merged = choose_canonical(cluster);
        if cluster.rules.len() < 2 {
            return Ok(SynthesizedRule::from_canonical(merged, &cluster.meta));
        }

        let prompt = Self::build_prompt(cluster, &merged);
        let response = with_timeout(
            self.timeout,
            self.provider.generate(&prompt, &audited_rule_schema()),
            "rule audit",
        )
        .await
        .map_err(|e| ItemError::from_error(&e, self.provider.name()))?;
        if let Some(usage) = &self.usage {
            usage.record("rule_synthesis", &response.usage);
        }

        let audited: ProposedRule = serde_json::from_value(response.content)
            .map_err(|e| ItemError::transient(format!("invalid audited rule: {}", e)))?;
        debug!(cluster = %cluster.key, slug = %audited.slug, "Rule audited");

        let mut rule = ProposedRule {
            slug: slugify(&audited.slug),
            bullets: audited
                .bullets
                .iter()
                .map(|b| truncate_chars(b.trim(), MAX_BULLET_CHARS).to_string())
                .filter(|b| !b.is_empty())
                .take(MAX_BULLETS)
                .collect(),
            ..audited
        };
        if rule.slug.is_empty() {
            rule.slug = merged.slug;
        }
        if rule.bullets.is_empty() {
            rule.bullets = merged.bullets;
        }
        Ok(SynthesizedRule::from_canonical(rule, &cluster.meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal(slug: &str, description: &str, bullets: &[&str], lines: &[u32]) -> ProposedRule {
        ProposedRule {
            slug: slug.to_string(),
            description: description.to_string(),
            scope_glob: "src/**/*.rs".to_string(),
            bullets: bullets.iter().map(|b| b.to_string()).collect(),
            evidence_lines: lines.to_vec(),
        }
    }

    fn candidate(file: &str, rule: ProposedRule, edits: u32) -> CandidateRule {
        CandidateRule {
            rule,
            file: file.to_string(),
            edit_count: edits,
            importance: DEFAULT_IMPORTANCE,
        }
    }

    #[test]
    fn test_cluster_key_uses_keyword_groups() {
        let rule = proposal("wrap-errors", "Wrap errors with context", &[], &[]);
        assert_eq!(cluster_key(&rule), "error-handling");

        let rule = proposal("snake-case-modules", "Modules are lowercase", &[], &[]);
        assert_eq!(cluster_key(&rule), "snake-case");

        let rule = proposal("Immutability", "Prefer immutability", &[], &[]);
        assert_eq!(cluster_key(&rule), "immutability");
    }

    #[test]
    fn test_cluster_meta_score() {
        let clusters = cluster_rules(vec![
            candidate("a.rs", proposal("wrap-errors", "x", &[], &[]), 3),
            candidate("b.rs", proposal("error-enum", "y", &[], &[]), 4),
            candidate("b.rs", proposal("error-context", "z", &[], &[]), 0),
        ]);
        let cluster = &clusters["error-handling"];
        assert_eq!(cluster.rules.len(), 3);
        assert_eq!(cluster.meta.support_files, 2);
        assert_eq!(cluster.meta.total_edits, 7);
        assert!((cluster.meta.score - (4.0 + 8f64.ln())).abs() < 1e-9);
    }

    #[test]
    fn test_score_capped() {
        let rules = (0..8)
            .map(|i| candidate(&format!("f{}.rs", i), proposal("test-fixtures", "x", &[], &[]), 100))
            .collect();
        let clusters = cluster_rules(rules);
        assert_eq!(clusters["testing-patterns"].meta.score, MAX_SCORE);
    }

    #[test]
    fn test_choose_canonical_merges() {
        let long = "x".repeat(200);
        let cluster = RuleCluster::new(
            "error-handling".to_string(),
            vec![
                candidate("a.rs", proposal("wrap-errors", "short", &["Use ?", "Add context"], &[40]), 1),
                candidate(
                    "b.rs",
                    proposal("error-enum", "longer description", &["Use ?", &long, "One enum"], &[10]),
                    1,
                ),
                candidate("c.rs", proposal("error-log", "z", &["Log once", "Use ?", "a", "b"], &[90]), 1),
            ],
        );
        let canonical = choose_canonical(&cluster);
        assert_eq!(canonical.slug, "error-handling");
        assert_eq!(canonical.description, "Propagate and report errors consistently");
        assert_eq!(canonical.bullets.len(), MAX_BULLETS);
        assert_eq!(canonical.bullets[0], "Use ?");
        assert_eq!(canonical.bullets[2].chars().count(), MAX_BULLET_CHARS);
        assert_eq!(canonical.scope_glob, "src/**/*.rs");
        // Most bullets wins the base
        assert_eq!(canonical.evidence_lines, vec![90]);
    }

    #[test]
    fn test_choose_canonical_single_rule_keeps_slug() {
        let cluster = RuleCluster::new(
            "immutability".to_string(),
            vec![candidate("a.rs", proposal("immutability", "Prefer let", &["No mut"], &[]), 0)],
        );
        let canonical = choose_canonical(&cluster);
        assert_eq!(canonical.slug, "immutability");
        assert_eq!(canonical.description, "Prefer let");
    }

    #[test]
    fn test_rank_and_threshold() {
        let candidates = vec![
            candidate("a.rs", proposal("wrap-errors", "x", &[], &[]), 1),
            candidate("b.rs", proposal("error-enum", "y", &[], &[]), 1),
            candidate("c.rs", proposal("lonely-rule", "z", &[], &[]), 0),
        ];
        let threshold = score_threshold(&candidates);
        assert_eq!(threshold, 1.5);
        let ranked = rank_clusters(cluster_rules(candidates), 2.5);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].key, "error-handling");
    }

    #[test]
    fn test_candidate_rules_attach_history() {
        let analyses = vec![FileRules {
            file: "a.rs".into(),
            rules: vec![proposal("x-y", "d", &[], &[])],
        }];
        let mut histories = HashMap::new();
        histories.insert(
            "a.rs".to_string(),
            FileHistory {
                path: "a.rs".into(),
                total: 7,
                ..Default::default()
            },
        );
        let candidates = candidate_rules(&analyses, &histories, &BTreeMap::new());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].edit_count, 7);
        assert_eq!(candidates[0].importance, DEFAULT_IMPORTANCE);
    }

    struct AuditProvider;

    #[async_trait]
    impl crate::ai::LlmProvider for AuditProvider {
        async fn generate(&self, _prompt: &str, _schema: &Value) -> crate::types::Result<crate::ai::LlmResponse> {
            Ok(crate::ai::LlmResponse::new(
                json!({
                    "slug": "Error Handling",
                    "description": "Propagate errors with context",
                    "scope_glob": "src/**/*.rs",
                    "bullets": ["Use ?", "  "]
                }),
                crate::ai::TokenUsage::new(800, 120),
                Duration::ZERO,
            ))
        }

        fn name(&self) -> &str {
            "audit"
        }

        fn model(&self) -> &str {
            "audit-1"
        }

        async fn health_check(&self) -> crate::types::Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_audit_records_usage_and_cleans_rule() {
        let usage = std::sync::Arc::new(crate::ai::UsageTracker::new("audit", "audit-1"));
        let synthesizer = LlmRuleSynthesizer::new(std::sync::Arc::new(AuditProvider), Duration::from_secs(5))
            .with_usage(std::sync::Arc::clone(&usage));

        let pair = RuleCluster::new(
            "error-handling".to_string(),
            vec![
                candidate("a.rs", proposal("wrap-errors", "x", &["Use ?"], &[]), 1),
                candidate("b.rs", proposal("error-enum", "y", &["One enum"], &[]), 1),
            ],
        );
        let rule = synthesizer.synthesize(&pair).await.unwrap();
        assert_eq!(rule.slug, "error-handling");
        assert_eq!(rule.bullets, vec!["Use ?"]);
        assert_eq!(rule.support_files, 2);

        // Single proposals skip the audit call
        let single = RuleCluster::new(
            "immutability".to_string(),
            vec![candidate("a.rs", proposal("immutability", "Prefer let", &["No mut"], &[]), 0)],
        );
        synthesizer.synthesize(&single).await.unwrap();

        let summary = usage.snapshot();
        assert_eq!(summary.phases["rule_synthesis"].calls, 1);
        assert_eq!(summary.total.total_tokens(), 920);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Use Result, not panic!"), "use-result-not-panic");
        assert_eq!(slugify("--a__b--"), "a-b");
    }
}
