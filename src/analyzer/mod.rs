//! Repository Analysis
//!
//! The collaborators driven by the pipeline phases:
//! - File scanning with gitignore support
//! - Language-agnostic structure summary
//! - Per-file git history
//! - Rule clustering and synthesis

pub mod git;
pub mod scanner;
pub mod structure;
pub mod synthesis;

pub use git::{FileHistory, GitAnalyzer, GitCli, importance_weights};
pub use scanner::{FileDiscovery, FileScanner};
pub use structure::{RepositoryStructure, StructureAnalyzer};
pub use synthesis::{
    CandidateRule, FileRules, LlmRuleSynthesizer, ProposedRule, RuleCluster, RuleSynthesizer,
    SynthesizedRule,
};
