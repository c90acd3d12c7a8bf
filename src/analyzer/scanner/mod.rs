pub mod file_scanner;

pub use file_scanner::{FileKind, FileScanner, ScannedFile};

use std::path::Path;

use crate::types::Result;

/// Source of the work items for per-file analysis
pub trait FileDiscovery: Send + Sync {
    /// Repository-relative paths in a stable order
    fn list(&self, repo: &Path) -> Result<Vec<String>>;

    /// Files held back from analysis pending review
    fn skipped_config(&self, _repo: &Path) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}
