//! Repository Structure Analyzer
//!
//! Builds a language-agnostic map of the repository: file type counts,
//! top-level directories, and build/entry-point markers. The map is cached
//! and quoted in every per-file prompt as project context.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use super::scanner::{FileKind, FileScanner};
use crate::types::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMarkerType {
    /// package.json, Cargo.toml, build.gradle, etc.
    PackageDefinition,
    /// main.rs, index.ts, app.py, etc.
    MainEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildMarker {
    pub path: String,
    pub marker_type: BuildMarkerType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryStructure {
    pub total_files: usize,
    /// Extension (without dot, `""` for none) to file count
    pub file_types: BTreeMap<String, usize>,
    /// Top-level directory (`.` for the root) to file count
    pub directories: BTreeMap<String, usize>,
    pub build_markers: Vec<BuildMarker>,
}

impl RepositoryStructure {
    /// Compact description for prompts
    pub fn summary(&self) -> String {
        let mut types: Vec<_> = self.file_types.iter().collect();
        types.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        let types = types
            .iter()
            .take(8)
            .map(|(ext, n)| {
                if ext.is_empty() {
                    format!("(none) {}", n)
                } else {
                    format!(".{} {}", ext, n)
                }
            })
            .collect::<Vec<_>>()
            .join(", ");

        let dirs = self
            .directories
            .keys()
            .take(12)
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");

        let markers = self
            .build_markers
            .iter()
            .map(|m| m.path.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "{} files. File types: {}. Top-level directories: {}. Build files: {}.",
            self.total_files,
            types,
            dirs,
            if markers.is_empty() { "none" } else { markers.as_str() }
        )
    }
}

const BUILD_FILE_PATTERNS: &[(&str, BuildMarkerType)] = &[
    ("package.json", BuildMarkerType::PackageDefinition),
    ("Cargo.toml", BuildMarkerType::PackageDefinition),
    ("build.gradle", BuildMarkerType::PackageDefinition),
    ("build.gradle.kts", BuildMarkerType::PackageDefinition),
    ("pom.xml", BuildMarkerType::PackageDefinition),
    ("pyproject.toml", BuildMarkerType::PackageDefinition),
    ("setup.py", BuildMarkerType::PackageDefinition),
    ("go.mod", BuildMarkerType::PackageDefinition),
    ("Gemfile", BuildMarkerType::PackageDefinition),
    ("main.rs", BuildMarkerType::MainEntry),
    ("main.ts", BuildMarkerType::MainEntry),
    ("main.py", BuildMarkerType::MainEntry),
    ("main.go", BuildMarkerType::MainEntry),
    ("main.kt", BuildMarkerType::MainEntry),
    ("main.java", BuildMarkerType::MainEntry),
    ("index.ts", BuildMarkerType::MainEntry),
    ("index.js", BuildMarkerType::MainEntry),
    ("app.ts", BuildMarkerType::MainEntry),
    ("app.py", BuildMarkerType::MainEntry),
];

pub struct StructureAnalyzer<'a> {
    scanner: &'a FileScanner,
}

impl<'a> StructureAnalyzer<'a> {
    pub fn new(scanner: &'a FileScanner) -> Self {
        Self { scanner }
    }

    pub fn analyze(&self, root: &Path) -> Result<RepositoryStructure> {
        let mut structure = RepositoryStructure::default();

        for file in self.scanner.scan(root)? {
            let name = file.path.rsplit('/').next().unwrap_or(&file.path);
            if let Some((_, marker_type)) = BUILD_FILE_PATTERNS.iter().find(|(p, _)| *p == name) {
                structure.build_markers.push(BuildMarker {
                    path: file.path.clone(),
                    marker_type: *marker_type,
                });
            }
            if file.kind == FileKind::Binary {
                continue;
            }

            structure.total_files += 1;
            let extension = name
                .rsplit_once('.')
                .filter(|(stem, _)| !stem.is_empty())
                .map(|(_, ext)| ext.to_lowercase())
                .unwrap_or_default();
            *structure.file_types.entry(extension).or_default() += 1;

            let top = match file.path.split_once('/') {
                Some((dir, _)) => dir.to_string(),
                None => ".".to_string(),
            };
            *structure.directories.entry(top).or_default() += 1;
        }

        tracing::debug!(
            files = structure.total_files,
            markers = structure.build_markers.len(),
            "Structure analysis complete"
        );
        Ok(structure)
    }
}
