use ignore::{DirEntry, WalkBuilder};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use super::FileDiscovery;
use crate::constants::{analysis, paths};
use crate::types::{Result, RulectlError};

/// Directories never worth descending into, matched against any path component
const DEFAULT_SKIP_DIRS: &[&str] = &[
    "node_modules",
    "target",
    ".git",
    "build",
    "dist",
    "__pycache__",
    "vendor",
    ".venv",
    paths::STATE_DIR,
];

/// Configuration formats. Skipped by default and offered for review instead.
const CONFIG_EXTENSIONS: &[&str] = &[
    "json", "yaml", "yml", "toml", "ini", "cfg", "conf", "xml", "plist", "properties", "env",
    "gradle", "sbt", "cmake", "mk", "dockerfile",
];

const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "icns", "tiff", "webp", "svg", "psd", "mp3", "wav",
    "ogg", "flac", "mp4", "mov", "avi", "mkv", "webm", "zip", "tar", "gz", "bz2", "xz", "7z",
    "rar", "jar", "war", "exe", "dll", "so", "dylib", "a", "o", "obj", "class", "pyc", "wasm",
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "ttf", "otf", "woff", "woff2", "eot",
    "db", "sqlite", "bin", "dat", "lock",
];

/// How a discovered file is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Text file sent to per-file analysis
    Analyzable,
    /// Configuration file, reviewed before inclusion
    Config,
    /// Binary or otherwise unreadable
    Binary,
}

#[derive(Debug, Clone)]
pub struct ScannedFile {
    /// Path relative to the scan root, `/`-separated
    pub path: String,
    pub size: u64,
    pub kind: FileKind,
}

/// Gitignore-aware repository walker
pub struct FileScanner {
    exclude: Arc<Vec<glob::Pattern>>,
    max_file_size: u64,
}

impl Default for FileScanner {
    fn default() -> Self {
        Self {
            exclude: Arc::new(Vec::new()),
            max_file_size: analysis::MAX_FILE_SIZE,
        }
    }
}

impl FileScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Glob patterns relative to the repository root
    pub fn with_exclude(mut self, patterns: &[String]) -> Result<Self> {
        let compiled = patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p).map_err(|e| {
                    RulectlError::Config(format!("Invalid exclude pattern '{}': {}", p, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.exclude = Arc::new(compiled);
        Ok(self)
    }

    pub fn with_max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self
    }

    /// Walk `root` and classify every regular file, sorted by path
    pub fn scan(&self, root: &Path) -> Result<Vec<ScannedFile>> {
        if !root.is_dir() {
            return Err(RulectlError::Repository(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        let exclude = Arc::clone(&self.exclude);
        let walk_root = root.to_path_buf();
        let walker = WalkBuilder::new(root)
            .hidden(false)
            .git_ignore(true)
            .git_global(true)
            .git_exclude(true)
            .require_git(false)
            .follow_links(false)
            .filter_entry(move |entry| !is_excluded_entry(&walk_root, entry, &exclude))
            .build();

        let mut files = Vec::new();
        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let Some(relative) = relative_path(root, entry.path()) else {
                continue;
            };
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if metadata.len() == 0 || metadata.len() > self.max_file_size {
                continue;
            }
            files.push(ScannedFile {
                kind: classify(entry.path()),
                path: relative,
                size: metadata.len(),
            });
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }
}

impl FileDiscovery for FileScanner {
    fn list(&self, repo: &Path) -> Result<Vec<String>> {
        Ok(self
            .scan(repo)?
            .into_iter()
            .filter(|f| f.kind == FileKind::Analyzable)
            .map(|f| f.path)
            .collect())
    }

    fn skipped_config(&self, repo: &Path) -> Result<Vec<String>> {
        Ok(self
            .scan(repo)?
            .into_iter()
            .filter(|f| f.kind == FileKind::Config)
            .map(|f| f.path)
            .collect())
    }
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

fn is_excluded_entry(root: &Path, entry: &DirEntry, exclude: &[glob::Pattern]) -> bool {
    let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
    if is_dir
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| DEFAULT_SKIP_DIRS.contains(&name))
    {
        return true;
    }

    let Some(relative) = relative_path(root, entry.path()) else {
        return false;
    };
    // A directory is excluded when anything inside it would be
    let candidate = if is_dir {
        format!("{}/_", relative)
    } else {
        relative
    };
    exclude.iter().any(|p| p.matches(&candidate))
}

fn classify(path: &Path) -> FileKind {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_lowercase();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    if name == "dockerfile" || CONFIG_EXTENSIONS.contains(&extension.as_str()) {
        return FileKind::Config;
    }
    if BINARY_EXTENSIONS.contains(&extension.as_str()) || name.ends_with(".min.js") {
        return FileKind::Binary;
    }
    if looks_binary(path) {
        FileKind::Binary
    } else {
        FileKind::Analyzable
    }
}

/// NUL byte in the first 512 bytes
fn looks_binary(path: &Path) -> bool {
    let mut buffer = [0u8; 512];
    match std::fs::File::open(path).and_then(|mut f| f.read(&mut buffer)) {
        Ok(n) => buffer[..n].contains(&0),
        Err(_) => true,
    }
}
