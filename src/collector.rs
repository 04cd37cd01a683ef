//! Bounded file collection over a checked-out repository.
//!
//! Walks the tree in file-name order, pruning ignored directories and
//! skipping ignored extensions, oversized files, unreadable files, and
//! anything containing a NUL byte. Once more than `max_files` candidates
//! have been seen the walk stops and returns what it has gathered.

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::config::LimitsConfig;
use crate::models::SourceFile;

/// Directory names that are never descended into.
pub const IGNORED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "dist",
    "build",
    "target",
    "__pycache__",
    ".venv",
    "venv",
    ".mypy_cache",
    ".pytest_cache",
    ".cache",
];

/// Lower-cased extensions (without the dot) of binary and lock files.
pub const IGNORED_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "svg", "ico", "bmp", "webp", "lock", "pdf", "zip", "gz", "tar",
    "jar", "exe", "dll", "so", "dylib", "o", "a", "class", "wasm", "woff", "woff2", "ttf", "eot",
    "mp3", "mp4",
];

/// Caps applied while collecting.
#[derive(Debug, Clone)]
pub struct CollectLimits {
    pub max_files: usize,
    pub max_file_size_kb: u64,
    pub exclude_globs: Vec<String>,
}

impl From<&LimitsConfig> for CollectLimits {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            max_files: limits.max_files,
            max_file_size_kb: limits.max_file_size_kb,
            exclude_globs: limits.exclude_globs.clone(),
        }
    }
}

/// Language tag derived from the lower-cased extension, `"text"` if none.
pub fn detect_language(path: &Path) -> String {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| "text".to_string())
}

fn is_ignored_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && IGNORED_DIRS
            .iter()
            .any(|name| entry.file_name().to_string_lossy() == *name)
}

fn has_ignored_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IGNORED_EXTENSIONS.contains(&ext.as_str()))
}

/// Collect text files under `root`.
///
/// Directory enumeration errors propagate; per-file I/O errors skip the file.
pub fn collect(root: &Path, limits: &CollectLimits) -> Result<Vec<SourceFile>> {
    let exclude_set = build_globset(&limits.exclude_globs)?;
    let max_bytes = limits.max_file_size_kb.saturating_mul(1024);

    let mut files = Vec::new();
    let mut candidates = 0usize;

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_ignored_dir(entry));

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if has_ignored_extension(path) || exclude_set.is_match(&rel_str) {
            continue;
        }

        let size = match entry.metadata() {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                debug!(path = %rel_str, error = %e, "skipping file without metadata");
                continue;
            }
        };
        if size > max_bytes {
            debug!(path = %rel_str, size, "skipping oversized file");
            continue;
        }

        candidates += 1;
        if candidates > limits.max_files {
            warn!(
                max_files = limits.max_files,
                collected = files.len(),
                "file limit reached; stopping collection"
            );
            break;
        }

        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(path = %rel_str, error = %e, "skipping unreadable file");
                continue;
            }
        };
        if bytes.contains(&0) {
            debug!(path = %rel_str, "skipping binary file");
            continue;
        }

        files.push(SourceFile {
            path: rel_str,
            language: detect_language(path),
            content: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }

    Ok(files)
}

/// Sum of the sizes of every regular file under `root`, in bytes.
pub fn tree_size_bytes(root: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if entry.file_type().is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
