//! Filesystem helpers shared across modules.
//!
//! These helpers provide consistent error context (operation + path) and
//! reduce duplicated `create_dir_all` / directory-walk code.

use std::path::{Path, PathBuf};

use tracing::warn;
use walkdir::WalkDir;

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all_with_op(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error(op, path, e))
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all(path: &Path) -> Result<()> {
    ensure_dir_all_with_op("creating directory", path).await
}

/// Ensure the parent directory of a file path exists.
pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    ensure_dir_all(parent).await
}

/// Ensure a directory exists (synchronous variant) with a custom operation label.
pub fn ensure_dir_all_sync_with_op(op: &'static str, path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| io_error(op, path, e))
}

/// Resolve `path` to an absolute, canonical form, falling back to the input.
pub async fn resolve(path: &Path) -> PathBuf {
    match tokio::fs::canonicalize(path).await {
        Ok(resolved) => resolved,
        Err(_) => path.to_path_buf(),
    }
}

/// Recursively list every regular file below `root`, sorted.
///
/// Unreadable subdirectories are logged and skipped; an unreadable root is an error.
pub async fn walk_files(root: &Path) -> Result<Vec<PathBuf>> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || walk_files_blocking(&root))
        .await
        .map_err(|e| Error::Other(format!("directory walk task failed: {}", e)))?
}

fn walk_files_blocking(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                return Err(io_error("reading directory", root, std::io::Error::from(e)));
            }
            Err(e) => {
                let path = e.path().unwrap_or(root).display().to_string();
                warn!(path = %path, error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }

    files.sort();
    Ok(files)
}

/// Case-insensitive extension check.
pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| extensions.iter().any(|c| c.eq_ignore_ascii_case(ext)))
}

/// File name as an owned string (lossy).
pub fn file_name_lossy(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
