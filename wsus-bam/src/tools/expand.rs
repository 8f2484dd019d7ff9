//! Archive extraction through `expand.exe`.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::traits::Extractor;
use crate::utils::fs::{ensure_dir_all, has_extension, walk_files};
use crate::{Error, Result};

/// Extensions treated as candidate PE binaries after expansion.
pub const PE_EXTENSIONS: &[&str] = &["exe", "dll", "sys", "ocx", "cpl", "drv", "efi", "mui", "scr"];

pub const DEFAULT_EXPAND_PROGRAM: &str = "expand.exe";
pub const DEFAULT_EXPAND_TIMEOUT: Duration = Duration::from_secs(600);

/// Nested cabinets expanded below the top-level package.
pub const DEFAULT_NESTED_DEPTH: u32 = 2;

/// Runs `expand -F:* <archive> <dest>`, then expands any `.cab` payloads it
/// produced, up to a fixed depth.
#[derive(Debug, Clone)]
pub struct ExpandExtractor {
    program: PathBuf,
    timeout: Duration,
    nested_depth: u32,
}

impl Default for ExpandExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_EXPAND_PROGRAM, DEFAULT_EXPAND_TIMEOUT)
    }
}

impl ExpandExtractor {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
            nested_depth: DEFAULT_NESTED_DEPTH,
        }
    }

    pub fn with_nested_depth(mut self, depth: u32) -> Self {
        self.nested_depth = depth;
        self
    }

    async fn expand_one(&self, archive: &Path, dest: &Path) -> Result<()> {
        let args: [OsString; 3] = ["-F:*".into(), archive.into(), dest.into()];
        let output = process_utils::run_tool(&self.program, &args, self.timeout)
            .await
            .map_err(|e| {
                Error::extraction(
                    archive,
                    format!("failed to run {}: {}", self.program.display(), e),
                )
            })?;

        if !output.success() {
            let reason = output
                .last_message()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{} exited with {}", self.program.display(), output.status));
            return Err(Error::extraction(archive, reason));
        }
        Ok(())
    }
}

#[async_trait]
impl Extractor for ExpandExtractor {
    async fn extract(&self, archive: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
        ensure_dir_all(dest).await?;

        let mut expanded: HashSet<PathBuf> = HashSet::new();
        let mut frontier = vec![(archive.to_path_buf(), dest.to_path_buf())];

        for depth in 0..=self.nested_depth {
            let mut next = Vec::new();
            for (source, out) in frontier.drain(..) {
                if depth > 0
                    && let Err(e) = ensure_dir_all(&out).await
                {
                    warn!("Skipping nested cabinet {}: {}", source.display(), e);
                    continue;
                }
                match self.expand_one(&source, &out).await {
                    Ok(()) => {}
                    Err(e) if depth == 0 => return Err(e),
                    Err(e) => {
                        warn!("Skipping nested cabinet {}: {}", source.display(), e);
                        continue;
                    }
                }

                let produced = match walk_files(&out).await {
                    Ok(files) => files,
                    Err(e) if depth == 0 => return Err(e),
                    Err(e) => {
                        warn!("Skipping nested cabinet {}: {}", source.display(), e);
                        continue;
                    }
                };
                for file in produced {
                    if has_extension(&file, &["cab"]) && expanded.insert(file.clone()) {
                        let nested_out = file.with_extension("");
                        next.push((file, nested_out));
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            if depth == self.nested_depth {
                debug!(
                    "{} nested cabinet(s) in {} left unexpanded at depth {}",
                    next.len(),
                    archive.display(),
                    depth
                );
            }
            frontier = next;
        }

        let binaries: Vec<PathBuf> = walk_files(dest)
            .await?
            .into_iter()
            .filter(|p| has_extension(p, PE_EXTENSIONS))
            .collect();
        debug!(
            "{} expanded into {} candidate binaries",
            archive.display(),
            binaries.len()
        );
        Ok(binaries)
    }
}
