//! Job types flowing between stages.

use std::path::{Path, PathBuf};

use crate::tools::PeImage;
use crate::utils::hash::FileDigest;

/// Anything a stage can consume: always anchored on one filesystem path.
pub trait Job: Send + 'static {
    fn path(&self) -> &Path;
}

/// An update package (CAB/MSU) to extract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveJob {
    pub path: PathBuf,
}

impl ArchiveJob {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Job for ArchiveJob {
    fn path(&self) -> &Path {
        &self.path
    }
}

/// A candidate binary, either extracted from an update or found by a walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryJob {
    pub path: PathBuf,
    /// File name of the update package this binary came from.
    pub update_file: Option<String>,
    /// Parsed header, present once the binary passed validation.
    pub image: Option<PeImage>,
    pub digest: Option<FileDigest>,
}

impl BinaryJob {
    /// A binary fresh out of an archive.
    pub fn extracted(path: impl Into<PathBuf>, update_file: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            update_file: Some(update_file.into()),
            image: None,
            digest: None,
        }
    }

    /// A binary found on disk with no known origin.
    pub fn discovered(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            update_file: None,
            image: None,
            digest: None,
        }
    }

    pub fn validated(mut self, image: PeImage, digest: FileDigest) -> Self {
        self.image = Some(image);
        self.digest = Some(digest);
        self
    }
}

impl Job for BinaryJob {
    fn path(&self) -> &Path {
        &self.path
    }
}

/// Outcome of symbol resolution for one binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolJob {
    pub binary: PathBuf,
    pub symbol_path: PathBuf,
}

impl Job for SymbolJob {
    fn path(&self) -> &Path {
        &self.symbol_path
    }
}
