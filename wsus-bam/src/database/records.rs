//! Row types written by the Persist stage.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::pipeline::jobs::Job;
use crate::tools::{BinaryIdentity, PeImage};
use crate::utils::fs::file_name_lossy;
use crate::utils::hash::FileDigest;

/// Kind of update package, taken from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PackageKind {
    Cab,
    Msu,
    Other,
}

impl PackageKind {
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .as_deref()
        {
            Some("cab") => PackageKind::Cab,
            Some("msu") => PackageKind::Msu,
            _ => PackageKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PackageKind::Cab => "cab",
            PackageKind::Msu => "msu",
            PackageKind::Other => "other",
        }
    }
}

/// Metadata for one update package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateRecord {
    pub name: String,
    pub path: PathBuf,
    pub kind: PackageKind,
    pub digest: FileDigest,
    pub modified: Option<DateTime<Utc>>,
    /// Directory the package was expanded into, if it was.
    pub extracted_to: Option<PathBuf>,
    pub recorded_at: DateTime<Utc>,
}

impl UpdateRecord {
    pub fn new(path: &Path, digest: FileDigest, modified: Option<DateTime<Utc>>) -> Self {
        Self {
            name: file_name_lossy(path),
            path: path.to_path_buf(),
            kind: PackageKind::from_path(path),
            digest,
            modified,
            extracted_to: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_extracted_to(mut self, dir: impl Into<PathBuf>) -> Self {
        self.extracted_to = Some(dir.into());
        self
    }
}

/// Metadata for one validated binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchRecord {
    pub name: String,
    pub path: PathBuf,
    /// Update package the binary was extracted from.
    pub update_file: Option<String>,
    pub digest: FileDigest,
    pub machine: &'static str,
    pub image_kind: &'static str,
    pub timestamp: u32,
    pub pdb_name: Option<String>,
    pub pdb_signature: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl PatchRecord {
    pub fn new(
        path: &Path,
        update_file: Option<String>,
        image: &PeImage,
        digest: FileDigest,
    ) -> Self {
        Self {
            name: file_name_lossy(path),
            path: path.to_path_buf(),
            update_file,
            digest,
            machine: image.machine_name(),
            image_kind: image.kind.as_str(),
            timestamp: image.timestamp,
            pdb_name: image.codeview.as_ref().map(|cv| cv.pdb_name.clone()),
            pdb_signature: image.codeview.as_ref().map(|cv| cv.signature()),
            recorded_at: Utc::now(),
        }
    }
}

/// Metadata for one resolved symbol file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolRecord {
    pub name: String,
    pub path: PathBuf,
    pub digest: FileDigest,
    pub signature: String,
    pub binary_name: String,
    pub binary_sha256: String,
    /// Where the symbol was resolved from.
    pub source: String,
    pub recorded_at: DateTime<Utc>,
}

impl SymbolRecord {
    pub fn new(
        identity: &BinaryIdentity,
        path: &Path,
        digest: FileDigest,
        source: impl Into<String>,
    ) -> Self {
        Self {
            name: identity.pdb_name.clone(),
            path: path.to_path_buf(),
            digest,
            signature: identity.signature.clone(),
            binary_name: identity.file_name.clone(),
            binary_sha256: identity.sha256.clone(),
            source: source.into(),
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RecordKind {
    Update,
    Patch,
    Symbol,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Update => "update",
            RecordKind::Patch => "patch",
            RecordKind::Symbol => "symbol",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message for the Persist stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PersistRecord {
    Update(UpdateRecord),
    Patch(PatchRecord),
    Symbol(SymbolRecord),
}

impl PersistRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            PersistRecord::Update(_) => RecordKind::Update,
            PersistRecord::Patch(_) => RecordKind::Patch,
            PersistRecord::Symbol(_) => RecordKind::Symbol,
        }
    }
}

impl Job for PersistRecord {
    fn path(&self) -> &Path {
        match self {
            PersistRecord::Update(r) => &r.path,
            PersistRecord::Patch(r) => &r.path,
            PersistRecord::Symbol(r) => &r.path,
        }
    }
}

impl From<UpdateRecord> for PersistRecord {
    fn from(record: UpdateRecord) -> Self {
        PersistRecord::Update(record)
    }
}

impl From<PatchRecord> for PersistRecord {
    fn from(record: PatchRecord) -> Self {
        PersistRecord::Patch(record)
    }
}

impl From<SymbolRecord> for PersistRecord {
    fn from(record: SymbolRecord) -> Self {
        PersistRecord::Symbol(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest() -> FileDigest {
        FileDigest {
            sha256: "00".repeat(32),
            size: 12,
        }
    }

    #[test]
    fn test_package_kind_is_case_insensitive() {
        assert_eq!(PackageKind::from_path(Path::new("a/KB123.CAB")), PackageKind::Cab);
        assert_eq!(PackageKind::from_path(Path::new("KB123.msu")), PackageKind::Msu);
        assert_eq!(PackageKind::from_path(Path::new("notes.txt")), PackageKind::Other);
    }

    #[test]
    fn test_update_record_fields() {
        let record = UpdateRecord::new(Path::new("/updates/kb1.msu"), digest(), None)
            .with_extracted_to("/out/kb1");
        assert_eq!(record.name, "kb1.msu");
        assert_eq!(record.kind, PackageKind::Msu);
        assert_eq!(record.extracted_to.as_deref(), Some(Path::new("/out/kb1")));

        let persist = PersistRecord::from(record);
        assert_eq!(persist.kind(), RecordKind::Update);
        assert_eq!(persist.path(), Path::new("/updates/kb1.msu"));
        assert_eq!(persist.kind().to_string(), "update");
    }
}
