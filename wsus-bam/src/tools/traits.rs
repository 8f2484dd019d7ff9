//! Collaborator interfaces consumed by the stages.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;

use super::pe::PeImage;
use crate::utils::fs::file_name_lossy;
use crate::utils::hash::FileDigest;
use crate::{Error, Result};

/// Unpacks an update package.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Expand `archive` into `dest` and return the candidate binaries found.
    async fn extract(&self, archive: &Path, dest: &Path) -> Result<Vec<PathBuf>>;
}

/// Decides whether a file is a well-formed executable image.
#[async_trait]
pub trait BinaryValidator: Send + Sync {
    /// `Err(Error::Validation)` means the file was read and rejected.
    async fn validate(&self, path: &Path) -> Result<PeImage>;
}

/// What a symbol source needs to know to locate a binary's PDB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BinaryIdentity {
    pub file_name: String,
    pub sha256: String,
    pub pdb_name: String,
    /// GUID followed by age, as used in symbol-store paths.
    pub signature: String,
}

impl BinaryIdentity {
    /// Fails with `SymbolNotFound` for images that carry no CodeView record.
    pub fn new(path: &Path, image: &PeImage, digest: &FileDigest) -> Result<Self> {
        let Some(cv) = image.codeview.as_ref() else {
            return Err(Error::SymbolNotFound(format!(
                "{} has no CodeView debug record",
                path.display()
            )));
        };
        Ok(Self {
            file_name: file_name_lossy(path),
            sha256: digest.sha256.clone(),
            pdb_name: cv.pdb_name.clone(),
            signature: cv.signature(),
        })
    }

    /// `<pdb>/<signature>/<pdb>` relative path used by symbol stores.
    pub fn store_path(&self) -> PathBuf {
        Path::new(&self.pdb_name)
            .join(&self.signature)
            .join(&self.pdb_name)
    }
}

/// Resolves a binary's PDB into a local file.
#[async_trait]
pub trait SymbolSource: Send + Sync {
    /// Place the symbol for `identity` under `dest` and return its path.
    async fn resolve(&self, identity: &BinaryIdentity, dest: &Path) -> Result<PathBuf>;

    /// Human-readable origin stored alongside each symbol row.
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::pe::{fixtures::PeFixture, parse};

    fn digest() -> FileDigest {
        FileDigest {
            sha256: "cd".repeat(32),
            size: 1024,
        }
    }

    #[test]
    fn test_identity_from_image() {
        let image = parse(&PeFixture::with_pdb("kernel32.pdb").build()).unwrap();
        let identity = BinaryIdentity::new(Path::new("/x/kernel32.dll"), &image, &digest()).unwrap();
        assert_eq!(identity.file_name, "kernel32.dll");
        assert_eq!(identity.pdb_name, "kernel32.pdb");
        assert_eq!(
            identity.store_path(),
            Path::new("kernel32.pdb")
                .join("123456789ABCDEF00123456789ABCDEF2")
                .join("kernel32.pdb")
        );
    }

    #[test]
    fn test_identity_requires_codeview() {
        let fixture = PeFixture {
            codeview: None,
            ..PeFixture::default()
        };
        let image = parse(&fixture.build()).unwrap();
        assert!(matches!(
            BinaryIdentity::new(Path::new("a.dll"), &image, &digest()),
            Err(Error::SymbolNotFound(_))
        ));
    }
}
