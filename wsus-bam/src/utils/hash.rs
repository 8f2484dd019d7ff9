//! SHA-256 digests of files on disk.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use super::fs::io_error;
use crate::Result;

const READ_CHUNK: usize = 64 * 1024;

/// Content digest and length of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    /// Lowercase hex SHA-256.
    pub sha256: String,
    pub size: u64,
}

/// Stream `path` through SHA-256.
pub async fn sha256_file(path: &Path) -> Result<FileDigest> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| io_error("opening file for hashing", path, e))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut size = 0u64;

    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| io_error("reading file for hashing", path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok(FileDigest {
        sha256: hex::encode(hasher.finalize()),
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sha256_file_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.bin");
        std::fs::write(&path, b"abc").unwrap();

        let digest = sha256_file(&path).await.unwrap();
        assert_eq!(
            digest.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(digest.size, 3);
    }

    #[tokio::test]
    async fn test_sha256_file_spanning_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let data = vec![7u8; READ_CHUNK * 2 + 17];
        std::fs::write(&path, &data).unwrap();

        let digest = sha256_file(&path).await.unwrap();
        assert_eq!(digest.sha256, hex::encode(Sha256::digest(&data)));
        assert_eq!(digest.size, data.len() as u64);
    }

    #[tokio::test]
    async fn test_sha256_missing_file() {
        let err = sha256_file(Path::new("/definitely/not/here.bin"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("opening file for hashing"));
    }
}
