//! Extraction stage: update packages in, candidate binaries out.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::Result;
use crate::database::UpdateRecord;
use crate::pipeline::jobs::{ArchiveJob, BinaryJob};
use crate::pipeline::stage::{Stage, StageContext, StageKind};
use crate::tools::Extractor;
use crate::utils::fs::{file_name_lossy, io_error};
use crate::utils::hash::sha256_file;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMode {
    /// Expand each package and forward its binaries.
    Full,
    /// Record package metadata only.
    UpdatesOnly,
}

pub struct ExtractStage {
    extractor: Arc<dyn Extractor>,
    dest_root: PathBuf,
    mode: ExtractMode,
    /// Destinations handed out this run; no two archives share one.
    claimed: Mutex<HashSet<PathBuf>>,
}

impl ExtractStage {
    pub fn new(extractor: Arc<dyn Extractor>, dest_root: impl Into<PathBuf>, mode: ExtractMode) -> Self {
        Self {
            extractor,
            dest_root: dest_root.into(),
            mode,
            claimed: Mutex::new(HashSet::new()),
        }
    }

    /// `<dest_root>/<archive file name>`, so `kb1.cab` and `kb1.msu` never
    /// expand into the same directory.
    pub fn destination_for(&self, archive: &Path) -> PathBuf {
        self.dest_root.join(file_name_lossy(archive))
    }

    /// Reserve an extraction directory for `archive`. Packages with the same
    /// file name from different source folders get `-2`, `-3`, ... suffixes.
    fn claim_destination(&self, archive: &Path) -> PathBuf {
        let base = self.destination_for(archive);
        let mut claimed = self.claimed.lock();
        if claimed.insert(base.clone()) {
            return base;
        }
        let name = file_name_lossy(archive);
        let mut n = 2u32;
        loop {
            let candidate = self.dest_root.join(format!("{}-{}", name, n));
            if claimed.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

async fn modified_time(path: &Path) -> Result<Option<DateTime<Utc>>> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| io_error("reading update metadata", path, e))?;
    Ok(metadata.modified().ok().map(DateTime::<Utc>::from))
}

#[async_trait]
impl Stage for ExtractStage {
    type Input = ArchiveJob;
    type Output = BinaryJob;

    fn kind(&self) -> StageKind {
        StageKind::Extract
    }

    async fn process(&self, job: ArchiveJob, ctx: &StageContext) -> Result<Vec<BinaryJob>> {
        let modified = modified_time(&job.path).await?;
        let digest = sha256_file(&job.path).await?;
        let update_name = file_name_lossy(&job.path);
        let record = UpdateRecord::new(&job.path, digest, modified);

        if self.mode == ExtractMode::UpdatesOnly {
            ctx.record(record.into())?;
            return Ok(Vec::new());
        }

        let dest = self.claim_destination(&job.path);
        let binaries = self.extractor.extract(&job.path, &dest).await?;
        ctx.record(record.with_extracted_to(&dest).into())?;

        ctx.log.info(format!(
            "Extracted {} candidate binaries from {}",
            binaries.len(),
            update_name
        ));

        Ok(binaries
            .into_iter()
            .map(|path| BinaryJob::extracted(path, update_name.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::PersistRecord;
    use crate::logging::{LogFunnel, MemorySink};
    use crate::pipeline::job_queue::{JobQueue, QueueItem};
    use crate::{Error, Result};

    /// Writes one `payload.dll` per archive, or fails if the name says so.
    struct StubExtractor;

    #[async_trait]
    impl Extractor for StubExtractor {
        async fn extract(&self, archive: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
            if archive.to_string_lossy().contains("corrupt") {
                return Err(Error::extraction(archive, "bad cabinet"));
            }
            tokio::fs::create_dir_all(dest).await?;
            let out = dest.join("payload.dll");
            tokio::fs::write(&out, b"MZ").await?;
            Ok(vec![out])
        }
    }

    #[tokio::test]
    async fn test_full_mode_extracts_then_records() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("kb5000.cab");
        tokio::fs::write(&archive, b"cab bytes").await.unwrap();

        let funnel = LogFunnel::start(MemorySink::new());
        let persist = JobQueue::new("persist");
        let ctx = StageContext::new(0, funnel.producer("EXTRACT"), Some(persist.sender()));
        let stage = ExtractStage::new(Arc::new(StubExtractor), dir.path().join("out"), ExtractMode::Full);

        let out = stage.process(ArchiveJob::new(&archive), &ctx).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].path, dir.path().join("out/kb5000.cab/payload.dll"));
        assert_eq!(out[0].update_file.as_deref(), Some("kb5000.cab"));

        match persist.receiver().dequeue().await {
            Some(QueueItem::Job(PersistRecord::Update(r))) => {
                assert_eq!(r.name, "kb5000.cab");
                assert_eq!(r.digest.size, 9);
                assert_eq!(r.extracted_to, Some(dir.path().join("out/kb5000.cab")));
            }
            other => panic!("unexpected {:?}", other),
        }
        funnel.shutdown().await;
    }

    #[tokio::test]
    async fn test_updates_only_records_without_extracting() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("corrupt.msu");
        tokio::fs::write(&archive, b"msu").await.unwrap();

        let funnel = LogFunnel::start(MemorySink::new());
        let persist = JobQueue::new("persist");
        let ctx = StageContext::new(0, funnel.producer("EXTRACT"), Some(persist.sender()));
        let stage = ExtractStage::new(Arc::new(StubExtractor), dir.path(), ExtractMode::UpdatesOnly);

        let out = stage.process(ArchiveJob::new(&archive), &ctx).await.unwrap();
        assert!(out.is_empty());
        assert!(matches!(
            persist.receiver().dequeue().await,
            Some(QueueItem::Job(PersistRecord::Update(_)))
        ));
        funnel.shutdown().await;
    }

    #[tokio::test]
    async fn test_corrupt_archive_is_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("corrupt.cab");
        tokio::fs::write(&archive, b"cab").await.unwrap();

        let funnel = LogFunnel::start(MemorySink::new());
        let persist = JobQueue::new("persist");
        let ctx = StageContext::new(0, funnel.producer("EXTRACT"), Some(persist.sender()));
        let stage = ExtractStage::new(Arc::new(StubExtractor), dir.path(), ExtractMode::Full);

        assert!(stage.process(ArchiveJob::new(&archive), &ctx).await.is_err());
        assert!(persist.receiver().drain_remaining().await.is_empty());
        funnel.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_archive_reports_os_error() {
        let dir = tempfile::tempdir().unwrap();
        let funnel = LogFunnel::start(MemorySink::new());
        let ctx = StageContext::new(0, funnel.producer("EXTRACT"), None);
        let stage = ExtractStage::new(Arc::new(StubExtractor), dir.path(), ExtractMode::Full);

        let err = stage
            .process(ArchiveJob::new(dir.path().join("gone.cab")), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IoPath { .. }));
        funnel.shutdown().await;
    }

    /// Names its single output after the archive extension.
    struct PerKindExtractor;

    #[async_trait]
    impl Extractor for PerKindExtractor {
        async fn extract(&self, archive: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
            tokio::fs::create_dir_all(dest).await?;
            let ext = archive.extension().unwrap_or_default().to_string_lossy();
            let out = dest.join(format!("{ext}_only.dll"));
            tokio::fs::write(&out, b"MZ").await?;
            crate::utils::fs::walk_files(dest).await
        }
    }

    #[tokio::test]
    async fn test_same_stem_archives_extract_apart() {
        let dir = tempfile::tempdir().unwrap();
        let cab = dir.path().join("kb1.cab");
        let msu = dir.path().join("kb1.msu");
        tokio::fs::write(&cab, b"cab").await.unwrap();
        tokio::fs::write(&msu, b"msu").await.unwrap();

        let funnel = LogFunnel::start(MemorySink::new());
        let ctx = StageContext::new(0, funnel.producer("EXTRACT"), None);
        let stage = ExtractStage::new(Arc::new(PerKindExtractor), dir.path().join("out"), ExtractMode::Full);

        let from_cab = stage.process(ArchiveJob::new(&cab), &ctx).await.unwrap();
        let from_msu = stage.process(ArchiveJob::new(&msu), &ctx).await.unwrap();
        funnel.shutdown().await;

        assert_eq!(from_cab.len(), 1);
        assert_eq!(from_msu.len(), 1);
        assert_eq!(from_cab[0].path, dir.path().join("out/kb1.cab/cab_only.dll"));
        assert_eq!(from_msu[0].path, dir.path().join("out/kb1.msu/msu_only.dll"));
        assert_eq!(from_msu[0].update_file.as_deref(), Some("kb1.msu"));
    }

    #[tokio::test]
    async fn test_same_file_name_in_two_folders_gets_distinct_destinations() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a/kb2.cab");
        let second = dir.path().join("b/kb2.cab");
        for archive in [&first, &second] {
            tokio::fs::create_dir_all(archive.parent().unwrap()).await.unwrap();
            tokio::fs::write(archive, b"cab").await.unwrap();
        }

        let funnel = LogFunnel::start(MemorySink::new());
        let ctx = StageContext::new(0, funnel.producer("EXTRACT"), None);
        let stage = ExtractStage::new(Arc::new(PerKindExtractor), dir.path().join("out"), ExtractMode::Full);

        let one = stage.process(ArchiveJob::new(&first), &ctx).await.unwrap();
        let two = stage.process(ArchiveJob::new(&second), &ctx).await.unwrap();
        funnel.shutdown().await;

        assert_eq!(one.len(), 1);
        assert_eq!(two.len(), 1);
        assert_eq!(one[0].path, dir.path().join("out/kb2.cab/cab_only.dll"));
        assert_eq!(two[0].path, dir.path().join("out/kb2.cab-2/cab_only.dll"));
    }
}
