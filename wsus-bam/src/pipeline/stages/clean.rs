//! Validation stage: keeps well-formed PE images only.

use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::database::PatchRecord;
use crate::pipeline::jobs::BinaryJob;
use crate::pipeline::stage::{Stage, StageContext, StageKind};
use crate::tools::BinaryValidator;
use crate::utils::hash::sha256_file;

pub struct CleanStage {
    validator: Arc<dyn BinaryValidator>,
}

impl CleanStage {
    pub fn new(validator: Arc<dyn BinaryValidator>) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl Stage for CleanStage {
    type Input = BinaryJob;
    type Output = BinaryJob;

    fn kind(&self) -> StageKind {
        StageKind::Clean
    }

    async fn process(&self, job: BinaryJob, ctx: &StageContext) -> Result<Vec<BinaryJob>> {
        let image = self.validator.validate(&job.path).await?;
        let digest = sha256_file(&job.path).await?;

        ctx.record(PatchRecord::new(&job.path, job.update_file.clone(), &image, digest.clone()).into())?;
        ctx.log
            .debug(format!("{} is a valid {} image", job.path.display(), image.machine_name()));

        Ok(vec![job.validated(image, digest)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::PersistRecord;
    use crate::logging::{LogFunnel, MemorySink};
    use crate::pipeline::job_queue::{JobQueue, QueueItem};
    use crate::tools::PeValidator;
    use crate::tools::pe::fixtures::PeFixture;

    #[tokio::test]
    async fn test_valid_binary_is_recorded_and_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("win32k.sys");
        tokio::fs::write(&binary, PeFixture::with_pdb("win32k.pdb").build())
            .await
            .unwrap();

        let funnel = LogFunnel::start(MemorySink::new());
        let persist = JobQueue::new("persist");
        let ctx = StageContext::new(0, funnel.producer("CLEAN"), Some(persist.sender()));
        let stage = CleanStage::new(Arc::new(PeValidator));

        let out = stage
            .process(BinaryJob::extracted(&binary, "kb1.cab"), &ctx)
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].image.is_some());
        assert!(out[0].digest.is_some());

        match persist.receiver().dequeue().await {
            Some(QueueItem::Job(PersistRecord::Patch(r))) => {
                assert_eq!(r.name, "win32k.sys");
                assert_eq!(r.update_file.as_deref(), Some("kb1.cab"));
                assert_eq!(r.pdb_name.as_deref(), Some("win32k.pdb"));
            }
            other => panic!("unexpected {:?}", other),
        }
        funnel.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_binary_is_neither_recorded_nor_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("fake.dll");
        tokio::fs::write(&binary, b"MZ but nothing else").await.unwrap();

        let funnel = LogFunnel::start(MemorySink::new());
        let persist = JobQueue::new("persist");
        let ctx = StageContext::new(0, funnel.producer("CLEAN"), Some(persist.sender()));
        let stage = CleanStage::new(Arc::new(PeValidator));

        assert!(stage.process(BinaryJob::discovered(&binary), &ctx).await.is_err());
        assert!(persist.receiver().drain_remaining().await.is_empty());
        funnel.shutdown().await;
    }
}
