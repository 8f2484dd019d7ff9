//! Symbol resolution stage.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::database::SymbolRecord;
use crate::pipeline::jobs::{BinaryJob, SymbolJob};
use crate::pipeline::stage::{Stage, StageContext, StageKind};
use crate::tools::{BinaryIdentity, BinaryValidator, SymbolSource};
use crate::utils::hash::sha256_file;

pub struct SymbolStage {
    source: Arc<dyn SymbolSource>,
    validator: Arc<dyn BinaryValidator>,
    dest: PathBuf,
}

impl SymbolStage {
    pub fn new(
        source: Arc<dyn SymbolSource>,
        validator: Arc<dyn BinaryValidator>,
        dest: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source,
            validator,
            dest: dest.into(),
        }
    }
}

#[async_trait]
impl Stage for SymbolStage {
    type Input = BinaryJob;
    type Output = SymbolJob;

    fn kind(&self) -> StageKind {
        StageKind::Symbols
    }

    async fn process(&self, job: BinaryJob, ctx: &StageContext) -> Result<Vec<SymbolJob>> {
        // Walked binaries arrive unvalidated.
        let (image, digest) = match (job.image, job.digest) {
            (Some(image), Some(digest)) => (image, digest),
            _ => {
                let image = self.validator.validate(&job.path).await?;
                (image, sha256_file(&job.path).await?)
            }
        };

        let identity = BinaryIdentity::new(&job.path, &image, &digest)?;
        let symbol_path = self.source.resolve(&identity, &self.dest).await?;
        let symbol_digest = sha256_file(&symbol_path).await?;

        ctx.record(
            SymbolRecord::new(&identity, &symbol_path, symbol_digest, self.source.describe()).into(),
        )?;
        ctx.log.debug(format!(
            "Resolved {} for {}",
            identity.pdb_name, identity.file_name
        ));

        Ok(vec![SymbolJob {
            binary: job.path,
            symbol_path,
        }])
    }
}
