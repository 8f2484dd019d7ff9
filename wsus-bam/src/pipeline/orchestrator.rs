//! Assembles the stages for one run mode and drives them to completion.
//!
//! Stages are started bottom-up (Persist, Symbols, Clean, Extract) so every
//! queue has listeners before its upstream produces, then joined top-down.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::jobs::{ArchiveJob, BinaryJob};
use super::stage::Stage;
use super::stages::{CleanStage, ExtractMode, ExtractStage, PersistStage, PersistStats, SymbolStage};
use super::worker_pool::{StageConfig, StageManager, StageStats};
use crate::database::RecordStore;
use crate::logging::LogProducer;
use crate::tools::{BinaryValidator, Extractor, SymbolSource};
use crate::utils::fs::{has_extension, resolve, walk_files};
use crate::{Error, Result};

/// Package extensions picked up from a source directory.
pub const ARCHIVE_EXTENSIONS: &[&str] = &["cab", "msu"];

/// Where Extract gets its packages from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveSource {
    Directory(PathBuf),
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// Extract, validate, resolve symbols and record everything.
    Extract(ArchiveSource),
    /// Resolve symbols for every file under the extraction destination.
    SymbolsOnly,
    /// Validate and record every file under the extraction destination.
    PatchesOnly,
    /// Record package metadata for every archive in a directory.
    UpdatesOnly(PathBuf),
}

impl RunMode {
    pub fn name(&self) -> &'static str {
        match self {
            RunMode::Extract(_) => "extract",
            RunMode::SymbolsOnly => "symbols-only",
            RunMode::PatchesOnly => "patches-only",
            RunMode::UpdatesOnly(_) => "updates-only",
        }
    }

    /// Stages that write records, one completion token each.
    pub fn persist_producers(&self) -> usize {
        match self {
            RunMode::Extract(_) => 3,
            RunMode::SymbolsOnly | RunMode::PatchesOnly | RunMode::UpdatesOnly(_) => 1,
        }
    }

    /// Worker count used when neither the command line nor the config file
    /// sets one.
    pub fn default_workers(&self) -> usize {
        match self {
            RunMode::Extract(_) => super::worker_pool::default_worker_count(),
            RunMode::SymbolsOnly | RunMode::UpdatesOnly(_) => 4,
            RunMode::PatchesOnly => 1,
        }
    }
}

/// Everything a run needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub mode: RunMode,
    /// Extraction destination (`--patchdest`).
    pub patch_dest: PathBuf,
    /// Symbol destination (`--symdestpath`).
    pub symbol_dest: PathBuf,
    pub workers: usize,
}

impl RunPlan {
    pub fn new(mode: RunMode, patch_dest: impl Into<PathBuf>, symbol_dest: impl Into<PathBuf>) -> Self {
        let workers = mode.default_workers();
        Self {
            mode,
            patch_dest: patch_dest.into(),
            symbol_dest: symbol_dest.into(),
            workers,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}

/// Collaborators shared by the stages.
#[derive(Clone)]
pub struct Toolset {
    pub extractor: Arc<dyn Extractor>,
    pub validator: Arc<dyn BinaryValidator>,
    pub symbols: Arc<dyn SymbolSource>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub mode: &'static str,
    /// Joined stages in join order.
    pub stages: Vec<StageStats>,
    pub persist: PersistStats,
    pub elapsed: Duration,
}

pub struct Orchestrator {
    plan: RunPlan,
    tools: Toolset,
    log: LogProducer,
}

impl Orchestrator {
    pub fn new(plan: RunPlan, tools: Toolset, log: &LogProducer) -> Self {
        Self {
            plan,
            tools,
            log: log.with_origin("MAIN"),
        }
    }

    pub fn plan(&self) -> &RunPlan {
        &self.plan
    }

    /// Run the pipeline to completion. The store is closed exactly once
    /// before this returns, on success or failure.
    ///
    /// Only a schema failure is fatal; per-job failures are logged and
    /// counted in the report.
    pub async fn run(self, mut store: Box<dyn RecordStore>) -> Result<RunReport> {
        let started_at = Instant::now();
        self.prepare_directories().await;

        if let Err(e) = store.construct_schema().await {
            self.log.error(format!("Problem creating DB tables: {}", e));
            if let Err(close_err) = store.close().await {
                self.log.error(format!("Failed to close database: {}", close_err));
            }
            return Err(match e {
                Error::Schema(_) => e,
                other => Error::Schema(other.to_string()),
            });
        }

        let mut persist = PersistStage::new(store, self.plan.mode.persist_producers(), &self.log);
        persist.start();

        let stages = match &self.plan.mode {
            RunMode::Extract(source) => self.run_full(source, &persist).await,
            RunMode::SymbolsOnly => self.run_symbols_only(&persist).await,
            RunMode::PatchesOnly => self.run_patches_only(&persist).await,
            RunMode::UpdatesOnly(source) => self.run_updates_only(source, &persist).await,
        };

        let (stages, persist_stats) = self.finish(stages, persist).await?;
        self.log.info(format!(
            "Total time including database insertion ({:.2} min)",
            started_at.elapsed().as_secs_f64() / 60.0
        ));

        Ok(RunReport {
            mode: self.plan.mode.name(),
            stages,
            persist: persist_stats,
            elapsed: started_at.elapsed(),
        })
    }

    /// Join Persist and close the store whatever the stages returned. The
    /// first error wins.
    async fn finish(
        &self,
        stages: Result<Vec<StageStats>>,
        mut persist: PersistStage,
    ) -> Result<(Vec<StageStats>, PersistStats)> {
        if let Err(e) = &stages {
            self.log.error(format!("Stage failed, shutting down database writer: {}", e));
            persist.abort();
        }

        let (store, persist_stats) = match persist.join().await {
            Ok(joined) => joined,
            Err(e) => return Err(stages.err().unwrap_or(e)),
        };
        let closed = store.close().await;

        let stages = stages?;
        closed?;
        Ok((stages, persist_stats))
    }

    async fn prepare_directories(&self) {
        match &self.plan.mode {
            RunMode::Extract(_) => {
                check_directory_exists(&self.plan.patch_dest, &self.log).await;
                check_directory_exists(&self.plan.symbol_dest, &self.log).await;
            }
            RunMode::SymbolsOnly => {
                check_directory_exists(&self.plan.symbol_dest, &self.log).await;
            }
            RunMode::PatchesOnly | RunMode::UpdatesOnly(_) => {}
        }
    }

    fn config(&self) -> StageConfig {
        StageConfig::new(self.plan.workers, 1)
    }

    fn symbol_stage(&self) -> SymbolStage {
        SymbolStage::new(
            self.tools.symbols.clone(),
            self.tools.validator.clone(),
            &self.plan.symbol_dest,
        )
    }

    async fn run_full(&self, source: &ArchiveSource, persist: &PersistStage) -> Result<Vec<StageStats>> {
        self.log.info(format!(
            "Using symbol source ({}) to store at ({})",
            self.tools.symbols.describe(),
            self.plan.symbol_dest.display()
        ));

        let mut symbols = StageManager::new(self.symbol_stage(), self.config(), &self.log)
            .with_persist(persist.handle());
        let mut clean = StageManager::new(
            CleanStage::new(self.tools.validator.clone()),
            self.config(),
            &self.log,
        )
        .with_downstream(symbols.sink())
        .with_persist(persist.handle());
        let mut extract = StageManager::new(
            ExtractStage::new(
                self.tools.extractor.clone(),
                &self.plan.patch_dest,
                ExtractMode::Full,
            ),
            self.config(),
            &self.log,
        )
        .with_downstream(clean.sink())
        .with_persist(persist.handle());

        symbols.start();
        clean.start();
        extract.start();

        let archives = self.collect_archives(source).await;
        self.seed(&extract, archives.into_iter().map(ArchiveJob::new));

        // Join every stage even if an earlier one failed.
        let joined = vec![
            self.join_stage(&mut extract, "extract").await,
            self.join_stage(&mut clean, "check binaries").await,
            self.join_stage(&mut symbols, "find symbols").await,
        ];
        joined.into_iter().collect()
    }

    async fn run_symbols_only(&self, persist: &PersistStage) -> Result<Vec<StageStats>> {
        self.log.info("Only retrieving symbols");
        let mut symbols = StageManager::new(self.symbol_stage(), self.config(), &self.log)
            .with_persist(persist.handle());
        symbols.start();

        let files = self.walk(&self.plan.patch_dest).await;
        self.seed(&symbols, files.into_iter().map(BinaryJob::discovered));

        Ok(vec![self.join_stage(&mut symbols, "find symbols").await?])
    }

    async fn run_patches_only(&self, persist: &PersistStage) -> Result<Vec<StageStats>> {
        self.log.info("Only retrieving patches");
        let mut clean = StageManager::new(
            CleanStage::new(self.tools.validator.clone()),
            self.config(),
            &self.log,
        )
        .with_persist(persist.handle());
        clean.start();

        let files = self.walk(&self.plan.patch_dest).await;
        self.seed(&clean, files.into_iter().map(BinaryJob::discovered));

        Ok(vec![self.join_stage(&mut clean, "check binaries").await?])
    }

    async fn run_updates_only(&self, source: &Path, persist: &PersistStage) -> Result<Vec<StageStats>> {
        self.log.info("Only retrieving updates");
        let mut extract = StageManager::new(
            ExtractStage::new(
                self.tools.extractor.clone(),
                &self.plan.patch_dest,
                ExtractMode::UpdatesOnly,
            ),
            self.config(),
            &self.log,
        )
        .with_persist(persist.handle());
        extract.start();

        let archives = self
            .collect_archives(&ArchiveSource::Directory(source.to_path_buf()))
            .await;
        self.seed(&extract, archives.into_iter().map(ArchiveJob::new));

        Ok(vec![self.join_stage(&mut extract, "extract").await?])
    }

    /// Enqueue every job, then this producer's single completion token.
    fn seed<S: Stage>(&self, stage: &StageManager<S>, jobs: impl IntoIterator<Item = S::Input>) {
        let mut seeded = 0usize;
        for job in jobs {
            match stage.receivejobset(job) {
                Ok(()) => seeded += 1,
                Err(e) => self.log.error(format!("Failed to enqueue job: {}", e)),
            }
        }
        self.log.info(format!("Seeded {} job(s) into {}", seeded, stage.kind()));
        if let Err(e) = stage.donesig() {
            self.log
                .error(format!("Failed to signal completion to {}: {}", stage.kind(), e));
        }
    }

    async fn join_stage<S: Stage>(&self, stage: &mut StageManager<S>, label: &str) -> Result<StageStats> {
        let stats = stage.join().await?;
        self.log.info(format!(
            "Time to {} ({:.2} min)",
            label,
            stats.elapsed_minutes()
        ));
        Ok(stats)
    }

    async fn collect_archives(&self, source: &ArchiveSource) -> Vec<PathBuf> {
        match source {
            ArchiveSource::File(path) => vec![resolve(path).await],
            ArchiveSource::Directory(dir) => {
                self.log.info(format!("Examining {}", dir.display()));
                self.walk(dir)
                    .await
                    .into_iter()
                    .filter(|p| has_extension(p, ARCHIVE_EXTENSIONS))
                    .collect()
            }
        }
    }

    /// Every file under `root`; an unreadable root yields nothing.
    async fn walk(&self, root: &Path) -> Vec<PathBuf> {
        let root = resolve(root).await;
        match walk_files(&root).await {
            Ok(files) => files,
            Err(e) => {
                self.log.error(format!("Cannot walk {}: {}", root.display(), e));
                Vec::new()
            }
        }
    }
}

/// Create `dir` if missing. Returns whether it was created; failures are
/// logged and the run continues.
pub async fn check_directory_exists(dir: &Path, log: &LogProducer) -> bool {
    let created = match tokio::fs::metadata(dir).await {
        Ok(m) if m.is_dir() => false,
        _ => match tokio::fs::create_dir_all(dir).await {
            Ok(()) => true,
            Err(e) => {
                log.warn(format!(
                    "Unable to create directory {}: {}",
                    dir.display(),
                    e
                ));
                false
            }
        },
    };
    log.debug(format!(
        "Directory ({}) results were {}",
        dir.display(),
        u8::from(created)
    ));
    created
}
