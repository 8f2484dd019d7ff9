//! End-to-end runs of the orchestrator against a real SQLite file.
//!
//! Extraction is faked so the tests do not depend on `expand.exe`; PE
//! validation and local symbol lookup are the real implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use wsus_bam::database::{
    PatchRecord, RecordStore, RowCounts, SqliteStore, SymbolRecord, UpdateRecord,
};
use wsus_bam::logging::{LogFunnel, MemorySink};
use wsus_bam::pipeline::{ArchiveSource, Orchestrator, RunMode, RunPlan, Toolset};
use wsus_bam::tools::pe::fixtures::PeFixture;
use wsus_bam::tools::{Extractor, LocalSymbolSource, PeValidator};
use wsus_bam::{Error, Result};

const RUN_TIMEOUT: Duration = Duration::from_secs(30);

/// Writes one synthetic DLL per archive instead of running expand.
struct FixtureExtractor;

#[async_trait]
impl Extractor for FixtureExtractor {
    async fn extract(&self, archive: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
        tokio::fs::create_dir_all(dest).await?;
        let stem = archive
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target = dest.join(format!("{stem}.dll"));
        tokio::fs::write(&target, PeFixture::default().build()).await?;
        Ok(vec![target])
    }
}

struct Workspace {
    _root: TempDir,
    updates: PathBuf,
    patch_dest: PathBuf,
    symbol_dest: PathBuf,
    symbols: PathBuf,
    database: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let base = root.path().to_path_buf();
        let ws = Self {
            updates: base.join("updates"),
            patch_dest: base.join("extractedPatches"),
            symbol_dest: base.join("updatefilesymbols"),
            symbols: base.join("local-symbols"),
            database: base.join("WSUS_Update_data.db"),
            _root: root,
        };
        std::fs::create_dir_all(&ws.updates).unwrap();
        std::fs::create_dir_all(&ws.symbols).unwrap();
        std::fs::write(ws.symbols.join("sample.pdb"), b"pdb bytes").unwrap();
        ws
    }

    fn tools(&self) -> Toolset {
        Toolset {
            extractor: Arc::new(FixtureExtractor),
            validator: Arc::new(PeValidator),
            symbols: Arc::new(LocalSymbolSource::new(&self.symbols)),
        }
    }

    fn plan(&self, mode: RunMode, workers: usize) -> RunPlan {
        RunPlan::new(mode, &self.patch_dest, &self.symbol_dest).with_workers(workers)
    }

    async fn counts(&self) -> RowCounts {
        let mut store = SqliteStore::open(&self.database).await.unwrap();
        let counts = store.row_counts().await.unwrap();
        Box::new(store).close().await.unwrap();
        counts
    }
}

async fn run(ws: &Workspace, plan: RunPlan, sink: MemorySink) -> Result<wsus_bam::pipeline::RunReport> {
    let funnel = LogFunnel::start(sink);
    let log = funnel.producer("TEST");
    let store = SqliteStore::open(&ws.database).await?;
    let result = tokio::time::timeout(
        RUN_TIMEOUT,
        Orchestrator::new(plan, ws.tools(), &log).run(Box::new(store)),
    )
    .await
    .expect("pipeline run did not terminate");
    drop(log);
    funnel.shutdown().await;
    result
}

#[tokio::test]
async fn test_empty_update_directory_writes_nothing() {
    let ws = Workspace::new();
    let plan = ws.plan(RunMode::Extract(ArchiveSource::Directory(ws.updates.clone())), 2);

    let report = run(&ws, plan, MemorySink::new()).await.unwrap();

    assert_eq!(report.stages.len(), 3);
    assert!(report.stages.iter().all(|s| s.received == 0));
    assert_eq!(report.persist.tokens, 3);
    assert_eq!(ws.counts().await, RowCounts::default());
    assert!(ws.patch_dest.is_dir());
    assert!(ws.symbol_dest.is_dir());
}

#[tokio::test]
async fn test_single_update_flows_through_every_stage() {
    let ws = Workspace::new();
    std::fs::write(ws.updates.join("kb5001.cab"), b"cab bytes").unwrap();
    std::fs::write(ws.updates.join("readme.txt"), b"ignored").unwrap();
    let plan = ws.plan(RunMode::Extract(ArchiveSource::Directory(ws.updates.clone())), 2);

    let report = run(&ws, plan, MemorySink::new()).await.unwrap();

    assert_eq!(report.persist.updates, 1);
    assert_eq!(report.persist.patches, 1);
    assert_eq!(report.persist.symbols, 1);
    assert_eq!(report.persist.dropped, 0);
    assert_eq!(
        ws.counts().await,
        RowCounts {
            updates: 1,
            patches: 1,
            symbols: 1
        }
    );
    assert!(
        ws.symbol_dest
            .join("sample.pdb")
            .join("123456789ABCDEF00123456789ABCDEF2")
            .join("sample.pdb")
            .is_file()
    );
}

#[tokio::test]
async fn test_same_stem_archives_do_not_share_binaries() {
    let ws = Workspace::new();
    std::fs::write(ws.updates.join("kb5003.cab"), b"cab bytes").unwrap();
    std::fs::write(ws.updates.join("kb5003.msu"), b"msu bytes").unwrap();
    let plan = ws.plan(RunMode::Extract(ArchiveSource::Directory(ws.updates.clone())), 2);

    let report = run(&ws, plan, MemorySink::new()).await.unwrap();

    assert_eq!(report.stages[0].completed, 2);
    assert_eq!(
        ws.counts().await,
        RowCounts {
            updates: 2,
            patches: 2,
            symbols: 2
        }
    );
    assert!(ws.patch_dest.join("kb5003.cab").join("kb5003.dll").is_file());
    assert!(ws.patch_dest.join("kb5003.msu").join("kb5003.dll").is_file());
}

#[tokio::test]
async fn test_single_file_source() {
    let ws = Workspace::new();
    let archive = ws.updates.join("kb5002.msu");
    std::fs::write(&archive, b"msu bytes").unwrap();
    let plan = ws.plan(RunMode::Extract(ArchiveSource::File(archive)), 1);

    let report = run(&ws, plan, MemorySink::new()).await.unwrap();

    assert_eq!(report.stages[0].received, 1);
    assert_eq!(report.persist.inserted(), 3);
}

#[tokio::test]
async fn test_symbols_only_consumes_each_file_once() {
    let ws = Workspace::new();
    std::fs::create_dir_all(ws.patch_dest.join("nested")).unwrap();
    let files = 7;
    for i in 0..files {
        let dir = if i % 2 == 0 {
            ws.patch_dest.clone()
        } else {
            ws.patch_dest.join("nested")
        };
        std::fs::write(dir.join(format!("bin{i}.dll")), PeFixture::default().build()).unwrap();
    }
    let plan = ws.plan(RunMode::SymbolsOnly, 3);

    let report = run(&ws, plan, MemorySink::new()).await.unwrap();

    assert_eq!(report.stages.len(), 1);
    assert_eq!(report.stages[0].received, files);
    assert_eq!(report.stages[0].completed, files);
    assert_eq!(report.persist.tokens, 1);
    assert_eq!(ws.counts().await.symbols, files as i64);
}

#[tokio::test]
async fn test_patches_only_skips_non_pe_files() {
    let ws = Workspace::new();
    std::fs::create_dir_all(&ws.patch_dest).unwrap();
    std::fs::write(ws.patch_dest.join("good.dll"), PeFixture::default().build()).unwrap();
    std::fs::write(ws.patch_dest.join("notes.dll"), b"not a PE image").unwrap();
    let sink = MemorySink::new();

    let report = run(&ws, ws.plan(RunMode::PatchesOnly, 1), sink.clone()).await.unwrap();

    assert_eq!(report.stages[0].received, 2);
    assert_eq!(report.stages[0].completed, 1);
    assert_eq!(report.persist.patches, 1);
    assert_eq!(ws.counts().await.patches, 1);
    assert!(!sink.matching("notes.dll").is_empty());
}

#[tokio::test]
async fn test_updates_only_records_without_extracting() {
    let ws = Workspace::new();
    for name in ["kb1.cab", "kb2.msu", "kb3.zip"] {
        std::fs::write(ws.updates.join(name), name.as_bytes()).unwrap();
    }

    let report = run(&ws, ws.plan(RunMode::UpdatesOnly(ws.updates.clone()), 2), MemorySink::new())
        .await
        .unwrap();

    assert_eq!(report.persist.updates, 2);
    assert_eq!(ws.counts().await.updates, 2);
    assert!(!ws.patch_dest.join("kb1.cab").exists());
}

#[tokio::test]
async fn test_rerun_appends_to_existing_tables() {
    let ws = Workspace::new();
    std::fs::write(ws.updates.join("kb1.cab"), b"cab").unwrap();
    let mode = RunMode::UpdatesOnly(ws.updates.clone());

    run(&ws, ws.plan(mode.clone(), 1), MemorySink::new()).await.unwrap();
    run(&ws, ws.plan(mode, 1), MemorySink::new()).await.unwrap();

    assert_eq!(ws.counts().await.updates, 2);
}

/// Store whose schema step always fails; counts how often it is closed.
struct BrokenStore {
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl RecordStore for BrokenStore {
    async fn construct_schema(&mut self) -> Result<()> {
        Err(Error::Schema("disk is read-only".into()))
    }

    async fn insert_update(&mut self, _: &UpdateRecord) -> Result<()> {
        unreachable!("no stage should run")
    }

    async fn insert_patch(&mut self, _: &PatchRecord) -> Result<()> {
        unreachable!("no stage should run")
    }

    async fn insert_symbol(&mut self, _: &SymbolRecord) -> Result<()> {
        unreachable!("no stage should run")
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_schema_failure_starts_no_stage_and_closes_once() {
    let ws = Workspace::new();
    std::fs::write(ws.updates.join("kb1.cab"), b"cab").unwrap();
    let sink = MemorySink::new();
    let funnel = LogFunnel::start(sink.clone());
    let log = funnel.producer("TEST");
    let closes = Arc::new(AtomicUsize::new(0));
    let store = BrokenStore {
        closes: closes.clone(),
    };

    let plan = ws.plan(RunMode::Extract(ArchiveSource::Directory(ws.updates.clone())), 2);
    let result = Orchestrator::new(plan, ws.tools(), &log)
        .run(Box::new(store))
        .await;
    drop(log);
    funnel.shutdown().await;

    assert!(matches!(result, Err(Error::Schema(_))));
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert!(sink.matching("Starting").is_empty());
    assert_eq!(sink.matching("Problem creating DB tables").len(), 1);
}
