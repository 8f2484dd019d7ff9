use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use tracing::info;

use wsus_bam::Error;
use wsus_bam::cli::{Args, INVALID_OPTION};
use wsus_bam::config::PipelineConfig;
use wsus_bam::database::SqliteStore;
use wsus_bam::logging::{self, LogFunnel, TracingSink};
use wsus_bam::pipeline::{Orchestrator, RunMode, RunReport};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();

    if std::env::args_os().len() <= 1 {
        Args::command().print_help()?;
        println!();
        return Ok(ExitCode::from(2));
    }

    let args = Args::parse();

    // Resolve the mode before touching the filesystem.
    let Some(mode) = args.run_mode() else {
        println!("{}", INVALID_OPTION);
        return Ok(ExitCode::SUCCESS);
    };

    let file_config = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    let settings = args.settings(mode, file_config);

    let _log_guard = logging::init_logging(&settings.log_dir, settings.verbose)
        .context("Failed to initialize logging")?;
    let funnel = LogFunnel::start(TracingSink);
    let log = funnel.producer("MAIN");

    println!("{}", banner(&settings.plan.mode));
    info!(
        "wsus-bam {} starting in {} mode with {} worker(s) per stage",
        env!("CARGO_PKG_VERSION"),
        settings.plan.mode.name(),
        settings.plan.workers
    );

    let store = SqliteStore::open(&settings.database)
        .await
        .with_context(|| format!("Failed to open database {}", settings.database.display()))?;
    let tools = settings.toolset().context("Failed to set up symbol source")?;

    let result = Orchestrator::new(settings.plan.clone(), tools, &log)
        .run(Box::new(store))
        .await;

    drop(log);
    let delivered = funnel.shutdown().await;
    tracing::debug!("Log funnel delivered {} record(s)", delivered);

    match result {
        Ok(report) => {
            print_report(&report, &settings.database);
            if let Some(path) = &args.report {
                let json = serde_json::to_string_pretty(&report)?;
                std::fs::write(path, json)
                    .with_context(|| format!("Failed to write report {}", path.display()))?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e @ Error::Schema(_)) => {
            eprintln!("Problem creating DB tables: {}", e);
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}

fn banner(mode: &RunMode) -> &'static str {
    match mode {
        RunMode::Extract(_) => "Extracting updates and retrieving symbols",
        RunMode::SymbolsOnly => "Only retrieving symbols",
        RunMode::PatchesOnly => "Only retrieving patches",
        RunMode::UpdatesOnly(_) => "Only retrieving updates",
    }
}

fn print_report(report: &RunReport, database: &Path) {
    for stage in &report.stages {
        println!(
            "{}: {} received, {} completed, {} dropped ({:.2} min)",
            stage.stage,
            stage.received,
            stage.completed,
            stage.dropped,
            stage.elapsed_minutes()
        );
    }
    println!(
        "Database: {} updates, {} patches, {} symbols inserted, {} failed",
        report.persist.updates, report.persist.patches, report.persist.symbols, report.persist.dropped
    );
    println!(
        "Total time including database insertion ({:.2} min)",
        report.elapsed.as_secs_f64() / 60.0
    );
    println!(
        "{} complete. Check {} for symbols, update metadata and binaries",
        report.mode,
        database.display()
    );
}
