//! Command-line surface.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{Overrides, PipelineConfig, Settings};
use crate::pipeline::{ArchiveSource, RunMode, RunPlan};
use crate::tools::DEFAULT_SYMBOL_SERVER;

/// Printed when the flags do not name a runnable mode.
pub const INVALID_OPTION: &str = "Invalid option -- view -h";

#[derive(Parser, Debug, Clone)]
#[command(name = "wsus-bam", author, version, about, long_about = None)]
pub struct Args {
    /// Path to a single update file. Requires --extract.
    #[arg(short = 'f', long)]
    pub file: Option<PathBuf>,

    /// Extract updates, validate binaries and retrieve symbols
    #[arg(short = 'x', long)]
    pub extract: bool,

    /// Only populate the database; combine with exactly one --get* flag
    #[arg(short = 'c', long = "createdbonly")]
    pub create_db_only: bool,

    /// Directory holding Windows updates (CAB/MSU)
    #[arg(short = 'p', long = "patchpath")]
    pub patch_path: Option<PathBuf>,

    /// Destination for extracted PE files
    #[arg(long = "patchdest", visible_alias = "pd", default_value = "extractedPatches")]
    pub patch_dest: PathBuf,

    /// Record symbols for the binaries under --patchdest
    #[arg(long = "getsymbols", visible_alias = "gs")]
    pub get_symbols: bool,

    /// Record validated binaries under --patchdest
    #[arg(long = "getpatches", visible_alias = "gp")]
    pub get_patches: bool,

    /// Record update files under --patchpath
    #[arg(long = "getupdates", visible_alias = "gu")]
    pub get_updates: bool,

    /// Treat --symbolserver as a flat local directory of PDBs
    #[arg(long = "symlocal", visible_alias = "sl")]
    pub sym_local: bool,

    /// Symbol server URL, UNC symbol store, or local directory with --symlocal
    #[arg(long = "symbolserver", visible_alias = "ss", default_value = DEFAULT_SYMBOL_SERVER)]
    pub symbol_server: String,

    /// Destination for retrieved symbols
    #[arg(long = "symdestpath", visible_alias = "sp", default_value = "updatefilesymbols")]
    pub sym_dest_path: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Database file (default WSUS_Update_data.db)
    #[arg(long, env = "WSUS_BAM_DB")]
    pub db: Option<PathBuf>,

    /// Workers per stage
    #[arg(long, env = "WSUS_BAM_WORKERS", value_parser = clap::value_parser!(u16).range(1..))]
    pub workers: Option<u16>,

    /// TOML file with pipeline settings
    #[arg(long, env = "WSUS_BAM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory for rolling log files
    #[arg(long = "log-dir", env = "WSUS_BAM_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Write the run report as JSON to this file
    #[arg(long)]
    pub report: Option<PathBuf>,
}

impl Args {
    /// The mode these flags select, or `None` for an invalid combination.
    pub fn run_mode(&self) -> Option<RunMode> {
        if self.extract {
            if let Some(file) = &self.file {
                return Some(RunMode::Extract(ArchiveSource::File(file.clone())));
            }
            return self
                .patch_path
                .as_ref()
                .map(|dir| RunMode::Extract(ArchiveSource::Directory(dir.clone())));
        }

        if !self.create_db_only {
            return None;
        }
        match (self.get_symbols, self.get_patches, self.get_updates) {
            (true, false, false) => Some(RunMode::SymbolsOnly),
            (false, true, false) => Some(RunMode::PatchesOnly),
            (false, false, true) => self.patch_path.clone().map(RunMode::UpdatesOnly),
            _ => None,
        }
    }

    /// Merge these flags with the file layer.
    pub fn settings(&self, mode: RunMode, file: PipelineConfig) -> Settings {
        let plan = RunPlan::new(mode, &self.patch_dest, &self.sym_dest_path);
        Settings::resolve(
            plan,
            self.symbol_server.clone(),
            self.sym_local,
            self.verbose,
            Overrides {
                workers: self.workers.map(usize::from),
                database: self.db.clone(),
                log_dir: self.log_dir.clone(),
            },
            file,
        )
    }
}
