//! Run configuration.
//!
//! Values come from three layers: built-in defaults, an optional TOML file
//! (`--config`), and the command line. The command line wins.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::database::DEFAULT_DATABASE_FILE;
use crate::pipeline::{RunPlan, Toolset};
use crate::tools::expand::{DEFAULT_EXPAND_PROGRAM, DEFAULT_EXPAND_TIMEOUT, DEFAULT_NESTED_DEPTH};
use crate::tools::{ExpandExtractor, PeValidator, symbol_source_from};
use crate::utils::retry::RetryPolicy;
use crate::{Error, Result};

pub const DEFAULT_LOG_DIR: &str = "logs";
pub const DEFAULT_SYMBOL_TIMEOUT_SECS: u64 = 60;

/// External tool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub expand_path: PathBuf,
    pub expand_timeout_secs: u64,
    /// Levels of nested `.cab` payloads expanded below each package.
    pub nested_cab_depth: u32,
    /// Per-request timeout for remote symbol downloads.
    pub symbol_timeout_secs: u64,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            expand_path: PathBuf::from(DEFAULT_EXPAND_PROGRAM),
            expand_timeout_secs: DEFAULT_EXPAND_TIMEOUT.as_secs(),
            nested_cab_depth: DEFAULT_NESTED_DEPTH,
            symbol_timeout_secs: DEFAULT_SYMBOL_TIMEOUT_SECS,
        }
    }
}

/// Contents of the optional TOML file.
///
/// ```toml
/// workers = 8
/// database = "WSUS_Update_data.db"
///
/// [tools]
/// expand_path = 'C:\Windows\System32\expand.exe'
///
/// [symbol_retry]
/// max_attempts = 5
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub workers: Option<usize>,
    pub database: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub tools: ToolConfig,
    pub symbol_retry: RetryPolicy,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::io_path("reading config file", path, e))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        if config.workers == Some(0) {
            return Err(Error::config("workers must be at least 1"));
        }
        Ok(config)
    }
}

/// A fully resolved invocation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub plan: RunPlan,
    pub database: PathBuf,
    pub log_dir: PathBuf,
    pub verbose: bool,
    /// URL, symbol store path, or flat directory.
    pub symbol_location: String,
    pub symbol_local: bool,
    pub tools: ToolConfig,
    pub symbol_retry: RetryPolicy,
}

/// Command-line values that override the file layer.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub workers: Option<usize>,
    pub database: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

impl Settings {
    pub fn resolve(
        plan: RunPlan,
        symbol_location: String,
        symbol_local: bool,
        verbose: bool,
        cli: Overrides,
        file: PipelineConfig,
    ) -> Self {
        let plan = match cli.workers.or(file.workers) {
            Some(workers) => plan.with_workers(workers),
            None => plan,
        };
        Self {
            plan,
            database: cli
                .database
                .or(file.database)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_FILE)),
            log_dir: cli
                .log_dir
                .or(file.log_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
            verbose,
            symbol_location,
            symbol_local,
            tools: file.tools,
            symbol_retry: file.symbol_retry,
        }
    }

    /// Concrete collaborators for this invocation.
    pub fn toolset(&self) -> Result<Toolset> {
        let symbols = symbol_source_from(
            &self.symbol_location,
            self.symbol_local,
            Duration::from_secs(self.tools.symbol_timeout_secs),
            self.symbol_retry,
        )?;
        Ok(Toolset {
            extractor: Arc::new(
                ExpandExtractor::new(
                    &self.tools.expand_path,
                    Duration::from_secs(self.tools.expand_timeout_secs),
                )
                .with_nested_depth(self.tools.nested_cab_depth),
            ),
            validator: Arc::new(PeValidator),
            symbols,
        })
    }
}
