//! Application-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    /// Table construction failed; fatal for the whole run.
    #[error("Schema construction failed: {0}")]
    Schema(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error while {op} ({path}): {source}")]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Extraction of {path} failed: {reason}")]
    Extraction { path: PathBuf, reason: String },

    #[error("{path} is not a valid PE image: {reason}")]
    Validation { path: PathBuf, reason: String },

    #[error("No symbol found for {0}")]
    SymbolNotFound(String),

    #[error("Symbol transport error: {0}")]
    SymbolTransport(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Queue closed: {0}")]
    ChannelClosed(&'static str),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to parse config file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn extraction(path: &Path, reason: impl Into<String>) -> Self {
        Self::Extraction {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn validation(path: &Path, reason: impl Into<String>) -> Self {
        Self::Validation {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::SymbolTransport(_) => true,
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::Io(e) | Error::IoPath { source: e, .. } => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}
