//! wsus-bam library crate.
//!
//! Extracts binaries from Windows update packages, resolves their symbols and
//! records metadata in SQLite. Exposed as a library for integration testing.

pub mod cli;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod tools;
pub mod utils;

pub use error::{Error, Result};
