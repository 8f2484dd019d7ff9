//! Table definitions.
//!
//! Construction is additive: every statement is `IF NOT EXISTS`, so running
//! it against an existing database keeps prior rows.

use sqlx::SqliteConnection;

use crate::{Error, Result};

pub const UPDATE_TABLE: &str = "UpdateFiles";
pub const PATCH_TABLE: &str = "PatchedFiles";
pub const SYMBOL_TABLE: &str = "SymbolFiles";

pub const TABLES: [&str; 3] = [UPDATE_TABLE, PATCH_TABLE, SYMBOL_TABLE];

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS UpdateFiles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        path TEXT NOT NULL,
        kind TEXT NOT NULL,
        size INTEGER NOT NULL,
        sha256 TEXT NOT NULL,
        modified TEXT,
        extracted_to TEXT,
        recorded_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_update_files_sha256 ON UpdateFiles(sha256)",
    r#"
    CREATE TABLE IF NOT EXISTS PatchedFiles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        path TEXT NOT NULL,
        update_file TEXT,
        size INTEGER NOT NULL,
        sha256 TEXT NOT NULL,
        machine TEXT NOT NULL,
        image_kind TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        pdb_name TEXT,
        pdb_signature TEXT,
        recorded_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_patched_files_sha256 ON PatchedFiles(sha256)",
    "CREATE INDEX IF NOT EXISTS idx_patched_files_signature ON PatchedFiles(pdb_signature)",
    r#"
    CREATE TABLE IF NOT EXISTS SymbolFiles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        path TEXT NOT NULL,
        size INTEGER NOT NULL,
        sha256 TEXT NOT NULL,
        signature TEXT NOT NULL,
        binary_name TEXT NOT NULL,
        binary_sha256 TEXT NOT NULL,
        source TEXT NOT NULL,
        recorded_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_symbol_files_signature ON SymbolFiles(signature)",
];

/// Create any missing tables and indexes.
///
/// Any failure is reported as [`Error::Schema`].
pub async fn construct_schema(conn: &mut SqliteConnection) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement)
            .execute(&mut *conn)
            .await
            .map_err(|e| Error::Schema(e.to_string()))?;
    }
    Ok(())
}
