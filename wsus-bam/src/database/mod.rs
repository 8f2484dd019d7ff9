//! Metadata store.
//!
//! A single SQLite connection behind the [`RecordStore`] trait. The Persist
//! stage is the only owner of a store during a run.

pub mod records;
pub mod schema;

pub use records::{PackageKind, PatchRecord, PersistRecord, RecordKind, SymbolRecord, UpdateRecord};

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous,
};
use sqlx::{ConnectOptions, Connection, Sqlite, SqliteConnection};
use tracing::{debug, info, warn};

use crate::Result;
use crate::utils::retry::{RetryPolicy, is_sqlite_busy_error};

/// Database file created in the working directory unless overridden.
pub const DEFAULT_DATABASE_FILE: &str = "WSUS_Update_data.db";

/// Default busy timeout in milliseconds.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Default cache size (negative means KiB).
const DEFAULT_CACHE_SIZE_KB: i32 = -64000;

/// Operations the pipeline needs from a metadata store.
#[async_trait]
pub trait RecordStore: Send {
    /// Create the tables if they are missing.
    async fn construct_schema(&mut self) -> Result<()>;

    async fn insert_update(&mut self, record: &UpdateRecord) -> Result<()>;

    async fn insert_patch(&mut self, record: &PatchRecord) -> Result<()>;

    async fn insert_symbol(&mut self, record: &SymbolRecord) -> Result<()>;

    async fn insert(&mut self, record: &PersistRecord) -> Result<()> {
        match record {
            PersistRecord::Update(r) => self.insert_update(r).await,
            PersistRecord::Patch(r) => self.insert_patch(r).await,
            PersistRecord::Symbol(r) => self.insert_symbol(r).await,
        }
    }

    /// Release the underlying connection.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Row counts per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RowCounts {
    pub updates: i64,
    pub patches: i64,
    pub symbols: i64,
}

/// [`RecordStore`] over one SQLite connection.
pub struct SqliteStore {
    conn: SqliteConnection,
    location: String,
    busy_retry: RetryPolicy,
}

impl SqliteStore {
    /// Open (creating if needed) a database file with WAL journaling.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
            .create_if_missing(true);

        let store = Self::connect(options, path.display().to_string()).await?;
        info!("Database opened at {}", store.location);
        Ok(store)
    }

    /// An in-memory database, gone once closed.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::connect(options, ":memory:".to_string()).await
    }

    async fn connect(options: SqliteConnectOptions, location: String) -> Result<Self> {
        let mut conn = options.connect().await?;

        sqlx::query(&format!("PRAGMA cache_size = {}", DEFAULT_CACHE_SIZE_KB))
            .execute(&mut conn)
            .await?;
        sqlx::query("PRAGMA temp_store = MEMORY")
            .execute(&mut conn)
            .await?;

        Ok(Self {
            conn,
            location,
            busy_retry: RetryPolicy::sqlite_busy(),
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub async fn row_counts(&mut self) -> Result<RowCounts> {
        Ok(RowCounts {
            updates: self.count(schema::UPDATE_TABLE).await?,
            patches: self.count(schema::PATCH_TABLE).await?,
            symbols: self.count(schema::SYMBOL_TABLE).await?,
        })
    }

    async fn count(&mut self, table: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&mut self.conn).await?;
        Ok(count)
    }

    /// Execute a write, retrying while SQLite reports the database as busy.
    async fn execute_write<'q, F>(&mut self, op: &str, build: F) -> Result<()>
    where
        F: Fn() -> Query<'q, Sqlite, SqliteArguments<'q>> + Send,
    {
        let max_attempts = self.busy_retry.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            match build().execute(&mut self.conn).await {
                Ok(_) => return Ok(()),
                Err(e) if is_sqlite_busy_error(&e) && attempt + 1 < max_attempts => {
                    let delay = self.busy_retry.delay_for(attempt);
                    attempt += 1;
                    warn!(
                        "{} hit a busy database (attempt {}/{}), retrying in {:?}",
                        op, attempt, max_attempts, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn opt_path_text(path: Option<&PathBuf>) -> Option<String> {
    path.map(|p| path_text(p))
}

fn size_column(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn construct_schema(&mut self) -> Result<()> {
        schema::construct_schema(&mut self.conn).await?;
        debug!("Schema ready in {}", self.location);
        Ok(())
    }

    async fn insert_update(&mut self, record: &UpdateRecord) -> Result<()> {
        let path = path_text(&record.path);
        let extracted_to = opt_path_text(record.extracted_to.as_ref());
        let modified = record.modified.map(|m| m.to_rfc3339());
        let recorded_at = record.recorded_at.to_rfc3339();

        self.execute_write("insert_update", || {
            sqlx::query(
                r#"
                INSERT INTO UpdateFiles (name, path, kind, size, sha256, modified, extracted_to, recorded_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(record.name.as_str())
            .bind(path.as_str())
            .bind(record.kind.as_str())
            .bind(size_column(record.digest.size))
            .bind(record.digest.sha256.as_str())
            .bind(modified.as_deref())
            .bind(extracted_to.as_deref())
            .bind(recorded_at.as_str())
        })
        .await
    }

    async fn insert_patch(&mut self, record: &PatchRecord) -> Result<()> {
        let path = path_text(&record.path);
        let recorded_at = record.recorded_at.to_rfc3339();

        self.execute_write("insert_patch", || {
            sqlx::query(
                r#"
                INSERT INTO PatchedFiles
                    (name, path, update_file, size, sha256, machine, image_kind, timestamp, pdb_name, pdb_signature, recorded_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(record.name.as_str())
            .bind(path.as_str())
            .bind(record.update_file.as_deref())
            .bind(size_column(record.digest.size))
            .bind(record.digest.sha256.as_str())
            .bind(record.machine)
            .bind(record.image_kind)
            .bind(record.timestamp)
            .bind(record.pdb_name.as_deref())
            .bind(record.pdb_signature.as_deref())
            .bind(recorded_at.as_str())
        })
        .await
    }

    async fn insert_symbol(&mut self, record: &SymbolRecord) -> Result<()> {
        let path = path_text(&record.path);
        let recorded_at = record.recorded_at.to_rfc3339();

        self.execute_write("insert_symbol", || {
            sqlx::query(
                r#"
                INSERT INTO SymbolFiles
                    (name, path, size, sha256, signature, binary_name, binary_sha256, source, recorded_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(record.name.as_str())
            .bind(path.as_str())
            .bind(size_column(record.digest.size))
            .bind(record.digest.sha256.as_str())
            .bind(record.signature.as_str())
            .bind(record.binary_name.as_str())
            .bind(record.binary_sha256.as_str())
            .bind(record.source.as_str())
            .bind(recorded_at.as_str())
        })
        .await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let location = self.location.clone();
        self.conn.close().await?;
        debug!("Database {} closed", location);
        Ok(())
    }
}
