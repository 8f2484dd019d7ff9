//! Symbol sources: a remote SymSrv endpoint, a symbol store on disk or a
//! UNC share, and a flat local directory.
//!
//! Every source places the resolved PDB at `<dest>/<pdb>/<signature>/<pdb>`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use super::traits::{BinaryIdentity, SymbolSource};
use crate::utils::fs::{ensure_parent_dir, io_error};
use crate::utils::http_client::build_symbol_client;
use crate::utils::retry::{RetryPolicy, retry_transient};
use crate::{Error, Result};

/// Public Microsoft symbol server.
pub const DEFAULT_SYMBOL_SERVER: &str = "https://msdl.microsoft.com/download/symbols";

fn cached_target(identity: &BinaryIdentity, dest: &Path) -> PathBuf {
    dest.join(identity.store_path())
}

async fn already_present(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|m| m.is_file() && m.len() > 0)
}

/// Sibling of `target` no other writer in this process will pick.
fn partial_path(target: &Path) -> PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    target.with_extension(format!("{}.{}.part", std::process::id(), n))
}

/// Publish `partial` as `target`. Workers resolving the same PDB race here;
/// the rename is atomic so readers never see a half-written file.
async fn publish(partial: &Path, target: &Path) -> Result<()> {
    if let Err(e) = tokio::fs::rename(partial, target).await {
        let _ = tokio::fs::remove_file(partial).await;
        return Err(io_error("renaming symbol", target, e));
    }
    Ok(())
}

async fn copy_into(source: &Path, target: &Path) -> Result<()> {
    ensure_parent_dir(target).await?;
    let partial = partial_path(target);
    tokio::fs::copy(source, &partial)
        .await
        .map_err(|e| io_error("copying symbol", source, e))?;
    publish(&partial, target).await
}

/// Downloads from a SymSrv-compatible HTTP endpoint.
pub struct HttpSymbolSource {
    client: reqwest::Client,
    base: String,
    retry: RetryPolicy,
}

impl HttpSymbolSource {
    pub fn new(base: impl Into<String>, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            client: build_symbol_client(timeout)?,
            base: base.into().trim_end_matches('/').to_string(),
            retry,
        })
    }

    pub fn url_for(&self, identity: &BinaryIdentity) -> String {
        format!(
            "{}/{}/{}/{}",
            self.base, identity.pdb_name, identity.signature, identity.pdb_name
        )
    }

    async fn fetch(&self, url: &str, pdb_name: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() || e.is_request() {
                Error::SymbolTransport(format!("{}: {}", url, e))
            } else {
                Error::Http(e)
            }
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::SymbolNotFound(format!("{} ({})", pdb_name, url)));
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::SymbolTransport(format!("{} returned {}", url, status)));
        }
        if !status.is_success() {
            return Err(Error::Other(format!("{} returned {}", url, status)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::SymbolTransport(format!("reading {}: {}", url, e)))?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl SymbolSource for HttpSymbolSource {
    async fn resolve(&self, identity: &BinaryIdentity, dest: &Path) -> Result<PathBuf> {
        let target = cached_target(identity, dest);
        if already_present(&target).await {
            debug!("{} already downloaded", target.display());
            return Ok(target);
        }

        let url = self.url_for(identity);
        let body = retry_transient(self.retry, "symbol download", || {
            self.fetch(&url, &identity.pdb_name)
        })
        .await?;

        ensure_parent_dir(&target).await?;
        let partial = partial_path(&target);
        tokio::fs::write(&partial, &body)
            .await
            .map_err(|e| io_error("writing symbol", &partial, e))?;
        publish(&partial, &target).await?;
        Ok(target)
    }

    fn describe(&self) -> String {
        self.base.clone()
    }
}

/// A symbol store laid out as `<root>/<pdb>/<signature>/<pdb>`, on local disk
/// or a UNC share.
pub struct SymbolStoreSource {
    root: PathBuf,
}

impl SymbolStoreSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SymbolSource for SymbolStoreSource {
    async fn resolve(&self, identity: &BinaryIdentity, dest: &Path) -> Result<PathBuf> {
        let source = self.root.join(identity.store_path());
        if !already_present(&source).await {
            return Err(Error::SymbolNotFound(format!(
                "{} not in {}",
                identity.pdb_name,
                self.root.display()
            )));
        }
        let target = cached_target(identity, dest);
        copy_into(&source, &target).await?;
        Ok(target)
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

/// A flat directory of PDBs, matched by file name only.
pub struct LocalSymbolSource {
    root: PathBuf,
}

impl LocalSymbolSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn find(&self, pdb_name: &str) -> Result<Option<PathBuf>> {
        let exact = self.root.join(pdb_name);
        if already_present(&exact).await {
            return Ok(Some(exact));
        }

        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| io_error("reading symbol directory", &self.root, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("reading symbol directory", &self.root, e))?
        {
            if entry.file_name().to_string_lossy().eq_ignore_ascii_case(pdb_name) {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl SymbolSource for LocalSymbolSource {
    async fn resolve(&self, identity: &BinaryIdentity, dest: &Path) -> Result<PathBuf> {
        let Some(source) = self.find(&identity.pdb_name).await? else {
            return Err(Error::SymbolNotFound(format!(
                "{} not in {}",
                identity.pdb_name,
                self.root.display()
            )));
        };
        let target = cached_target(identity, dest);
        copy_into(&source, &target).await?;
        Ok(target)
    }

    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }
}

/// Pick a source for `location`.
///
/// `local` forces a flat directory; otherwise `http(s)://` selects the HTTP
/// source and anything else is treated as a symbol store path.
pub fn symbol_source_from(
    location: &str,
    local: bool,
    timeout: Duration,
    retry: RetryPolicy,
) -> Result<Arc<dyn SymbolSource>> {
    if local {
        return Ok(Arc::new(LocalSymbolSource::new(location)));
    }
    let lower = location.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Ok(Arc::new(HttpSymbolSource::new(location, timeout, retry)?));
    }
    Ok(Arc::new(SymbolStoreSource::new(location)))
}
