//! Bounded retry helpers: SQLite busy handling and transient transport errors.

use rand::random;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::Result;

const SQLITE_BUSY_MAX_RETRIES: u32 = 12;
const SQLITE_BUSY_BASE_DELAY_MS: u64 = 10;
const SQLITE_BUSY_MAX_DELAY_MS: u64 = 2000;

pub fn is_sqlite_busy_error(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = err else {
        let msg = err.to_string().to_ascii_lowercase();
        return msg.contains("database is locked") || msg.contains("database is busy");
    };

    let code = db_err.code().map(Cow::into_owned);
    if matches!(code.as_deref(), Some("5") | Some("6")) {
        return true;
    }

    let msg = db_err.message().to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// Policy used for SQLite busy/locked errors.
    pub fn sqlite_busy() -> Self {
        Self {
            max_attempts: SQLITE_BUSY_MAX_RETRIES + 1,
            base_delay_ms: SQLITE_BUSY_BASE_DELAY_MS,
            max_delay_ms: SQLITE_BUSY_MAX_DELAY_MS,
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp_backoff_ms = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(16));
        let capped_ms = exp_backoff_ms.min(self.max_delay_ms);
        let jitter_ms = random::<u64>() % (capped_ms / 4 + 1);
        Duration::from_millis((capped_ms + jitter_ms).min(self.max_delay_ms))
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are exhausted.
pub async fn retry_transient<T, F, Fut>(policy: RetryPolicy, op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if !err.is_transient() || attempt >= max_attempts {
                    return Err(err);
                }

                let delay = policy.delay_for(attempt - 1);
                debug!(
                    "Transient failure during {}: {}; retrying in {:?} (attempt {}/{})",
                    op_name, err, delay, attempt + 1, max_attempts
                );
                sleep(delay).await;
            }
        }
    }
}
