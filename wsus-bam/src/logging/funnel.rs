//! Process-wide log funnel.
//!
//! Every stage pushes [`LogRecord`]s through a cloned [`LogProducer`] into one
//! unbounded channel. A single listener task drains the channel and hands each
//! record to a [`LogSink`], so only one context ever writes to the sink.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Severity of a funnel record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// A structured message plus the stage it came from.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub origin: &'static str,
    pub level: LogLevel,
    pub message: String,
}

enum FunnelMessage {
    Record(LogRecord),
    Close,
}

/// Destination the listener writes to.
pub trait LogSink: Send + 'static {
    fn write(&mut self, record: &LogRecord);

    fn flush(&mut self) {}
}

/// Re-emits funnel records as `tracing` events with a `stage` field.
#[derive(Debug, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&mut self, record: &LogRecord) {
        let stage = record.origin;
        match record.level {
            LogLevel::Debug => debug!(target: "wsus_bam::funnel", stage, "{}", record.message),
            LogLevel::Info => info!(target: "wsus_bam::funnel", stage, "{}", record.message),
            LogLevel::Warn => warn!(target: "wsus_bam::funnel", stage, "{}", record.message),
            LogLevel::Error => error!(target: "wsus_bam::funnel", stage, "{}", record.message),
        }
    }
}

/// Collects records in memory; cloning shares the buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Records whose message contains `needle`.
    pub fn matching(&self, needle: &str) -> Vec<LogRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.message.contains(needle))
            .cloned()
            .collect()
    }
}

impl LogSink for MemorySink {
    fn write(&mut self, record: &LogRecord) {
        self.records.lock().push(record.clone());
    }
}

/// Owner of the funnel channel and its listener task.
pub struct LogFunnel {
    tx: mpsc::UnboundedSender<FunnelMessage>,
    listener: JoinHandle<u64>,
}

impl LogFunnel {
    /// Spawn the listener task draining into `sink`.
    pub fn start(sink: impl LogSink) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = tokio::spawn(listen(rx, sink));
        Self { tx, listener }
    }

    /// A producer tagging its records with `origin`.
    pub fn producer(&self, origin: &'static str) -> LogProducer {
        LogProducer {
            tx: self.tx.clone(),
            origin,
        }
    }

    /// Stop the listener after every record already enqueued has been written.
    ///
    /// Returns the number of records the listener wrote.
    pub async fn shutdown(self) -> u64 {
        let _ = self.tx.send(FunnelMessage::Close);
        match self.listener.await {
            Ok(written) => written,
            Err(e) => {
                error!("Log listener task failed: {}", e);
                0
            }
        }
    }
}

async fn listen(mut rx: mpsc::UnboundedReceiver<FunnelMessage>, mut sink: impl LogSink) -> u64 {
    let mut written = 0u64;

    while let Some(message) = rx.recv().await {
        match message {
            FunnelMessage::Record(record) => {
                sink.write(&record);
                written += 1;
            }
            FunnelMessage::Close => break,
        }
    }

    // Producers racing the close sentinel still get their records written.
    rx.close();
    while let Ok(message) = rx.try_recv() {
        if let FunnelMessage::Record(record) = message {
            sink.write(&record);
            written += 1;
        }
    }

    sink.flush();
    written
}

/// Cloneable sending side of the funnel.
#[derive(Clone)]
pub struct LogProducer {
    tx: mpsc::UnboundedSender<FunnelMessage>,
    origin: &'static str,
}

impl LogProducer {
    /// Same funnel, different origin tag.
    pub fn with_origin(&self, origin: &'static str) -> Self {
        Self {
            tx: self.tx.clone(),
            origin,
        }
    }

    pub fn origin(&self) -> &'static str {
        self.origin
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let record = LogRecord {
            timestamp: Utc::now(),
            origin: self.origin,
            level,
            message: message.into(),
        };
        if let Err(mpsc::error::SendError(FunnelMessage::Record(record))) =
            self.tx.send(FunnelMessage::Record(record))
        {
            // Listener already gone; write straight through instead of losing it.
            TracingSink.write(&record);
        }
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }
}

impl fmt::Debug for LogProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogProducer")
            .field("origin", &self.origin)
            .finish()
    }
}
