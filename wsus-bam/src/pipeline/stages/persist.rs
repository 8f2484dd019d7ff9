//! Persist stage: the single owner of the record store.
//!
//! Records arrive over a [`JobQueue`] from every producing stage and are
//! written one at a time by one task, so the store never sees concurrent use.

use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::database::{PersistRecord, RecordKind, RecordStore};
use crate::logging::LogProducer;
use crate::pipeline::job_queue::{CompletionTracker, JobQueue, JobSender, QueueItem, TokenObservation};
use crate::pipeline::jobs::Job;
use crate::pipeline::stage::StageKind;
use crate::{Error, Result};

/// Counters reported by a joined Persist stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersistStats {
    pub received: u64,
    pub updates: u64,
    pub patches: u64,
    pub symbols: u64,
    /// Records whose insert failed.
    pub dropped: u64,
    pub tokens: u64,
    pub elapsed: Duration,
}

impl PersistStats {
    pub fn inserted(&self) -> u64 {
        self.updates + self.patches + self.symbols
    }

    fn count(&mut self, kind: RecordKind) {
        match kind {
            RecordKind::Update => self.updates += 1,
            RecordKind::Patch => self.patches += 1,
            RecordKind::Symbol => self.symbols += 1,
        }
    }
}

type ActorHandle = JoinHandle<(Box<dyn RecordStore>, PersistStats)>;

pub struct PersistStage {
    queue: JobQueue<PersistRecord>,
    store: Option<Box<dyn RecordStore>>,
    expected_producers: usize,
    log: LogProducer,
    actor: Option<ActorHandle>,
}

impl PersistStage {
    /// `expected_producers` is the number of stages that will each send one
    /// completion token.
    pub fn new(store: Box<dyn RecordStore>, expected_producers: usize, log: &LogProducer) -> Self {
        Self {
            queue: JobQueue::new(StageKind::Persist.as_str()),
            store: Some(store),
            expected_producers,
            log: log.with_origin(StageKind::Persist.as_str()),
            actor: None,
        }
    }

    /// Producer handle for a stage that writes records.
    pub fn handle(&self) -> JobSender<PersistRecord> {
        self.queue.sender()
    }

    pub fn expected_producers(&self) -> usize {
        self.expected_producers
    }

    /// Move the store into the writer task.
    pub fn start(&mut self) {
        let Some(mut store) = self.store.take() else {
            self.log.warn("PERSIST stage already started");
            return;
        };

        let receiver = self.queue.receiver();
        let tracker = CompletionTracker::new(self.expected_producers);
        let log = self.log.clone();
        log.info(format!(
            "Starting PERSIST stage, expecting {} producer(s)",
            self.expected_producers
        ));

        self.actor = Some(tokio::spawn(async move {
            let started_at = Instant::now();
            let mut stats = PersistStats::default();

            if tracker.expected() == 0 {
                receiver.close();
            }

            while let Some(item) = receiver.dequeue().await {
                match item {
                    QueueItem::Job(record) => {
                        stats.received += 1;
                        match store.insert(&record).await {
                            Ok(()) => stats.count(record.kind()),
                            Err(e) => {
                                stats.dropped += 1;
                                log.error(format!(
                                    "Failed to insert {} record for {}: {}",
                                    record.kind(),
                                    record.path().display(),
                                    e
                                ));
                            }
                        }
                    }
                    QueueItem::Done => {
                        stats.tokens += 1;
                        match tracker.observe() {
                            TokenObservation::Pending { remaining } => {
                                log.debug(format!("{} producer(s) still writing", remaining));
                            }
                            TokenObservation::Final => {
                                receiver.close();
                                break;
                            }
                            TokenObservation::Surplus { observed } => {
                                log.warn(format!(
                                    "PERSIST received {} completion tokens but expects {}",
                                    observed,
                                    tracker.expected()
                                ));
                            }
                        }
                    }
                }
            }

            for item in receiver.drain_remaining().await {
                if let QueueItem::Job(record) = item {
                    stats.received += 1;
                    stats.dropped += 1;
                    log.warn(format!(
                        "Dropping {} record received after all producers completed",
                        record.kind()
                    ));
                }
            }

            stats.elapsed = started_at.elapsed();
            log.info(format!(
                "PERSIST stage finished: {} updates, {} patches, {} symbols, {} failed",
                stats.updates, stats.patches, stats.symbols, stats.dropped
            ));
            (store, stats)
        }));
    }

    /// Stop the writer at its next dequeue without waiting for tokens.
    /// Records still queued are counted as dropped.
    pub fn abort(&self) {
        self.log.warn("PERSIST stage aborted before all producers completed");
        self.queue.receiver().close();
    }

    pub fn receivejobset(&self, record: PersistRecord) -> Result<()> {
        self.queue.sender().send_job(record)
    }

    pub fn donesig(&self) -> Result<()> {
        self.queue.sender().send_done()
    }

    /// Wait for the writer to observe every producer's token, then hand the
    /// store back for closing.
    pub async fn join(&mut self) -> Result<(Box<dyn RecordStore>, PersistStats)> {
        let Some(actor) = self.actor.take() else {
            return Err(Error::Other("PERSIST stage was never started".into()));
        };
        actor
            .await
            .map_err(|e| Error::Other(format!("PERSIST writer task failed: {}", e)))
    }
}
