//! Stage manager: a worker pool bound to one input queue.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::{JoinHandle, JoinSet};

use super::job_queue::{CompletionTracker, JobQueue, JobReceiver, JobSender, QueueItem, TokenObservation};
use super::jobs::Job;
use super::stage::{JobSink, Stage, StageContext, StageKind};
use crate::database::PersistRecord;
use crate::logging::LogProducer;
use crate::{Error, Result};

/// Sizing of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Completion tokens to observe before the pool may shut down.
    pub expected_producers: usize,
}

impl StageConfig {
    pub fn new(workers: usize, expected_producers: usize) -> Self {
        Self {
            workers: workers.max(1),
            expected_producers,
        }
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        Self::new(default_worker_count(), 1)
    }
}

/// Worker count matching the host's available parallelism.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[derive(Debug, Default)]
struct StageCounters {
    received: AtomicU64,
    completed: AtomicU64,
    dropped: AtomicU64,
    forwarded: AtomicU64,
    tokens: AtomicU64,
}

impl StageCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counters reported by a joined stage.
///
/// Once joined, `received == completed + dropped`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageStats {
    pub stage: StageKind,
    pub workers: usize,
    /// Jobs dequeued.
    pub received: u64,
    /// Jobs processed successfully.
    pub completed: u64,
    /// Jobs that failed and were logged.
    pub dropped: u64,
    /// Output jobs handed to downstream sinks.
    pub forwarded: u64,
    /// Completion tokens observed.
    pub tokens: u64,
    pub elapsed: Duration,
}

impl StageStats {
    pub fn elapsed_minutes(&self) -> f64 {
        self.elapsed.as_secs_f64() / 60.0
    }
}

/// Owns the worker pool of one stage.
///
/// Lifecycle: [`new`](Self::new) → wire downstream → [`start`](Self::start)
/// → producers call [`receivejobset`](Self::receivejobset) and
/// [`donesig`](Self::donesig) → [`join`](Self::join).
pub struct StageManager<S: Stage> {
    stage: Arc<S>,
    config: StageConfig,
    queue: JobQueue<S::Input>,
    downstream: Vec<Arc<dyn JobSink<S::Output>>>,
    persist: Option<JobSender<PersistRecord>>,
    log: LogProducer,
    counters: Arc<StageCounters>,
    supervisor: Option<JoinHandle<Duration>>,
}

impl<S: Stage> StageManager<S> {
    /// Create a stopped manager. `log` is re-tagged with the stage's origin.
    pub fn new(stage: S, config: StageConfig, log: &LogProducer) -> Self {
        let kind = stage.kind();
        Self {
            stage: Arc::new(stage),
            config,
            queue: JobQueue::new(kind.as_str()),
            downstream: Vec::new(),
            persist: None,
            log: log.with_origin(kind.as_str()),
            counters: Arc::new(StageCounters::default()),
            supervisor: None,
        }
    }

    /// Forward successful outputs to `sink`, and signal it on completion.
    pub fn with_downstream(mut self, sink: Arc<dyn JobSink<S::Output>>) -> Self {
        self.downstream.push(sink);
        self
    }

    /// Attach the Persist stage; it receives this stage's records and one
    /// completion token when this stage finishes.
    pub fn with_persist(mut self, persist: JobSender<PersistRecord>) -> Self {
        self.persist = Some(persist);
        self
    }

    pub fn kind(&self) -> StageKind {
        self.stage.kind()
    }

    pub fn config(&self) -> StageConfig {
        self.config
    }

    /// A sink feeding this stage's input queue, for wiring an upstream stage.
    pub fn sink(&self) -> Arc<dyn JobSink<S::Input>> {
        Arc::new(self.queue.sender())
    }

    pub fn sender(&self) -> JobSender<S::Input> {
        self.queue.sender()
    }

    /// Spawn the worker pool. Workers idle on the input queue until jobs arrive.
    pub fn start(&mut self) {
        if self.supervisor.is_some() {
            self.log.warn(format!("{} stage already started", self.kind()));
            return;
        }

        let kind = self.kind();
        let started_at = Instant::now();
        let receiver = self.queue.receiver();
        let tracker = Arc::new(CompletionTracker::new(self.config.expected_producers));
        let downstream = Arc::new(self.downstream.clone());

        self.log.info(format!(
            "Starting {} stage with {} workers, expecting {} producer(s)",
            kind, self.config.workers, self.config.expected_producers
        ));

        if self.config.expected_producers == 0 {
            receiver.close();
        }

        let mut workers = JoinSet::new();
        for i in 0..self.config.workers {
            let worker = Worker {
                stage: self.stage.clone(),
                receiver: receiver.clone(),
                tracker: tracker.clone(),
                downstream: downstream.clone(),
                counters: self.counters.clone(),
                ctx: StageContext::new(i, self.log.clone(), self.persist.clone()),
            };
            workers.spawn(worker.run());
        }

        let log = self.log.clone();
        let counters = self.counters.clone();
        let persist = self.persist.clone();

        self.supervisor = Some(tokio::spawn(async move {
            while let Some(result) = workers.join_next().await {
                if let Err(e) = result {
                    // Only `process` can panic, so the job in hand was
                    // already counted as received.
                    StageCounters::bump(&counters.dropped);
                    log.error(format!("{} worker task failed: {}", kind, e));
                }
            }

            for item in receiver.drain_remaining().await {
                match item {
                    QueueItem::Job(job) => {
                        StageCounters::bump(&counters.received);
                        StageCounters::bump(&counters.dropped);
                        log.warn(format!(
                            "Dropping {} received after all producers completed",
                            job.path().display()
                        ));
                    }
                    QueueItem::Done => {
                        StageCounters::bump(&counters.tokens);
                        log.warn(format!("Ignoring surplus completion token for {}", kind));
                    }
                }
            }

            for sink in downstream.iter() {
                if let Err(e) = sink.donesig() {
                    log.error(format!("Failed to signal completion to {}: {}", sink.name(), e));
                }
            }
            if let Some(persist) = persist
                && let Err(e) = persist.send_done()
            {
                log.error(format!("Failed to signal completion to database writer: {}", e));
            }

            let elapsed = started_at.elapsed();
            log.info(format!(
                "{} stage finished: {} received, {} completed, {} dropped, {} forwarded in {:.2}s",
                kind,
                counters.received.load(Ordering::Relaxed),
                counters.completed.load(Ordering::Relaxed),
                counters.dropped.load(Ordering::Relaxed),
                counters.forwarded.load(Ordering::Relaxed),
                elapsed.as_secs_f64()
            ));
            elapsed
        }));
    }

    /// Enqueue a job for this stage.
    pub fn receivejobset(&self, job: S::Input) -> Result<()> {
        self.queue.sender().send_job(job)
    }

    /// Enqueue one completion token on behalf of one producer.
    pub fn donesig(&self) -> Result<()> {
        self.queue.sender().send_done()
    }

    /// Wait until every worker has exited and downstream has been signalled.
    ///
    /// Blocks forever if fewer completion tokens arrive than the stage expects.
    pub async fn join(&mut self) -> Result<StageStats> {
        let Some(supervisor) = self.supervisor.take() else {
            return Err(Error::Other(format!("{} stage was never started", self.kind())));
        };

        let elapsed = supervisor
            .await
            .map_err(|e| Error::Other(format!("{} stage supervisor failed: {}", self.kind(), e)))?;

        Ok(self.stats(elapsed))
    }

    fn stats(&self, elapsed: Duration) -> StageStats {
        StageStats {
            stage: self.kind(),
            workers: self.config.workers,
            received: self.counters.received.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            tokens: self.counters.tokens.load(Ordering::Relaxed),
            elapsed,
        }
    }
}

struct Worker<S: Stage> {
    stage: Arc<S>,
    receiver: JobReceiver<S::Input>,
    tracker: Arc<CompletionTracker>,
    downstream: Arc<Vec<Arc<dyn JobSink<S::Output>>>>,
    counters: Arc<StageCounters>,
    ctx: StageContext,
}

impl<S: Stage> Worker<S> {
    async fn run(self) {
        let kind = self.stage.kind();
        let id = self.ctx.worker;
        let log = &self.ctx.log;
        log.debug(format!("{} worker {} started", kind, id));

        while let Some(item) = self.receiver.dequeue().await {
            match item {
                QueueItem::Job(job) => self.handle(job).await,
                QueueItem::Done => {
                    StageCounters::bump(&self.counters.tokens);
                    match self.tracker.observe() {
                        TokenObservation::Pending { remaining } => {
                            log.debug(format!(
                                "{} worker {} saw completion token, {} producer(s) outstanding",
                                kind, id, remaining
                            ));
                        }
                        TokenObservation::Final => {
                            log.debug(format!(
                                "{} worker {} saw final completion token, closing queue",
                                kind, id
                            ));
                            self.receiver.close();
                            break;
                        }
                        TokenObservation::Surplus { observed } => {
                            log.warn(format!(
                                "{} received {} completion tokens but expects {}",
                                kind,
                                observed,
                                self.tracker.expected()
                            ));
                        }
                    }
                }
            }
        }

        log.debug(format!("{} worker {} shutting down", kind, id));
    }

    async fn handle(&self, job: S::Input) {
        StageCounters::bump(&self.counters.received);
        let label = job.path().display().to_string();

        match self.stage.process(job, &self.ctx).await {
            Ok(outputs) => {
                StageCounters::bump(&self.counters.completed);
                for output in outputs {
                    for sink in self.downstream.iter() {
                        match sink.receivejobset(output.clone()) {
                            Ok(()) => StageCounters::bump(&self.counters.forwarded),
                            Err(e) => self.ctx.log.error(format!(
                                "Failed to forward result of {} to {}: {}",
                                label,
                                sink.name(),
                                e
                            )),
                        }
                    }
                }
            }
            Err(e) => {
                StageCounters::bump(&self.counters.dropped);
                self.ctx.log.error(format!("Dropping {}: {}", label, e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{LogFunnel, MemorySink};
    use crate::pipeline::jobs::ArchiveJob;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::path::PathBuf;

    /// Fails every job whose file name ends in an odd digit.
    struct ParityStage {
        seen: Arc<Mutex<Vec<PathBuf>>>,
    }

    #[async_trait]
    impl Stage for ParityStage {
        type Input = ArchiveJob;
        type Output = ArchiveJob;

        fn kind(&self) -> StageKind {
            StageKind::Extract
        }

        async fn process(&self, job: ArchiveJob, _ctx: &StageContext) -> Result<Vec<ArchiveJob>> {
            self.seen.lock().push(job.path.clone());
            tokio::task::yield_now().await;
            let digit = job
                .path
                .to_string_lossy()
                .chars()
                .last()
                .and_then(|c| c.to_digit(10))
                .unwrap_or(0);
            if digit % 2 == 1 {
                Err(Error::Other("odd".into()))
            } else {
                Ok(vec![job])
            }
        }
    }

    fn parity_manager(
        workers: usize,
        producers: usize,
        log: &LogProducer,
    ) -> (StageManager<ParityStage>, Arc<Mutex<Vec<PathBuf>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stage = ParityStage { seen: seen.clone() };
        (
            StageManager::new(stage, StageConfig::new(workers, producers), log),
            seen,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_every_job_processed_exactly_once_and_partitioned() {
        const JOBS: usize = 400;
        let funnel = LogFunnel::start(MemorySink::new());
        let log = funnel.producer("TEST");

        let downstream = JobQueue::new("collector");
        let (manager, seen) = parity_manager(6, 1, &log);
        let mut manager = manager.with_downstream(Arc::new(downstream.sender()));
        manager.start();

        for i in 0..JOBS {
            manager.receivejobset(ArchiveJob::new(format!("job-{i}"))).unwrap();
        }
        manager.donesig().unwrap();
        let stats = manager.join().await.unwrap();

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), JOBS);
        assert_eq!(seen.iter().collect::<HashSet<_>>().len(), JOBS);

        assert_eq!(stats.received, JOBS as u64);
        assert_eq!(stats.completed + stats.dropped, JOBS as u64);
        assert_eq!(stats.completed, (JOBS / 2) as u64);
        assert_eq!(stats.forwarded, stats.completed);
        assert_eq!(stats.tokens, 1);

        let rx = downstream.receiver();
        let mut forwarded = 0;
        loop {
            match rx.dequeue().await {
                Some(QueueItem::Job(_)) => forwarded += 1,
                Some(QueueItem::Done) => break,
                None => panic!("collector closed"),
            }
        }
        assert_eq!(forwarded, JOBS / 2);
        funnel.shutdown().await;
    }

    /// Panics on any job named `boom`.
    struct PanickingStage;

    #[async_trait]
    impl Stage for PanickingStage {
        type Input = ArchiveJob;
        type Output = ArchiveJob;

        fn kind(&self) -> StageKind {
            StageKind::Clean
        }

        async fn process(&self, job: ArchiveJob, _ctx: &StageContext) -> Result<Vec<ArchiveJob>> {
            if job.path.ends_with("boom") {
                panic!("stage bug");
            }
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_panicking_job_counts_as_dropped() {
        let sink = MemorySink::new();
        let funnel = LogFunnel::start(sink.clone());
        let log = funnel.producer("TEST");
        let mut manager = StageManager::new(PanickingStage, StageConfig::new(2, 1), &log);
        manager.start();

        for name in ["boom", "ok0", "ok2"] {
            manager.receivejobset(ArchiveJob::new(name)).unwrap();
        }
        manager.donesig().unwrap();
        let stats = tokio::time::timeout(Duration::from_secs(5), manager.join())
            .await
            .unwrap()
            .unwrap();
        funnel.shutdown().await;

        assert_eq!(stats.received, 3);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.received, stats.completed + stats.dropped);
        assert_eq!(sink.matching("CLEAN worker task failed").len(), 1);
    }

    #[tokio::test]
    async fn test_join_waits_for_all_producers() {
        let funnel = LogFunnel::start(MemorySink::new());
        let log = funnel.producer("TEST");
        let (mut manager, _) = parity_manager(3, 2, &log);
        manager.start();

        manager.receivejobset(ArchiveJob::new("a0")).unwrap();
        manager.donesig().unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(200), manager.join()).await;
        assert!(pending.is_err(), "stage joined with a producer outstanding");
        funnel.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_producer_token_releases_join() {
        let funnel = LogFunnel::start(MemorySink::new());
        let log = funnel.producer("TEST");
        let (mut manager, seen) = parity_manager(2, 2, &log);
        manager.start();

        let a = manager.sender();
        let b = manager.sender();
        a.send_job(ArchiveJob::new("a0")).unwrap();
        b.send_job(ArchiveJob::new("b2")).unwrap();
        a.send_done().unwrap();
        b.send_job(ArchiveJob::new("b4")).unwrap();
        b.send_done().unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(5), manager.join())
            .await
            .expect("join did not complete")
            .unwrap();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.tokens, 2);
        assert_eq!(seen.lock().len(), 3);
        funnel.shutdown().await;
    }

    #[tokio::test]
    async fn test_completion_propagates_to_downstream_and_persist() {
        let funnel = LogFunnel::start(MemorySink::new());
        let log = funnel.producer("TEST");
        let downstream = JobQueue::new("next");
        let persist = JobQueue::new("persist");

        let (manager, _) = parity_manager(2, 1, &log);
        let mut manager = manager
            .with_downstream(Arc::new(downstream.sender()))
            .with_persist(persist.sender());
        manager.start();
        manager.donesig().unwrap();
        manager.join().await.unwrap();

        assert_eq!(downstream.receiver().dequeue().await, Some(QueueItem::Done));
        assert_eq!(persist.receiver().dequeue().await, Some(QueueItem::Done));
        funnel.shutdown().await;
    }

    #[tokio::test]
    async fn test_failures_are_logged_not_raised() {
        let sink = MemorySink::new();
        let funnel = LogFunnel::start(sink.clone());
        let log = funnel.producer("TEST");
        let (mut manager, _) = parity_manager(1, 1, &log);
        manager.start();
        manager.receivejobset(ArchiveJob::new("bad1")).unwrap();
        manager.donesig().unwrap();
        let stats = manager.join().await.unwrap();
        funnel.shutdown().await;

        assert_eq!(stats.dropped, 1);
        let dropped = sink.matching("Dropping bad1");
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].origin, "EXTRACT");
    }

    #[tokio::test]
    async fn test_jobs_after_completion_are_rejected() {
        let funnel = LogFunnel::start(MemorySink::new());
        let log = funnel.producer("TEST");
        let (mut manager, _) = parity_manager(1, 1, &log);
        let sender = manager.sender();
        manager.start();
        manager.donesig().unwrap();
        manager.join().await.unwrap();

        assert!(matches!(
            sender.send_job(ArchiveJob::new("late")),
            Err(Error::ChannelClosed(_))
        ));
        funnel.shutdown().await;
    }

    #[tokio::test]
    async fn test_zero_producers_finishes_immediately() {
        let funnel = LogFunnel::start(MemorySink::new());
        let log = funnel.producer("TEST");
        let (mut manager, _) = parity_manager(2, 0, &log);
        manager.start();
        let stats = tokio::time::timeout(Duration::from_secs(5), manager.join())
            .await
            .expect("join did not complete")
            .unwrap();
        assert_eq!(stats.received, 0);
        funnel.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_without_start_is_error() {
        let funnel = LogFunnel::start(MemorySink::new());
        let log = funnel.producer("TEST");
        let (mut manager, _) = parity_manager(1, 1, &log);
        assert!(manager.join().await.is_err());
        funnel.shutdown().await;
    }

    #[test]
    fn test_stage_config_clamps_workers() {
        assert_eq!(StageConfig::new(0, 1).workers, 1);
        assert!(default_worker_count() >= 1);
    }
}
