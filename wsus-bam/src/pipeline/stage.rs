//! Stage trait and the plumbing shared by every stage.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::job_queue::JobSender;
use super::jobs::Job;
use crate::Result;
use crate::database::PersistRecord;
use crate::logging::LogProducer;

/// Which phase of the pipeline a stage implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageKind {
    Extract,
    Clean,
    Symbols,
    Persist,
}

impl StageKind {
    /// Origin tag used on funnel records.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Extract => "EXTRACT",
            StageKind::Clean => "CLEAN",
            StageKind::Symbols => "SYMBOLS",
            StageKind::Persist => "PERSIST",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Somewhere a stage can hand jobs to.
///
/// Implemented by queue senders so a stage never needs to know whether its
/// downstream is another stage or a test collector.
pub trait JobSink<J>: Send + Sync {
    /// Enqueue one job.
    fn receivejobset(&self, job: J) -> Result<()>;

    /// Enqueue one completion token on behalf of a single producer.
    fn donesig(&self) -> Result<()>;

    fn name(&self) -> &'static str;
}

impl<J: Send> JobSink<J> for JobSender<J> {
    fn receivejobset(&self, job: J) -> Result<()> {
        self.send_job(job)
    }

    fn donesig(&self) -> Result<()> {
        self.send_done()
    }

    fn name(&self) -> &'static str {
        JobSender::name(self)
    }
}

/// Per-worker context passed into [`Stage::process`].
#[derive(Debug, Clone)]
pub struct StageContext {
    pub worker: usize,
    pub log: LogProducer,
    persist: Option<JobSender<PersistRecord>>,
}

impl StageContext {
    pub fn new(worker: usize, log: LogProducer, persist: Option<JobSender<PersistRecord>>) -> Self {
        Self {
            worker,
            log,
            persist,
        }
    }

    /// Hand a metadata record to the Persist stage.
    ///
    /// A stage wired without Persist discards records.
    pub fn record(&self, record: PersistRecord) -> Result<()> {
        match &self.persist {
            Some(persist) => persist.send_job(record),
            None => {
                self.log
                    .debug(format!("No database writer attached; skipping {}", record.kind()));
                Ok(())
            }
        }
    }
}

/// One phase of the pipeline.
///
/// `process` is called once per dequeued job. `Ok` yields the jobs to forward
/// to every downstream sink (possibly none); `Err` drops the job, which the
/// worker logs. Errors never leave the stage.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    type Input: Job;
    type Output: Clone + Send + 'static;

    fn kind(&self) -> StageKind;

    async fn process(&self, job: Self::Input, ctx: &StageContext) -> Result<Vec<Self::Output>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::job_queue::{JobQueue, QueueItem};

    #[test]
    fn test_stage_kind_tags() {
        assert_eq!(StageKind::Extract.to_string(), "EXTRACT");
        assert_eq!(StageKind::Clean.as_str(), "CLEAN");
        assert_eq!(StageKind::Symbols.as_str(), "SYMBOLS");
        assert_eq!(StageKind::Persist.as_str(), "PERSIST");
    }

    #[tokio::test]
    async fn test_sender_as_job_sink() {
        let queue = JobQueue::new("sink");
        let sink: Box<dyn JobSink<u32>> = Box::new(queue.sender());
        sink.receivejobset(7).unwrap();
        sink.donesig().unwrap();
        assert_eq!(sink.name(), "sink");

        let rx = queue.receiver();
        assert_eq!(rx.dequeue().await, Some(QueueItem::Job(7)));
        assert_eq!(rx.dequeue().await, Some(QueueItem::Done));
    }
}
