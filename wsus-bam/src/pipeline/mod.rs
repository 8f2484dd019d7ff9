//! Staged pipeline.
//!
//! - Runs each stage as a worker pool fed by one job queue
//! - Forwards successful outputs downstream, logs and drops failures
//! - Counts completion tokens per producer before shutting a stage down
//! - Serializes every database write through the Persist stage

pub mod job_queue;
pub mod jobs;
pub mod orchestrator;
pub mod stage;
pub mod stages;
pub mod worker_pool;

pub use job_queue::{CompletionTracker, JobQueue, JobReceiver, JobSender, QueueItem, TokenObservation};
pub use jobs::{ArchiveJob, BinaryJob, Job, SymbolJob};
pub use orchestrator::{ArchiveSource, Orchestrator, RunMode, RunPlan, RunReport, Toolset};
pub use stage::{JobSink, Stage, StageContext, StageKind};
pub use stages::{CleanStage, ExtractMode, ExtractStage, PersistStage, PersistStats, SymbolStage};
pub use worker_pool::{StageConfig, StageManager, StageStats};
