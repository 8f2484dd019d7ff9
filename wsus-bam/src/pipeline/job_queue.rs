//! In-process job queue carrying work items and completion tokens.
//!
//! One queue feeds one stage. Any number of producers hold a [`JobSender`];
//! the stage's workers share a [`JobReceiver`]. Items from a single producer
//! are observed in the order they were sent.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// An entry on a job queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueItem<J> {
    /// A unit of work.
    Job(J),
    /// Completion token: the sending producer will enqueue nothing further.
    Done,
}

impl<J> QueueItem<J> {
    pub fn is_done(&self) -> bool {
        matches!(self, QueueItem::Done)
    }
}

/// A job queue. Creating one yields the single receive side plus any number
/// of senders via [`JobQueue::sender`].
pub struct JobQueue<J> {
    name: &'static str,
    tx: mpsc::UnboundedSender<QueueItem<J>>,
    receiver: JobReceiver<J>,
}

impl<J: Send + 'static> JobQueue<J> {
    /// Create a new, open queue.
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name,
            tx,
            receiver: JobReceiver {
                name,
                rx: Arc::new(Mutex::new(rx)),
                closed: CancellationToken::new(),
            },
        }
    }

    /// Queue name (used in log messages).
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// A producer handle.
    pub fn sender(&self) -> JobSender<J> {
        JobSender {
            name: self.name,
            tx: self.tx.clone(),
        }
    }

    /// The shared consumer handle.
    pub fn receiver(&self) -> JobReceiver<J> {
        self.receiver.clone()
    }
}

/// Producer side of a [`JobQueue`].
pub struct JobSender<J> {
    name: &'static str,
    tx: mpsc::UnboundedSender<QueueItem<J>>,
}

impl<J> Clone for JobSender<J> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

impl<J> fmt::Debug for JobSender<J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSender").field("queue", &self.name).finish()
    }
}

impl<J> JobSender<J> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Put an item on the queue.
    ///
    /// Fails only once the consuming stage has shut down.
    pub fn enqueue(&self, item: QueueItem<J>) -> Result<()> {
        self.tx
            .send(item)
            .map_err(|_| Error::ChannelClosed(self.name))
    }

    pub fn send_job(&self, job: J) -> Result<()> {
        self.enqueue(QueueItem::Job(job))
    }

    pub fn send_done(&self) -> Result<()> {
        self.enqueue(QueueItem::Done)
    }
}

/// Consumer side of a [`JobQueue`], shared by every worker of one stage.
pub struct JobReceiver<J> {
    name: &'static str,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<QueueItem<J>>>>,
    closed: CancellationToken,
}

impl<J> Clone for JobReceiver<J> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            rx: self.rx.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<J> JobReceiver<J> {
    /// Wait for the next item.
    ///
    /// Returns `None` once [`close`](Self::close) has been called; a worker
    /// parked here at that moment is woken.
    pub async fn dequeue(&self) -> Option<QueueItem<J>> {
        if self.closed.is_cancelled() {
            return None;
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            item = rx.recv() => item,
        }
    }

    /// Stop handing out items. Does not wait for the receive lock.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Close the channel for good and return whatever is still queued.
    ///
    /// After this, every [`JobSender::enqueue`] fails with `ChannelClosed`.
    pub async fn drain_remaining(&self) -> Vec<QueueItem<J>> {
        self.close();
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut remaining = Vec::new();
        while let Ok(item) = rx.try_recv() {
            remaining.push(item);
        }
        remaining
    }
}

/// Result of observing one completion token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenObservation {
    /// More producers are still outstanding.
    Pending { remaining: usize },
    /// That was the last expected token.
    Final,
    /// More tokens than registered producers.
    Surplus { observed: usize },
}

/// Counts completion tokens against an expected producer count.
#[derive(Debug)]
pub struct CompletionTracker {
    expected: usize,
    observed: AtomicUsize,
}

impl CompletionTracker {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            observed: AtomicUsize::new(0),
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn observed(&self) -> usize {
        self.observed.load(Ordering::SeqCst)
    }

    pub fn is_complete(&self) -> bool {
        self.observed() >= self.expected
    }

    /// Record one token.
    pub fn observe(&self) -> TokenObservation {
        let observed = self.observed.fetch_add(1, Ordering::SeqCst) + 1;
        match observed.cmp(&self.expected) {
            std::cmp::Ordering::Less => TokenObservation::Pending {
                remaining: self.expected - observed,
            },
            std::cmp::Ordering::Equal => TokenObservation::Final,
            std::cmp::Ordering::Greater => TokenObservation::Surplus { observed },
        }
    }
}
