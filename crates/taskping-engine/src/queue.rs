//! Work-queue scheduler — five independent in-memory queues (one per job
//! category) drained with bounded concurrency and reentrancy guards.
//!
//! Queues hold transient jobs only; nothing here survives a restart
//! (at-least-once delivery with idempotent downstream effects is the
//! contract, not durability).

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::Mutex;

use taskping_core::error::Result;
use taskping_core::types::{AnalyticsEvent, DigestPeriod, Priority};

/// Job category — one queue per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobCategory {
    Notification,
    Batch,
    Digest,
    SurfaceRefresh,
    Analytics,
}

impl JobCategory {
    pub const ALL: [JobCategory; 5] = [
        JobCategory::Notification,
        JobCategory::Batch,
        JobCategory::Digest,
        JobCategory::SurfaceRefresh,
        JobCategory::Analytics,
    ];
}

impl std::fmt::Display for JobCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobCategory::Notification => write!(f, "notification"),
            JobCategory::Batch => write!(f, "batch"),
            JobCategory::Digest => write!(f, "digest"),
            JobCategory::SurfaceRefresh => write!(f, "surface_refresh"),
            JobCategory::Analytics => write!(f, "analytics"),
        }
    }
}

/// What a queued job carries. Jobs reference records by id; the full record
/// is reloaded at processing time so retries always see current state.
#[derive(Debug, Clone)]
pub enum JobPayload {
    Notification { record_id: String },
    BatchFlush { recipient_id: String },
    Digest { recipient_id: String, period: DigestPeriod },
    SurfaceRefresh { recipient_id: String },
    Analytics { event: AnalyticsEvent },
}

/// A transient queue entry. Ordering key for the notification queue is
/// (weight ascending, enqueue time ascending) — stable priority, FIFO ties.
#[derive(Debug, Clone)]
pub struct QueueJob {
    pub category: JobCategory,
    pub payload: JobPayload,
    pub weight: u8,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueJob {
    fn fifo(category: JobCategory, payload: JobPayload) -> Self {
        Self {
            category,
            payload,
            weight: Priority::Medium.queue_weight(),
            enqueued_at: Utc::now(),
        }
    }
}

/// Storage behind one queue. In-memory by default; a durable backend can be
/// swapped in without touching scheduling logic.
pub trait QueueBackend: Send {
    /// Append at the tail.
    fn push_back(&mut self, job: QueueJob);
    /// Insert maintaining (weight asc, enqueued_at asc) order.
    fn insert_ordered(&mut self, job: QueueJob);
    /// Pull up to `max` jobs from the front.
    fn pop_front(&mut self, max: usize) -> Vec<QueueJob>;
    /// Remove all jobs matching the predicate; returns how many.
    fn remove_matching(&mut self, pred: &dyn Fn(&QueueJob) -> bool) -> usize;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Default process-memory backend.
#[derive(Default)]
pub struct MemoryBackend {
    jobs: VecDeque<QueueJob>,
}

impl QueueBackend for MemoryBackend {
    fn push_back(&mut self, job: QueueJob) {
        self.jobs.push_back(job);
    }

    fn insert_ordered(&mut self, job: QueueJob) {
        let key = (job.weight, job.enqueued_at);
        // First position with a strictly greater key — equal keys stay FIFO.
        let pos = self
            .jobs
            .iter()
            .position(|j| (j.weight, j.enqueued_at) > key)
            .unwrap_or(self.jobs.len());
        self.jobs.insert(pos, job);
    }

    fn pop_front(&mut self, max: usize) -> Vec<QueueJob> {
        let n = max.min(self.jobs.len());
        self.jobs.drain(..n).collect()
    }

    fn remove_matching(&mut self, pred: &dyn Fn(&QueueJob) -> bool) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|j| !pred(j));
        before - self.jobs.len()
    }

    fn len(&self) -> usize {
        self.jobs.len()
    }
}

/// Per-queue counters exposed via `getQueueStats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub completed: u64,
    pub failed: u64,
}

/// One named queue with a reentrancy-guarded drain loop.
pub struct WorkQueue {
    category: JobCategory,
    backend: Mutex<Box<dyn QueueBackend>>,
    draining: AtomicBool,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl WorkQueue {
    fn new(category: JobCategory, backend: Box<dyn QueueBackend>) -> Self {
        Self {
            category,
            backend: Mutex::new(backend),
            draining: AtomicBool::new(false),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub async fn len(&self) -> usize {
        self.backend.lock().await.len()
    }

    pub async fn stats(&self) -> QueueStats {
        QueueStats {
            waiting: self.len().await,
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    async fn enqueue(&self, job: QueueJob, ordered: bool) {
        let mut backend = self.backend.lock().await;
        if ordered {
            backend.insert_ordered(job);
        } else {
            backend.push_back(job);
        }
        tracing::debug!(queue = %self.category, waiting = backend.len(), "job enqueued");
    }

    /// Drain the queue: pull up to `concurrency` jobs from the front, process
    /// them concurrently, wait for all to settle (failures recorded, never
    /// aborting the batch), repeat until empty.
    ///
    /// Reentrancy-guarded: a queue never holds two drain loops at once.
    /// Enqueues racing a running drain either land in the current loop's next
    /// pull or re-enter via the post-clear check below.
    pub async fn drain<F, Fut>(&self, concurrency: usize, process: F)
    where
        F: Fn(QueueJob) -> Fut + Sync,
        Fut: Future<Output = Result<()>> + Send,
    {
        let concurrency = concurrency.max(1);
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return; // another drain loop owns the queue
            }

            loop {
                let batch = {
                    let mut backend = self.backend.lock().await;
                    backend.pop_front(concurrency)
                };
                if batch.is_empty() {
                    break;
                }
                let results = join_all(batch.into_iter().map(&process)).await;
                for result in results {
                    match result {
                        Ok(()) => {
                            self.completed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            self.failed.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(queue = %self.category, error = %e, "job failed");
                        }
                    }
                }
            }

            self.draining.store(false, Ordering::SeqCst);
            // A job may have slipped in between the last empty pull and the
            // flag clear; re-check so nothing strands.
            if self.backend.lock().await.is_empty() {
                return;
            }
        }
    }
}

/// The five category queues, plus category-specific enqueue policies.
pub struct WorkQueues {
    notification: WorkQueue,
    batch: WorkQueue,
    digest: WorkQueue,
    surface: WorkQueue,
    analytics: WorkQueue,
}

impl WorkQueues {
    /// Build with the in-memory backend.
    pub fn in_memory() -> Self {
        Self::with_backend(|| Box::new(MemoryBackend::default()))
    }

    /// Build with a custom backend per queue (e.g. a durable list).
    pub fn with_backend<F>(make: F) -> Self
    where
        F: Fn() -> Box<dyn QueueBackend>,
    {
        Self {
            notification: WorkQueue::new(JobCategory::Notification, make()),
            batch: WorkQueue::new(JobCategory::Batch, make()),
            digest: WorkQueue::new(JobCategory::Digest, make()),
            surface: WorkQueue::new(JobCategory::SurfaceRefresh, make()),
            analytics: WorkQueue::new(JobCategory::Analytics, make()),
        }
    }

    pub fn queue(&self, category: JobCategory) -> &WorkQueue {
        match category {
            JobCategory::Notification => &self.notification,
            JobCategory::Batch => &self.batch,
            JobCategory::Digest => &self.digest,
            JobCategory::SurfaceRefresh => &self.surface,
            JobCategory::Analytics => &self.analytics,
        }
    }

    /// Priority-ordered insert into the single-notification queue.
    pub async fn enqueue_notification(&self, record_id: &str, priority: Priority) {
        let job = QueueJob {
            category: JobCategory::Notification,
            payload: JobPayload::Notification {
                record_id: record_id.to_string(),
            },
            weight: priority.queue_weight(),
            enqueued_at: Utc::now(),
        };
        self.notification.enqueue(job, true).await;
    }

    pub async fn enqueue_batch_flush(&self, recipient_id: &str) {
        let job = QueueJob::fifo(
            JobCategory::Batch,
            JobPayload::BatchFlush {
                recipient_id: recipient_id.to_string(),
            },
        );
        self.batch.enqueue(job, false).await;
    }

    pub async fn enqueue_digest(&self, recipient_id: &str, period: DigestPeriod) {
        let job = QueueJob::fifo(
            JobCategory::Digest,
            JobPayload::Digest {
                recipient_id: recipient_id.to_string(),
                period,
            },
        );
        self.digest.enqueue(job, false).await;
    }

    /// Debounced surface-refresh enqueue: any queued refresh for the same
    /// recipient is replaced, so the rebuild always reflects current state
    /// rather than a stale intermediate one.
    pub async fn enqueue_surface_refresh(&self, recipient_id: &str) {
        let mut backend = self.surface.backend.lock().await;
        let target = recipient_id.to_string();
        backend.remove_matching(&|job| {
            matches!(&job.payload, JobPayload::SurfaceRefresh { recipient_id } if *recipient_id == target)
        });
        backend.push_back(QueueJob::fifo(
            JobCategory::SurfaceRefresh,
            JobPayload::SurfaceRefresh {
                recipient_id: recipient_id.to_string(),
            },
        ));
    }

    pub async fn enqueue_analytics(&self, event: AnalyticsEvent) {
        let job = QueueJob::fifo(JobCategory::Analytics, JobPayload::Analytics { event });
        self.analytics.enqueue(job, false).await;
    }

    /// Waiting/completed/failed counters for every category.
    pub async fn stats(&self) -> Vec<(JobCategory, QueueStats)> {
        let mut out = Vec::with_capacity(JobCategory::ALL.len());
        for category in JobCategory::ALL {
            out.push((category, self.queue(category).stats().await));
        }
        out
    }

    /// Total jobs waiting across all queues.
    pub async fn total_waiting(&self) -> usize {
        let mut total = 0;
        for category in JobCategory::ALL {
            total += self.queue(category).len().await;
        }
        total
    }
}
