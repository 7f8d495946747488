//! The AIO service (C8, §4.8): two bounded-admission, priority-ordered task
//! queues (read, write) per volume, each drained by a pool of worker tasks.
//!
//! Grounded on `cache_fs.cpp`'s `aios_` member: `async_open_read`/
//! `async_open_write` both check the read queue's depth and push to its
//! *front* (an open must not wait behind a backlog of bulk data work), while
//! bulk read/write data operations push to the *back* of their respective
//! queue. Worker-pool shutdown coordination is grounded on `tokio_util`'s
//! `CancellationToken`, used the same way `vector-buffers`' shutdown
//! coordination uses it.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One unit of queued work: a boxed, owned future. Jobs carry their own
/// result delivery (typically a `tokio::sync::oneshot` sender) baked in,
/// since the queue itself is result-agnostic.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct JobQueue {
    items: Mutex<VecDeque<Job>>,
    depth: AtomicUsize,
    notify: Notify,
}

impl JobQueue {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            depth: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    fn push_back(&self, job: Job) {
        self.items.lock().push_back(job);
        self.depth.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_one();
    }

    fn push_front(&self, job: Job) {
        self.items.lock().push_front(job);
        self.depth.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Job {
        loop {
            if let Some(job) = self.items.lock().pop_front() {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                return job;
            }
            self.notify.notified().await;
        }
    }
}

/// Two independent job queues (read, write) with their own worker pools.
/// Jobs still queued when [`AioService::stop`] is called are dropped
/// unexecuted; any caller awaiting their completion via a oneshot channel
/// observes a cancelled receiver, which `handles.rs` maps to
/// [`crate::error::HandleError::ServiceStopped`].
pub struct AioService {
    read: Arc<JobQueue>,
    write: Arc<JobQueue>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl AioService {
    pub fn new() -> Self {
        Self {
            read: Arc::new(JobQueue::new()),
            write: Arc::new(JobQueue::new()),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the worker pool. Mirrors `aios_.start(path_, num_threads)`;
    /// called once from `CacheFs::init`.
    pub fn start(&self, num_read_workers: usize, num_write_workers: usize) {
        let mut workers = self.workers.lock();
        for _ in 0..num_read_workers.max(1) {
            workers.push(Self::spawn_worker(Arc::clone(&self.read), self.shutdown.clone()));
        }
        for _ in 0..num_write_workers.max(1) {
            workers.push(Self::spawn_worker(Arc::clone(&self.write), self.shutdown.clone()));
        }
    }

    fn spawn_worker(queue: Arc<JobQueue>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    job = queue.pop() => job.await,
                }
            }
        })
    }

    pub fn read_queue_depth(&self) -> usize {
        self.read.len()
    }

    pub fn write_queue_depth(&self) -> usize {
        self.write.len()
    }

    /// Both `async_open_read` and `async_open_write` use this: opens of
    /// either kind are admitted against the read queue's depth and run on
    /// a read worker, the way `cache_fs.cpp` dispatches both open variants
    /// through `push_front_read_queue` (kept per `SPEC_FULL.md`'s
    /// supplemented-features section).
    pub fn push_front_read_queue(&self, job: Job) {
        self.read.push_front(job);
    }

    pub fn push_back_read_queue(&self, job: Job) {
        self.read.push_back(job);
    }

    pub fn push_back_write_queue(&self, job: Job) {
        self.write.push_back(job);
    }

    /// Cancels the worker pool and joins every worker task. No job queued
    /// after this call will ever run.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for h in handles {
            if let Err(err) = h.await {
                debug!(?err, "aio worker task panicked during shutdown");
            }
        }
    }
}

impl Default for AioService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn jobs_run_on_worker_pool() {
        let svc = AioService::new();
        svc.start(1, 1);

        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        svc.push_back_read_queue(Box::pin(async move {
            ran2.store(true, Ordering::Release);
        }));

        for _ in 0..100 {
            if ran.load(Ordering::Acquire) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(ran.load(Ordering::Acquire));
        svc.stop().await;
    }

    #[tokio::test]
    async fn queue_depth_reflects_pending_jobs() {
        let svc = AioService::new();
        // No workers started: jobs stay queued so we can observe depth.
        svc.push_back_write_queue(Box::pin(async {}));
        svc.push_back_write_queue(Box::pin(async {}));
        assert_eq!(svc.write_queue_depth(), 2);
        svc.stop().await;
    }

    #[tokio::test]
    async fn stopped_service_drops_unexecuted_jobs() {
        let svc = AioService::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        svc.push_back_read_queue(Box::pin(async move {
            ran2.store(true, Ordering::Release);
        }));
        svc.stop().await;
        assert!(!ran.load(Ordering::Acquire));
    }
}
