//! Worker pool for decode and prefetch jobs.
//!
//! Fixed thread count draining a two-level priority queue: foreground
//! jobs (user-visible reads) jump ahead of background jobs (readahead,
//! tidy). The queue is bounded; `submit` blocks when it is full.
//! Thread spawn can be deferred (`init_workers = false`) for driver
//! shells that fork into the background after setup.

use parking_lot::{Condvar, Mutex};
use sfs_error::{Result, SfsError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Shared cancellation flag carried by every job.
///
/// Background work polls it between decode steps; setting it makes the
/// job finish early with `Cancelled`. Queued background jobs whose
/// flag is set are dropped without running.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Priority class of a pool job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPriority {
    /// User-visible reads; never dropped once admitted.
    Foreground,
    /// Readahead and tidy; cancellable, dropped at shutdown.
    Background,
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub queue_cap: usize,
    /// Spawn worker threads in `new`. `false` defers to `start()`,
    /// which must happen after the host driver has daemonized.
    pub init_workers: bool,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_cap: 256,
            init_workers: true,
        }
    }
}

struct Job {
    run: Box<dyn FnOnce() + Send>,
    cancel: CancelFlag,
}

struct PoolState {
    foreground: VecDeque<Job>,
    background: VecDeque<Job>,
    /// Number of worker threads that should currently be running.
    workers: usize,
}

impl PoolState {
    fn queued(&self) -> usize {
        self.foreground.len() + self.background.len()
    }
}

struct PoolShared {
    state: Mutex<PoolState>,
    /// Signalled when a job is queued or the pool stops.
    work: Condvar,
    /// Signalled when a job is dequeued (queue space available).
    space: Condvar,
    stop: AtomicBool,
    queue_cap: usize,
}

/// Bounded two-priority worker pool.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(config: &WorkerPoolConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    foreground: VecDeque::new(),
                    background: VecDeque::new(),
                    workers: config.workers.max(1),
                }),
                work: Condvar::new(),
                space: Condvar::new(),
                stop: AtomicBool::new(false),
                queue_cap: config.queue_cap.max(1),
            }),
            threads: Mutex::new(Vec::new()),
        });
        if config.init_workers {
            pool.start();
        }
        pool
    }

    /// Spawn the configured worker threads. Idempotent; used to defer
    /// thread creation until after the driver shell forks.
    pub fn start(&self) {
        let mut threads = self.threads.lock();
        if !threads.is_empty() || self.shared.stop.load(Ordering::Acquire) {
            return;
        }
        let count = self.shared.state.lock().workers;
        for i in 0..count {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("sfs-worker-{i}"))
                .spawn(move || worker_loop(&shared));
            match handle {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    error!(
                        target: "sfs::block::pool",
                        event = "worker_spawn_failed",
                        worker = i,
                        error = %err
                    );
                }
            }
        }
        debug!(
            target: "sfs::block::pool",
            event = "workers_started",
            count = threads.len()
        );
    }

    /// Number of threads the pool runs once started.
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.shared.state.lock().workers
    }

    /// Queue a job, blocking while the queue is full.
    ///
    /// Fails with `Cancelled` if the pool is shutting down.
    pub fn submit(
        &self,
        priority: JobPriority,
        cancel: CancelFlag,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        let mut state = self.shared.state.lock();
        while state.queued() >= self.shared.queue_cap {
            if self.shared.stop.load(Ordering::Acquire) {
                return Err(SfsError::Cancelled);
            }
            self.shared.space.wait(&mut state);
        }
        if self.shared.stop.load(Ordering::Acquire) {
            return Err(SfsError::Cancelled);
        }
        push_job(&mut state, priority, Job {
            run: Box::new(f),
            cancel,
        });
        drop(state);
        self.shared.work.notify_one();
        Ok(())
    }

    /// Queue a job only if space is available right now.
    ///
    /// Best-effort variant for readahead and tidy; returns `false`
    /// instead of blocking.
    pub fn try_submit(
        &self,
        priority: JobPriority,
        cancel: CancelFlag,
        f: impl FnOnce() + Send + 'static,
    ) -> bool {
        let mut state = self.shared.state.lock();
        if self.shared.stop.load(Ordering::Acquire) || state.queued() >= self.shared.queue_cap {
            return false;
        }
        push_job(&mut state, priority, Job {
            run: Box::new(f),
            cancel,
        });
        drop(state);
        self.shared.work.notify_one();
        true
    }

    /// Resize the pool.
    ///
    /// Stops the current workers (queued foreground jobs complete,
    /// queued background jobs are dropped) and restarts with `n`
    /// threads.
    pub fn set_workers(&self, n: usize) {
        self.stop_and_join();
        self.shared.stop.store(false, Ordering::Release);
        self.shared.state.lock().workers = n.max(1);
        self.start();
    }

    /// Stop the pool: queued foreground jobs run to completion, queued
    /// background jobs are dropped, workers are joined.
    pub fn shutdown(&self) {
        self.stop_and_join();
    }

    fn stop_and_join(&self) {
        self.shared.stop.store(true, Ordering::Release);
        {
            let mut state = self.shared.state.lock();
            let dropped = state.background.len();
            state.background.clear();
            if dropped > 0 {
                debug!(
                    target: "sfs::block::pool",
                    event = "background_jobs_dropped",
                    count = dropped
                );
            }
        }
        self.shared.work.notify_all();
        self.shared.space.notify_all();

        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn push_job(state: &mut PoolState, priority: JobPriority, job: Job) {
    match priority {
        JobPriority::Foreground => state.foreground.push_back(job),
        JobPriority::Background => state.background.push_back(job),
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.foreground.pop_front() {
                    break Some(job);
                }
                let stopping = shared.stop.load(Ordering::Acquire);
                if let Some(job) = state.background.pop_front() {
                    if stopping || job.cancel.is_cancelled() {
                        // Dropped without running; prefetch is best-effort.
                        continue;
                    }
                    break Some(job);
                }
                if stopping {
                    break None;
                }
                shared.work.wait(&mut state);
            }
        };

        let Some(job) = job else {
            return;
        };
        shared.space.notify_one();
        (job.run)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn runs_submitted_jobs() {
        let pool = WorkerPool::new(&WorkerPoolConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            pool.submit(JobPriority::Foreground, CancelFlag::new(), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("submit");
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn foreground_jumps_ahead_of_background() {
        // Single worker, blocked on a gate so we can stack the queue.
        let pool = WorkerPool::new(&WorkerPoolConfig {
            workers: 1,
            ..WorkerPoolConfig::default()
        });
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (order_tx, order_rx) = mpsc::channel::<&'static str>();

        pool.submit(JobPriority::Foreground, CancelFlag::new(), move || {
            gate_rx.recv().expect("gate");
        })
        .expect("submit gate");

        let tx = order_tx.clone();
        pool.submit(JobPriority::Background, CancelFlag::new(), move || {
            tx.send("background").expect("send");
        })
        .expect("submit background");

        let tx = order_tx;
        pool.submit(JobPriority::Foreground, CancelFlag::new(), move || {
            tx.send("foreground").expect("send");
        })
        .expect("submit foreground");

        gate_tx.send(()).expect("open gate");
        assert_eq!(order_rx.recv_timeout(Duration::from_secs(5)), Ok("foreground"));
        assert_eq!(order_rx.recv_timeout(Duration::from_secs(5)), Ok("background"));
        pool.shutdown();
    }

    #[test]
    fn cancelled_background_jobs_are_dropped() {
        let pool = WorkerPool::new(&WorkerPoolConfig {
            workers: 1,
            init_workers: false,
            ..WorkerPoolConfig::default()
        });
        let ran = Arc::new(AtomicUsize::new(0));
        let cancel = CancelFlag::new();
        {
            let ran = Arc::clone(&ran);
            pool.submit(JobPriority::Background, cancel.clone(), move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .expect("submit");
        }
        cancel.cancel();
        pool.start();
        pool.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn deferred_start_runs_nothing_until_started() {
        let pool = WorkerPool::new(&WorkerPoolConfig {
            workers: 2,
            init_workers: false,
            ..WorkerPoolConfig::default()
        });
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = Arc::clone(&counter);
            pool.submit(JobPriority::Foreground, CancelFlag::new(), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("submit");
        }
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        pool.start();
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_completes_queued_foreground_jobs() {
        let pool = WorkerPool::new(&WorkerPoolConfig {
            workers: 1,
            init_workers: false,
            ..WorkerPoolConfig::default()
        });
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            pool.submit(JobPriority::Foreground, CancelFlag::new(), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("submit");
        }
        {
            let counter = Arc::clone(&counter);
            pool.submit(JobPriority::Background, CancelFlag::new(), move || {
                counter.fetch_add(100, Ordering::SeqCst);
            })
            .expect("submit background");
        }
        pool.start();
        pool.shutdown();
        // All foreground jobs ran; the background job may or may not
        // have been reached before the stop flag was observed.
        let count = counter.load(Ordering::SeqCst);
        assert!(count == 8 || count == 108, "count = {count}");
    }

    #[test]
    fn try_submit_refuses_when_full() {
        let pool = WorkerPool::new(&WorkerPoolConfig {
            workers: 1,
            queue_cap: 1,
            init_workers: false,
        });
        assert!(pool.try_submit(JobPriority::Background, CancelFlag::new(), || {}));
        assert!(!pool.try_submit(JobPriority::Background, CancelFlag::new(), || {}));
        pool.shutdown();
    }

    #[test]
    fn set_workers_restarts_the_pool() {
        let pool = WorkerPool::new(&WorkerPoolConfig::default());
        pool.set_workers(4);
        assert_eq!(pool.num_workers(), 4);
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = Arc::clone(&counter);
            pool.submit(JobPriority::Foreground, CancelFlag::new(), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("submit");
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
