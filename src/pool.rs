//! The worker pool the scheduler hands its work to.
use std::sync::OnceLock;

use crate::SchedulerError;
use crate::utils::panic_message;

/// A unit of work submitted to a [`WorkerPool`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fire-and-forget thread pool.
///
/// Submitted jobs run on some worker thread, in no particular order. The
/// scheduler never waits on a job and never observes its return value.
pub trait WorkerPool: Send + Sync {
    fn submit(&self, job: Job);

    /// Whether the calling thread is one of this pool's workers.
    fn is_worker_thread(&self) -> bool;

    /// Prepares the pool so that later submissions cannot fail.
    ///
    /// Called before any work is registered, only from threads outside the
    /// pool. Must be idempotent.
    fn ensure_started(&self) -> Result<(), SchedulerError> {
        Ok(())
    }
}

/// A [`WorkerPool`] backed by a dedicated `rayon` thread pool.
///
/// The threads are spawned on first use and live as long as the pool.
pub struct RayonPool {
    threads: usize,
    thread_name: String,
    pool: OnceLock<rayon::ThreadPool>,
}

impl RayonPool {
    /// `threads == 0` lets rayon pick the number of threads.
    pub fn new(threads: usize, thread_name: impl Into<String>) -> Self {
        Self {
            threads,
            thread_name: thread_name.into(),
            pool: OnceLock::new(),
        }
    }

    fn build(&self) -> Result<rayon::ThreadPool, rayon::ThreadPoolBuildError> {
        let prefix = self.thread_name.clone();

        rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(move |i| format!("{prefix}-{i}"))
            // Without a handler rayon aborts the process on a panicking job.
            .panic_handler(|panic| {
                tracing::error!("worker job panicked: {}", panic_message(&*panic));
            })
            .build()
    }

    fn get(&self) -> Result<&rayon::ThreadPool, SchedulerError> {
        if let Some(pool) = self.pool.get() {
            return Ok(pool);
        }

        // Two threads may race to build here, the loser's pool is dropped.
        let pool = self.build()?;
        tracing::debug!(threads = pool.current_num_threads(), "worker pool started");
        Ok(self.pool.get_or_init(|| pool))
    }
}

impl Default for RayonPool {
    fn default() -> Self {
        Self::new(0, "tickwork")
    }
}

impl WorkerPool for RayonPool {
    fn submit(&self, job: Job) {
        match self.get() {
            Ok(pool) => pool.spawn(job),
            // Only reachable if the job comes from outside ensure_started,
            // rayon's global pool still honours the contract.
            Err(err) => {
                tracing::warn!("worker pool unavailable, using the global pool: {err}");
                rayon::spawn(job)
            }
        }
    }

    fn is_worker_thread(&self) -> bool {
        self.pool
            .get()
            .is_some_and(|pool| pool.current_thread_index().is_some())
    }

    fn ensure_started(&self) -> Result<(), SchedulerError> {
        self.get().map(|_| ())
    }
}
