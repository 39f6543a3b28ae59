use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use crate::diagnostics::{ErrorSink, TracingSink};
use crate::engine::{
    GroupRecord, GroupResults, Membership, Registry, TaskId, TaskRecord, TypedWork, Work,
};
use crate::error::{SchedulerError, TaskError};
use crate::executor::{self, DrainReport};
use crate::pool::{RayonPool, WorkerPool};

/// State shared between the scheduler handle and the jobs it submits.
pub(crate) struct Shared {
    pub registry: Registry,
    pub pool: Box<dyn WorkerPool>,
    pub sink: Box<dyn ErrorSink>,
    next_id: AtomicU64,
    main: OnceLock<ThreadId>,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Runs work on a thread pool and calls back on your main thread.
///
/// Every enqueued task runs on a worker (or, for sync tasks, inside the next
/// [`Scheduler::drain`]). Completion callbacks only ever run inside `drain`,
/// which the host calls once per iteration of its own loop, from one thread.
/// Groups collect the results of a fixed number of tasks into a single
/// callback.
///
/// `Scheduler` is a cheap handle, clones share the same tasks and groups.
///
/// # Example
///
/// ```rust,no_run
/// use tickwork::Scheduler;
///
/// let scheduler = Scheduler::new();
///
/// scheduler
///     .enqueue_task(
///         "answer",
///         || Ok(6 * 7),
///         |value| {
///             println!("got {value}");
///             Ok(())
///         },
///         |err| {
///             eprintln!("failed: {err:#}");
///             Ok(())
///         },
///     )
///     .unwrap();
///
/// loop {
///     // ...the rest of the frame...
///     scheduler.drain().unwrap();
/// }
/// ```
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// A scheduler on its own rayon pool, reporting errors through `tracing`.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    /// Runs `body` on a worker. On the main thread, `on_complete` receives the
    /// value or `on_error` receives the failure.
    pub fn enqueue_task<T, B, C, E>(
        &self,
        name: impl Into<String>,
        body: B,
        on_complete: C,
        on_error: E,
    ) -> Result<TaskId, SchedulerError>
    where
        T: Send + 'static,
        B: FnOnce() -> anyhow::Result<T> + Send + 'static,
        C: FnOnce(T) -> anyhow::Result<()> + Send + 'static,
        E: FnOnce(TaskError) -> anyhow::Result<()> + Send + 'static,
    {
        let work = TypedWork::<T>::new(
            Box::new(body),
            Some(Box::new(on_complete)),
            Some(Box::new(on_error)),
        );
        self.enqueue(name.into(), true, Box::new(work))
    }

    /// Runs a side-effect-only `body` on a worker; only failures come back,
    /// through `on_error` on the main thread.
    pub fn enqueue_detached<B, E>(
        &self,
        name: impl Into<String>,
        body: B,
        on_error: E,
    ) -> Result<TaskId, SchedulerError>
    where
        B: FnOnce() -> anyhow::Result<()> + Send + 'static,
        E: FnOnce(TaskError) -> anyhow::Result<()> + Send + 'static,
    {
        let work = TypedWork::new(Box::new(body), None, Some(Box::new(on_error)));
        self.enqueue(name.into(), true, Box::new(work))
    }

    /// Runs `body` on the main thread, inside the next [`Scheduler::drain`].
    pub fn enqueue_sync_task<B, E>(
        &self,
        name: impl Into<String>,
        body: B,
        on_error: E,
    ) -> Result<TaskId, SchedulerError>
    where
        B: FnOnce() -> anyhow::Result<()> + Send + 'static,
        E: FnOnce(TaskError) -> anyhow::Result<()> + Send + 'static,
    {
        let work = TypedWork::new(Box::new(body), None, Some(Box::new(on_error)));
        self.enqueue(name.into(), false, Box::new(work))
    }

    /// Runs `body` on a worker as a member of `group`. Its result lands in
    /// the group's results under `name`; failures also reach `on_error`.
    ///
    /// Fails right away, before anything is submitted, if the group was not
    /// created, already has all of its members, or collects another type.
    pub fn enqueue_group_task<T, B, E>(
        &self,
        name: impl Into<String>,
        group: &str,
        body: B,
        on_error: E,
    ) -> Result<TaskId, SchedulerError>
    where
        T: Send + 'static,
        B: FnOnce() -> anyhow::Result<T> + Send + 'static,
        E: FnOnce(TaskError) -> anyhow::Result<()> + Send + 'static,
    {
        let work = TypedWork::<T>::new(Box::new(body), None, Some(Box::new(on_error))).moved();
        self.enqueue_member(name.into(), group, work)
    }

    /// Like [`Scheduler::enqueue_group_task`], with the member's own value
    /// also handed to `on_complete` on the main thread. The group gets a
    /// clone.
    pub fn enqueue_group_task_with<T, B, C, E>(
        &self,
        name: impl Into<String>,
        group: &str,
        body: B,
        on_complete: C,
        on_error: E,
    ) -> Result<TaskId, SchedulerError>
    where
        T: Clone + Send + 'static,
        B: FnOnce() -> anyhow::Result<T> + Send + 'static,
        C: FnOnce(T) -> anyhow::Result<()> + Send + 'static,
        E: FnOnce(TaskError) -> anyhow::Result<()> + Send + 'static,
    {
        let work = TypedWork::<T>::new(
            Box::new(body),
            Some(Box::new(on_complete)),
            Some(Box::new(on_error)),
        );
        self.enqueue_member(name.into(), group, work.shared())
    }

    /// Declares a group that completes once `total` member tasks finished.
    ///
    /// `on_complete` gets every member's outcome keyed by task name. It runs on
    /// a worker when `is_async`, otherwise inside the next `drain`.
    ///
    /// Declaring a name that already exists replaces the old group. Members
    /// already submitted to the old group keep running and still get their own
    /// callbacks, but no longer count towards any group.
    pub fn create_group<T, F>(
        &self,
        name: impl Into<String>,
        total: usize,
        is_async: bool,
        on_complete: F,
    ) -> Result<(), SchedulerError>
    where
        T: Send + 'static,
        F: FnOnce(GroupResults<T>) -> anyhow::Result<()> + Send + 'static,
    {
        let name = name.into();
        if total == 0 {
            return Err(SchedulerError::InvalidGroupSize(name));
        }

        self.ensure_context()?;

        let id = self.shared.next_id();
        let group = GroupRecord::new(id, name.clone(), total, is_async, on_complete);

        if let Some(old) = self.shared.registry.register_group(Arc::new(group))
            && old.members() > old.completed()
        {
            tracing::warn!(
                group = %name,
                orphaned = old.members() - old.completed(),
                "group re-declared while members were still running"
            );
        }

        tracing::debug!(group = %name, total, is_async, "group created");
        Ok(())
    }

    /// Runs one main-thread pass: executes sync tasks, calls the callbacks of
    /// finished tasks and synchronous groups, and forgets everything it
    /// handled.
    ///
    /// The first call binds the scheduler to the calling thread. Calls from
    /// any other thread fail with [`SchedulerError::NotMainThread`].
    pub fn drain(&self) -> Result<DrainReport, SchedulerError> {
        let current = thread::current().id();
        if *self.shared.main.get_or_init(|| current) != current {
            return Err(SchedulerError::NotMainThread);
        }

        Ok(executor::drain(&self.shared))
    }

    /// The thread `drain` is bound to, once it has been called.
    pub fn main_thread(&self) -> Option<ThreadId> {
        self.shared.main.get().copied()
    }

    /// Tasks not yet handled by a drain, including those still running.
    pub fn pending_tasks(&self) -> usize {
        self.shared.registry.task_count()
    }

    /// Names of the groups still registered, sorted.
    pub fn live_groups(&self) -> Vec<String> {
        self.shared.registry.group_names()
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.shared.registry.has_group(name)
    }

    fn enqueue(
        &self,
        name: String,
        threaded: bool,
        work: Box<dyn Work>,
    ) -> Result<TaskId, SchedulerError> {
        self.ensure_context()?;

        let id = TaskId(self.shared.next_id());
        let record = Arc::new(TaskRecord::new(id, name, None, threaded, work));
        self.shared.registry.register_task(record.clone());

        tracing::debug!(task = %record.name, %id, threaded, "task enqueued");

        if threaded {
            executor::submit_task(&self.shared, record);
        }

        Ok(id)
    }

    fn enqueue_member<T>(
        &self,
        name: String,
        group: &str,
        work: TypedWork<T>,
    ) -> Result<TaskId, SchedulerError>
    where
        T: Send + 'static,
    {
        self.ensure_context()?;

        let record = self.shared.registry.group(group)?;
        record.accepts::<T>()?;

        let id = TaskId(self.shared.next_id());

        let task = record.add_member(|position| {
            let membership = Membership {
                group: record.name.clone(),
                group_id: record.id,
                position,
            };
            Arc::new(TaskRecord::new(id, name, Some(membership), true, Box::new(work)))
        })?;

        self.shared.registry.register_task(task.clone());

        tracing::debug!(task = %task.name, %id, group, "group task enqueued");

        executor::submit_task(&self.shared, task);
        Ok(id)
    }

    /// Makes sure the worker pool is up before the first task is registered.
    /// Worker threads enqueueing follow-up work skip this.
    fn ensure_context(&self) -> Result<(), SchedulerError> {
        if self.shared.pool.is_worker_thread() {
            return Ok(());
        }

        self.shared.pool.ensure_started()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Configures a [`Scheduler`].
pub struct SchedulerBuilder {
    threads: usize,
    thread_name: String,
    pool: Option<Box<dyn WorkerPool>>,
    sink: Box<dyn ErrorSink>,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self {
            threads: 0,
            thread_name: String::from("tickwork"),
            pool: None,
            sink: Box::new(TracingSink),
        }
    }
}

impl SchedulerBuilder {
    /// Number of worker threads, `0` lets rayon decide. Ignored with a custom
    /// pool.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Worker threads are named `<prefix>-<index>`. Ignored with a custom pool.
    pub fn thread_name(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name = prefix.into();
        self
    }

    pub fn pool(mut self, pool: impl WorkerPool + 'static) -> Self {
        self.pool = Some(Box::new(pool));
        self
    }

    /// Where swallowed failures are reported, [`TracingSink`] by default.
    pub fn sink(mut self, sink: impl ErrorSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    pub fn build(self) -> Scheduler {
        let pool = self
            .pool
            .unwrap_or_else(|| Box::new(RayonPool::new(self.threads, self.thread_name)));

        Scheduler {
            shared: Arc::new(Shared {
                registry: Registry::default(),
                pool,
                sink: self.sink,
                next_id: AtomicU64::new(1),
                main: OnceLock::new(),
            }),
        }
    }
}
