//! Task records and their lifecycle.
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

use crate::engine::{Dynamic, Work};
use crate::utils::{lock, panic_message};

/// Identifies one enqueued task for the lifetime of its scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The group a task joined, and where.
#[derive(Debug, Clone)]
pub(crate) struct Membership {
    pub group: String,
    pub group_id: u64,
    pub position: usize,
}

enum TaskState {
    /// Waiting for a worker, or for the next drain when not threaded.
    Queued(Box<dyn Work>),
    Running,
    /// Outcome captured, callbacks not yet called.
    Finished(Box<dyn Work>),
    Delivered,
}

/// What a call to [`TaskRecord::run`] did.
pub(crate) enum Run {
    /// Somebody else ran the body already.
    Skipped,
    Done,
    /// The body ran, but its value could not be handed over cleanly.
    Faulted(anyhow::Error),
}

pub(crate) struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    pub membership: Option<Membership>,
    pub threaded: bool,
    state: Mutex<TaskState>,
    complete: AtomicBool,
    share: Mutex<Option<Dynamic>>,
}

impl TaskRecord {
    pub(crate) fn new(
        id: TaskId,
        name: String,
        membership: Option<Membership>,
        threaded: bool,
        work: Box<dyn Work>,
    ) -> Self {
        Self {
            id,
            name,
            membership,
            threaded,
            state: Mutex::new(TaskState::Queued(work)),
            complete: AtomicBool::new(false),
            share: Mutex::new(None),
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// Runs the body if nobody has yet. The body runs outside of the record's
    /// lock.
    pub(crate) fn run(&self) -> Run {
        let previous = std::mem::replace(&mut *lock(&self.state), TaskState::Running);
        let mut work = match previous {
            TaskState::Queued(work) => work,
            other => {
                *lock(&self.state) = other;
                return Run::Skipped;
            }
        };

        // Bodies and clones catch their own panics, this only guards the
        // bookkeeping around them.
        let fault = match catch_unwind(AssertUnwindSafe(|| work.execute())) {
            Ok(executed) => {
                *lock(&self.share) = executed.share;
                executed.fault
            }
            Err(panic) => Some(anyhow::anyhow!(
                "failed to record task outcome: {}",
                panic_message(&*panic)
            )),
        };

        *lock(&self.state) = TaskState::Finished(work);
        self.complete.store(true, Ordering::Release);

        match fault {
            Some(err) => Run::Faulted(err),
            None => Run::Done,
        }
    }

    /// Takes the finished work out for delivery. `None` if it was never run
    /// or was already delivered.
    pub(crate) fn take_finished(&self) -> Option<Box<dyn Work>> {
        let mut state = lock(&self.state);
        match std::mem::replace(&mut *state, TaskState::Delivered) {
            TaskState::Finished(work) => Some(work),
            TaskState::Delivered => None,
            other => {
                *state = other;
                None
            }
        }
    }

    /// The copy of the outcome kept for the group, taken at most once.
    pub(crate) fn take_share(&self) -> Option<Dynamic> {
        lock(&self.share).take()
    }
}

impl fmt::Debug for TaskRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("membership", &self.membership)
            .field("threaded", &self.threaded)
            .field("complete", &self.is_complete())
            .finish()
    }
}
