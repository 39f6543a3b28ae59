use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Failure captured from a task body, either a returned error or a panic.
///
/// Cloning is cheap, the same failure can be handed to a member's own
/// `on_error` and to its group's result mapping.
#[derive(Debug, Clone)]
pub struct TaskError(pub(crate) Arc<anyhow::Error>);

impl TaskError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    /// The underlying error, with its full context chain.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(e: anyhow::Error) -> Self {
        TaskError(Arc::new(e))
    }
}

// `anyhow::Error` is not itself a `std::error::Error`, so this can't be
// derived as transparent.
impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Errors reported synchronously to the caller of a scheduler operation.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("No group named '{0}' found. Declare it with Scheduler::create_group")]
    GroupNotDeclared(String),

    #[error("Group '{group}' collects results of type {expected}, got a task returning {found}")]
    GroupTypeMismatch {
        group: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Group '{group}' already has all of its {total} members")]
    GroupFull { group: String, total: usize },

    #[error("Group '{0}' must expect at least one task")]
    InvalidGroupSize(String),

    #[error("drain() called outside of the thread it was first called on")]
    NotMainThread,

    #[error("Failed to build the worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}
