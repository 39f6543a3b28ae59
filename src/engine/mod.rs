mod group;
mod registry;
mod task;

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::diagnostics::Stage;
use crate::error::TaskError;
use crate::utils::panic_message;

pub(crate) use crate::engine::group::{Barrier, GroupCallback, GroupRecord};
pub(crate) use crate::engine::registry::Registry;
pub(crate) use crate::engine::task::{Membership, Run, TaskRecord};
pub use crate::engine::group::GroupResults;
pub use crate::engine::task::TaskId;

/// A result on its way from a member task to its group.
pub(crate) type Dynamic = Box<dyn Any + Send>;

pub(crate) type Body<T> = Box<dyn FnOnce() -> anyhow::Result<T> + Send>;
pub(crate) type Callback<A> = Box<dyn FnOnce(A) -> anyhow::Result<()> + Send>;

/// What running a body left behind besides its own outcome.
#[derive(Default)]
pub(crate) struct Executed {
    /// The outcome's copy meant for the task's group.
    pub share: Option<Dynamic>,
    /// A failure that happened after the body, while handing its value over.
    pub fault: Option<anyhow::Error>,
}

impl Executed {
    fn shared<T: Send + 'static>(outcome: Result<T, TaskError>) -> Self {
        Self {
            share: Some(Box::new(outcome)),
            fault: None,
        }
    }
}

/// Type-erased view of a task's body and callbacks, this is what the
/// registry stores.
pub(crate) trait Work: Send {
    /// Runs the body, at most once, and keeps its outcome.
    fn execute(&mut self) -> Executed;

    /// The callback `deliver` is about to call.
    fn stage(&self) -> Stage;

    /// Hands the kept outcome to the matching callback.
    fn deliver(self: Box<Self>) -> anyhow::Result<()>;
}

/// How a group member hands its value to the group.
enum Share<T> {
    Nothing,
    /// The member keeps the value for its own `on_complete`.
    Cloned(fn(&T) -> T),
    /// No `on_complete`, the group takes the value as is.
    Moved,
}

pub(crate) struct TypedWork<T> {
    body: Option<Body<T>>,
    on_complete: Option<Callback<T>>,
    on_error: Option<Callback<TaskError>>,
    outcome: Option<Result<T, TaskError>>,
    share: Share<T>,
}

impl<T> TypedWork<T>
where
    T: Send + 'static,
{
    pub(crate) fn new(
        body: Body<T>,
        on_complete: Option<Callback<T>>,
        on_error: Option<Callback<TaskError>>,
    ) -> Self {
        Self {
            body: Some(body),
            on_complete,
            on_error,
            outcome: None,
            share: Share::Nothing,
        }
    }

    /// Also send a copy of the outcome to the task's group.
    pub(crate) fn shared(mut self) -> Self
    where
        T: Clone,
    {
        self.share = Share::Cloned(T::clone);
        self
    }

    /// Send a successful value to the task's group instead of `on_complete`.
    pub(crate) fn moved(mut self) -> Self {
        self.on_complete = None;
        self.share = Share::Moved;
        self
    }
}

impl<T> Work for TypedWork<T>
where
    T: Send + 'static,
{
    fn execute(&mut self) -> Executed {
        let Some(body) = self.body.take() else {
            return Executed::default();
        };

        let outcome = match catch_unwind(AssertUnwindSafe(body)) {
            Ok(result) => result.map_err(TaskError::from),
            Err(panic) => Err(TaskError::new(anyhow::anyhow!(
                "task panicked: {}",
                panic_message(&*panic)
            ))),
        };

        let (outcome, executed) = match (&self.share, outcome) {
            (Share::Nothing, outcome) => (Some(outcome), Executed::default()),
            (_, Err(err)) => (Some(Err(err.clone())), Executed::shared::<T>(Err(err))),
            (Share::Moved, Ok(value)) => (None, Executed::shared(Ok(value))),
            (Share::Cloned(clone), Ok(value)) => {
                // A panicking clone must not cost the member its own callback.
                match catch_unwind(AssertUnwindSafe(|| clone(&value))) {
                    Ok(copy) => (Some(Ok(value)), Executed::shared::<T>(Ok(copy))),
                    Err(panic) => {
                        let message = format!("result clone panicked: {}", panic_message(&*panic));
                        let err = TaskError::new(anyhow::anyhow!("{message}"));
                        let executed = Executed {
                            fault: Some(anyhow::anyhow!(message)),
                            ..Executed::shared::<T>(Err(err))
                        };
                        (Some(Ok(value)), executed)
                    }
                }
            }
        };

        self.outcome = outcome;
        executed
    }

    fn stage(&self) -> Stage {
        match self.outcome {
            Some(Err(_)) => Stage::OnError,
            _ => Stage::OnComplete,
        }
    }

    fn deliver(mut self: Box<Self>) -> anyhow::Result<()> {
        match self.outcome.take() {
            Some(Ok(value)) => match self.on_complete.take() {
                Some(callback) => callback(value),
                None => Ok(()),
            },
            Some(Err(err)) => match self.on_error.take() {
                Some(callback) => callback(err),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }
}
