//! Group records: a named barrier over a fixed number of member tasks.
use std::any::{TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::diagnostics::Stage;
use crate::engine::{Dynamic, TaskId, TaskRecord};
use crate::error::{SchedulerError, TaskError};
use crate::utils::lock;

/// Outcome of every member of a group, keyed by task name.
pub type GroupResults<T> = HashMap<String, Result<T, TaskError>>;

/// The group's completion callback with the result type erased.
pub(crate) type GroupCallback =
    Box<dyn FnOnce(HashMap<String, Dynamic>) -> Result<(), (Stage, anyhow::Error)> + Send>;

/// What a member completion did to its group.
pub(crate) enum Barrier {
    /// More members to go.
    Pending,
    /// Every member is done and the results wait for the drain.
    Reached,
    /// Every member is done and the callback must now run on a worker.
    Fire(GroupCallback, HashMap<String, Dynamic>),
    /// The task is not one of this group's members.
    Stranger,
}

struct GroupState {
    members: Vec<Arc<TaskRecord>>,
    completed: usize,
    has_fired_executor: bool,
    results: Option<HashMap<String, Dynamic>>,
    on_complete: Option<GroupCallback>,
}

pub(crate) struct GroupRecord {
    pub id: u64,
    pub name: String,
    pub total: usize,
    pub is_async: bool,
    result_type: TypeId,
    result_type_name: &'static str,
    state: Mutex<GroupState>,
}

impl GroupRecord {
    pub(crate) fn new<T, F>(
        id: u64,
        name: String,
        total: usize,
        is_async: bool,
        on_complete: F,
    ) -> Self
    where
        T: Send + 'static,
        F: FnOnce(GroupResults<T>) -> anyhow::Result<()> + Send + 'static,
    {
        let callback: GroupCallback = Box::new(move |results: HashMap<String, Dynamic>| {
            let mut typed = GroupResults::<T>::with_capacity(results.len());

            for (name, value) in results {
                match value.downcast::<Result<T, TaskError>>() {
                    Ok(value) => typed.insert(name, *value),
                    Err(_) => {
                        let err = anyhow::anyhow!(
                            "member '{name}' did not produce a {}",
                            type_name::<T>()
                        );
                        return Err((Stage::GroupAssembly, err));
                    }
                };
            }

            on_complete(typed).map_err(|err| (Stage::GroupComplete, err))
        });

        Self {
            id,
            name,
            total,
            is_async,
            result_type: TypeId::of::<T>(),
            result_type_name: type_name::<T>(),
            state: Mutex::new(GroupState {
                members: Vec::with_capacity(total),
                completed: 0,
                has_fired_executor: false,
                results: None,
                on_complete: Some(callback),
            }),
        }
    }

    /// Checks that a member returning `T` can join this group.
    pub(crate) fn accepts<T: 'static>(&self) -> Result<(), SchedulerError> {
        if self.result_type == TypeId::of::<T>() {
            return Ok(());
        }

        Err(SchedulerError::GroupTypeMismatch {
            group: self.name.clone(),
            expected: self.result_type_name,
            found: type_name::<T>(),
        })
    }

    /// Builds and appends the next member. The position handed to `build`
    /// is the member's index in registration order.
    pub(crate) fn add_member(
        &self,
        build: impl FnOnce(usize) -> Arc<TaskRecord>,
    ) -> Result<Arc<TaskRecord>, SchedulerError> {
        let mut state = lock(&self.state);

        if state.members.len() >= self.total {
            return Err(SchedulerError::GroupFull {
                group: self.name.clone(),
                total: self.total,
            });
        }

        let record = build(state.members.len());
        state.members.push(record.clone());
        Ok(record)
    }

    /// Counts one finished member. The member that closes the barrier also
    /// collects every member's result; for async groups it gets the callback
    /// to dispatch. All of it happens under the group's lock, so only one
    /// completion can ever close the barrier.
    pub(crate) fn record_completion(&self, task: TaskId) -> Barrier {
        let mut state = lock(&self.state);

        if !state.members.iter().any(|member| member.id == task) {
            return Barrier::Stranger;
        }

        state.completed += 1;
        if state.completed < self.total || state.has_fired_executor || state.results.is_some() {
            return Barrier::Pending;
        }

        let mut results = HashMap::with_capacity(state.members.len());
        for member in &state.members {
            if let Some(value) = member.take_share() {
                results.insert(member.name.clone(), value);
            }
        }

        if !self.is_async {
            state.results = Some(results);
            return Barrier::Reached;
        }

        state.has_fired_executor = true;
        match state.on_complete.take() {
            Some(callback) => Barrier::Fire(callback, results),
            None => Barrier::Pending,
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        lock(&self.state).completed == self.total
    }

    /// Hands out the callback and the collected results of a finished
    /// synchronous group, once.
    pub(crate) fn take_ready(&self) -> Option<(GroupCallback, HashMap<String, Dynamic>)> {
        let mut state = lock(&self.state);

        if self.is_async || state.completed != self.total {
            return None;
        }

        let results = state.results.take()?;
        let callback = state.on_complete.take()?;
        Some((callback, results))
    }

    pub(crate) fn completed(&self) -> usize {
        lock(&self.state).completed
    }

    pub(crate) fn members(&self) -> usize {
        lock(&self.state).members.len()
    }
}

impl fmt::Debug for GroupRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("total", &self.total)
            .field("is_async", &self.is_async)
            .field("completed", &self.completed())
            .finish()
    }
}
