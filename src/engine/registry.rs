//! Thread-safe storage for live task and group records.
//!
//! Tasks and groups each sit behind their own reader/writer lock. Readers
//! (the drain scan, worker group lookups) only hold a lock long enough to
//! clone the `Arc`s they need; nothing runs user code under these locks.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::engine::{GroupRecord, TaskId, TaskRecord};
use crate::error::SchedulerError;
use crate::utils::{read, write};

#[derive(Default)]
pub(crate) struct Registry {
    tasks: RwLock<Vec<Arc<TaskRecord>>>,
    groups: RwLock<HashMap<String, Arc<GroupRecord>>>,
}

impl Registry {
    pub(crate) fn register_task(&self, task: Arc<TaskRecord>) {
        write(&self.tasks).push(task);
    }

    /// Returns the record this one replaced, if the name was taken.
    pub(crate) fn register_group(&self, group: Arc<GroupRecord>) -> Option<Arc<GroupRecord>> {
        write(&self.groups).insert(group.name.clone(), group)
    }

    /// Removes every task in `finished`, keeping the others in order.
    pub(crate) fn remove_tasks(&self, finished: &HashSet<TaskId>) -> usize {
        if finished.is_empty() {
            return 0;
        }

        let mut tasks = write(&self.tasks);
        let before = tasks.len();
        tasks.retain(|task| !finished.contains(&task.id));
        before - tasks.len()
    }

    /// Removes the group only if the name still points at this very record,
    /// a re-declared group under the same name stays.
    pub(crate) fn remove_group(&self, group: &GroupRecord) -> bool {
        let mut groups = write(&self.groups);
        match groups.get(&group.name) {
            Some(current) if current.id == group.id => {
                groups.remove(&group.name);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn group(&self, name: &str) -> Result<Arc<GroupRecord>, SchedulerError> {
        read(&self.groups)
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::GroupNotDeclared(name.to_string()))
    }

    /// Live tasks in registration order.
    pub(crate) fn tasks(&self) -> Vec<Arc<TaskRecord>> {
        read(&self.tasks).clone()
    }

    pub(crate) fn groups(&self) -> Vec<Arc<GroupRecord>> {
        read(&self.groups).values().cloned().collect()
    }

    pub(crate) fn task_count(&self) -> usize {
        read(&self.tasks).len()
    }

    pub(crate) fn has_group(&self, name: &str) -> bool {
        read(&self.groups).contains_key(name)
    }

    pub(crate) fn group_names(&self) -> Vec<String> {
        let mut names: Vec<_> = read(&self.groups).keys().cloned().collect();
        names.sort();
        names
    }
}
