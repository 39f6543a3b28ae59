//! The worker side: running task bodies off the main thread and closing
//! group barriers.
mod drain;

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::Level;

use crate::diagnostics::{ErrorReport, Stage, Subject};
use crate::engine::{Barrier, Dynamic, GroupCallback, Membership, Run, TaskRecord};
use crate::scheduler::Shared;
use crate::utils::panic_message;

pub(crate) use drain::drain;
pub use drain::DrainReport;

pub(crate) fn submit_task(shared: &Arc<Shared>, task: Arc<TaskRecord>) {
    let context = shared.clone();
    shared.pool.submit(Box::new(move || run_task(&context, &task)));
}

/// Runs the task's body, then does its group's bookkeeping. Used by the
/// workers and, for sync tasks, by the drain. Never panics.
pub(crate) fn run_task(shared: &Arc<Shared>, task: &TaskRecord) {
    let span = tracing::span!(Level::DEBUG, "task", name = %task.name, id = %task.id);
    let _enter = span.enter();

    match task.run() {
        Run::Skipped => {
            tracing::trace!("task already ran");
            return;
        }
        Run::Faulted(err) => {
            let stage = Stage::GroupAssembly;
            let report = ErrorReport::from_error(Subject::Task, &task.name, stage, &err);
            shared.sink.log_error(&report);
        }
        Run::Done => {}
    }

    if let Some(membership) = &task.membership {
        complete_member(shared, task, membership);
    }
}

fn complete_member(shared: &Arc<Shared>, task: &TaskRecord, membership: &Membership) {
    let group = match shared.registry.group(&membership.group) {
        Ok(group) if group.id == membership.group_id => group,
        Ok(_) => {
            let message = format!(
                "Group '{}' was re-declared, completion of '{}' is not counted",
                membership.group, task.name
            );
            report(shared, Subject::Group, &membership.group, Stage::GroupLookup, message);
            return;
        }
        Err(err) => {
            report(shared, Subject::Group, &membership.group, Stage::GroupLookup, err.to_string());
            return;
        }
    };

    match group.record_completion(task.id) {
        Barrier::Pending => {
            tracing::trace!(group = %group.name, position = membership.position, "member done");
        }
        Barrier::Reached => {
            tracing::debug!(group = %group.name, "group barrier reached, waiting for drain");
        }
        Barrier::Fire(callback, results) => {
            tracing::debug!(group = %group.name, "group barrier reached, dispatching callback");

            let context = shared.clone();
            let name = group.name.clone();
            shared.pool.submit(Box::new(move || {
                run_group(&context, &name, callback, results);
            }));
        }
        Barrier::Stranger => {
            let message = format!("Task '{}' is not a member of this group", task.name);
            report(shared, Subject::Group, &group.name, Stage::GroupLookup, message);
        }
    }
}

/// Calls a group's completion callback, catching and reporting failures.
/// Returns whether it succeeded.
pub(crate) fn run_group(
    shared: &Shared,
    name: &str,
    callback: GroupCallback,
    results: HashMap<String, Dynamic>,
) -> bool {
    let span = tracing::span!(Level::DEBUG, "group", name);
    let _enter = span.enter();

    match catch_unwind(AssertUnwindSafe(move || callback(results))) {
        Ok(Ok(())) => true,
        Ok(Err((stage, err))) => {
            shared
                .sink
                .log_error(&ErrorReport::from_error(Subject::Group, name, stage, &err));
            false
        }
        Err(panic) => {
            let err = anyhow::anyhow!("callback panicked: {}", panic_message(&*panic));
            let report = ErrorReport::from_error(Subject::Group, name, Stage::GroupComplete, &err);
            shared.sink.log_error(&report);
            false
        }
    }
}

fn report(shared: &Shared, kind: Subject, subject: &str, stage: Stage, message: String) {
    shared
        .sink
        .log_error(&ErrorReport::new(kind, subject, stage, message));
}
