use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::Serialize;

use crate::diagnostics::{ErrorReport, Subject};
use crate::engine::{TaskRecord, Work};
use crate::executor::{run_group, run_task};
use crate::scheduler::Shared;
use crate::utils::panic_message;

/// What a single drain pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Sync task bodies executed during the pass.
    pub ran_inline: usize,
    /// Tasks whose callbacks were called.
    pub delivered: usize,
    /// Finished tasks removed without any callback left to call.
    pub discarded: usize,
    /// Groups that reached their barrier and were removed.
    pub groups_completed: usize,
    /// Callbacks that returned an error or panicked.
    pub callback_failures: usize,
    /// Tasks still running on a worker.
    pub in_flight: usize,
}

pub(crate) fn drain(shared: &Arc<Shared>) -> DrainReport {
    let span = tracing::trace_span!("drain");
    let _enter = span.enter();

    let mut report = DrainReport::default();
    drain_tasks(shared, &mut report);
    drain_groups(shared, &mut report);

    if report != DrainReport::default() {
        tracing::trace!(?report, "drain pass");
    }

    report
}

/// Tasks are scanned from a snapshot in registration order, tasks enqueued
/// meanwhile wait for the next pass. Handled tasks are removed in one go at
/// the end.
fn drain_tasks(shared: &Arc<Shared>, report: &mut DrainReport) {
    let tasks = shared.registry.tasks();
    let mut handled = HashSet::new();

    for task in &tasks {
        if !task.threaded && !task.is_complete() {
            run_task(shared, task);
            report.ran_inline += 1;
        } else if !task.is_complete() {
            report.in_flight += 1;
            continue;
        }

        match task.take_finished() {
            Some(work) => {
                report.delivered += 1;
                if !deliver(shared, task, work) {
                    report.callback_failures += 1;
                }
            }
            None => report.discarded += 1,
        }

        handled.insert(task.id);
    }

    shared.registry.remove_tasks(&handled);
}

fn deliver(shared: &Shared, task: &TaskRecord, work: Box<dyn Work>) -> bool {
    let stage = work.stage();

    let err = match catch_unwind(AssertUnwindSafe(move || work.deliver())) {
        Ok(Ok(())) => return true,
        Ok(Err(err)) => err,
        Err(panic) => anyhow::anyhow!("callback panicked: {}", panic_message(&*panic)),
    };

    let report = ErrorReport::from_error(Subject::Task, &task.name, stage, &err);
    shared.sink.log_error(&report);
    false
}

/// Synchronous groups get their callback here. Async groups already fired
/// from a worker, the drain only forgets them.
fn drain_groups(shared: &Arc<Shared>, report: &mut DrainReport) {
    for group in shared.registry.groups() {
        if !group.is_complete() {
            continue;
        }

        if let Some((callback, results)) = group.take_ready()
            && !run_group(shared, &group.name, callback, results)
        {
            report.callback_failures += 1;
        }

        if shared.registry.remove_group(&group) {
            report.groups_completed += 1;
            tracing::debug!(group = %group.name, "group removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::diagnostics::Stage;
    use crate::diagnostics::testing::CollectingSink;
    use crate::pool::testing::ManualPool;
    use crate::{GroupResults, Scheduler, SchedulerError, TaskError};

    type Log = Arc<Mutex<Vec<String>>>;

    fn setup() -> (Scheduler, ManualPool, CollectingSink) {
        let pool = ManualPool::default();
        let sink = CollectingSink::default();
        let scheduler = Scheduler::builder()
            .pool(pool.clone())
            .sink(sink.clone())
            .build();
        (scheduler, pool, sink)
    }

    fn push(log: &Log, entry: impl Into<String>) {
        log.lock().unwrap().push(entry.into());
    }

    #[test]
    fn test_completed_task_is_delivered_and_removed() {
        let (scheduler, pool, _) = setup();
        let log = Log::default();
        let (ok, err) = (log.clone(), log.clone());

        scheduler
            .enqueue_task(
                "t",
                || Ok(3),
                move |v| Ok(push(&ok, format!("ok {v}"))),
                move |e| Ok(push(&err, format!("err {e}"))),
            )
            .unwrap();

        // Still running: nothing to deliver.
        let report = scheduler.drain().unwrap();
        assert_eq!(report.in_flight, 1);
        assert_eq!(scheduler.pending_tasks(), 1);

        pool.run_all();
        let report = scheduler.drain().unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(scheduler.pending_tasks(), 0);
        assert_eq!(*log.lock().unwrap(), vec!["ok 3"]);

        // A second pass finds nothing left.
        assert_eq!(scheduler.drain().unwrap(), DrainReport::default());
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_failing_body_reaches_on_error_only() {
        let (scheduler, pool, sink) = setup();
        let log = Log::default();
        let (ok, err) = (log.clone(), log.clone());

        scheduler
            .enqueue_task(
                "t1",
                || -> anyhow::Result<i32> { anyhow::bail!("E") },
                move |v| Ok(push(&ok, format!("ok {v}"))),
                move |e| Ok(push(&err, format!("err {e}"))),
            )
            .unwrap();

        pool.run_all();
        scheduler.drain().unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["err E"]);
        assert!(sink.reports().is_empty());
    }

    #[test]
    fn test_sync_task_runs_inside_drain() {
        let (scheduler, pool, _) = setup();
        let log = Log::default();
        let body = log.clone();

        scheduler
            .enqueue_sync_task("t2", move || Ok(push(&body, "ran")), |_| Ok(()))
            .unwrap();

        assert_eq!(pool.queued(), 0);
        assert!(log.lock().unwrap().is_empty());

        let report = scheduler.drain().unwrap();
        assert_eq!(report.ran_inline, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(*log.lock().unwrap(), vec!["ran"]);
        assert_eq!(scheduler.pending_tasks(), 0);
    }

    #[test]
    fn test_sync_task_failure_reaches_on_error() {
        let (scheduler, _, _) = setup();
        let log = Log::default();
        let err = log.clone();

        scheduler
            .enqueue_sync_task(
                "bad",
                || anyhow::bail!("no disk"),
                move |e| Ok(push(&err, e.to_string())),
            )
            .unwrap();

        scheduler.drain().unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["no disk"]);
    }

    #[test]
    fn test_callback_failure_is_logged_and_isolated() {
        let (scheduler, pool, sink) = setup();
        let log = Log::default();
        let after = log.clone();

        scheduler
            .enqueue_task("loud", || Ok(1), |_| anyhow::bail!("handler broke"), |_| Ok(()))
            .unwrap();
        scheduler
            .enqueue_task("panicky", || Ok(2), |_| panic!("handler panicked"), |_| Ok(()))
            .unwrap();
        scheduler
            .enqueue_task("quiet", || Ok(3), move |v| Ok(push(&after, v.to_string())), |_| Ok(()))
            .unwrap();

        pool.run_all();
        let report = scheduler.drain().unwrap();

        assert_eq!(report.delivered, 3);
        assert_eq!(report.callback_failures, 2);
        assert_eq!(scheduler.pending_tasks(), 0);
        assert_eq!(*log.lock().unwrap(), vec!["3"]);

        let reports = sink.reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].subject, "loud");
        assert_eq!(reports[0].stage, Stage::OnComplete);
        assert_eq!(reports[0].message, "handler broke");
        assert_eq!(reports[1].subject, "panicky");
        assert!(reports[1].message.contains("handler panicked"));
        assert!(reports[1].trace.as_deref().unwrap().contains("handler panicked"));
    }

    #[test]
    fn test_drain_from_inside_a_callback_delivers_once() {
        let (scheduler, pool, _) = setup();
        let log = Log::default();
        let nested = Arc::new(Mutex::new(None));

        let (first, inner, slot) = (log.clone(), scheduler.clone(), nested.clone());
        scheduler
            .enqueue_task(
                "a",
                || Ok(1),
                move |_| {
                    push(&first, "a");
                    *slot.lock().unwrap() = Some(inner.drain()?);
                    Ok(())
                },
                |_| Ok(()),
            )
            .unwrap();
        let second = log.clone();
        scheduler
            .enqueue_task("b", || Ok(2), move |_| Ok(push(&second, "b")), |_| Ok(()))
            .unwrap();

        pool.run_all();
        let outer = scheduler.drain().unwrap();
        let nested = nested.lock().unwrap().take().unwrap();

        // The nested pass finds `a` already handed out and delivers `b`, the
        // outer pass then finds `b` already handed out.
        assert_eq!((nested.delivered, nested.discarded), (1, 1));
        assert_eq!((outer.delivered, outer.discarded), (1, 1));
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(scheduler.pending_tasks(), 0);
    }

    #[test]
    fn test_on_error_failure_names_the_callback() {
        let (scheduler, pool, sink) = setup();

        scheduler
            .enqueue_detached("", || anyhow::bail!("first"), |_| anyhow::bail!("second"))
            .unwrap();

        pool.run_all();
        scheduler.drain().unwrap();

        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].subject, "<unnamed>");
        assert_eq!(reports[0].stage, Stage::OnError);
        assert_eq!(reports[0].to_string(), "Task '<unnamed>' failed in onError: second");
    }

    #[test]
    fn test_tasks_are_delivered_in_registration_order() {
        let (scheduler, pool, _) = setup();
        let log = Log::default();

        for i in 0..5 {
            let log = log.clone();
            let deliver = move |v: i32| Ok(push(&log, v.to_string()));
            scheduler
                .enqueue_task(format!("t{i}"), move || Ok(i), deliver, |_| Ok(()))
                .unwrap();
        }

        // Completion order does not matter, delivery follows the registry.
        pool.run_reversed();
        scheduler.drain().unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["0", "1", "2", "3", "4"]);
    }

    #[test]
    fn test_sync_group_fires_in_drain() {
        let (scheduler, pool, _) = setup();
        let seen: Arc<Mutex<Option<GroupResults<i32>>>> = Arc::default();
        let results = seen.clone();

        scheduler
            .create_group("g1", 2, false, move |r| {
                *results.lock().unwrap() = Some(r);
                Ok(())
            })
            .unwrap();
        scheduler.enqueue_group_task("a", "g1", || Ok(1), |_| Ok(())).unwrap();
        scheduler.enqueue_group_task("b", "g1", || Ok(2), |_| Ok(())).unwrap();

        pool.run_reversed();
        assert!(seen.lock().unwrap().is_none());

        let report = scheduler.drain().unwrap();
        assert_eq!(report.groups_completed, 1);
        assert!(!scheduler.has_group("g1"));

        let results = seen.lock().unwrap().take().unwrap();
        assert_eq!(results.len(), 2);
        assert!(matches!(results["a"], Ok(1)));
        assert!(matches!(results["b"], Ok(2)));
    }

    #[test]
    fn test_group_waits_for_every_member() {
        let (scheduler, pool, _) = setup();
        let fired = Arc::new(Mutex::new(0));
        let counter = fired.clone();

        scheduler
            .create_group("g", 3, false, move |_: GroupResults<()>| {
                *counter.lock().unwrap() += 1;
                Ok(())
            })
            .unwrap();
        scheduler.enqueue_group_task("a", "g", || Ok(()), |_| Ok(())).unwrap();
        scheduler.enqueue_group_task("b", "g", || Ok(()), |_| Ok(())).unwrap();

        pool.run_all();
        scheduler.drain().unwrap();
        assert_eq!(*fired.lock().unwrap(), 0);
        assert!(scheduler.has_group("g"));

        scheduler.enqueue_group_task("c", "g", || Ok(()), |_| Ok(())).unwrap();
        pool.run_all();
        scheduler.drain().unwrap();
        scheduler.drain().unwrap();

        assert_eq!(*fired.lock().unwrap(), 1);
        assert!(!scheduler.has_group("g"));
    }

    #[test]
    fn test_group_results_include_failures() {
        let (scheduler, pool, _) = setup();
        let seen: Arc<Mutex<Option<GroupResults<u8>>>> = Arc::default();
        let results = seen.clone();
        let log = Log::default();
        let (own, err) = (log.clone(), log.clone());

        scheduler
            .create_group("mixed", 2, false, move |r| {
                *results.lock().unwrap() = Some(r);
                Ok(())
            })
            .unwrap();
        scheduler
            .enqueue_group_task_with(
                "good",
                "mixed",
                || Ok(7_u8),
                move |v| Ok(push(&own, format!("own {v}"))),
                |_| Ok(()),
            )
            .unwrap();
        scheduler
            .enqueue_group_task(
                "bad",
                "mixed",
                || -> anyhow::Result<u8> { anyhow::bail!("lost") },
                move |e: TaskError| Ok(push(&err, format!("err {e}"))),
            )
            .unwrap();

        pool.run_shuffled();
        scheduler.drain().unwrap();

        let results = seen.lock().unwrap().take().unwrap();
        assert!(matches!(results["good"], Ok(7)));
        assert_eq!(results["bad"].as_ref().unwrap_err().to_string(), "lost");

        let mut log = log.lock().unwrap().clone();
        log.sort();
        assert_eq!(log, vec!["err lost", "own 7"]);
    }

    #[derive(Debug)]
    struct Fragile(u16);

    impl Clone for Fragile {
        fn clone(&self) -> Self {
            panic!("cannot copy {}", self.0)
        }
    }

    #[test]
    fn test_panicking_clone_keeps_member_callbacks() {
        let (scheduler, pool, sink) = setup();
        let log = Log::default();
        let (own, group) = (log.clone(), log.clone());

        scheduler
            .create_group("g", 1, false, move |r: GroupResults<Fragile>| {
                let err = r["f"].as_ref().unwrap_err();
                Ok(push(&group, format!("group {err}")))
            })
            .unwrap();
        scheduler
            .enqueue_group_task_with(
                "f",
                "g",
                || Ok(Fragile(8)),
                move |v| Ok(push(&own, format!("own {}", v.0))),
                |_| Ok(()),
            )
            .unwrap();

        pool.run_all();
        let report = scheduler.drain().unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(report.groups_completed, 1);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["own 8", "group result clone panicked: cannot copy 8"]
        );

        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, Subject::Task);
        assert_eq!(reports[0].subject, "f");
        assert_eq!(reports[0].stage, Stage::GroupAssembly);
    }

    #[test]
    fn test_group_members_need_not_be_clone_without_own_callback() {
        struct Handle(u16);

        let (scheduler, pool, _) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let results = seen.clone();

        scheduler
            .create_group("h", 2, false, move |r: GroupResults<Handle>| {
                let mut values: Vec<_> =
                    r.values().filter_map(|v| v.as_ref().ok()).map(|h| h.0).collect();
                values.sort();
                *results.lock().unwrap() = values;
                Ok(())
            })
            .unwrap();
        for i in 0..2_u16 {
            scheduler
                .enqueue_group_task(format!("h{i}"), "h", move || Ok(Handle(i)), |_| Ok(()))
                .unwrap();
        }

        pool.run_all();
        scheduler.drain().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_group_callback_panic_carries_trace() {
        let (scheduler, pool, sink) = setup();

        scheduler
            .create_group("g", 1, false, |_: GroupResults<i32>| panic!("merge exploded"))
            .unwrap();
        scheduler.enqueue_group_task("only", "g", || Ok(1), |_| Ok(())).unwrap();

        pool.run_all();
        let report = scheduler.drain().unwrap();
        assert_eq!(report.callback_failures, 1);

        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].stage, Stage::GroupComplete);
        assert_eq!(reports[0].message, "callback panicked: merge exploded");
        assert!(reports[0].trace.as_deref().unwrap().contains("merge exploded"));
    }

    #[test]
    fn test_group_callback_failure_is_logged() {
        let (scheduler, pool, sink) = setup();

        scheduler
            .create_group("g", 1, false, |_: GroupResults<i32>| anyhow::bail!("cannot merge"))
            .unwrap();
        scheduler.enqueue_group_task("only", "g", || Ok(1), |_| Ok(())).unwrap();

        pool.run_all();
        let report = scheduler.drain().unwrap();

        assert_eq!(report.callback_failures, 1);
        assert_eq!(report.groups_completed, 1);
        assert!(!scheduler.has_group("g"));

        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, Subject::Group);
        assert_eq!(reports[0].stage, Stage::GroupComplete);
        assert_eq!(reports[0].message, "cannot merge");
    }

    #[test]
    fn test_async_group_fires_on_worker_then_drain_removes_it() {
        let (scheduler, pool, _) = setup();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();

        scheduler
            .create_group("g2", 3, true, move |r: GroupResults<usize>| {
                let mut values: Vec<_> = r.into_values().map(Result::unwrap).collect();
                values.sort();
                sink.lock().unwrap().push(values);
                Ok(())
            })
            .unwrap();
        for i in 0..3_usize {
            scheduler
                .enqueue_group_task(format!("m{i}"), "g2", move || Ok(i), |_| Ok(()))
                .unwrap();
        }

        assert_eq!(pool.run_shuffled(), 3);
        // The last member queued the group callback on the pool.
        assert_eq!(pool.queued(), 1);
        assert!(fired.lock().unwrap().is_empty());

        pool.run_all();
        assert_eq!(*fired.lock().unwrap(), vec![vec![0, 1, 2]]);
        assert!(scheduler.has_group("g2"));

        let report = scheduler.drain().unwrap();
        assert_eq!(report.groups_completed, 1);
        assert!(!scheduler.has_group("g2"));
        assert_eq!(fired.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_redeclared_group_orphans_old_members() {
        let (scheduler, pool, sink) = setup();
        let fired = Log::default();
        let (old, new) = (fired.clone(), fired.clone());

        scheduler
            .create_group("g", 1, false, move |_: GroupResults<i32>| Ok(push(&old, "old")))
            .unwrap();
        scheduler.enqueue_group_task("stale", "g", || Ok(1), |_| Ok(())).unwrap();

        scheduler
            .create_group("g", 1, false, move |_: GroupResults<i32>| Ok(push(&new, "new")))
            .unwrap();

        pool.run_all();
        let report = scheduler.drain().unwrap();

        // The stale member is still delivered, but the new group never counts it.
        assert_eq!(report.delivered, 1);
        assert!(fired.lock().unwrap().is_empty());
        assert!(scheduler.has_group("g"));

        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].stage, Stage::GroupLookup);

        scheduler.enqueue_group_task("fresh", "g", || Ok(2), |_| Ok(())).unwrap();
        pool.run_all();
        scheduler.drain().unwrap();
        assert_eq!(*fired.lock().unwrap(), vec!["new"]);
    }

    #[test]
    fn test_removed_group_is_reported_to_late_members() {
        let (scheduler, pool, sink) = setup();
        scheduler
            .create_group("g", 1, false, |_: GroupResults<i32>| Ok(()))
            .unwrap();
        scheduler.enqueue_group_task("m", "g", || Ok(1), |_| Ok(())).unwrap();
        pool.run_all();
        scheduler.drain().unwrap();

        let err = scheduler
            .enqueue_group_task("late", "g", || Ok(1), |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::GroupNotDeclared(_)));
        assert!(sink.reports().is_empty());
    }
}
