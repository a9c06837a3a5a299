// src/handler/core.rs

//! Pure roster and matching state behind the task handler.
//!
//! [`HandlerCore`] owns the workforce, the labor pools, the update tasks and
//! the [`AssignmentFactory`]. It never awaits and never spawns: every method
//! mutates state synchronously and returns the [`HandlerCommand`]s the async
//! shell (`handler::runtime`) must carry out. That keeps the bookkeeping
//! testable without a runtime.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::assign::{Accepted, Assignment, AssignmentFactory, Match};
use crate::errors::{Result, WorkforceError};
use crate::handler::HandlerSnapshot;
use crate::task::Task;
use crate::types::{series_label, Series, WorkerId};
use crate::worker::{Worker, WorkerHandle};

/// Work the shell must perform after a state change.
#[derive(Debug)]
pub enum HandlerCommand {
    /// Have `worker` accept `assignment`, then report back when it is ready
    /// for the next task of `series`.
    Dispatch(Dispatch),
}

#[derive(Debug)]
pub struct Dispatch {
    pub worker_id: WorkerId,
    pub worker: Arc<dyn Worker>,
    pub series: Series,
    pub assignment: Assignment,
}

#[derive(Debug)]
pub struct HandlerCore {
    workers: BTreeMap<WorkerId, WorkerHandle>,
    labor_pools: HashMap<String, Vec<WorkerId>>,
    update_tasks: Vec<Task>,
    /// Hired workers still replaying update tasks; not yet requesting work.
    replaying: HashSet<WorkerId>,
    worker_counter: u64,
    is_running: bool,
    shutting_down: bool,
    assignments: AssignmentFactory,
}

impl Default for HandlerCore {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerCore {
    pub fn new() -> Self {
        Self {
            workers: BTreeMap::new(),
            labor_pools: HashMap::new(),
            update_tasks: Vec::new(),
            replaying: HashSet::new(),
            worker_counter: 0,
            is_running: true,
            shutting_down: false,
            assignments: AssignmentFactory::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running
    }

    pub fn assignments(&self) -> &AssignmentFactory {
        &self.assignments
    }

    pub fn worker(&self, id: WorkerId) -> Option<&WorkerHandle> {
        self.workers.get(&id)
    }

    /// Add `worker` to the workforce and give it a badge.
    ///
    /// The worker is hired but does not request tasks until [`activate`]
    /// is called, so update tasks can be replayed on it first.
    ///
    /// [`activate`]: HandlerCore::activate
    pub fn enroll(&mut self, worker: Arc<dyn Worker>) -> Result<WorkerId> {
        if !self.is_running || self.shutting_down {
            return Err(WorkforceError::NotRunning);
        }
        worker.validate().map_err(|reason| {
            WorkforceError::Implementation(format!("{} rejected: {reason}", worker.describe()))
        })?;
        if self
            .workers
            .values()
            .any(|handle| Arc::ptr_eq(handle.worker(), &worker))
        {
            return Err(WorkforceError::Implementation(format!(
                "{} is already employed",
                worker.describe()
            )));
        }

        self.worker_counter += 1;
        let id = WorkerId(self.worker_counter);
        let qualifications = worker.qualifications().series();
        info!(
            worker_id = %id,
            worker = %worker.describe(),
            qualifications = ?qualifications,
            "worker hired"
        );

        let mut handle = WorkerHandle::new(id, worker, qualifications);
        handle.set_hired(true);
        self.workers.insert(id, handle);
        self.replaying.insert(id);
        Ok(id)
    }

    /// Fresh copies of the update tasks `id` is qualified to run, in the
    /// order they were registered.
    pub fn replay_tasks(&self, id: WorkerId) -> Vec<Task> {
        let Some(handle) = self.workers.get(&id) else {
            return Vec::new();
        };
        self.update_tasks
            .iter()
            .filter(|task| handle.is_qualified(task.series()))
            .map(Task::duplicate)
            .collect()
    }

    /// Make a hired worker eligible for normal work: post one request per
    /// qualification and join the labor pool of every named series.
    ///
    /// Does nothing if the worker was terminated in the meantime.
    pub fn activate(&mut self, id: WorkerId) -> Vec<HandlerCommand> {
        self.replaying.remove(&id);
        let Some(handle) = self.workers.get(&id) else {
            debug!(worker_id = %id, "worker left before it was ready; no requests posted");
            return Vec::new();
        };
        if !handle.is_hired() {
            return Vec::new();
        }

        let qualifications = handle.qualifications().to_vec();
        let mut commands = Vec::new();
        for series in qualifications {
            if let Some(name) = &series {
                let pool = self.labor_pools.entry(name.clone()).or_default();
                if !pool.contains(&id) {
                    pool.push(id);
                }
            }
            commands.extend(self.post_request(id, series));
        }
        debug!(worker_id = %id, dispatched = commands.len(), "worker ready for assignments");
        commands
    }

    /// A worker finished running a task of `series`.
    ///
    /// It requests the next one only if it is still hired.
    pub fn worker_ready(&mut self, id: WorkerId, series: Series) -> Vec<HandlerCommand> {
        let still_hired = self.workers.get(&id).is_some_and(WorkerHandle::is_hired);
        if !still_hired {
            debug!(
                worker_id = %id,
                series = series_label(&series),
                "worker finished a task after leaving; not requesting more"
            );
            return Vec::new();
        }
        self.post_request(id, series).into_iter().collect()
    }

    /// Admission entry point.
    pub fn submit(&mut self, task: Task) -> Result<(Accepted, Vec<HandlerCommand>)> {
        if !self.is_running || self.shutting_down {
            return Err(WorkforceError::NotRunning);
        }
        Ok(self.admit(task))
    }

    /// Queue `task` or hand it to a waiting worker.
    pub fn admit(&mut self, task: Task) -> (Accepted, Vec<HandlerCommand>) {
        debug!(
            task = %task,
            series = series_label(task.series()),
            priority = task.priority(),
            "task admitted"
        );
        let (accepted, matched) = self.assignments.new_assignment(task);
        let commands = matched.and_then(|m| self.dispatch(m)).into_iter().collect();
        (accepted, commands)
    }

    /// Readmit tasks left unfinished by a terminated worker.
    ///
    /// Their timers are disarmed: a readmitted task is not timed until its
    /// next acceptance.
    pub fn resubmit(&mut self, tasks: Vec<Task>) -> Vec<HandlerCommand> {
        if !tasks.is_empty() {
            info!(count = tasks.len(), "reassigning unfinished tasks");
        }
        let mut commands = Vec::new();
        for task in tasks {
            task.disarm();
            let (_accepted, mut dispatched) = self.admit(task);
            commands.append(&mut dispatched);
        }
        commands
    }

    /// Remove a worker from the workforce.
    ///
    /// Clears its hired flag and withdraws its waiting requests before it is
    /// dropped from the roster and the labor pools. Returns the worker, or
    /// `None` if `id` is not employed.
    pub fn dismiss(&mut self, id: WorkerId) -> Option<Arc<dyn Worker>> {
        let handle = self.workers.get_mut(&id)?;
        handle.set_hired(false);
        self.assignments.cancel_requests(handle);

        let handle = self.workers.remove(&id)?;
        for pool in self.labor_pools.values_mut() {
            pool.retain(|member| *member != id);
        }
        self.replaying.remove(&id);
        info!(worker_id = %id, "worker dismissed");
        Some(handle.into_worker())
    }

    /// Every employed worker when `series` is generic, otherwise the labor
    /// pool of that series.
    pub fn roster(&self, series: &Series) -> Vec<WorkerId> {
        match series {
            None => self.workers.keys().copied().collect(),
            Some(name) => self.labor_pools.get(name).cloned().unwrap_or_default(),
        }
    }

    /// One independent copy of `task` per worker serving its series.
    ///
    /// Unless `ephemeral`, the task is kept for replay on future hires.
    pub fn broadcast(
        &mut self,
        task: Task,
        ephemeral: bool,
    ) -> Vec<(WorkerId, Arc<dyn Worker>, Task)> {
        let copies: Vec<_> = self
            .roster(task.series())
            .into_iter()
            .filter_map(|id| {
                let handle = self.workers.get(&id)?;
                Some((id, Arc::clone(handle.worker()), task.duplicate()))
            })
            .collect();

        info!(
            task = %task,
            series = series_label(task.series()),
            workers = copies.len(),
            ephemeral,
            "broadcasting update task"
        );
        if !ephemeral {
            self.update_tasks.push(task);
        }
        copies
    }

    /// Qualify a hired worker for one more series at runtime.
    pub fn qualify(&mut self, id: WorkerId, name: String) -> Result<Vec<HandlerCommand>> {
        let handle = self
            .workers
            .get_mut(&id)
            .ok_or(WorkforceError::UnknownWorker(id))?;
        let series = Some(name.clone());
        if !handle.add_qualification(series.clone()) {
            return Ok(Vec::new());
        }
        info!(worker_id = %id, series = %name, "worker qualified for series");

        if self.replaying.contains(&id) {
            // activate() picks the new series up.
            return Ok(Vec::new());
        }
        self.labor_pools.entry(name).or_default().push(id);
        Ok(self.post_request(id, series).into_iter().collect())
    }

    /// Stop admitting tasks and hires. Returns every worker to terminate.
    pub fn begin_shutdown(&mut self) -> Vec<WorkerId> {
        self.shutting_down = true;
        self.workers.keys().copied().collect()
    }

    pub fn mark_stopped(&mut self) {
        self.shutting_down = false;
        self.is_running = false;
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.keys().copied().collect()
    }

    pub fn snapshot(&self) -> HandlerSnapshot {
        let mut labor_pools: BTreeMap<String, Vec<WorkerId>> = self
            .labor_pools
            .iter()
            .filter(|(_, members)| !members.is_empty())
            .map(|(name, members)| (name.clone(), members.clone()))
            .collect();
        for members in labor_pools.values_mut() {
            members.sort();
        }

        HandlerSnapshot {
            workers: self.worker_ids(),
            labor_pools,
            pending_assignments: self.assignments.pending_total(),
            waiting_requests: self.assignments.waiting_total(),
            update_tasks: self.update_tasks.len(),
            is_running: self.is_running,
        }
    }

    fn post_request(&mut self, id: WorkerId, series: Series) -> Option<HandlerCommand> {
        let handle = self.workers.get_mut(&id)?;
        let matched = self.assignments.request(handle, series)?;
        self.dispatch(matched)
    }

    /// Turn a match into a dispatch command.
    ///
    /// A match naming a worker that is no longer employed means its request
    /// outlived it; that is logged and the assignment goes back to the head
    /// of its series.
    fn dispatch(&mut self, mut matched: Match) -> Option<HandlerCommand> {
        loop {
            if let Some(handle) = self.workers.get_mut(&matched.worker_id) {
                if let Some(request) = matched.request {
                    handle.fulfil_request(&matched.series, request);
                }
                debug!(
                    worker_id = %matched.worker_id,
                    series = series_label(&matched.series),
                    task = %matched.assignment.task(),
                    "dispatching assignment"
                );
                return Some(HandlerCommand::Dispatch(Dispatch {
                    worker_id: matched.worker_id,
                    worker: Arc::clone(handle.worker()),
                    series: matched.series,
                    assignment: matched.assignment,
                }));
            }

            error!(
                worker_id = %matched.worker_id,
                series = series_label(&matched.series),
                "request matched for a worker that is no longer employed"
            );
            matched = self.assignments.requeue(matched.assignment)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::task::TaskCall;
    use crate::types::BoxFuture;
    use crate::worker::{Qualifications, Resignator};

    #[derive(Default)]
    struct StubWorker {
        series: Vec<String>,
        invalid: bool,
        crashed: AtomicUsize,
    }

    impl Worker for StubWorker {
        fn run(&self, _task: Task) -> BoxFuture<'static, ()> {
            Box::pin(async {})
        }

        fn stop(&self) -> BoxFuture<'static, Vec<Task>> {
            Box::pin(async { Vec::new() })
        }

        fn crash(&self) -> Vec<Task> {
            self.crashed.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        }

        fn set_resignator(&self, _resignator: Resignator) {}

        fn qualifications(&self) -> Qualifications {
            Qualifications::new(Vec::new(), self.series.clone())
        }

        fn validate(&self) -> std::result::Result<(), String> {
            if self.invalid {
                return Err("missing capabilities".into());
            }
            Ok(())
        }
    }

    fn stub(series: &[&str]) -> Arc<dyn Worker> {
        Arc::new(StubWorker {
            series: series.iter().map(|s| s.to_string()).collect(),
            ..StubWorker::default()
        })
    }

    fn task(target: &str, series: Series) -> Task {
        Task::from_call(TaskCall::new(target), 1.0, series, None)
    }

    fn hire(core: &mut HandlerCore, worker: Arc<dyn Worker>) -> (WorkerId, Vec<HandlerCommand>) {
        let id = core.enroll(worker).expect("enroll");
        let commands = core.activate(id);
        (id, commands)
    }

    fn dispatched_to(commands: &[HandlerCommand]) -> Vec<WorkerId> {
        commands
            .iter()
            .map(|HandlerCommand::Dispatch(d)| d.worker_id)
            .collect()
    }

    #[test]
    fn hire_posts_one_request_per_qualification() {
        let mut core = HandlerCore::new();
        let (id, commands) = hire(&mut core, stub(&["gpu", "io"]));

        assert!(commands.is_empty());
        assert_eq!(core.assignments().waiting_total(), 3);
        assert_eq!(core.roster(&None), vec![id]);
        assert_eq!(core.roster(&Some("gpu".into())), vec![id]);
        assert_eq!(core.roster(&Some("io".into())), vec![id]);
    }

    #[test]
    fn invalid_worker_is_never_employed() {
        let mut core = HandlerCore::new();
        let worker = Arc::new(StubWorker {
            invalid: true,
            ..StubWorker::default()
        });

        let err = core.enroll(worker).unwrap_err();
        assert!(matches!(err, WorkforceError::Implementation(_)));
        assert!(core.worker_ids().is_empty());
        assert!(core.snapshot().labor_pools.is_empty());
    }

    #[test]
    fn same_worker_cannot_be_hired_twice() {
        let mut core = HandlerCore::new();
        let worker = stub(&[]);
        hire(&mut core, Arc::clone(&worker));
        assert!(matches!(
            core.enroll(worker),
            Err(WorkforceError::Implementation(_))
        ));
    }

    #[test]
    fn pending_task_is_dispatched_on_activation() {
        let mut core = HandlerCore::new();
        let (_accepted, commands) = core.submit(task("early", None)).expect("running");
        assert!(commands.is_empty());

        let (id, commands) = hire(&mut core, stub(&[]));
        assert_eq!(dispatched_to(&commands), vec![id]);
        assert_eq!(core.assignments().pending_total(), 0);
        assert!(core.worker(id).map(|h| h.requests().is_empty()).unwrap_or(false));
    }

    #[test]
    fn ready_worker_pulls_the_next_task_only_while_hired() {
        let mut core = HandlerCore::new();
        let (id, _) = hire(&mut core, stub(&[]));

        let (_a, commands) = core.submit(task("one", None)).expect("running");
        assert_eq!(dispatched_to(&commands), vec![id]);
        let (_b, commands) = core.submit(task("two", None)).expect("running");
        assert!(commands.is_empty(), "the only worker is busy");

        let commands = core.worker_ready(id, None);
        assert_eq!(dispatched_to(&commands), vec![id]);

        core.dismiss(id);
        assert!(core.worker_ready(id, None).is_empty());
    }

    #[test]
    fn dismissed_worker_requests_are_withdrawn() {
        let mut core = HandlerCore::new();
        let (leaving, _) = hire(&mut core, stub(&["gpu"]));
        let (staying, _) = hire(&mut core, stub(&[]));

        assert!(core.dismiss(leaving).is_some());
        assert!(core.roster(&Some("gpu".into())).is_empty());
        assert_eq!(core.roster(&None), vec![staying]);

        let (_a, commands) = core.submit(task("t", None)).expect("running");
        assert_eq!(dispatched_to(&commands), vec![staying]);

        let (_b, commands) = core.submit(task("g", Some("gpu".into()))).expect("running");
        assert!(commands.is_empty());
        assert_eq!(core.assignments().pending_count(&Some("gpu".into())), 1);
    }

    #[test]
    fn dismissing_an_unknown_worker_changes_nothing() {
        let mut core = HandlerCore::new();
        let (id, _) = hire(&mut core, stub(&[]));
        assert!(core.dismiss(WorkerId(99)).is_none());
        assert_eq!(core.roster(&None), vec![id]);
    }

    #[test]
    fn resubmitted_tasks_are_readmitted() {
        let mut core = HandlerCore::new();
        let commands = core.resubmit(vec![task("a", None), task("b", None)]);
        assert!(commands.is_empty());
        assert_eq!(core.assignments().pending_count(&None), 2);

        let (id, commands) = hire(&mut core, stub(&[]));
        assert_eq!(dispatched_to(&commands), vec![id]);
        assert_eq!(core.assignments().pending_count(&None), 1);
    }

    #[tokio::test]
    async fn resubmitted_tasks_are_not_timed_while_pending() {
        let mut core = HandlerCore::new();
        let timed = Task::from_call(
            TaskCall::new("timed"),
            1.0,
            None,
            Some(std::time::Duration::from_secs(60)),
        );
        timed.start_timer();
        assert!(timed.timer_armed());

        core.resubmit(vec![timed]);
        let (_id, commands) = hire(&mut core, stub(&[]));
        let HandlerCommand::Dispatch(dispatch) = &commands[0];
        assert!(!dispatch.assignment.task().timer_armed());
    }

    #[test]
    fn update_tasks_replay_only_in_qualified_series() {
        let mut core = HandlerCore::new();
        assert!(core.broadcast(task("generic", None), false).is_empty());
        core.broadcast(task("gpu-only", Some("gpu".into())), false);
        core.broadcast(task("ephemeral", None), true);

        let plain = core.enroll(stub(&[])).expect("enroll");
        let gpu = core.enroll(stub(&["gpu"])).expect("enroll");

        let targets = |id| -> Vec<String> {
            core.replay_tasks(id)
                .iter()
                .map(|t| t.call().target.clone())
                .collect()
        };
        assert_eq!(targets(plain), vec!["generic"]);
        assert_eq!(targets(gpu), vec!["generic", "gpu-only"]);
    }

    #[test]
    fn broadcast_reaches_every_worker_in_the_series() {
        let mut core = HandlerCore::new();
        let (a, _) = hire(&mut core, stub(&["gpu"]));
        let (b, _) = hire(&mut core, stub(&[]));

        let all: Vec<WorkerId> = core
            .broadcast(task("u", None), true)
            .into_iter()
            .map(|(id, _, _)| id)
            .collect();
        assert_eq!(all, vec![a, b]);

        let gpu: Vec<WorkerId> = core
            .broadcast(task("u", Some("gpu".into())), true)
            .into_iter()
            .map(|(id, _, _)| id)
            .collect();
        assert_eq!(gpu, vec![a]);
    }

    #[test]
    fn activation_after_dismissal_posts_nothing() {
        let mut core = HandlerCore::new();
        let id = core.enroll(stub(&["gpu"])).expect("enroll");
        core.dismiss(id);

        assert!(core.activate(id).is_empty());
        assert_eq!(core.assignments().waiting_total(), 0);
        assert!(core.roster(&Some("gpu".into())).is_empty());
    }

    #[test]
    fn qualify_joins_the_pool_and_requests_work() {
        let mut core = HandlerCore::new();
        let (_pending, _) = core.submit(task("x", Some("extra".into()))).expect("running");
        let (id, _) = hire(&mut core, stub(&[]));

        let commands = core.qualify(id, "extra".into()).expect("known worker");
        assert_eq!(dispatched_to(&commands), vec![id]);
        assert_eq!(core.roster(&Some("extra".into())), vec![id]);

        assert!(core.qualify(id, "extra".into()).expect("known").is_empty());
        assert!(matches!(
            core.qualify(WorkerId(42), "extra".into()),
            Err(WorkforceError::UnknownWorker(WorkerId(42)))
        ));
    }

    #[test]
    fn qualify_during_replay_waits_for_activation() {
        let mut core = HandlerCore::new();
        let id = core.enroll(stub(&[])).expect("enroll");

        assert!(core.qualify(id, "late".into()).expect("known").is_empty());
        assert!(core.roster(&Some("late".into())).is_empty());

        core.activate(id);
        assert_eq!(core.roster(&Some("late".into())), vec![id]);
        assert_eq!(core.assignments().waiting_count(&Some("late".into())), 1);
    }

    #[test]
    fn no_admission_or_hiring_once_shutting_down() {
        let mut core = HandlerCore::new();
        let (id, _) = hire(&mut core, stub(&[]));
        assert_eq!(core.begin_shutdown(), vec![id]);

        assert!(matches!(core.submit(task("late", None)), Err(WorkforceError::NotRunning)));
        assert!(matches!(core.enroll(stub(&[])), Err(WorkforceError::NotRunning)));

        core.dismiss(id);
        core.mark_stopped();
        assert!(!core.is_running());
        assert!(!core.snapshot().is_running);
    }
}
