// src/assign/factory.rs

use std::collections::{HashMap, VecDeque};
use std::fmt;

use tracing::{debug, trace};

use crate::assign::assignment::{Accepted, Assignment};
use crate::task::Task;
use crate::types::{series_label, Series, WorkerId};
use crate::worker::WorkerHandle;

/// Identifies one outstanding worker request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request#{}", self.0)
    }
}

/// A task paired with the worker that gets to run it.
///
/// `request` is set when the pairing filled a request that had been
/// waiting; the worker's handle still lists it until the caller fulfils it.
#[derive(Debug)]
pub struct Match {
    pub worker_id: WorkerId,
    pub series: Series,
    pub assignment: Assignment,
    pub request: Option<RequestId>,
}

#[derive(Debug, Clone, Copy)]
struct WaitingRequest {
    worker_id: WorkerId,
    request: RequestId,
}

/// Per-series matching of tasks and worker requests, FIFO on both sides.
///
/// For any series at most one of the two queues is non-empty: every arrival
/// drains the opposite queue first.
#[derive(Debug, Default)]
pub struct AssignmentFactory {
    waiting: HashMap<Series, VecDeque<WaitingRequest>>,
    pending: HashMap<Series, VecDeque<Assignment>>,
    request_counter: u64,
}

impl AssignmentFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `worker` as wanting a task from `series`.
    ///
    /// Returns the oldest pending assignment of the series if there is one.
    /// Otherwise the request joins the series' waiting list, is recorded on
    /// the worker's handle, and `None` is returned.
    pub fn request(&mut self, worker: &mut WorkerHandle, series: Series) -> Option<Match> {
        if let Some(assignment) = self.pending.get_mut(&series).and_then(VecDeque::pop_front) {
            debug!(
                worker_id = %worker.id(),
                series = series_label(&series),
                "request filled from pending assignments"
            );
            return Some(Match {
                worker_id: worker.id(),
                series,
                assignment,
                request: None,
            });
        }

        self.request_counter += 1;
        let request = RequestId(self.request_counter);
        trace!(
            worker_id = %worker.id(),
            series = series_label(&series),
            %request,
            "request waiting for a task"
        );
        self.waiting
            .entry(series.clone())
            .or_default()
            .push_back(WaitingRequest {
                worker_id: worker.id(),
                request,
            });
        worker.record_request(series.clone(), request);

        self.debug_check(&series);
        None
    }

    /// Create an assignment for `task`.
    ///
    /// If a worker is already waiting in the task's series, the oldest such
    /// request is filled and returned as a [`Match`]. Otherwise the
    /// assignment is queued. Either way the returned [`Accepted`] resolves
    /// once a worker takes the task.
    pub fn new_assignment(&mut self, task: Task) -> (Accepted, Option<Match>) {
        let series = task.series().clone();
        let (assignment, accepted) = Assignment::new(task);

        if let Some(waiting) = self.waiting.get_mut(&series).and_then(VecDeque::pop_front) {
            debug!(
                worker_id = %waiting.worker_id,
                series = series_label(&series),
                request = %waiting.request,
                "assignment matched a waiting request"
            );
            let matched = Match {
                worker_id: waiting.worker_id,
                series,
                assignment,
                request: Some(waiting.request),
            };
            return (accepted, Some(matched));
        }

        trace!(series = series_label(&series), "assignment pending");
        self.pending
            .entry(series.clone())
            .or_default()
            .push_back(assignment);
        self.debug_check(&series);
        (accepted, None)
    }

    /// Put an assignment back at the head of its series' pending list, or
    /// hand it to the oldest waiting request if there is one.
    ///
    /// Used when a match could not be dispatched, so the assignment keeps
    /// its place ahead of later arrivals.
    pub fn requeue(&mut self, assignment: Assignment) -> Option<Match> {
        let series = assignment.task().series().clone();
        if let Some(waiting) = self.waiting.get_mut(&series).and_then(VecDeque::pop_front) {
            return Some(Match {
                worker_id: waiting.worker_id,
                series,
                assignment,
                request: Some(waiting.request),
            });
        }

        self.pending
            .entry(series.clone())
            .or_default()
            .push_front(assignment);
        self.debug_check(&series);
        None
    }

    /// Withdraw every request `worker` still has waiting.
    ///
    /// Must run before the worker is dropped from the roster, so that no
    /// later task is routed to a worker that has gone away. Returns how many
    /// requests were withdrawn.
    pub fn cancel_requests(&mut self, worker: &mut WorkerHandle) -> usize {
        let mut cancelled = 0;
        for (series, requests) in worker.take_requests() {
            let Some(queue) = self.waiting.get_mut(&series) else {
                continue;
            };
            let before = queue.len();
            queue.retain(|waiting| !requests.contains(&waiting.request));
            cancelled += before - queue.len();
        }
        debug!(worker_id = %worker.id(), cancelled, "cancelled waiting requests");
        cancelled
    }

    /// Number of assignments nobody has picked up yet in `series`.
    pub fn pending_count(&self, series: &Series) -> usize {
        self.pending.get(series).map_or(0, VecDeque::len)
    }

    /// Number of worker requests nobody has filled yet in `series`.
    pub fn waiting_count(&self, series: &Series) -> usize {
        self.waiting.get(series).map_or(0, VecDeque::len)
    }

    /// Pending assignments across every series.
    pub fn pending_total(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    /// Waiting requests across every series.
    pub fn waiting_total(&self) -> usize {
        self.waiting.values().map(VecDeque::len).sum()
    }

    fn debug_check(&self, series: &Series) {
        debug_assert!(
            self.pending_count(series) == 0 || self.waiting_count(series) == 0,
            "series {} has both pending assignments and waiting requests",
            series_label(series)
        );
    }
}
