// src/assign/assignment.rs

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::errors::{Result, WorkforceError};
use crate::task::Task;
use crate::types::BoxFuture;
use crate::worker::Worker;

/// One task waiting to be accepted by exactly one worker.
#[derive(Debug)]
pub struct Assignment {
    task: Task,
    accepted: oneshot::Sender<()>,
}

impl Assignment {
    /// Create an assignment for `task` and the future that resolves once a
    /// worker accepts it.
    pub fn new(task: Task) -> (Self, Accepted) {
        let (accepted, rx) = oneshot::channel();
        (Self { task, accepted }, Accepted { rx })
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Hand the task to `worker`.
    ///
    /// Signals acceptance, arms the task's timeout and starts the run. The
    /// returned future resolves when the worker is ready for another
    /// assignment, which is unrelated to the task's own result.
    pub fn accept(self, worker: &dyn Worker) -> BoxFuture<'static, ()> {
        // The submitter may have stopped listening; the task still runs.
        let _ = self.accepted.send(());
        self.task.start_timer();
        worker.run(self.task)
    }

    /// Give up on the assignment and recover its task. The acceptance
    /// future then fails with [`WorkforceError::HandlerClosed`].
    pub fn into_task(self) -> Task {
        self.task
    }
}

/// Resolves once some worker has accepted the task.
///
/// Acceptance and completion are distinct events: wait on the task's
/// [`TaskResult`](crate::task::TaskResult) for the latter.
#[derive(Debug)]
pub struct Accepted {
    rx: oneshot::Receiver<()>,
}

impl Future for Accepted {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|accepted| accepted.map_err(|_| WorkforceError::HandlerClosed))
    }
}
