// src/handler/mod.rs

//! The task handler: workforce lifecycle and task admission.
//!
//! A single actor ([`runtime::HandlerRuntime`]) owns all scheduling state
//! and processes [`HandlerMessage`]s one at a time. The public face is
//! [`TaskHandler`], a cheap-to-clone client that sends a message per
//! operation and waits for the reply.
//!
//! The state itself lives in [`core::HandlerCore`], which is synchronous and
//! returns commands for the actor to execute.

pub mod core;
pub mod runtime;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};

use crate::assign::Accepted;
use crate::config::ConfigFile;
use crate::errors::{Result, WorkforceError};
use crate::task::{Task, TaskOutcome, TaskResult};
use crate::types::{Series, WorkerId};
use crate::worker::Worker;

pub use self::core::{Dispatch, HandlerCommand, HandlerCore};
pub use self::runtime::HandlerRuntime;

/// How to terminate a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminateOptions {
    /// Crash the worker if its graceful stop has not finished by then.
    /// Falls back to the handler's configured terminate timeout.
    pub timeout: Option<Duration>,
    /// Crash right away instead of stopping gracefully.
    pub crash: bool,
    /// Readmit the unfinished tasks instead of returning them.
    pub reassign: bool,
}

impl TerminateOptions {
    pub fn graceful() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn crash() -> Self {
        Self {
            crash: true,
            ..Self::default()
        }
    }

    pub fn reassigning(mut self) -> Self {
        self.reassign = true;
        self
    }
}

/// Options for the handler actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerOptions {
    pub channel_capacity: usize,
    pub terminate_timeout: Option<Duration>,
    pub shutdown_timeout: Option<Duration>,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            terminate_timeout: None,
            shutdown_timeout: None,
        }
    }
}

impl From<&ConfigFile> for HandlerOptions {
    fn from(config: &ConfigFile) -> Self {
        Self {
            channel_capacity: config.handler().channel_capacity,
            terminate_timeout: config.handler().terminate_timeout(),
            shutdown_timeout: config.handler().shutdown_timeout(),
        }
    }
}

/// Point-in-time view of the handler's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerSnapshot {
    pub workers: Vec<WorkerId>,
    pub labor_pools: BTreeMap<String, Vec<WorkerId>>,
    pub pending_assignments: usize,
    pub waiting_requests: usize,
    pub update_tasks: usize,
    pub is_running: bool,
}

/// Messages processed by the handler actor.
///
/// The first group comes from [`TaskHandler`]; the rest are continuations
/// the actor posts to itself (or that workers post through their
/// [`Resignator`](crate::worker::Resignator)).
pub enum HandlerMessage {
    Hire {
        worker: Arc<dyn Worker>,
        reply: oneshot::Sender<Result<WorkerId>>,
    },
    Terminate {
        worker_id: WorkerId,
        options: TerminateOptions,
        reply: oneshot::Sender<Vec<Task>>,
    },
    Shutdown {
        timeout: Option<Duration>,
        reply: oneshot::Sender<Vec<Task>>,
    },
    Roster {
        series: Series,
        reply: oneshot::Sender<Vec<WorkerId>>,
    },
    Update {
        task: Task,
        ephemeral: bool,
        reply: oneshot::Sender<Vec<TaskResult>>,
    },
    Submit {
        task: Task,
        reply: oneshot::Sender<Result<Accepted>>,
    },
    Qualify {
        worker_id: WorkerId,
        series: String,
        reply: oneshot::Sender<Result<()>>,
    },
    IsRunning {
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<HandlerSnapshot>,
    },

    /// A worker's `run` resolved; it may take the next task of `series`.
    WorkerReady { worker_id: WorkerId, series: Series },
    /// Update-task replay for a new hire has finished.
    HireReady {
        worker_id: WorkerId,
        reply: oneshot::Sender<Result<WorkerId>>,
    },
    /// Tasks returned by a graceful stop that must be reassigned.
    Resubmit { tasks: Vec<Task> },
    /// Every worker has been terminated for a shutdown.
    ShutdownComplete {
        unfinished: Vec<Task>,
        reply: oneshot::Sender<Vec<Task>>,
    },
    /// A worker reported its own fatal failure.
    Resigned { worker_id: WorkerId },
}

impl HandlerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerMessage::Hire { .. } => "Hire",
            HandlerMessage::Terminate { .. } => "Terminate",
            HandlerMessage::Shutdown { .. } => "Shutdown",
            HandlerMessage::Roster { .. } => "Roster",
            HandlerMessage::Update { .. } => "Update",
            HandlerMessage::Submit { .. } => "Submit",
            HandlerMessage::Qualify { .. } => "Qualify",
            HandlerMessage::IsRunning { .. } => "IsRunning",
            HandlerMessage::Snapshot { .. } => "Snapshot",
            HandlerMessage::WorkerReady { .. } => "WorkerReady",
            HandlerMessage::HireReady { .. } => "HireReady",
            HandlerMessage::Resubmit { .. } => "Resubmit",
            HandlerMessage::ShutdownComplete { .. } => "ShutdownComplete",
            HandlerMessage::Resigned { .. } => "Resigned",
        }
    }
}

impl fmt::Debug for HandlerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(self.kind());
        match self {
            HandlerMessage::Hire { worker, .. } => {
                s.field("worker", worker);
            }
            HandlerMessage::Terminate {
                worker_id, options, ..
            } => {
                s.field("worker_id", worker_id).field("options", options);
            }
            HandlerMessage::Shutdown { timeout, .. } => {
                s.field("timeout", timeout);
            }
            HandlerMessage::Roster { series, .. } => {
                s.field("series", series);
            }
            HandlerMessage::Update {
                task, ephemeral, ..
            } => {
                s.field("task", task).field("ephemeral", ephemeral);
            }
            HandlerMessage::Submit { task, .. } => {
                s.field("task", task);
            }
            HandlerMessage::Qualify {
                worker_id, series, ..
            } => {
                s.field("worker_id", worker_id).field("series", series);
            }
            HandlerMessage::WorkerReady { worker_id, series } => {
                s.field("worker_id", worker_id).field("series", series);
            }
            HandlerMessage::HireReady { worker_id, .. }
            | HandlerMessage::Resigned { worker_id } => {
                s.field("worker_id", worker_id);
            }
            HandlerMessage::Resubmit { tasks } => {
                s.field("tasks", &tasks.len());
            }
            HandlerMessage::ShutdownComplete { unfinished, .. } => {
                s.field("unfinished", &unfinished.len());
            }
            HandlerMessage::IsRunning { .. } | HandlerMessage::Snapshot { .. } => {}
        }
        s.finish_non_exhaustive()
    }
}

/// Client of the handler actor.
#[derive(Debug, Clone)]
pub struct TaskHandler {
    tx: mpsc::Sender<HandlerMessage>,
}

impl TaskHandler {
    /// Start the handler actor on the current tokio runtime.
    ///
    /// The actor runs until every `TaskHandler` clone has been dropped.
    pub fn spawn(options: HandlerOptions) -> Self {
        let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));
        let runtime = HandlerRuntime::new(HandlerCore::new(), options, rx, tx.downgrade());
        tokio::spawn(runtime.run());
        Self { tx }
    }

    /// Add a worker to the workforce.
    ///
    /// Resolves with the worker's badge once any update tasks have been
    /// replayed on it and its first requests are posted. Fails with
    /// [`WorkforceError::Implementation`] if the worker's `validate()` fails
    /// or it is already employed here.
    pub async fn hire(&self, worker: Arc<dyn Worker>) -> Result<WorkerId> {
        self.request(|reply| HandlerMessage::Hire { worker, reply })
            .await?
    }

    /// Remove a worker, returning the tasks it left unfinished.
    ///
    /// Unknown ids resolve with an empty list. With `reassign`, unfinished
    /// tasks are readmitted and the list is empty.
    pub async fn terminate(
        &self,
        worker_id: WorkerId,
        options: TerminateOptions,
    ) -> Result<Vec<Task>> {
        self.request(|reply| HandlerMessage::Terminate {
            worker_id,
            options,
            reply,
        })
        .await
    }

    /// Terminate every worker and stop admitting tasks.
    ///
    /// Resolves with all tasks the workforce left unfinished; none are
    /// reassigned.
    pub async fn shutdown(&self, timeout: Option<Duration>) -> Result<Vec<Task>> {
        self.request(|reply| HandlerMessage::Shutdown { timeout, reply })
            .await
    }

    /// Every employed worker (`None`) or the labor pool of one series.
    pub async fn roster(&self, series: Series) -> Result<Vec<WorkerId>> {
        self.request(|reply| HandlerMessage::Roster { series, reply })
            .await
    }

    /// Run a copy of `task` on every worker serving its series, outside the
    /// queue, and collect each copy's outcome.
    ///
    /// Unless `ephemeral`, the task is also replayed on every future hire.
    pub async fn update(&self, task: Task, ephemeral: bool) -> Result<Vec<TaskOutcome>> {
        let results = self.update_results(task, ephemeral).await?;
        join_all(results.into_iter().map(TaskResult::wait))
            .await
            .into_iter()
            .collect()
    }

    /// Like [`update`](TaskHandler::update) but returns the per-worker result
    /// handles without waiting on them.
    pub async fn update_results(&self, task: Task, ephemeral: bool) -> Result<Vec<TaskResult>> {
        self.request(|reply| HandlerMessage::Update {
            task,
            ephemeral,
            reply,
        })
        .await
    }

    /// Admit a task.
    ///
    /// The outer future resolves once the task is queued or dispatched; the
    /// returned [`Accepted`] resolves once a worker has taken it. Neither
    /// waits for the task to finish.
    pub async fn submit(&self, task: Task) -> Result<Accepted> {
        self.request(|reply| HandlerMessage::Submit { task, reply })
            .await?
    }

    /// Qualify an employed worker for another series.
    pub async fn qualify(&self, worker_id: WorkerId, series: impl Into<String>) -> Result<()> {
        let series = series.into();
        self.request(|reply| HandlerMessage::Qualify {
            worker_id,
            series,
            reply,
        })
        .await?
    }

    /// `false` once a shutdown has completed.
    pub async fn is_running(&self) -> Result<bool> {
        self.request(|reply| HandlerMessage::IsRunning { reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<HandlerSnapshot> {
        self.request(|reply| HandlerMessage::Snapshot { reply })
            .await
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> HandlerMessage,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(message(reply))
            .await
            .map_err(|_| WorkforceError::HandlerClosed)?;
        rx.await.map_err(|_| WorkforceError::HandlerClosed)
    }
}
