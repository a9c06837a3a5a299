// src/handler/runtime.rs

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::errors::Result;
use crate::task::{Task, TaskResult};
use crate::types::{BoxFuture, WorkerId};
use crate::worker::{Resignator, Worker};

use super::core::{Dispatch, HandlerCore};
use super::{HandlerCommand, HandlerMessage, HandlerOptions, TerminateOptions};

/// The handler actor.
///
/// Drives [`HandlerCore`] from a single message loop. Every message is
/// handled synchronously; anything that has to wait (a worker's `run` or
/// `stop`, update replay on a new hire, a stop deadline) is spawned and
/// reports back with another message, so scheduling state is only ever
/// touched from this loop.
pub struct HandlerRuntime {
    core: HandlerCore,
    options: HandlerOptions,
    rx: mpsc::Receiver<HandlerMessage>,
    /// Continuations post here. Weak, so the loop ends once every client
    /// handle has been dropped.
    tx: mpsc::WeakSender<HandlerMessage>,
}

impl fmt::Debug for HandlerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRuntime")
            .field("core", &self.core)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl HandlerRuntime {
    pub fn new(
        core: HandlerCore,
        options: HandlerOptions,
        rx: mpsc::Receiver<HandlerMessage>,
        tx: mpsc::WeakSender<HandlerMessage>,
    ) -> Self {
        Self {
            core,
            options,
            rx,
            tx,
        }
    }

    /// Main message loop.
    pub async fn run(mut self) {
        info!("task handler started");

        while let Some(message) = self.rx.recv().await {
            trace!(?message, "task handler received message");
            self.handle(message);
        }

        info!(
            workers = self.core.worker_ids().len(),
            pending = self.core.assignments().pending_total(),
            "task handler exiting"
        );
    }

    fn handle(&mut self, message: HandlerMessage) {
        match message {
            HandlerMessage::Hire { worker, reply } => self.hire(worker, reply),
            HandlerMessage::Terminate {
                worker_id,
                options,
                reply,
            } => {
                let options = TerminateOptions {
                    timeout: options.timeout.or(self.options.terminate_timeout),
                    ..options
                };
                let terminating = self.terminate(worker_id, options);
                tokio::spawn(async move {
                    let _ = reply.send(terminating.await);
                });
            }
            HandlerMessage::Shutdown { timeout, reply } => self.shutdown(timeout, reply),
            HandlerMessage::Roster { series, reply } => {
                let _ = reply.send(self.core.roster(&series));
            }
            HandlerMessage::Update {
                task,
                ephemeral,
                reply,
            } => {
                let _ = reply.send(self.update(task, ephemeral));
            }
            HandlerMessage::Submit { task, reply } => {
                let admitted = self.core.submit(task).map(|(accepted, commands)| {
                    self.execute(commands);
                    accepted
                });
                let _ = reply.send(admitted);
            }
            HandlerMessage::Qualify {
                worker_id,
                series,
                reply,
            } => {
                let qualified = self
                    .core
                    .qualify(worker_id, series)
                    .map(|commands| self.execute(commands));
                let _ = reply.send(qualified);
            }
            HandlerMessage::IsRunning { reply } => {
                let _ = reply.send(self.core.is_running());
            }
            HandlerMessage::Snapshot { reply } => {
                let _ = reply.send(self.core.snapshot());
            }
            HandlerMessage::WorkerReady { worker_id, series } => {
                let commands = self.core.worker_ready(worker_id, series);
                self.execute(commands);
            }
            HandlerMessage::HireReady { worker_id, reply } => {
                let commands = self.core.activate(worker_id);
                self.execute(commands);
                let _ = reply.send(Ok(worker_id));
            }
            HandlerMessage::Resubmit { tasks } => {
                let commands = self.core.resubmit(tasks);
                self.execute(commands);
            }
            HandlerMessage::ShutdownComplete { unfinished, reply } => {
                self.core.mark_stopped();
                info!(unfinished = unfinished.len(), "task handler shut down");
                let _ = reply.send(unfinished);
            }
            HandlerMessage::Resigned { worker_id } => {
                warn!(worker_id = %worker_id, "worker resigned; crashing it and reassigning its tasks");
                let terminating =
                    self.terminate(worker_id, TerminateOptions::crash().reassigning());
                tokio::spawn(terminating);
            }
        }
    }

    fn execute(&mut self, commands: Vec<HandlerCommand>) {
        for command in commands {
            match command {
                HandlerCommand::Dispatch(dispatch) => self.dispatch(dispatch),
            }
        }
    }

    /// Hand an assignment to its worker and arrange for the worker to ask
    /// for more once its `run` resolves.
    fn dispatch(&self, dispatch: Dispatch) {
        let Dispatch {
            worker_id,
            worker,
            series,
            assignment,
        } = dispatch;

        let ready = assignment.accept(worker.as_ref());
        let tx = self.tx.clone();
        tokio::spawn(async move {
            ready.await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx
                    .send(HandlerMessage::WorkerReady { worker_id, series })
                    .await;
            }
        });
    }

    fn hire(&mut self, worker: Arc<dyn Worker>, reply: oneshot::Sender<Result<WorkerId>>) {
        let worker_id = match self.core.enroll(Arc::clone(&worker)) {
            Ok(id) => id,
            Err(e) => {
                warn!(worker = %worker.describe(), error = %e, "hire rejected");
                let _ = reply.send(Err(e));
                return;
            }
        };
        worker.set_resignator(Resignator::new(worker_id, self.tx.clone()));

        let replay = self.core.replay_tasks(worker_id);
        if replay.is_empty() {
            let commands = self.core.activate(worker_id);
            self.execute(commands);
            let _ = reply.send(Ok(worker_id));
            return;
        }

        debug!(worker_id = %worker_id, tasks = replay.len(), "replaying update tasks on new hire");
        let tx = self.tx.clone();
        tokio::spawn(async move {
            for task in replay {
                worker.run(task).await;
            }
            match tx.upgrade() {
                Some(tx) => {
                    let _ = tx
                        .send(HandlerMessage::HireReady { worker_id, reply })
                        .await;
                }
                None => {
                    let _ = reply.send(Ok(worker_id));
                }
            }
        });
    }

    /// Start terminating `worker_id`; the future resolves with the tasks it
    /// left unfinished (empty when they were reassigned).
    ///
    /// `options.timeout` is used as given: callers resolve their own default.
    fn terminate(
        &mut self,
        worker_id: WorkerId,
        options: TerminateOptions,
    ) -> BoxFuture<'static, Vec<Task>> {
        let Some(worker) = self.core.dismiss(worker_id) else {
            debug!(worker_id = %worker_id, "terminate: unknown worker");
            return Box::pin(async { Vec::new() });
        };

        if options.crash {
            let unfinished = worker.crash();
            info!(
                worker_id = %worker_id,
                unfinished = unfinished.len(),
                reassign = options.reassign,
                "worker crashed"
            );
            if options.reassign {
                let commands = self.core.resubmit(unfinished);
                self.execute(commands);
                return Box::pin(async { Vec::new() });
            }
            return Box::pin(async move { unfinished });
        }

        let stopping = stop_worker(worker_id, worker, options.timeout);
        if !options.reassign {
            return stopping;
        }

        let tx = self.tx.clone();
        Box::pin(async move {
            let unfinished = stopping.await;
            if unfinished.is_empty() {
                return Vec::new();
            }
            match tx.upgrade() {
                Some(tx) => {
                    if tx
                        .send(HandlerMessage::Resubmit { tasks: unfinished })
                        .await
                        .is_err()
                    {
                        warn!(worker_id = %worker_id, "handler gone; unfinished tasks dropped");
                    }
                }
                None => {
                    warn!(
                        worker_id = %worker_id,
                        dropped = unfinished.len(),
                        "handler gone; unfinished tasks dropped"
                    );
                }
            }
            Vec::new()
        })
    }

    fn shutdown(&mut self, timeout: Option<Duration>, reply: oneshot::Sender<Vec<Task>>) {
        let workers = self.core.begin_shutdown();
        info!(workers = workers.len(), "shutting down task handler");

        let options = TerminateOptions {
            timeout: timeout.or(self.options.shutdown_timeout),
            crash: false,
            reassign: false,
        };
        let terminations: Vec<_> = workers
            .into_iter()
            .map(|worker_id| self.terminate(worker_id, options))
            .collect();

        let tx = self.tx.clone();
        tokio::spawn(async move {
            let unfinished: Vec<Task> = join_all(terminations).await.into_iter().flatten().collect();
            let message = HandlerMessage::ShutdownComplete { unfinished, reply };
            let undelivered = match tx.upgrade() {
                Some(tx) => tx.send(message).await.err().map(|e| e.0),
                None => Some(message),
            };
            if let Some(HandlerMessage::ShutdownComplete { unfinished, reply }) = undelivered {
                let _ = reply.send(unfinished);
            }
        });
    }

    /// Run a copy of `task` on every qualified worker, bypassing the queue.
    fn update(&mut self, task: Task, ephemeral: bool) -> Vec<TaskResult> {
        self.core
            .broadcast(task, ephemeral)
            .into_iter()
            .map(|(worker_id, worker, copy)| {
                let result = copy.result();
                trace!(worker_id = %worker_id, task = %copy, "running update task");
                // Readiness is irrelevant outside the queue.
                tokio::spawn(worker.run(copy));
                result
            })
            .collect()
    }
}

/// Stop `worker` gracefully, crashing it if `deadline` passes first.
///
/// A stop that completes (before the deadline, or with none) counts as
/// leaving nothing unfinished. If both become ready together the graceful
/// stop wins.
fn stop_worker(
    worker_id: WorkerId,
    worker: Arc<dyn Worker>,
    deadline: Option<Duration>,
) -> BoxFuture<'static, Vec<Task>> {
    let stopping = worker.stop();
    Box::pin(async move {
        let Some(deadline) = deadline else {
            stopping.await;
            info!(worker_id = %worker_id, "worker stopped");
            return Vec::new();
        };

        tokio::select! {
            biased;
            _ = stopping => {
                info!(worker_id = %worker_id, "worker stopped before its deadline");
                Vec::new()
            }
            _ = tokio::time::sleep(deadline) => {
                let unfinished = worker.crash();
                warn!(
                    worker_id = %worker_id,
                    deadline_secs = deadline.as_secs_f64(),
                    unfinished = unfinished.len(),
                    "worker did not stop in time; crashed"
                );
                unfinished
            }
        }
    })
}
