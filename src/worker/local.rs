// src/worker/local.rs

//! In-process worker running registered async functions on tokio tasks.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

use crate::task::{Task, TaskCall};
use crate::types::BoxFuture;
use crate::worker::{Qualifications, Resignator, Worker};

/// Series every [`LocalWorker`] serves.
pub const LOCAL_SERIES: &str = "local";

/// A registered function: takes the call description, yields a JSON value.
pub type TaskFn = Arc<dyn Fn(TaskCall) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Named async functions a [`LocalWorker`] can run.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, TaskFn>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `function` under `name`, replacing any previous entry.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, function: F) -> &mut Self
    where
        F: Fn(TaskCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let function: TaskFn =
            Arc::new(move |call: TaskCall| -> BoxFuture<'static, anyhow::Result<Value>> {
                Box::pin(function(call))
            });
        self.functions.insert(name.into(), function);
        self
    }

    pub fn get(&self, name: &str) -> Option<TaskFn> {
        self.functions.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

struct InFlight {
    task: Task,
    abort: Option<AbortHandle>,
}

#[derive(Default)]
struct LocalState {
    next_token: u64,
    in_flight: HashMap<u64, InFlight>,
    closed: bool,
}

struct LocalInner {
    registry: FunctionRegistry,
    state: Mutex<LocalState>,
    idle: Notify,
    resignator: Mutex<Option<Resignator>>,
}

impl LocalInner {
    fn state(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove a finished entry and settle its task with `settle`, then wake
    /// `stop()` if nothing is left. Does nothing if `crash()` took the task.
    fn finish(&self, token: u64, settle: impl FnOnce(Task)) {
        let entry = self.state().in_flight.remove(&token);
        if let Some(entry) = entry {
            settle(entry.task);
        }
        if self.state().in_flight.is_empty() {
            self.idle.notify_waiters();
        }
    }

    fn resign(&self) {
        let resignator = self
            .resignator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match resignator {
            Some(resignator) => resignator.resign(),
            None => warn!("local worker failed before it was hired"),
        }
    }
}

/// Runs tasks by looking up [`TaskCall::target`] in a [`FunctionRegistry`].
///
/// Each run is a separate tokio task. `stop()` waits for the ones in flight;
/// `crash()` aborts them and hands their tasks back. A function that panics
/// fails its task and makes the worker resign.
#[derive(Clone)]
pub struct LocalWorker {
    inner: Arc<LocalInner>,
    series: Vec<String>,
}

impl LocalWorker {
    pub fn new(registry: FunctionRegistry) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                registry,
                state: Mutex::new(LocalState::default()),
                idle: Notify::new(),
                resignator: Mutex::new(None),
            }),
            series: Vec::new(),
        }
    }

    /// Also serve these series, on top of the generic and `"local"` ones.
    pub fn with_series<I, S>(mut self, series: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.series.extend(series.into_iter().map(Into::into));
        self
    }

    /// Number of tasks currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.state().in_flight.len()
    }
}

impl fmt::Debug for LocalWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalWorker")
            .field("registry", &self.inner.registry)
            .field("series", &self.series)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Worker for LocalWorker {
    fn run(&self, task: Task) -> BoxFuture<'static, ()> {
        let target = task.call().target.clone();
        let Some(function) = self.inner.registry.get(&target) else {
            warn!(task = %target, "no function registered under this name");
            task.fail(format!("no function registered as `{target}`"));
            return Box::pin(async {});
        };

        let call = task.call().clone();
        let token = {
            let mut state = self.inner.state();
            if state.closed {
                drop(state);
                task.fail("worker has been shut down");
                return Box::pin(async {});
            }
            state.next_token += 1;
            let token = state.next_token;
            state.in_flight.insert(token, InFlight { task, abort: None });
            token
        };

        let inner = Arc::clone(&self.inner);
        let job = tokio::spawn(async move {
            let outcome = function(call).await;
            inner.finish(token, |task| match outcome {
                Ok(value) => {
                    task.resolve(value);
                }
                Err(e) => {
                    debug!(task = %task, error = %e, "task function returned an error");
                    task.fail(format!("{e:#}"));
                }
            });
        });

        if let Some(entry) = self.inner.state().in_flight.get_mut(&token) {
            entry.abort = Some(job.abort_handle());
        }

        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let Err(join_error) = job.await else {
                return;
            };
            if join_error.is_panic() {
                error!(task = %target, "task function panicked; local worker resigning");
                inner.finish(token, |task| {
                    task.fail(format!("task function `{target}` panicked"));
                });
                inner.resign();
            }
        })
    }

    fn stop(&self) -> BoxFuture<'static, Vec<Task>> {
        self.inner.state().closed = true;
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            loop {
                let idle = inner.idle.notified();
                if inner.state().in_flight.is_empty() {
                    break;
                }
                idle.await;
            }
            debug!("local worker stopped");
            Vec::new()
        })
    }

    fn crash(&self) -> Vec<Task> {
        let drained: Vec<InFlight> = {
            let mut state = self.inner.state();
            state.closed = true;
            state.in_flight.drain().map(|(_, entry)| entry).collect()
        };
        self.inner.idle.notify_waiters();

        drained
            .into_iter()
            .map(|entry| {
                if let Some(abort) = entry.abort {
                    abort.abort();
                }
                entry.task
            })
            .collect()
    }

    fn set_resignator(&self, resignator: Resignator) {
        *self
            .inner
            .resignator
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(resignator);
    }

    fn qualifications(&self) -> Qualifications {
        Qualifications::new(vec![LOCAL_SERIES.to_string()], self.series.clone())
    }

    fn validate(&self) -> Result<(), String> {
        if self.inner.registry.is_empty() {
            return Err("local worker has no registered functions".to_string());
        }
        Ok(())
    }
}
