// src/task/mod.rs

//! Units of work and their results.
//!
//! - [`Task`] carries a call description, a priority, a series and an
//!   optional timeout, plus a result slot that a worker resolves.
//! - [`factory`] computes priorities from niceness and per-series serials.
//! - [`result`] holds the shared result slot and its read side.
//! - [`QueueEntry`] orders tasks ahead of the shutdown marker.

pub mod factory;
pub mod result;

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::warn;

use crate::errors::{Result, WorkforceError};
use crate::types::{series_label, Series};

pub use factory::TaskFactory;
pub use result::TaskResult;

use result::ResultSlot;

/// Priority given by [`Task::rush`]: ahead of anything a factory computes.
pub const RUSH_PRIORITY: f64 = -1_000_000.0;

/// Priority given by [`Task::relax`]: behind anything a factory computes.
pub const RELAX_PRIORITY: f64 = 1_000_000.0;

/// Transform applied to an outcome before it is stored in the result slot.
pub type ResultTransform = Arc<dyn Fn(TaskOutcome) -> TaskOutcome + Send + Sync>;

/// What to call: a target name the worker resolves, plus its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCall {
    pub target: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl TaskCall {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    /// Build a call from loosely typed arguments.
    ///
    /// `args` must be a JSON array and `kwargs` a JSON object.
    pub fn from_values(target: impl Into<String>, args: Value, kwargs: Value) -> Result<Self> {
        let args = match args {
            Value::Array(items) => items,
            other => {
                return Err(WorkforceError::InvalidArguments(format!(
                    "`args` must be a sequence, got {}",
                    json_kind(&other)
                )));
            }
        };
        let kwargs = match kwargs {
            Value::Object(map) => map,
            other => {
                return Err(WorkforceError::InvalidArguments(format!(
                    "`kwargs` must be a mapping, got {}",
                    json_kind(&other)
                )));
            }
        };

        Ok(Self {
            target: target.into(),
            args,
            kwargs,
        })
    }
}

impl fmt::Display for TaskCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.target)?;
        let mut first = true;
        for arg in &self.args {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
            first = false;
        }
        for (key, value) in &self.kwargs {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{key}={value}")?;
            first = false;
        }
        f.write_str(")")
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// How a task ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(Value),
    Failed(String),
    /// The task's timer fired before its worker resolved it.
    TimedOut(Duration),
}

impl TaskOutcome {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskOutcome::TimedOut(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            TaskOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }
}

/// A unit of work dispatched to a worker.
///
/// Tasks compare by priority alone: lower numbers are scheduled first.
pub struct Task {
    call: TaskCall,
    priority: f64,
    series: Series,
    timeout: Option<Duration>,
    callbacks: Vec<ResultTransform>,
    slot: Arc<ResultSlot>,
}

impl Task {
    /// Build a task, checking that `args` is a sequence and `kwargs` a mapping.
    pub fn new(
        target: impl Into<String>,
        args: Value,
        kwargs: Value,
        priority: f64,
        series: Series,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let call = TaskCall::from_values(target, args, kwargs)?;
        Ok(Self::from_call(call, priority, series, timeout))
    }

    pub fn from_call(
        call: TaskCall,
        priority: f64,
        series: Series,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            call,
            priority,
            series,
            timeout,
            callbacks: Vec::new(),
            slot: ResultSlot::new(),
        }
    }

    pub fn call(&self) -> &TaskCall {
        &self.call
    }

    pub fn priority(&self) -> f64 {
        self.priority
    }

    pub fn series(&self) -> &Series {
        &self.series
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// A handle on this task's current result slot.
    ///
    /// Take it before handing the task over; after [`Task::reset`] older
    /// handles keep watching the replaced slot.
    pub fn result(&self) -> TaskResult {
        self.slot.subscribe()
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.is_resolved()
    }

    /// Register a transform applied to successful and timed-out outcomes
    /// stored from now on. Failures bypass it.
    pub fn add_callback<F>(&mut self, transform: F)
    where
        F: Fn(TaskOutcome) -> TaskOutcome + Send + Sync + 'static,
    {
        self.callbacks.push(Arc::new(transform));
    }

    /// Deliver a successful result. Ignored if the task is already resolved
    /// (e.g. it timed out first). Returns whether the result was stored.
    pub fn resolve(&self, value: Value) -> bool {
        self.slot.cancel_timer();
        if self.slot.is_resolved() {
            return false;
        }
        self.slot
            .deliver(apply_callbacks(&self.callbacks, TaskOutcome::Completed(value)))
    }

    /// Deliver a failure. Always takes effect, even over an earlier result.
    pub fn fail(&self, reason: impl Into<String>) {
        self.slot.cancel_timer();
        self.slot.overwrite(TaskOutcome::Failed(reason.into()));
    }

    /// Arm the timeout timer, if this task has a timeout.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_timer(&self) {
        let Some(timeout) = self.timeout else {
            return;
        };

        let slot = Arc::clone(&self.slot);
        let callbacks = self.callbacks.clone();
        let label = self.call.target.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            slot.clear_timer();
            if slot.deliver(apply_callbacks(&callbacks, TaskOutcome::TimedOut(timeout))) {
                warn!(
                    task = %label,
                    timeout_secs = timeout.as_secs_f64(),
                    "task timed out before its worker resolved it"
                );
            }
        });
        self.slot.arm_timer(handle.abort_handle());
    }

    /// Cancel a running timeout timer without resolving the task.
    ///
    /// The next acceptance arms a fresh one.
    pub fn disarm(&self) {
        self.slot.cancel_timer();
    }

    pub fn timer_armed(&self) -> bool {
        self.slot.timer_armed()
    }

    /// Replace the result slot with a fresh one, for redispatching the same
    /// task. Returns the new slot's read handle.
    pub fn reset(&mut self) -> TaskResult {
        self.slot.cancel_timer();
        self.slot = ResultSlot::new();
        self.slot.subscribe()
    }

    /// Schedule ahead of everything else.
    pub fn rush(&mut self) {
        self.priority = RUSH_PRIORITY;
    }

    /// Schedule behind everything else.
    pub fn relax(&mut self) {
        self.priority = RELAX_PRIORITY;
    }

    /// A functional copy: same call, priority, series, timeout and
    /// callbacks, with its own result slot.
    pub fn duplicate(&self) -> Task {
        Task {
            call: self.call.clone(),
            priority: self.priority,
            series: self.series.clone(),
            timeout: self.timeout,
            callbacks: self.callbacks.clone(),
            slot: ResultSlot::new(),
        }
    }
}

fn apply_callbacks(callbacks: &[ResultTransform], outcome: TaskOutcome) -> TaskOutcome {
    callbacks
        .iter()
        .fold(outcome, |outcome, transform| transform(outcome))
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("call", &self.call.to_string())
            .field("priority", &self.priority)
            .field("series", &series_label(&self.series))
            .field("timeout", &self.timeout)
            .field("callbacks", &self.callbacks.len())
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task: {}", self.call)
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.priority.partial_cmp(&other.priority)
    }
}

/// Item of a priority queue feeding the handler.
///
/// `Shutdown` is the "no more work" marker: every task sorts before it,
/// and it never compares equal to a task.
#[derive(Debug)]
pub enum QueueEntry {
    Task(Task),
    Shutdown,
}

impl QueueEntry {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, QueueEntry::Shutdown)
    }

    pub fn into_task(self) -> Option<Task> {
        match self {
            QueueEntry::Task(task) => Some(task),
            QueueEntry::Shutdown => None,
        }
    }
}

impl From<Task> for QueueEntry {
    fn from(task: Task) -> Self {
        QueueEntry::Task(task)
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (QueueEntry::Task(a), QueueEntry::Task(b)) => a.priority.total_cmp(&b.priority),
            (QueueEntry::Task(_), QueueEntry::Shutdown) => Ordering::Less,
            (QueueEntry::Shutdown, QueueEntry::Task(_)) => Ordering::Greater,
            (QueueEntry::Shutdown, QueueEntry::Shutdown) => Ordering::Equal,
        }
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}
