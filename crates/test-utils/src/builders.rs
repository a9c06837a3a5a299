#![allow(dead_code)]

use std::time::Duration;

use serde_json::{Map, Value};
use workforce::task::{Task, TaskCall};
use workforce::types::Series;

/// Builder for `Task` to simplify test setup.
///
/// Defaults: no arguments, priority `1.0`, generic series, no timeout.
pub struct TaskBuilder {
    call: TaskCall,
    priority: f64,
    series: Series,
    timeout: Option<Duration>,
}

impl TaskBuilder {
    pub fn new(target: &str) -> Self {
        Self {
            call: TaskCall::new(target),
            priority: 1.0,
            series: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, value: Value) -> Self {
        self.call.args.push(value);
        self
    }

    pub fn kwarg(mut self, key: &str, value: Value) -> Self {
        self.call.kwargs.insert(key.to_string(), value);
        self
    }

    pub fn kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.call.kwargs = kwargs;
        self
    }

    pub fn priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn series(mut self, series: &str) -> Self {
        self.series = Some(series.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Task {
        Task::from_call(self.call, self.priority, self.series, self.timeout)
    }
}
