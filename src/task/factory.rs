// src/task/factory.rs

//! Priority assignment for tasks running in one or more concurrent series.
//!
//! Priority is `serial * (1 + nn^2)`, where `serial` increments per task
//! within a series and `nn` is the niceness mapped from `-20..=20` onto
//! `0.0..=4.0` by `(niceness + 20) / 10`. Lower values are scheduled first.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::config::ConfigFile;
use crate::errors::{Result, WorkforceError};
use crate::task::{Task, TaskCall};
use crate::types::{series_label, Series};

pub const MIN_NICENESS: i64 = -20;
pub const MAX_NICENESS: i64 = 20;

/// Builds [`Task`]s with priorities that interleave fairly across series.
#[derive(Debug, Default)]
pub struct TaskFactory {
    series_numbers: HashMap<Series, u64>,
    default_timeout: Option<Duration>,
}

impl TaskFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ConfigFile) -> Self {
        Self::new().with_default_timeout(config.tasks().default_timeout())
    }

    /// Timeout given to tasks created without one.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Create a task in `series` whose priority reflects `niceness`.
    ///
    /// Niceness and argument shapes are checked before a serial number is
    /// consumed, so a rejected call leaves the factory untouched.
    pub fn new_task(
        &mut self,
        target: impl Into<String>,
        args: Value,
        kwargs: Value,
        niceness: i64,
        series: Series,
        timeout: Option<Duration>,
    ) -> Result<Task> {
        if !(MIN_NICENESS..=MAX_NICENESS).contains(&niceness) {
            return Err(WorkforceError::InvalidNiceness(niceness));
        }
        let call = TaskCall::from_values(target, args, kwargs)?;

        let serial = self.serial(&series);
        let priority = priority_for(serial, niceness);
        debug!(
            task = %call,
            series = series_label(&series),
            serial,
            niceness,
            priority,
            "task created"
        );

        Ok(Task::from_call(
            call,
            priority,
            series,
            timeout.or(self.default_timeout),
        ))
    }

    /// Next serial number for `series`.
    ///
    /// Serials increase independently per series, except that a series seen
    /// for the first time starts above every serial issued so far.
    pub fn serial(&mut self, series: &Series) -> u64 {
        if !self.series_numbers.contains_key(series) {
            let start = self.series_numbers.values().copied().max().unwrap_or(0);
            self.series_numbers.insert(series.clone(), start);
        }

        let counter = self.series_numbers.entry(series.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Last serial handed out for `series`, if any.
    pub fn last_serial(&self, series: &Series) -> Option<u64> {
        self.series_numbers.get(series).copied()
    }
}

/// Priority of the `serial`-th task of a series at the given niceness.
pub fn priority_for(serial: u64, niceness: i64) -> f64 {
    let normalized = (niceness + 20) as f64 / 10.0;
    serial as f64 * (1.0 + normalized * normalized)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn series(name: &str) -> Series {
        Some(name.to_string())
    }

    #[test]
    fn serials_increment_per_series() {
        let mut factory = TaskFactory::new();
        assert_eq!(factory.serial(&None), 1);
        assert_eq!(factory.serial(&None), 2);
        assert_eq!(factory.serial(&None), 3);
        assert_eq!(factory.last_serial(&None), Some(3));
    }

    #[test]
    fn new_series_starts_above_existing_ones() {
        let mut factory = TaskFactory::new();
        for _ in 0..5 {
            factory.serial(&series("a"));
        }
        factory.serial(&series("b"));

        assert_eq!(factory.last_serial(&series("b")), Some(6));
        assert_eq!(factory.serial(&series("a")), 6);
        assert_eq!(factory.serial(&series("c")), 7);
    }

    #[test]
    fn priority_formula() {
        assert_eq!(priority_for(1, -20), 1.0);
        assert_eq!(priority_for(1, 0), 5.0);
        assert_eq!(priority_for(2, 20), 34.0);
        assert_eq!(priority_for(3, -10), 6.0);
    }

    #[test]
    fn out_of_range_niceness_is_rejected_without_consuming_a_serial() {
        let mut factory = TaskFactory::new();
        let err = factory
            .new_task("f", json!([]), json!({}), 21, None, None)
            .unwrap_err();
        assert!(matches!(err, WorkforceError::InvalidNiceness(21)));

        let err = factory
            .new_task("f", json!([]), json!({}), -21, None, None)
            .unwrap_err();
        assert!(matches!(err, WorkforceError::InvalidNiceness(-21)));
        assert_eq!(factory.last_serial(&None), None);
    }

    #[test]
    fn bad_arguments_are_rejected_without_consuming_a_serial() {
        let mut factory = TaskFactory::new();
        let err = factory
            .new_task("f", json!("nope"), json!({}), 0, None, None)
            .unwrap_err();
        assert!(matches!(err, WorkforceError::InvalidArguments(_)));
        assert_eq!(factory.last_serial(&None), None);
    }

    #[test]
    fn default_timeout_applies_only_when_none_given() {
        let mut factory =
            TaskFactory::new().with_default_timeout(Some(Duration::from_secs(30)));

        let defaulted = factory
            .new_task("f", json!([]), json!({}), 0, None, None)
            .unwrap();
        assert_eq!(defaulted.timeout(), Some(Duration::from_secs(30)));

        let explicit = factory
            .new_task("f", json!([]), json!({}), 0, None, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(explicit.timeout(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn equal_niceness_means_fifo_within_a_series() {
        let mut factory = TaskFactory::new();
        let first = factory
            .new_task("f", json!([]), json!({}), 5, series("s"), None)
            .unwrap();
        let second = factory
            .new_task("f", json!([]), json!({}), 5, series("s"), None)
            .unwrap();
        assert!(first < second);
    }
}
