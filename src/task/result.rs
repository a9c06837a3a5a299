// src/task/result.rs

//! Result slot shared between a task and everyone awaiting its outcome.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::errors::{Result, WorkforceError};
use crate::task::TaskOutcome;

/// Write side of a task's result.
///
/// The first success or timeout resolution is kept and later ones are
/// ignored; failures always overwrite. Holds the abort handle of the
/// task's timeout timer so any resolution can disarm it.
#[derive(Debug)]
pub(crate) struct ResultSlot {
    tx: watch::Sender<Option<TaskOutcome>>,
    timer: Mutex<Option<AbortHandle>>,
}

impl ResultSlot {
    pub(crate) fn new() -> Arc<Self> {
        let (tx, _rx) = watch::channel(None);
        Arc::new(Self {
            tx,
            timer: Mutex::new(None),
        })
    }

    pub(crate) fn subscribe(&self) -> TaskResult {
        TaskResult {
            rx: self.tx.subscribe(),
        }
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Store `outcome` unless the slot already holds one.
    ///
    /// Returns `true` if this call resolved the slot.
    pub(crate) fn deliver(&self, outcome: TaskOutcome) -> bool {
        self.tx.send_if_modified(move |slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    pub(crate) fn overwrite(&self, outcome: TaskOutcome) {
        self.tx.send_replace(Some(outcome));
    }

    pub(crate) fn arm_timer(&self, handle: AbortHandle) {
        let previous = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub(crate) fn cancel_timer(&self) {
        if let Some(handle) = self.clear_timer() {
            handle.abort();
        }
    }

    /// Forget the timer without aborting it (used by the timer itself).
    pub(crate) fn clear_timer(&self) -> Option<AbortHandle> {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn timer_armed(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Read side of a task's result. Cheap to clone; every clone sees the
/// same outcome.
#[derive(Debug, Clone)]
pub struct TaskResult {
    rx: watch::Receiver<Option<TaskOutcome>>,
}

impl TaskResult {
    /// Wait for the task to be resolved.
    ///
    /// Fails with [`WorkforceError::ResultDropped`] if the task (and its
    /// timer) went away without ever being resolved.
    pub async fn wait(mut self) -> Result<TaskOutcome> {
        let outcome = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| WorkforceError::ResultDropped)?;
        (*outcome).clone().ok_or(WorkforceError::ResultDropped)
    }

    /// The outcome stored so far, if any.
    pub fn peek(&self) -> Option<TaskOutcome> {
        self.rx.borrow().clone()
    }
}
