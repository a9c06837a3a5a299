use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::json;
use tokio::sync::{oneshot, Notify};
use workforce::task::Task;
use workforce::types::BoxFuture;
use workforce::worker::{Qualifications, Resignator, Worker};

struct Held {
    task: Task,
    done: oneshot::Sender<()>,
}

#[derive(Default)]
struct FakeState {
    ran: Vec<String>,
    held: VecDeque<Held>,
    stopped: bool,
    crashed: bool,
}

/// A scriptable worker that:
/// - records the target of every task it is asked to run
/// - either resolves each task right away with the target name as its value,
///   or holds it until the test releases it
/// - can stall its graceful stop, fail validation, or resign on demand.
#[derive(Default)]
pub struct FakeWorker {
    state: Mutex<FakeState>,
    changed: Notify,
    holding: bool,
    stall_stop: bool,
    invalid: Option<String>,
    series: Vec<String>,
    resignator: Mutex<Option<Resignator>>,
}

impl FakeWorker {
    /// Resolves every task as soon as it runs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps every task unfinished until `release_one`/`release_all`.
    pub fn holding() -> Self {
        Self {
            holding: true,
            ..Self::default()
        }
    }

    pub fn with_series(mut self, series: &[&str]) -> Self {
        self.series = series.iter().map(|s| s.to_string()).collect();
        self
    }

    /// `stop()` never completes.
    pub fn stalling_stop(mut self) -> Self {
        self.stall_stop = true;
        self
    }

    /// `validate()` fails with `reason`.
    pub fn invalid(reason: &str) -> Self {
        Self {
            invalid: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Targets of every task run so far, in order.
    pub fn ran(&self) -> Vec<String> {
        self.state().ran.clone()
    }

    pub fn held_count(&self) -> usize {
        self.state().held.len()
    }

    /// Resolve the oldest held task. Returns `false` if none was held.
    pub fn release_one(&self) -> bool {
        let held = self.state().held.pop_front();
        match held {
            Some(Held { task, done }) => {
                let target = task.call().target.clone();
                task.resolve(json!(target));
                let _ = done.send(());
                self.changed.notify_waiters();
                true
            }
            None => false,
        }
    }

    pub fn release_all(&self) -> usize {
        let mut released = 0;
        while self.release_one() {
            released += 1;
        }
        released
    }

    /// Wait until at least `n` tasks are being held.
    pub async fn wait_for_held(&self, n: usize) {
        loop {
            let changed = self.changed.notified();
            if self.held_count() >= n {
                return;
            }
            changed.await;
        }
    }

    /// Wait until at least `n` tasks have been run.
    pub async fn wait_for_runs(&self, n: usize) {
        loop {
            let changed = self.changed.notified();
            if self.state().ran.len() >= n {
                return;
            }
            changed.await;
        }
    }

    /// Report a fatal failure to the handler.
    pub fn resign(&self) {
        let resignator = self.resignator.lock().unwrap().clone();
        resignator
            .expect("worker was never hired")
            .resign();
    }

    pub fn was_stopped(&self) -> bool {
        self.state().stopped
    }

    pub fn was_crashed(&self) -> bool {
        self.state().crashed
    }
}

impl Worker for FakeWorker {
    fn run(&self, task: Task) -> BoxFuture<'static, ()> {
        let target = task.call().target.clone();

        if !self.holding {
            self.state().ran.push(target.clone());
            task.resolve(json!(target));
            self.changed.notify_waiters();
            return Box::pin(async {});
        }

        let (done, rx) = oneshot::channel();
        {
            let mut state = self.state();
            state.ran.push(target);
            state.held.push_back(Held { task, done });
        }
        self.changed.notify_waiters();
        Box::pin(async move {
            let _ = rx.await;
        })
    }

    fn stop(&self) -> BoxFuture<'static, Vec<Task>> {
        self.state().stopped = true;
        if self.stall_stop {
            return Box::pin(std::future::pending());
        }
        Box::pin(async { Vec::new() })
    }

    fn crash(&self) -> Vec<Task> {
        let held: Vec<Held> = {
            let mut state = self.state();
            state.crashed = true;
            state.held.drain(..).collect()
        };
        self.changed.notify_waiters();
        held.into_iter().map(|h| h.task).collect()
    }

    fn set_resignator(&self, resignator: Resignator) {
        *self.resignator.lock().unwrap() = Some(resignator);
    }

    fn qualifications(&self) -> Qualifications {
        Qualifications::new(Vec::new(), self.series.clone())
    }

    fn validate(&self) -> Result<(), String> {
        match &self.invalid {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }
}
