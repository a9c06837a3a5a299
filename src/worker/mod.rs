// src/worker/mod.rs

//! The worker capability contract and the scheduler's per-worker record.
//!
//! A [`Worker`] is anything that can run tasks: a tokio task pool, a
//! subprocess, a remote node. The handler only relies on the operations of
//! the trait. Everything the handler tracks about a worker it employs
//! (hired flag, badge, outstanding requests) lives in [`WorkerHandle`],
//! never on the worker itself.

pub mod local;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::assign::RequestId;
use crate::handler::HandlerMessage;
use crate::task::Task;
use crate::types::{BoxFuture, Series, WorkerId};

pub use local::{FunctionRegistry, LocalWorker};

/// What the task handler needs from a worker.
pub trait Worker: Send + Sync {
    /// Run `task`, eventually resolving or failing the task's own result.
    ///
    /// The returned future resolves when the worker is ready for another
    /// assignment. It is not the task's result.
    fn run(&self, task: Task) -> BoxFuture<'static, ()>;

    /// Shut down gracefully, resolving with any tasks left unfinished.
    fn stop(&self) -> BoxFuture<'static, Vec<Task>>;

    /// Shut down immediately, returning the unfinished tasks.
    fn crash(&self) -> Vec<Task>;

    /// Receive the handle to call if the worker dies unexpectedly.
    fn set_resignator(&self, resignator: Resignator);

    /// Series this worker serves besides the generic one.
    fn qualifications(&self) -> Qualifications {
        Qualifications::default()
    }

    /// Check the worker's own invariants before it is hired.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

impl fmt::Debug for dyn Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Extra series a worker is qualified for.
///
/// `class` lists series every worker of its kind serves; `instance` lists
/// series this particular worker was configured for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Qualifications {
    pub class: Vec<String>,
    pub instance: Vec<String>,
}

impl Qualifications {
    pub fn new(class: Vec<String>, instance: Vec<String>) -> Self {
        Self { class, instance }
    }

    /// Every series served, generic first, without duplicates.
    pub fn series(&self) -> Vec<Series> {
        let mut all: Vec<Series> = vec![None];
        for name in self.class.iter().chain(self.instance.iter()) {
            let series = Some(name.clone());
            if !all.contains(&series) {
                all.push(series);
            }
        }
        all
    }
}

/// Lets a worker report its own fatal failure.
///
/// Resigning makes the handler crash the worker and reassign whatever it
/// had unfinished. Once the handler is gone, resigning does nothing.
#[derive(Debug, Clone)]
pub struct Resignator {
    worker_id: WorkerId,
    tx: mpsc::WeakSender<HandlerMessage>,
}

impl Resignator {
    pub(crate) fn new(worker_id: WorkerId, tx: mpsc::WeakSender<HandlerMessage>) -> Self {
        Self { worker_id, tx }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn resign(&self) {
        let Some(tx) = self.tx.upgrade() else {
            debug!(worker_id = %self.worker_id, "resignation after handler stopped; ignored");
            return;
        };

        let message = HandlerMessage::Resigned {
            worker_id: self.worker_id,
        };
        match tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(async move {
                            let _ = tx.send(message).await;
                        });
                    }
                    Err(_) => {
                        warn!(
                            worker_id = %self.worker_id,
                            "handler channel full and no runtime to wait on; resignation lost"
                        );
                    }
                }
            }
            Err(TrySendError::Closed(_)) => {
                debug!(worker_id = %self.worker_id, "handler channel closed; resignation ignored");
            }
        }
    }
}

/// The handler's record of one employed worker.
pub struct WorkerHandle {
    id: WorkerId,
    worker: Arc<dyn Worker>,
    hired: bool,
    qualifications: Vec<Series>,
    requests: HashMap<Series, Vec<RequestId>>,
}

impl WorkerHandle {
    pub fn new(id: WorkerId, worker: Arc<dyn Worker>, qualifications: Vec<Series>) -> Self {
        Self {
            id,
            worker,
            hired: false,
            qualifications,
            requests: HashMap::new(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn worker(&self) -> &Arc<dyn Worker> {
        &self.worker
    }

    pub fn is_hired(&self) -> bool {
        self.hired
    }

    pub fn set_hired(&mut self, hired: bool) {
        self.hired = hired;
    }

    pub fn qualifications(&self) -> &[Series] {
        &self.qualifications
    }

    pub fn is_qualified(&self, series: &Series) -> bool {
        self.qualifications.contains(series)
    }

    /// Returns `false` if the worker already served `series`.
    pub fn add_qualification(&mut self, series: Series) -> bool {
        if self.is_qualified(&series) {
            return false;
        }
        self.qualifications.push(series);
        true
    }

    /// Outstanding requests, per series.
    pub fn requests(&self) -> &HashMap<Series, Vec<RequestId>> {
        &self.requests
    }

    pub(crate) fn record_request(&mut self, series: Series, request: RequestId) {
        self.requests.entry(series).or_default().push(request);
    }

    /// Forget a request that has just been filled.
    pub(crate) fn fulfil_request(&mut self, series: &Series, request: RequestId) {
        if let Some(requests) = self.requests.get_mut(series) {
            requests.retain(|r| *r != request);
            if requests.is_empty() {
                self.requests.remove(series);
            }
        }
    }

    pub(crate) fn take_requests(&mut self) -> HashMap<Series, Vec<RequestId>> {
        std::mem::take(&mut self.requests)
    }

    pub fn into_worker(self) -> Arc<dyn Worker> {
        self.worker
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("worker", &self.worker.describe())
            .field("hired", &self.hired)
            .field("qualifications", &self.qualifications)
            .field("requests", &self.requests)
            .finish()
    }
}
