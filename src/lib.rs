// src/lib.rs

//! Priority task queue scheduling over a dynamic pool of workers.
//!
//! Tasks built by a [`TaskFactory`] are submitted to a [`TaskHandler`],
//! which matches them, per series and first-come-first-served, to workers
//! implementing [`Worker`]. Workers can be hired, qualified, terminated and
//! replaced while work is in flight.

pub mod assign;
pub mod config;
pub mod errors;
pub mod handler;
pub mod logging;
pub mod task;
pub mod types;
pub mod worker;

use std::path::Path;

use tracing::{debug, info};

pub use crate::assign::Accepted;
pub use crate::config::ConfigFile;
pub use crate::errors::{Result, WorkforceError};
pub use crate::handler::{HandlerOptions, HandlerSnapshot, TaskHandler, TerminateOptions};
pub use crate::task::{QueueEntry, Task, TaskCall, TaskFactory, TaskOutcome, TaskResult};
pub use crate::types::{Series, WorkerId};
pub use crate::worker::{FunctionRegistry, LocalWorker, Qualifications, Resignator, Worker};

/// Start a task handler and a matching task factory from a validated
/// configuration. Must be called within a tokio runtime.
pub fn start(config: &ConfigFile) -> (TaskHandler, TaskFactory) {
    let options = HandlerOptions::from(config);
    debug!(?options, "starting task handler");
    (TaskHandler::spawn(options), TaskFactory::from_config(config))
}

/// Load `path`, initialise logging from its `[logging]` section, and start.
///
/// If a global tracing subscriber is already installed it is kept.
pub fn start_from_path(path: impl AsRef<Path>) -> Result<(TaskHandler, TaskFactory)> {
    let path = path.as_ref();
    let config = config::load_and_validate(path)?;

    if let Err(e) = logging::init_logging(config.logging().level) {
        debug!(error = %e, "keeping the existing tracing subscriber");
    }
    info!(config = %path.display(), "configuration loaded");

    Ok(start(&config))
}
