// src/config/model.rs

use std::time::Duration;

use serde::Deserialize;

use crate::types::LogLevel;

/// Configuration as read from a TOML file, before validation.
///
/// ```toml
/// [handler]
/// channel_capacity = 64
/// terminate_timeout_secs = 5.0
/// shutdown_timeout_secs = 10.0
///
/// [tasks]
/// default_timeout_secs = 30.0
///
/// [logging]
/// level = "debug"
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfigFile {
    #[serde(default)]
    pub handler: HandlerSection,

    #[serde(default)]
    pub tasks: TasksSection,

    #[serde(default)]
    pub logging: LoggingSection,
}

/// Validated configuration. Only obtainable through `TryFrom<RawConfigFile>`
/// (or `Default`), so its sections are read-only.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    handler: HandlerSection,
    tasks: TasksSection,
    logging: LoggingSection,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        handler: HandlerSection,
        tasks: TasksSection,
        logging: LoggingSection,
    ) -> Self {
        Self {
            handler,
            tasks,
            logging,
        }
    }

    pub fn handler(&self) -> &HandlerSection {
        &self.handler
    }

    pub fn tasks(&self) -> &TasksSection {
        &self.tasks
    }

    pub fn logging(&self) -> &LoggingSection {
        &self.logging
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        let raw = RawConfigFile::default();
        Self::new_unchecked(raw.handler, raw.tasks, raw.logging)
    }
}

/// `[handler]` section: the scheduler actor and worker termination.
#[derive(Debug, Clone, Deserialize)]
pub struct HandlerSection {
    /// Buffer size of the scheduler's message channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Deadline for a graceful `stop()` when `terminate` is given none.
    ///
    /// When it passes, the worker is crashed instead.
    #[serde(default)]
    pub terminate_timeout_secs: Option<f64>,

    /// Deadline applied to every worker during `shutdown` when none is given.
    #[serde(default)]
    pub shutdown_timeout_secs: Option<f64>,
}

fn default_channel_capacity() -> usize {
    64
}

impl Default for HandlerSection {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            terminate_timeout_secs: None,
            shutdown_timeout_secs: None,
        }
    }
}

impl HandlerSection {
    pub fn terminate_timeout(&self) -> Option<Duration> {
        self.terminate_timeout_secs.and_then(secs_to_duration)
    }

    pub fn shutdown_timeout(&self) -> Option<Duration> {
        self.shutdown_timeout_secs.and_then(secs_to_duration)
    }
}

/// `None` for negative, NaN or overflowing values; validation rejects those
/// before a `ConfigFile` exists.
fn secs_to_duration(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

/// `[tasks]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TasksSection {
    /// Timeout given to tasks built without one of their own.
    #[serde(default)]
    pub default_timeout_secs: Option<f64>,
}

impl TasksSection {
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_secs.and_then(secs_to_duration)
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingSection {
    /// If `None`, `WORKFORCE_LOG` or `info` is used.
    #[serde(default)]
    pub level: Option<LogLevel>,
}
