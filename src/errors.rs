// src/errors.rs

//! Crate-wide error type and result alias.

use thiserror::Error;

use crate::types::WorkerId;

#[derive(Error, Debug)]
pub enum WorkforceError {
    /// Task `args` was not a sequence or `kwargs` was not a mapping.
    #[error("Invalid task arguments: {0}")]
    InvalidArguments(String),

    #[error("Niceness must be an integer between -20 and +20 (got {0})")]
    InvalidNiceness(i64),

    /// A worker handed to `hire` does not honour the worker contract.
    #[error("Implementation error: {0}")]
    Implementation(String),

    #[error("Task handler is not running")]
    NotRunning,

    #[error("Task handler has stopped; no one is listening for requests")]
    HandlerClosed,

    #[error("Task result was dropped before it was delivered")]
    ResultDropped,

    #[error("Unknown worker: {0}")]
    UnknownWorker(WorkerId),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, WorkforceError>;
