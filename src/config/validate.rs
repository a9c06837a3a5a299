// src/config/validate.rs

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{Result, WorkforceError};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::WorkforceError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw.handler, raw.tasks, raw.logging))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_handler_section(cfg)?;
    validate_tasks_section(cfg)?;
    Ok(())
}

fn validate_handler_section(cfg: &RawConfigFile) -> Result<()> {
    if cfg.handler.channel_capacity == 0 {
        return Err(WorkforceError::ConfigError(
            "[handler].channel_capacity must be >= 1 (got 0)".to_string(),
        ));
    }

    ensure_positive_secs(
        "[handler].terminate_timeout_secs",
        cfg.handler.terminate_timeout_secs,
    )?;
    ensure_positive_secs(
        "[handler].shutdown_timeout_secs",
        cfg.handler.shutdown_timeout_secs,
    )?;
    Ok(())
}

fn validate_tasks_section(cfg: &RawConfigFile) -> Result<()> {
    ensure_positive_secs("[tasks].default_timeout_secs", cfg.tasks.default_timeout_secs)
}

/// Every deadline in a `ConfigFile` must convert to a non-zero `Duration`.
fn ensure_positive_secs(field: &str, value: Option<f64>) -> Result<()> {
    match value {
        Some(secs) if !secs.is_finite() || secs <= 0.0 || secs > 1.0e9 => {
            Err(WorkforceError::ConfigError(format!(
                "{field} must be a positive number of seconds (got {secs})"
            )))
        }
        _ => Ok(()),
    }
}
