// src/config/loader.rs

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Parse TOML text into a [`RawConfigFile`]. Missing sections take their
/// defaults; nothing is validated yet.
pub fn parse_str(contents: &str) -> Result<RawConfigFile> {
    Ok(toml::from_str(contents)?)
}

/// Read and parse the file at `path` without validating it.
///
/// See [`load_and_validate`] for the checked variant.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    debug!(path = %path.display(), "reading workforce config");
    parse_str(&fs::read_to_string(path)?)
}

/// Read, parse and validate the file at `path`.
///
/// Rejects a zero channel capacity and any deadline that is not a positive
/// number of seconds.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    ConfigFile::try_from(load_from_path(path)?)
}
