//! Config patcher - structured edits that leave unrelated keys alone
//!
//! - `properties`: flat `key=value` files (server.properties)
//! - `yaml`: deep-merge into YAML documents (bukkit.yml, spigot.yml)
//! - `optimization`: performance presets built on top of both
//!
//! Every patch is idempotent: applying it a second time rewrites the file
//! with identical bytes.

pub mod optimization;
pub mod properties;
pub mod yaml;

pub use optimization::{apply_optimizations, OptimizationSettings};
pub use properties::{PatchMode, PropertiesFile};

use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML in '{path}': {reason}")]
    Yaml { path: String, reason: String },

    #[error("Invalid value for '{key}': {value}")]
    InvalidValue { key: String, value: String },
}

impl PatchError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// File the error refers to, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::Io { path, .. } | Self::Yaml { path, .. } => Some(path),
            Self::InvalidValue { .. } => None,
        }
    }
}

/// Read a file that may not exist yet; missing is treated as empty.
pub(crate) fn read_or_empty(path: &Path) -> Result<String, PatchError> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(PatchError::io(path, e)),
    }
}

/// Write only when the content changed.
pub(crate) fn write_if_changed(path: &Path, old: &str, new: &str) -> Result<bool, PatchError> {
    if old == new && path.exists() {
        return Ok(false);
    }
    crate::utils::write_atomic(path, new.as_bytes()).map_err(|e| PatchError::io(path, e))?;
    Ok(true)
}
