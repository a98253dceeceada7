//! Engine-level error type.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("No views directory configured")]
    MissingViewsDir,

    #[error("View not found: {0}")]
    ViewNotFound(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
