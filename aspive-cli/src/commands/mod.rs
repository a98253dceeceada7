//! CLI command implementations.

pub mod close_tags;
pub mod render;

pub use close_tags::close_tags;
pub use render::{render_view, RenderArgs};

use anyhow::{Context, Result};
use aspive_core::EngineConfig;
use std::path::Path;

/// Loads the config file, falling back to defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        tracing::debug!("No config at {:?}; using defaults", path);
        return Ok(EngineConfig::default());
    }
    tracing::debug!("Loading config from {:?}", path);
    EngineConfig::from_file(path).context("Failed to load configuration")
}
