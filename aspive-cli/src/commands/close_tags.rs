//! Close-tags command implementation.

use super::load_config;
use anyhow::{Context, Result};
use aspive_core::{strip_invalid_tags, Engine};
use std::io::Read;
use std::path::Path;

/// Print `file` (or stdin) with its markup balanced. Unterminated tags are
/// escaped, or removed with `strip_invalid`.
pub fn close_tags(config_path: &Path, file: Option<&Path>, strip_invalid: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let engine = Engine::with_config(config).context("Invalid configuration")?;

    let text = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("Failed to read stdin")?;
            text
        }
    };

    let text = if strip_invalid {
        strip_invalid_tags(&text)
    } else {
        text
    };
    print!("{}", engine.close_tags(&text));
    Ok(())
}
