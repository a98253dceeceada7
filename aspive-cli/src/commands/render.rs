//! Render command implementation.

use super::load_config;
use anyhow::{bail, Context, Result};
use aspive_core::{normalize_json, Engine, MemoryCache, RenderOptions};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Arguments of `aspive render`.
pub struct RenderArgs {
    pub view: String,
    pub views: Option<PathBuf>,
    pub opts: Option<String>,
    pub opts_file: Option<PathBuf>,
    pub template: Option<String>,
    pub no_markdown: bool,
    pub output: Option<PathBuf>,
}

/// Render a view and print or write the result
pub fn render_view(config_path: &Path, args: RenderArgs) -> Result<()> {
    let config = load_config(config_path)?;
    let cache = Arc::new(MemoryCache::new(config.cache_capacity));
    let mut builder = Engine::builder().config(config).cache(cache.clone());
    if let Some(views) = &args.views {
        builder = builder.views_dir(views);
    }
    let engine = builder.build().context("Invalid configuration")?;

    let options = build_options(&args)?;
    let started = Instant::now();
    let rendered = engine
        .render_file(&args.view, &options)
        .with_context(|| format!("Failed to render view '{}'", args.view))?;
    tracing::debug!("Rendered {} in {:?}", args.view, started.elapsed());
    tracing::debug!("Template cache: {}", cache.stats());

    match &args.output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).context("Failed to create output directory")?;
            }
            fs::write(path, rendered)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!("Wrote {}", path.display());
        }
        None => println!("{}", rendered),
    }
    Ok(())
}

/// Merge the JSON options with the flags that map onto option keys.
fn build_options(args: &RenderArgs) -> Result<RenderOptions> {
    let text = match (&args.opts, &args.opts_file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read options file {}", path.display()))?,
        (None, None) => "{}".to_string(),
    };
    // Strict JSON first, then the lenient literal form used inside scripts.
    let mut value: serde_json::Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(err) => {
            let strict = normalize_json(&text)
                .with_context(|| format!("Render options are not valid JSON: {}", err))?;
            serde_json::from_str(&strict).context("Render options are not valid JSON")?
        }
    };
    let Some(object) = value.as_object_mut() else {
        bail!("Render options must be a JSON object");
    };
    if let Some(template) = &args.template {
        object.insert("template".to_string(), template.clone().into());
    }
    if args.no_markdown {
        object.insert("noMarkdown".to_string(), true.into());
    }
    RenderOptions::from_json(value).context("Invalid render options")
}
