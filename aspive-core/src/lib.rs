//! # aspive-core
//!
//! Template engine for HTML documents with embedded `<? ?>` scripts written
//! in a small PHP-like language.
//!
//! A render runs the scripts, resolves `{{ }}` tags against the render
//! options, moves extracted elements to their markers, applies a light
//! markdown pass and returns balanced markup.

pub mod autoclose;
pub mod builtins;
pub mod config;
pub mod context;
pub mod error;
pub mod escape;
pub mod interpreter;
pub mod json;
pub mod loader;
pub mod markdown;
pub mod math;
pub mod pipeline;
pub mod registry;
pub mod resolve;
pub mod safe_regex;
pub mod value;

pub use autoclose::TagCloser;
pub use config::{ConfigError, EngineConfig, NoHtmlRules, RenderOptions};
pub use context::Session;
pub use error::{EngineError, Result};
pub use escape::{escape_html, escape_invalid_tags, escape_regex, strip_invalid_tags, unescape_html};
pub use json::normalize_json;
pub use loader::{CacheStats, CachedTemplate, MemoryCache, TemplateCache};
pub use markdown::MarkdownPass;
pub use pipeline::{Engine, EngineBuilder, RenderHook};
pub use registry::{Attrs, Flow, TagFlags, TagRegistry, TagResult};
pub use value::{Map, Value};
