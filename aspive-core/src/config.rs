//! Engine configuration and per-render options.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::autoclose::DEFAULT_VOID_TAGS;
use crate::value::{Map, Value};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid render options: {0}")]
    InvalidOptions(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Engine-wide settings, usually loaded from `aspive.yml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Return documents unchanged.
    #[serde(default)]
    pub raw: bool,

    /// Default template view wrapped around every document.
    #[serde(default)]
    pub template: Option<String>,

    /// Tag groups extracted from the body and re-inserted at `{{-name}}`.
    #[serde(default, deserialize_with = "one_or_many")]
    pub extract_tags: Vec<String>,

    #[serde(default)]
    pub no_markdown: bool,

    #[serde(default)]
    pub no_html_rules: NoHtmlRules,

    /// Lifetime of cached view files; 0 keeps them until evicted.
    #[serde(default)]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    #[serde(default)]
    pub views_dir: Option<PathBuf>,

    #[serde(default = "default_view_extension")]
    pub view_extension: String,

    #[serde(default = "default_void_tags")]
    pub void_tags: Vec<String>,

    #[serde(default)]
    pub log_render_time: bool,

    // Internal: path to config file (for relative path resolution)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

fn default_cache_capacity() -> usize {
    256
}

fn default_view_extension() -> String {
    String::from(".php")
}

fn default_void_tags() -> Vec<String> {
    DEFAULT_VOID_TAGS.iter().map(|t| t.to_string()).collect()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            raw: false,
            template: None,
            extract_tags: Vec::new(),
            no_markdown: false,
            no_html_rules: NoHtmlRules::default(),
            cache_ttl_secs: 0,
            cache_capacity: default_cache_capacity(),
            views_dir: None,
            view_extension: default_view_extension(),
            void_tags: default_void_tags(),
            log_render_time: false,
            config_path: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: EngineConfig = serde_yaml::from_str(&content)?;
        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Views directory, resolved relative to the config file.
    pub fn views_path(&self) -> Option<PathBuf> {
        let dir = self.views_dir.as_ref()?;
        Some(self.resolve_path(dir))
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match self.config_path.as_ref().and_then(|p| p.parent()) {
            Some(base) => base.join(path),
            None => path.to_path_buf(),
        }
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        ttl_from_secs(self.cache_ttl_secs)
    }

    /// Checks settings that deserialize fine but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_capacity == 0 {
            return Err(ConfigError::Invalid(
                "cache_capacity must be at least 1".to_string(),
            ));
        }
        if !self.view_extension.is_empty() && !self.view_extension.starts_with('.') {
            return Err(ConfigError::Invalid(format!(
                "view_extension must start with '.': {}",
                self.view_extension
            )));
        }
        Ok(())
    }
}

fn ttl_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Markup that survives inside `{{#no-html}}` zones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoHtmlRules {
    #[serde(default, alias = "allow_user_vars")]
    pub allow_user_vars: bool,
    #[serde(default, alias = "allow_headers")]
    pub allow_headers: bool,
    #[serde(default, alias = "allow_images")]
    pub allow_images: bool,
    #[serde(default, alias = "allow_custom_links")]
    pub allow_custom_links: bool,
}

/// Accepts either a single string or a list of strings.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(tag)) => vec![tag],
        Some(OneOrMany::Many(tags)) => tags,
        None => Vec::new(),
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOptions {
    #[serde(default)]
    template: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    extract_tags: Vec<String>,
    #[serde(default)]
    no_markdown: bool,
    #[serde(default)]
    no_html_rules: Option<NoHtmlRules>,
    #[serde(default)]
    cache: Option<u64>,
    #[serde(default)]
    user_vars: IndexMap<String, String>,
}

/// Options for a single render call.
///
/// Typed keys (`template`, `extractTags`, `noMarkdown`, `noHtmlRules`,
/// `cache`, `userVars`) are parsed out; the whole object, including `opts`,
/// `req` and any extra keys, stays readable from scripts.
#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    pub template: Option<String>,
    pub extract_tags: Vec<String>,
    pub no_markdown: bool,
    pub no_html_rules: Option<NoHtmlRules>,
    pub cache_ttl_secs: Option<u64>,
    pub user_vars: IndexMap<String, String>,
    data: Map,
}

impl RenderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self, ConfigError> {
        if !value.is_object() {
            return Err(ConfigError::InvalidOptions(
                "render options must be a JSON object".to_string(),
            ));
        }
        let raw: RawOptions = serde_json::from_value(value.clone())
            .map_err(|e| ConfigError::InvalidOptions(e.to_string()))?;
        let mut data = match Value::from(value) {
            Value::Map(map) => map,
            _ => Map::new(),
        };
        if !matches!(data.get("opts"), Some(Value::Map(_))) {
            data.insert("opts".to_string(), Value::Map(Map::new()));
        }
        Ok(Self {
            template: raw.template,
            extract_tags: raw.extract_tags,
            no_markdown: raw.no_markdown,
            no_html_rules: raw.no_html_rules,
            cache_ttl_secs: raw.cache,
            user_vars: raw.user_vars,
            data,
        })
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ConfigError::InvalidOptions(e.to_string()))?;
        Self::from_json(value)
    }

    /// Sets the `opts` object readable as `$Opts` and by `{{name}}` tags.
    pub fn with_opts(mut self, opts: Map) -> Self {
        self.data.insert("opts".to_string(), Value::Map(opts));
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn with_user_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_vars.insert(name.into(), value.into());
        self
    }

    /// The full options object.
    pub fn data(&self) -> &Map {
        &self.data
    }

    pub fn cache_ttl(&self) -> Option<Option<Duration>> {
        self.cache_ttl_secs.map(ttl_from_secs)
    }
}
