//! The render pipeline.
//!
//! Flow: pad + close tags → template splice → no-html zones / user vars →
//! scripts → `{{ }}` tags → tag extraction → no-html zones / user vars →
//! markdown → cleanup
//!
//! Every stage is a text-to-text pass over the whole document; state shared
//! between stages lives in the render [`Session`].

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::{Captures, NoExpand, Regex};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::autoclose::TagCloser;
use crate::config::{EngineConfig, RenderOptions};
use crate::context::{strip_sentinels, strip_tokens, RenderContext, Session};
use crate::error::{EngineError, Result};
use crate::escape::{escape_html, escape_regex};
use crate::interpreter::Program;
use crate::loader::{MemoryCache, TemplateCache, ViewLoader};
use crate::markdown::MarkdownPass;
use crate::registry::{Attrs, TagFlags, TagRegistry, TagResult};
use crate::safe_regex;

/// Hook run on document text; a `Some` result replaces the text.
pub type RenderHook = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

static TEMPLATE_BODY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<\?(?:js|php)?\s*body\(\);?\s*\?>|\{\{\{?#?\s*body\s*\}\}\}?")
        .expect("valid template body regex")
});

static NO_HTML: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?si)\{\{\{?#no[_-]?html\}\}\}?(.*?)\{\{\{?/no[_-]?html\}\}\}?")
        .expect("valid no-html regex")
});

static NO_MARKDOWN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?si)\{\{\{?#no[_-]?markdown\}\}\}?(.*?)\{\{\{?/no[_-]?markdown\}\}\}?")
        .expect("valid no-markdown regex")
});

static USER_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{(.*?)\}").expect("valid user var regex"));

static ESCAPED_USER_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$&lbrace;(.*?)&rbrace;").expect("valid escaped user var regex"));

static LEFTOVER_SCRIPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<\?(?:js|php)?.*?\?>").expect("valid leftover script regex"));

static REGVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)(\{\{\{?)(.*?)(\}\}\}?)").expect("valid regve regex"));

static STYLESHEET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\brel\s*=\s*["']?stylesheet"#).expect("valid stylesheet regex")
});

/// Renders documents. Built once and shared; each render gets its own
/// [`Session`].
pub struct Engine {
    config: EngineConfig,
    registry: TagRegistry,
    closer: TagCloser,
    cache: Arc<dyn TemplateCache>,
    loader: Option<ViewLoader>,
    before_render: Option<RenderHook>,
    after_render: Option<RenderHook>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// An engine with the default configuration and the built-in tags.
    pub fn new() -> Self {
        EngineBuilder::new().assemble(EngineConfig::default())
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn with_config(config: EngineConfig) -> Result<Self> {
        EngineBuilder::new().config(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &TagRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &dyn TemplateCache {
        self.cache.as_ref()
    }

    pub fn loader(&self) -> Option<&ViewLoader> {
        self.loader.as_ref()
    }

    /// Balances the markup in `text` using this engine's void tags.
    pub fn close_tags(&self, text: &str) -> String {
        self.closer.close(text)
    }

    /// Renders a document given as text.
    pub fn render(&self, document: &str, options: &RenderOptions) -> Result<String> {
        if self.config.raw {
            return Ok(document.to_string());
        }
        let started = Instant::now();
        let mut session = Session::new(self, options);

        let text = self.close_tags(&pad(&strip_sentinels(document)));
        let text = self.apply_template(&session, text, options)?;
        let text = protect_no_html(&session.ctx, &text, false);

        let text = session.run_scripts(&text)?;
        let text = strip_tokens(&LEFTOVER_SCRIPT.replace_all(&text, ""));

        let text = run_regve(&mut session, &text);
        let text = extract_tags(&session.ctx, &self.closer, &text);
        let text = protect_no_html(&session.ctx, &text, true);

        let text = if self.config.no_markdown || options.no_markdown {
            text
        } else {
            markdown_outside_zones(&text, MarkdownPass::new(session.ctx.no_html_rules))
        };

        let text = LEFTOVER_SCRIPT.replace_all(&text, "").replace("?>", "");
        let text = REGVE.replace_all(&text, "");
        let text = strip_sentinels(&strip_tokens(&text)).trim().to_string();

        self.log_render_time(started.elapsed());
        Ok(text)
    }

    /// Renders with options given as a JSON object.
    pub fn render_json(&self, document: &str, options: serde_json::Value) -> Result<String> {
        let options = RenderOptions::from_json(options)?;
        self.render(document, &options)
    }

    /// Loads a view from the views directory and renders it, running the
    /// before and after render hooks.
    pub fn render_file(&self, name: &str, options: &RenderOptions) -> Result<String> {
        let loader = self.loader.as_ref().ok_or(EngineError::MissingViewsDir)?;
        let ttl = options.cache_ttl().unwrap_or_else(|| self.config.cache_ttl());
        let text = match loader.load(name, self.cache(), ttl)? {
            Some(text) => text,
            None if loader.resolve(name).is_some_and(|path| path.is_file()) => String::new(),
            None => return Err(EngineError::ViewNotFound(name.to_string())),
        };

        let text = match &self.before_render {
            Some(hook) => hook(&text).unwrap_or(text),
            None => text,
        };
        let rendered = self.render(&text, options)?;
        Ok(match &self.after_render {
            Some(hook) => hook(&rendered).unwrap_or(rendered),
            None => rendered,
        })
    }

    /// Wraps `text` in the configured template, if there is one.
    fn apply_template(&self, session: &Session<'_>, text: String, options: &RenderOptions) -> Result<String> {
        let Some(name) = options.template.as_ref().or(self.config.template.as_ref()) else {
            return Ok(text);
        };
        let Some(loader) = &self.loader else {
            debug!(template = %name, "template set without a views directory");
            return Ok(text);
        };
        let Some(layout) = loader.load(name, self.cache(), session.ctx.cache_ttl)? else {
            return Ok(text);
        };
        let layout = self.close_tags(&pad(&strip_sentinels(&layout)));
        if !TEMPLATE_BODY.is_match(&layout) {
            debug!(template = %name, "template has no body marker");
        }
        Ok(TEMPLATE_BODY.replace_all(&layout, NoExpand(&text)).into_owned())
    }

    fn log_render_time(&self, elapsed: Duration) {
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        if self.config.log_render_time {
            info!(elapsed_ms, "rendered document");
        } else {
            debug!(elapsed_ms, "rendered document");
        }
    }
}

fn pad(text: &str) -> String {
    format!("\n{}\n", text)
}

fn user_var(ctx: &RenderContext, caps: &Captures, remove_unknown: bool) -> String {
    match ctx.user_vars.get(caps[1].trim()) {
        Some(value) => value.clone(),
        None if remove_unknown => String::new(),
        None => caps[0].to_string(),
    }
}

/// Replaces `${name}` with user vars. Unknown names are kept until the final
/// pass, since scripts may still set them.
fn substitute_user_vars(ctx: &RenderContext, text: &str, final_pass: bool) -> String {
    let text = USER_VAR.replace_all(text, |caps: &Captures| user_var(ctx, caps, final_pass));
    if !ctx.no_html_rules.allow_user_vars {
        return text.into_owned();
    }
    ESCAPED_USER_VAR
        .replace_all(&text, |caps: &Captures| user_var(ctx, caps, final_pass))
        .into_owned()
}

/// Escapes the content of `{{#no-html}}` zones and substitutes user vars
/// everywhere else.
fn protect_no_html(ctx: &RenderContext, text: &str, final_pass: bool) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in NO_HTML.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&substitute_user_vars(ctx, &text[last..whole.start()], final_pass));
        out.push_str(&escape_html(&caps[1]));
        last = whole.end();
    }
    out.push_str(&substitute_user_vars(ctx, &text[last..], final_pass));
    out
}

fn strip_double_quotes(text: &str) -> &str {
    text.strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(text)
}

/// Resolves `{{expr}}` (escaped) and `{{{expr}}}` (raw) tags.
///
/// `{{-name}}` registers an extraction group and stays as a marker,
/// `{{attr=expr}}` renders an attribute, and zone markers starting with `#`
/// or `/` are left for later passes.
fn run_regve(session: &mut Session<'_>, text: &str) -> String {
    REGVE
        .replace_all(text, |caps: &Captures| {
            let content = caps[2].trim();
            if content.is_empty() {
                return String::new();
            }
            if content.starts_with('#') || content.starts_with('/') {
                return caps[0].to_string();
            }
            if let Some(name) = content.strip_prefix('-') {
                let name = name.trim().to_string();
                let marker = format!("{{{{-{}}}}}", name);
                if !session.ctx.extract_tags.contains(&name) {
                    session.ctx.extract_tags.push(name);
                }
                return marker;
            }

            let raw = &caps[1] == "{{{" && &caps[3] == "}}}";
            let finish = |value: String| if raw { value } else { escape_html(&value) };

            if let Some((name, value)) = content.split_once('=') {
                let value = value.trim();
                if value.is_empty() {
                    return String::new();
                }
                let value = strip_double_quotes(value);
                let name = match name.trim() {
                    "" => value,
                    name => name,
                };
                let name = name.split(['.', '[']).next().unwrap_or_default();
                return format!("{}=\"{}\"", name, finish(session.resolve_text(value)));
            }
            finish(session.resolve_text(strip_double_quotes(content)))
        })
        .into_owned()
}

/// Byte offset just past the close tag of the `name` element whose open tag
/// ends at `from`. Nested elements of the same name are skipped. `lower` is
/// the ASCII-lowercased document.
fn element_end(lower: &str, name: &str, from: usize) -> Option<usize> {
    let open = format!("<{}", name);
    let close = format!("</{}", name);
    let mut depth = 1usize;
    let mut pos = from;
    while let Some(i) = lower[pos..].find('<') {
        let at = pos + i;
        let rest = &lower[at..];
        if let Some(after) = rest.strip_prefix(close.as_str()) {
            if ends_tag_name(after) {
                depth -= 1;
                if depth == 0 {
                    return Some(rest.find('>').map_or(lower.len(), |gt| at + gt + 1));
                }
            }
        } else if let Some(after) = rest.strip_prefix(open.as_str()) {
            if ends_tag_name(after) {
                depth += 1;
            }
        }
        pos = at + 1;
    }
    None
}

fn ends_tag_name(rest: &str) -> bool {
    rest.chars()
        .next()
        .map_or(true, |c| c == '>' || c == '/' || c.is_ascii_whitespace())
}

/// Moves elements named in the extraction list to their `{{-name}}`
/// markers. Requesting `style` also moves stylesheet `<link>` elements into
/// the style group.
fn extract_tags(ctx: &RenderContext, closer: &TagCloser, text: &str) -> String {
    let tags = &ctx.extract_tags;
    if tags.is_empty() {
        return text.to_string();
    }
    let wants = |name: &str| tags.iter().any(|t| t.eq_ignore_ascii_case(name));
    let mut names: Vec<&str> = tags.iter().map(String::as_str).collect();
    if wants("style") && !wants("link") {
        names.push("link");
    }
    let alternation = names
        .iter()
        .map(|name| escape_regex(name))
        .collect::<Vec<_>>()
        .join("|");
    let (Some(open), Some(marker)) = (
        safe_regex::compile(&format!(r"(?i)<({})(\s[^>]*)?>", alternation)),
        safe_regex::compile(&format!(r"\{{\{{-\s*({})\s*\}}\}}", alternation)),
    ) else {
        return text.to_string();
    };

    let lower = text.to_ascii_lowercase();
    let mut groups: IndexMap<String, Vec<String>> = IndexMap::new();
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    while let Some(caps) = open.captures_at(text, pos) {
        let Some(whole) = caps.get(0) else { break };
        let name = caps[1].to_ascii_lowercase();
        let attrs = caps.get(2).map_or("", |m| m.as_str());

        let end = if closer.is_void(&name) {
            whole.end()
        } else {
            let Some(end) = element_end(&lower, &name, whole.end()) else {
                out.push_str(&text[pos..whole.end()]);
                pos = whole.end();
                continue;
            };
            end
        };

        let group = if name == "link" {
            if STYLESHEET.is_match(attrs) && wants("style") {
                Some("style".to_string())
            } else if wants("link") {
                Some(name)
            } else {
                None
            }
        } else {
            Some(name)
        };

        match group {
            Some(group) => {
                out.push_str(&text[pos..whole.start()]);
                groups
                    .entry(group)
                    .or_default()
                    .push(text[whole.start()..end].to_string());
            }
            None => out.push_str(&text[pos..end]),
        }
        pos = end;
    }
    out.push_str(&text[pos..]);

    marker
        .replace_all(&out, |caps: &Captures| {
            groups
                .get(&caps[1].to_ascii_lowercase())
                .map(|elements| elements.join("\n"))
                .unwrap_or_default()
        })
        .into_owned()
}

/// Runs the markdown pass over text outside `{{#no-markdown}}` zones and
/// unwraps the zones.
fn markdown_outside_zones(text: &str, pass: MarkdownPass) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in NO_MARKDOWN.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&pass.transform(&text[last..whole.start()]));
        out.push_str(&caps[1]);
        last = whole.end();
    }
    out.push_str(&pass.transform(&text[last..]));
    out
}

/// Builds an [`Engine`].
pub struct EngineBuilder {
    config: Option<EngineConfig>,
    views_dir: Option<PathBuf>,
    registry: TagRegistry,
    void_tags: Vec<String>,
    cache: Option<Arc<dyn TemplateCache>>,
    before_render: Option<RenderHook>,
    after_render: Option<RenderHook>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            views_dir: None,
            registry: TagRegistry::with_builtins(),
            void_tags: Vec::new(),
            cache: None,
            before_render: None,
            after_render: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Overrides the configured views directory.
    pub fn views_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.views_dir = Some(dir.into());
        self
    }

    /// Adds a tag function, replacing a built-in of the same name.
    pub fn register<F>(mut self, name: &str, attrs: &[&str], flags: TagFlags, callback: F) -> Self
    where
        F: Fn(&mut Session<'_>, &Attrs, Option<&Program>) -> Result<TagResult>
            + Send
            + Sync
            + 'static,
    {
        self.registry.register(name, attrs, flags, callback);
        self
    }

    /// Treats `tag` as a void element when balancing markup.
    pub fn define_void_tag(mut self, tag: &str) -> Self {
        let tag = tag.trim();
        if !tag.is_empty() {
            self.void_tags.push(tag.to_string());
        }
        self
    }

    /// Uses `cache` for view files instead of a private [`MemoryCache`].
    pub fn cache(mut self, cache: Arc<dyn TemplateCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn on_before_render<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.before_render = Some(Box::new(hook));
        self
    }

    pub fn on_after_render<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.after_render = Some(Box::new(hook));
        self
    }

    pub fn build(mut self) -> Result<Engine> {
        let mut config = self.config.take().unwrap_or_default();
        if let Some(dir) = self.views_dir.take() {
            config.views_dir = Some(dir);
        }
        config.validate()?;
        Ok(self.assemble(config))
    }

    fn assemble(self, config: EngineConfig) -> Engine {
        let mut closer = TagCloser::new(config.void_tags.iter().cloned());
        for tag in &self.void_tags {
            closer.add_void_tag(tag);
        }
        let cache: Arc<dyn TemplateCache> = match self.cache {
            Some(cache) => cache,
            None => Arc::new(MemoryCache::new(config.cache_capacity)),
        };
        let loader = config
            .views_path()
            .map(|root| ViewLoader::new(root, config.view_extension.clone()));
        debug!(tags = ?self.registry.names(), "tag functions registered");
        Engine {
            config,
            registry: self.registry,
            closer,
            cache,
            loader,
            before_render: self.before_render,
            after_render: self.after_render,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(document: &str, options: serde_json::Value) -> String {
        Engine::new().render_json(document, options).unwrap()
    }

    #[test]
    fn test_element_end_respects_names_and_nesting() {
        let doc = "<p>a<pre>b</pre></p>";
        assert_eq!(element_end(doc, "p", 3), Some(doc.len()));
        let doc = "<div><div>x</div>y</div>z";
        assert_eq!(element_end(doc, "div", 5), Some(doc.len() - 1));
        assert_eq!(element_end("<p>open", "p", 3), None);
    }

    #[test]
    fn test_extraction_keeps_nested_elements_whole() {
        let doc = "<head>{{-aside}}</head><aside><aside>in</aside>out</aside><p>x</p>";
        let out = render(doc, json!({"extractTags": ["aside"], "noMarkdown": true}));
        assert_eq!(out, "<head><aside><aside>in</aside>out</aside></head><p>x</p>");
    }

    #[test]
    fn test_raw_mode_returns_input() {
        let config = EngineConfig::from_yaml("raw: true").unwrap();
        let engine = Engine::with_config(config).unwrap();
        let doc = "<? echo 1; ?> {{x}}";
        assert_eq!(engine.render(doc, &RenderOptions::new()).unwrap(), doc);
    }

    #[test]
    fn test_regve_forms() {
        let options = json!({"opts": {"title": "<b>Hi</b>", "cls": "main"}});
        assert_eq!(render("{{title}}", options.clone()), "&lt;b&gt;Hi&lt;&sol;b&gt;");
        assert_eq!(render("{{{title}}}", options.clone()), "<b>Hi</b>");
        assert_eq!(render("<p {{class=cls}}>x</p>", options), r#"<p class="main">x</p>"#);
    }

    #[test]
    fn test_user_vars() {
        let options = json!({"userVars": {"name": "Ada"}});
        assert_eq!(render("Hi ${name}${unknown}", options), "Hi Ada");
        assert_eq!(
            render("<? setUserVar('late', 'x'); ?>${late}", json!({})),
            "x"
        );
    }

    #[test]
    fn test_no_html_zone_is_escaped() {
        let out = render("{{#no-html}}<? echo 1; ?>{{/no-html}}", json!({}));
        assert_eq!(out, "&lt;&quest; echo 1; &quest;&gt;");
    }

    #[test]
    fn test_no_markdown_zone() {
        assert_eq!(render("**a** {{#no-markdown}}**b**{{/no-markdown}}", json!({})), "<strong>a</strong> **b**");
        assert_eq!(render("**a**", json!({"noMarkdown": true})), "**a**");
    }

    #[test]
    fn test_extract_tags() {
        let doc = "<head>{{-style}}</head><body><style>p{}</style><link rel=\"stylesheet\" href=\"a.css\"><p>x</p></body>";
        let out = render(doc, json!({"noMarkdown": true}));
        assert_eq!(
            out,
            "<head><style>p{}</style>\n<link rel=\"stylesheet\" href=\"a.css\"></head><body><p>x</p></body>"
        );
    }

    #[test]
    fn test_leftovers_removed() {
        assert_eq!(render("a ?> b", json!({})), "a  b");
        assert_eq!(render("a {{#unknown}} b", json!({})), "a  b");
    }

    #[test]
    fn test_sentinels_in_input_are_stripped() {
        assert_eq!(render("a\u{E000}r0\u{E001}b", json!({})), "ar0b");
    }

    #[test]
    fn test_render_file_requires_views() {
        let err = Engine::new().render_file("index", &RenderOptions::new()).unwrap_err();
        assert!(matches!(err, EngineError::MissingViewsDir));
    }

    #[test]
    fn test_builder_rejects_bad_config() {
        let config = EngineConfig::from_yaml("cache_capacity: 0").unwrap();
        assert!(Engine::builder().config(config).build().is_err());
    }
}
