//! Per-render state: variable scopes, placeholder arenas and the session
//! handle passed to tag callbacks.
//!
//! Placeholders are written into script text as
//! `U+E000 <kind> <index> U+E001`. Both sentinels come from the Private Use
//! Area and are stripped from documents before rendering, so a placeholder
//! can never be forged by input text.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{NoHtmlRules, RenderOptions};
use crate::interpreter::Program;
use crate::pipeline::Engine;
use crate::value::{Map, Value};

pub const SENTINEL_OPEN: char = '\u{E000}';
pub const SENTINEL_CLOSE: char = '\u{E001}';

/// Maximum nesting of script execution (function calls, imports, bodies).
pub const MAX_CALL_DEPTH: usize = 64;

/// Cap on normalization loops over script text.
pub const MAX_NORMALIZE_PASSES: usize = 1000;

static TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x{E000}([sbrvq])(\d+)\x{E001}").expect("valid token regex")
});

static BLOCK_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{?\x{E000}b(\d+)\x{E001}\}?").expect("valid block token regex")
});

/// What a placeholder stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// A quoted string literal from script source.
    Literal,
    /// The body of a `{ }` block.
    Block,
    /// A value produced by `return`.
    Return,
    /// The value of a function call inside an expression.
    Value,
    /// A quoted literal protected while resolving one expression.
    Quote,
}

impl TokenKind {
    fn tag(self) -> char {
        match self {
            TokenKind::Literal => 's',
            TokenKind::Block => 'b',
            TokenKind::Return => 'r',
            TokenKind::Value => 'v',
            TokenKind::Quote => 'q',
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "s" => Some(TokenKind::Literal),
            "b" => Some(TokenKind::Block),
            "r" => Some(TokenKind::Return),
            "v" => Some(TokenKind::Value),
            "q" => Some(TokenKind::Quote),
            _ => None,
        }
    }
}

pub fn encode_token(kind: TokenKind, index: usize) -> String {
    format!("{}{}{}{}", SENTINEL_OPEN, kind.tag(), index, SENTINEL_CLOSE)
}

/// Parses `text` if it is exactly one placeholder.
pub fn parse_token(text: &str) -> Option<(TokenKind, usize)> {
    let caps = TOKEN.captures(text)?;
    let whole = caps.get(0)?;
    if whole.start() != 0 || whole.end() != text.len() {
        return None;
    }
    Some((TokenKind::from_tag(&caps[1])?, caps[2].parse().ok()?))
}

/// Removes every placeholder from `text`.
pub fn strip_tokens(text: &str) -> String {
    TOKEN.replace_all(text, "").into_owned()
}

/// Removes stray sentinel characters.
pub fn strip_sentinels(text: &str) -> String {
    text.chars()
        .filter(|c| *c != SENTINEL_OPEN && *c != SENTINEL_CLOSE)
        .collect()
}

/// Puts braces around every block placeholder, bare or already wrapped.
pub fn wrap_block_tokens(text: &str) -> String {
    BLOCK_TOKEN
        .replace_all(text, |caps: &Captures| {
            format!("{{{}}}", encode_token(TokenKind::Block, caps[1].parse().unwrap_or(0)))
        })
        .into_owned()
}

pub fn contains_return_token(text: &str) -> bool {
    TOKEN
        .captures_iter(text)
        .any(|caps| &caps[1] == "r")
}

/// Storage behind placeholders for one render.
#[derive(Debug, Default)]
pub struct Arena {
    literals: Vec<String>,
    blocks: Vec<String>,
    returns: Vec<Value>,
    values: Vec<Value>,
}

impl Arena {
    /// Stores a quoted literal (quotes included) and returns its placeholder.
    pub fn push_literal(&mut self, quoted: String) -> String {
        self.literals.push(quoted);
        encode_token(TokenKind::Literal, self.literals.len() - 1)
    }

    pub fn push_block(&mut self, body: String) -> String {
        self.blocks.push(body);
        encode_token(TokenKind::Block, self.blocks.len() - 1)
    }

    pub fn push_return(&mut self, value: Value) -> String {
        self.returns.push(value);
        encode_token(TokenKind::Return, self.returns.len() - 1)
    }

    pub fn push_value(&mut self, value: Value) -> String {
        self.values.push(value);
        encode_token(TokenKind::Value, self.values.len() - 1)
    }

    pub fn block(&self, index: usize) -> Option<&str> {
        self.blocks.get(index).map(String::as_str)
    }

    pub fn value(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Replaces literal and block placeholders with their source text.
    /// Return and value placeholders are left in place.
    pub fn restore(&self, text: &str) -> String {
        let mut text = text.to_string();
        for _ in 0..MAX_NORMALIZE_PASSES {
            let mut changed = false;
            let next = TOKEN.replace_all(&text, |caps: &Captures| {
                if &caps[1] != "s" {
                    return caps[0].to_string();
                }
                changed = true;
                caps[2]
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| self.literals.get(i).cloned())
                    .unwrap_or_default()
            });
            let next = BLOCK_TOKEN
                .replace_all(&next, |caps: &Captures| {
                    changed = true;
                    let body = caps[1]
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| self.blocks.get(i))
                        .map(String::as_str)
                        .unwrap_or_default();
                    format!("{{{}}}", body)
                })
                .into_owned();
            text = next;
            if !changed {
                break;
            }
        }
        text
    }

    /// Removes every return placeholder from `text` and yields the value of
    /// the first one.
    pub fn extract_return(&self, text: &mut String) -> Option<Value> {
        let mut found = None;
        let stripped = TOKEN
            .replace_all(text, |caps: &Captures| {
                if &caps[1] != "r" {
                    return caps[0].to_string();
                }
                if found.is_none() {
                    found = caps[2]
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| self.returns.get(i).cloned());
                }
                String::new()
            })
            .into_owned();
        *text = stripped;
        found
    }
}

/// A function defined inside a document with `function name(params){...}`.
#[derive(Debug, Clone)]
pub struct DocumentFunction {
    pub params: Vec<String>,
    pub body: Arc<Program>,
}

/// Variable scopes and settings for one render.
#[derive(Debug, Default)]
pub struct RenderContext {
    /// Document variables set by assignments.
    pub vars: Map,
    /// Loop and parameter bindings; shadow `vars` for `$name` lookups.
    pub temp_vars: Map,
    /// Values substituted for `${name}`.
    pub user_vars: IndexMap<String, String>,
    pub functions: HashMap<String, DocumentFunction>,
    /// The render options object (`opts`, `req` and extra keys).
    pub options: Map,
    pub arena: Arena,
    /// Tag groups to extract, including `{{-name}}` markers found in the body.
    pub extract_tags: Vec<String>,
    pub no_html_rules: NoHtmlRules,
    pub cache_ttl: Option<Duration>,
}

impl RenderContext {
    pub fn new(options: &RenderOptions, engine: &Engine) -> Self {
        let config = engine.config();
        let mut extract_tags = config.extract_tags.clone();
        for tag in &options.extract_tags {
            if !extract_tags.contains(tag) {
                extract_tags.push(tag.clone());
            }
        }
        Self {
            user_vars: options.user_vars.clone(),
            options: options.data().clone(),
            extract_tags,
            no_html_rules: options.no_html_rules.unwrap_or(config.no_html_rules),
            cache_ttl: options.cache_ttl().unwrap_or_else(|| config.cache_ttl()),
            ..Self::default()
        }
    }

    pub fn opts(&self) -> Option<&Value> {
        self.options.get("opts")
    }

    /// A field of the `req` option (`query`, `body` or `data`).
    pub fn request(&self, field: &str) -> Option<&Value> {
        match self.options.get("req")? {
            Value::Map(req) => req.get(field),
            _ => None,
        }
    }
}

/// The handle a render runs on. Tag callbacks receive it to resolve
/// expressions, run nested programs and reach engine services.
pub struct Session<'e> {
    engine: &'e Engine,
    pub ctx: RenderContext,
    depth: usize,
}

impl<'e> Session<'e> {
    pub fn new(engine: &'e Engine, options: &RenderOptions) -> Self {
        Self {
            engine,
            ctx: RenderContext::new(options, engine),
            depth: 0,
        }
    }

    pub fn engine(&self) -> &'e Engine {
        self.engine
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Runs `f` one level deeper, or returns `None` past [`MAX_CALL_DEPTH`].
    pub(crate) fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> Option<T> {
        if self.depth >= MAX_CALL_DEPTH {
            tracing::warn!(depth = self.depth, "maximum script nesting reached");
            return None;
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        Some(result)
    }

    /// Runs `f` and then restores the listed temp bindings to their prior
    /// state, whether or not `f` succeeded.
    pub fn scoped_temps<T>(&mut self, names: &[String], f: impl FnOnce(&mut Self) -> T) -> T {
        let saved: Vec<(String, Option<Value>)> = names
            .iter()
            .map(|name| (name.clone(), self.ctx.temp_vars.get(name).cloned()))
            .collect();
        let result = f(self);
        for (name, previous) in saved.into_iter().rev() {
            match previous {
                Some(value) => {
                    self.ctx.temp_vars.insert(name, value);
                }
                None => {
                    self.ctx.temp_vars.shift_remove(&name);
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_round_trip() {
        let token = encode_token(TokenKind::Block, 12);
        assert_eq!(parse_token(&token), Some((TokenKind::Block, 12)));
        assert_eq!(parse_token(&format!("x{}", token)), None);
    }

    #[test]
    fn test_strip() {
        let text = format!("a{}b\u{E000}c", encode_token(TokenKind::Return, 0));
        assert_eq!(strip_tokens(&text), "ab\u{E000}c");
        assert_eq!(strip_sentinels(&text), "ar0bc");
    }

    #[test]
    fn test_restore_nested_blocks() {
        let mut arena = Arena::default();
        let lit = arena.push_literal("'hi'".to_string());
        let inner = arena.push_block(format!("echo {};", lit));
        let outer = arena.push_block(format!("if(true){}", inner));
        assert_eq!(
            arena.restore(&format!("x{{{}}}", outer)),
            "x{if(true){echo 'hi';}}"
        );
    }

    #[test]
    fn test_extract_return() {
        let mut arena = Arena::default();
        let first = arena.push_return(Value::Number(1.0));
        let second = arena.push_return(Value::Number(2.0));
        let mut text = format!("a{}b{}", first, second);
        assert_eq!(arena.extract_return(&mut text), Some(Value::Number(1.0)));
        assert_eq!(text, "ab");
        assert!(!contains_return_token(&text));
    }

    #[test]
    fn test_scoped_temps_restore() {
        let engine = Engine::new();
        let mut session = Session::new(&engine, &RenderOptions::new());
        session.ctx.temp_vars.insert("item".into(), Value::from("outer"));
        session.scoped_temps(&["item".to_string(), "key".to_string()], |s| {
            s.ctx.temp_vars.insert("item".into(), Value::from("inner"));
            s.ctx.temp_vars.insert("key".into(), Value::Number(0.0));
        });
        assert_eq!(session.ctx.temp_vars.get("item"), Some(&Value::from("outer")));
        assert!(session.ctx.temp_vars.get("key").is_none());
    }

    #[test]
    fn test_nested_depth_limit() {
        let engine = Engine::new();
        let mut session = Session::new(&engine, &RenderOptions::new());
        fn recurse(s: &mut Session<'_>) -> usize {
            s.nested(recurse).map_or(s.depth(), |d| d)
        }
        assert_eq!(recurse(&mut session), MAX_CALL_DEPTH);
        assert_eq!(session.depth(), 0);
    }
}
