//! Expression resolution.
//!
//! An expression is resolved in stages: inline function calls, JSON
//! literals, `|` fallbacks and `&` conjunctions, arithmetic, and finally a
//! fold over `+ - * / .` using [`Value::combine`].

use once_cell::sync::Lazy;
use regex::Regex;

use crate::context::{encode_token, parse_token, Session, TokenKind, MAX_NORMALIZE_PASSES};
use crate::error::Result;
use crate::interpreter::Call;
use crate::json;
use crate::math;
use crate::registry::Flow;
use crate::value::{format_number, is_numeric, Map, Operator, Value};

/// How a resolved value is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Structured value for scripts.
    Value,
    /// Text for `{{ }}` tags: `$name` reads document vars, a bare name reads
    /// `opts`, and anything that is not a scalar becomes "".
    Flatten,
}

static PAREN_GROUP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(([^()]*)\)").expect("valid paren group regex"));

static INLINE_CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z_]\w*\s*\(").expect("valid inline call regex"));

static SCOPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\$(Opts|Options|_OPTS|_OPTIONS|Post|_POST|Get|_GET|Data|_DATA)([.\[].*)$")
        .expect("valid scope regex")
});

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Splits on `sep` outside of `()`, `[]` and `{}`.
pub fn split_top_level(text: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            c if c == sep && depth <= 0 => {
                parts.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

/// Byte index of the `)` matching the `(` at `open`.
pub fn find_matching_paren(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in text[open..].char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Replaces quoted literals with placeholders, returning the unquoted,
/// unescaped contents in placeholder order.
pub fn protect_quotes(text: &str) -> (String, Vec<String>) {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut quotes = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' || c == '"' {
            if let Some(end) = closing_quote(&chars, i) {
                let mut content = String::new();
                let mut j = i + 1;
                while j < end {
                    if chars[j] == '\\' && j + 1 < end {
                        j += 1;
                    }
                    content.push(chars[j]);
                    j += 1;
                }
                out.push_str(&encode_token(TokenKind::Quote, quotes.len()));
                quotes.push(content);
                i = end + 1;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    (out, quotes)
}

/// Index of the unescaped quote closing the one at `open`.
pub(crate) fn closing_quote(chars: &[char], open: usize) -> Option<usize> {
    let quote = chars[open];
    let mut j = open + 1;
    while j < chars.len() {
        match chars[j] {
            '\\' => j += 2,
            c if c == quote => return Some(j),
            _ => j += 1,
        }
    }
    None
}

/// Puts protected literals back as single-quoted text.
pub fn restore_quotes(text: &str, quotes: &[String]) -> String {
    let mut out = text.to_string();
    for (i, content) in quotes.iter().enumerate().rev() {
        let token = encode_token(TokenKind::Quote, i);
        if out.contains(&token) {
            let quoted = format!("'{}'", content.replace('\\', "\\\\").replace('\'', "\\'"));
            out = out.replace(&token, &quoted);
        }
    }
    out
}

/// Splits a dotted/bracketed path into segments: `a.b[0]['c']` gives
/// `a`, `b`, `0`, `c`.
pub fn parse_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars();
    while let Some(c) = chars.next() {
        match c {
            '.' => flush_segment(&mut segments, &mut current),
            '[' => {
                flush_segment(&mut segments, &mut current);
                let mut inner = String::new();
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                    inner.push(c);
                }
                let inner = inner.trim();
                let inner = inner
                    .strip_prefix(['\'', '"'])
                    .and_then(|s| s.strip_suffix(['\'', '"']))
                    .unwrap_or(inner);
                if !inner.is_empty() {
                    segments.push(inner.to_string());
                }
            }
            c => current.push(c),
        }
    }
    flush_segment(&mut segments, &mut current);
    segments
}

fn flush_segment(segments: &mut Vec<String>, current: &mut String) {
    let segment = current.trim();
    if !segment.is_empty() {
        segments.push(segment.to_string());
    }
    current.clear();
}

/// Walks `segments` from `root`. `None` when any step is missing.
pub fn lookup<'v>(root: &'v Value, segments: &[String]) -> Option<&'v Value> {
    let mut current = root;
    for segment in segments {
        current = match current {
            Value::Map(map) => map.get(segment)?,
            Value::List(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

pub fn lookup_in<'v>(map: &'v Map, segments: &[String]) -> Option<&'v Value> {
    let (first, rest) = segments.split_first()?;
    lookup(map.get(first)?, rest)
}

/// Writes `value` at `segments`, creating intermediate maps as needed.
pub fn assign_path(map: &mut Map, segments: &[String], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        map.insert(first.clone(), value);
        return;
    }
    let entry = map
        .entry(first.clone())
        .or_insert_with(|| Value::Map(Map::new()));
    assign_in(entry, rest, value);
}

fn assign_in(target: &mut Value, segments: &[String], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        *target = value;
        return;
    };
    match target {
        Value::Map(map) => assign_path(map, segments, value),
        Value::List(items) => {
            let Ok(index) = first.parse::<usize>() else {
                return;
            };
            if rest.is_empty() {
                if index < items.len() {
                    items[index] = value;
                } else if index == items.len() {
                    items.push(value);
                }
            } else if let Some(item) = items.get_mut(index) {
                assign_in(item, rest, value);
            }
        }
        other => {
            *other = Value::Map(Map::new());
            assign_in(other, segments, value);
        }
    }
}

enum Piece<'a> {
    Op(Operator),
    Operand(&'a str),
}

/// Splits on top-level operators. `.` is only an operator when it is not
/// part of a path or a decimal number.
fn split_operators(text: &str) -> Vec<Piece<'_>> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut pieces = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (k, &(i, c)) in chars.iter().enumerate() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            _ if depth > 0 => {}
            '+' | '-' | '*' | '/' | '.' => {
                if c == '.' {
                    let prev = k.checked_sub(1).map(|p| chars[p].1);
                    let next = chars.get(k + 1).map(|&(_, n)| n);
                    let joins_word = next.is_some_and(is_word);
                    let after_token = prev.is_some_and(|p| !is_word(p))
                        && next.is_some_and(|n| n.is_ascii_digit());
                    if joins_word && !after_token {
                        continue;
                    }
                }
                let operand = text[start..i].trim();
                if !operand.is_empty() {
                    pieces.push(Piece::Operand(operand));
                }
                if let Some(op) = Operator::from_symbol(c) {
                    pieces.push(Piece::Op(op));
                }
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    let operand = text[start..].trim();
    if !operand.is_empty() {
        pieces.push(Piece::Operand(operand));
    }
    pieces
}

fn looks_numeric(text: &str) -> bool {
    text.bytes().any(|b| b.is_ascii_digit()) || text.contains("pi")
}

/// Replaces parenthesized arithmetic such as `(1+2)` with its value. Groups
/// directly after a name are call arguments and stay as written.
fn solve_paren_groups(text: &str) -> String {
    let mut text = text.to_string();
    for _ in 0..MAX_NORMALIZE_PASSES {
        let mut changed = false;
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in PAREN_GROUP.captures_iter(&text) {
            let Some(whole) = caps.get(0) else { continue };
            let prev = text[..whole.start()].chars().next_back();
            if prev.is_some_and(|p| is_word(p) || p == '$' || p == '.') || !looks_numeric(&caps[1]) {
                continue;
            }
            let Some(result) = math::evaluate(&caps[1]) else {
                continue;
            };
            out.push_str(&text[last..whole.start()]);
            out.push_str(&format_number(result));
            last = whole.end();
            changed = true;
        }
        if !changed {
            break;
        }
        out.push_str(&text[last..]);
        text = out;
    }
    text
}

fn fold(acc: Value, op: Operator, rhs: Value) -> Value {
    if rhs.is_undefined() {
        return acc;
    }
    if acc.is_undefined() {
        return rhs;
    }
    acc.combine(op, &rhs).unwrap_or(acc)
}

fn finish(value: Value, mode: Mode) -> Value {
    match mode {
        Mode::Value => value.coerce(),
        Mode::Flatten => Value::String(value.flatten()),
    }
}

impl Session<'_> {
    /// Resolves `expr` without running function calls.
    pub fn resolve(&self, expr: &str, mode: Mode) -> Value {
        let restored = self.ctx.arena.restore(expr);
        let mut text = restored.trim();
        if let Some(stripped) = text.strip_suffix(';') {
            text = stripped.trim_end();
        }
        if text.is_empty() {
            return finish(Value::Undefined, mode);
        }
        if (text.starts_with('{') && text.ends_with('}'))
            || (text.starts_with('[') && text.ends_with(']'))
        {
            if let Some(value) = json::parse_lenient(text) {
                return finish(value, mode);
            }
        }

        let (protected, quotes) = protect_quotes(text);
        let mut result = Value::Undefined;
        for alternative in split_top_level(&protected, '|') {
            let alternative = alternative.trim();
            if alternative.is_empty() {
                continue;
            }
            let conjuncts: Vec<&str> = split_top_level(alternative, '&')
                .into_iter()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .collect();
            if conjuncts.len() > 1 {
                if conjuncts
                    .iter()
                    .all(|c| self.resolve_chain(c, &quotes, mode).is_truthy())
                {
                    result = Value::Bool(true);
                    break;
                }
                continue;
            }
            result = self.resolve_chain(alternative, &quotes, mode);
            if result.is_truthy() {
                break;
            }
        }
        finish(result, mode)
    }

    /// Resolves `expr` for a `{{ }}` tag.
    pub fn resolve_text(&self, expr: &str) -> String {
        self.resolve(expr, Mode::Flatten).to_text()
    }

    /// Resolves `expr`, running any document or registered function called
    /// inside it. Text those calls emit is appended to `out`.
    pub fn evaluate(&mut self, expr: &str, out: &mut String) -> Result<Value> {
        let expr = self.substitute_calls(expr, out)?;
        Ok(self.resolve(&expr, Mode::Value))
    }

    fn is_callable(&self, name: &str) -> bool {
        self.ctx.functions.contains_key(name) || self.engine().registry().contains(name)
    }

    fn substitute_calls(&mut self, expr: &str, out: &mut String) -> Result<String> {
        let mut result = String::with_capacity(expr.len());
        let mut pos = 0;
        while let Some(m) = INLINE_CALL.find_at(expr, pos) {
            let name = m.as_str().trim_end_matches('(').trim_end();
            let prev = expr[..m.start()].chars().next_back();
            let bounded = !prev.is_some_and(|p| is_word(p) || p == '$' || p == '.');
            let open = m.end() - 1;
            let close = if bounded && self.is_callable(name) {
                find_matching_paren(expr, open)
            } else {
                None
            };
            let Some(close) = close else {
                result.push_str(&expr[pos..m.end()]);
                pos = m.end();
                continue;
            };

            let args = split_top_level(&expr[open + 1..close], ',')
                .into_iter()
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect();
            let call = Call {
                else_branch: false,
                name: name.to_string(),
                args,
                body: None,
            };
            let dispatch = self.dispatch(&call, Flow::Ran)?;
            out.push_str(&dispatch.output);
            result.push_str(&expr[pos..m.start()]);
            let token = self
                .ctx
                .arena
                .push_value(dispatch.value.unwrap_or_default());
            result.push_str(&token);
            pos = close + 1;
        }
        result.push_str(&expr[pos..]);
        Ok(result)
    }

    fn resolve_chain(&self, text: &str, quotes: &[String], mode: Mode) -> Value {
        let text = text.trim();
        if math::is_expression(text) {
            return match math::evaluate(text) {
                Some(n) => Value::Number(n),
                None => Value::String(math::solve(text)),
            };
        }
        let text = solve_paren_groups(text);

        // `*` and `/` bind tighter than `+`, `-` and `.`; each level folds
        // left to right.
        let mut terms: Vec<(Operator, Value)> = Vec::new();
        let mut op = Operator::Concat;
        let mut negate = false;
        let mut expecting_operand = true;
        for piece in split_operators(&text) {
            match piece {
                Piece::Op(o) if expecting_operand => {
                    if o == Operator::Sub {
                        negate = !negate;
                    }
                }
                Piece::Op(o) => {
                    op = o;
                    expecting_operand = true;
                }
                Piece::Operand(operand) => {
                    let mut value = self.operand(operand, quotes, mode);
                    if negate {
                        if let Value::Number(n) = value {
                            value = Value::Number(-n);
                        }
                        negate = false;
                    }
                    match terms.last_mut() {
                        Some((_, acc)) if matches!(op, Operator::Mul | Operator::Div) => {
                            *acc = fold(std::mem::take(acc), op, value);
                        }
                        _ => terms.push((op, value)),
                    }
                    expecting_operand = false;
                }
            }
        }

        let mut terms = terms.into_iter();
        let first = terms.next().map(|(_, v)| v).unwrap_or_default();
        terms.fold(first, |acc, (op, value)| fold(acc, op, value))
    }

    fn operand(&self, text: &str, quotes: &[String], mode: Mode) -> Value {
        if let Some((kind, index)) = parse_token(text) {
            return match kind {
                TokenKind::Quote => quotes
                    .get(index)
                    .map(|q| Value::String(q.clone()))
                    .unwrap_or_default(),
                TokenKind::Value => self.ctx.arena.value(index).cloned().unwrap_or_default(),
                _ => Value::Undefined,
            };
        }
        if is_numeric(text) {
            return text.parse().map(Value::Number).unwrap_or_default();
        }
        match text {
            "NaN" => return Value::Number(f64::NAN),
            "Infinity" => return Value::Number(f64::INFINITY),
            _ => {}
        }
        self.get_var(&restore_quotes(text, quotes), mode)
    }

    /// Looks up a variable reference such as `$name`, `$Opts.title` or a
    /// bare name.
    pub fn get_var(&self, name: &str, mode: Mode) -> Value {
        match name {
            "true" => return Value::Bool(true),
            "false" => return Value::Bool(false),
            _ => {}
        }
        if let Some(caps) = SCOPE.captures(name) {
            let root = match &caps[1] {
                "Opts" | "Options" | "_OPTS" | "_OPTIONS" => self.ctx.opts(),
                "Post" | "_POST" => self.ctx.request("body"),
                "Get" | "_GET" => self.ctx.request("query"),
                _ => self.ctx.request("data"),
            };
            let segments = parse_path(&caps[2]);
            return root
                .and_then(|root| lookup(root, &segments))
                .cloned()
                .unwrap_or_default();
        }

        let found = match (mode, name.strip_prefix('$')) {
            (Mode::Flatten, Some(path)) => lookup_in(&self.ctx.vars, &parse_path(path)).cloned(),
            (Mode::Flatten, None) => self
                .ctx
                .opts()
                .and_then(|opts| lookup(opts, &parse_path(name)))
                .cloned(),
            (Mode::Value, Some(path)) => {
                let segments = parse_path(path);
                lookup_in(&self.ctx.temp_vars, &segments)
                    .or_else(|| lookup_in(&self.ctx.vars, &segments))
                    .cloned()
                    .or_else(|| self.ctx.user_vars.get(path).cloned().map(Value::String))
            }
            (Mode::Value, None) => lookup_in(&self.ctx.vars, &parse_path(name)).cloned(),
        };
        found.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderOptions;
    use crate::pipeline::Engine;
    use serde_json::json;

    fn with_session<T>(options: serde_json::Value, f: impl FnOnce(&mut Session<'_>) -> T) -> T {
        let engine = Engine::new();
        let options = RenderOptions::from_json(options).unwrap();
        let mut session = Session::new(&engine, &options);
        f(&mut session)
    }

    #[test]
    fn test_split_top_level() {
        assert_eq!(split_top_level("a,(b,c),[d,e]", ','), vec!["a", "(b,c)", "[d,e]"]);
        assert_eq!(split_top_level("", ','), vec![""]);
    }

    #[test]
    fn test_matching_paren() {
        assert_eq!(find_matching_paren("f(a(b))c", 1), Some(6));
        assert_eq!(find_matching_paren("f(a", 1), None);
    }

    #[test]
    fn test_protect_and_restore_quotes() {
        let (text, quotes) = protect_quotes(r#"'a\'b' + "c""#);
        assert_eq!(quotes, vec!["a'b".to_string(), "c".to_string()]);
        assert!(!text.contains('\''));
        assert_eq!(restore_quotes(&text, &quotes), r"'a\'b' + 'c'");
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(parse_path("a.b[0]['c d']"), vec!["a", "b", "0", "c d"]);
        assert!(parse_path("").is_empty());
    }

    #[test]
    fn test_assign_path_creates_maps() {
        let mut map = Map::new();
        assign_path(&mut map, &parse_path("a.b"), Value::Number(1.0));
        assert_eq!(Value::Map(map), Value::from(json!({"a": {"b": 1}})));
    }

    #[test]
    fn test_paren_groups() {
        assert_eq!(solve_paren_groups("$x*(1+2)"), "$x*3");
        assert_eq!(solve_paren_groups("((1+1)*2)"), "4");
        assert_eq!(solve_paren_groups("foo(1+2)"), "foo(1+2)");
        assert_eq!(solve_paren_groups("($a+1)"), "($a+1)");
    }

    #[test]
    fn test_arithmetic_precedence() {
        with_session(json!({}), |s| {
            s.ctx.vars.insert("x".into(), Value::Number(4.0));
            assert_eq!(s.resolve("2 + 3 * 4", Mode::Value), Value::Number(14.0));
            assert_eq!(s.resolve("$x * 2 + 1", Mode::Value), Value::Number(9.0));
            assert_eq!(s.resolve("$x + 2 * 3", Mode::Value), Value::Number(10.0));
            assert_eq!(s.resolve("$x * (1 + 2)", Mode::Value), Value::Number(12.0));
            assert_eq!(s.resolve("2^3 + 5!", Mode::Value), Value::Number(128.0));
            assert_eq!(s.resolve("10 - $x - 1", Mode::Value), Value::Number(5.0));
        });
    }

    #[test]
    fn test_resolve_literals_and_concat() {
        with_session(json!({}), |s| {
            assert_eq!(s.resolve("'a'.'b'", Mode::Value), Value::from("ab"));
            assert_eq!(s.resolve("'a' + 1", Mode::Value), Value::from("a1"));
            assert_eq!(s.resolve("2 + 3", Mode::Value), Value::Number(5.0));
            assert_eq!(s.resolve("-5", Mode::Value), Value::Number(-5.0));
            assert_eq!(s.resolve("'42'", Mode::Value), Value::Number(42.0));
            assert_eq!(s.resolve("[1, two]", Mode::Value), Value::from(json!([1, "two"])));
        });
    }

    #[test]
    fn test_resolve_variables() {
        with_session(json!({"opts": {"title": "Hi", "list": [1, 2]}}), |s| {
            s.ctx.vars.insert("x".into(), Value::Number(4.0));
            assert_eq!(s.resolve("$x * 2", Mode::Value), Value::Number(8.0));
            assert_eq!(s.resolve("$Opts.title", Mode::Value), Value::from("Hi"));
            assert_eq!(s.resolve("$Opts['title']", Mode::Value), Value::from("Hi"));
            assert_eq!(s.resolve("$Opts.list[1]", Mode::Value), Value::Number(2.0));
            assert_eq!(s.resolve("$missing", Mode::Value), Value::Undefined);
        });
    }

    #[test]
    fn test_resolve_flatten_mode() {
        with_session(json!({"opts": {"title": "Hi"}}), |s| {
            s.ctx.vars.insert("name".into(), Value::from("Ada"));
            assert_eq!(s.resolve_text("title"), "Hi");
            assert_eq!(s.resolve_text("$name"), "Ada");
            assert_eq!(s.resolve_text("name"), "");
            assert_eq!(s.resolve_text("$Opts"), "");
        });
    }

    #[test]
    fn test_request_scopes() {
        let options = json!({"req": {"query": {"q": "rust"}, "body": {"id": 7}, "data": {"k": "v"}}});
        with_session(options, |s| {
            assert_eq!(s.resolve("$Get.q", Mode::Value), Value::from("rust"));
            assert_eq!(s.resolve("$_POST.id", Mode::Value), Value::Number(7.0));
            assert_eq!(s.resolve("$Data[k]", Mode::Value), Value::from("v"));
        });
    }

    #[test]
    fn test_temp_shadows_vars() {
        with_session(json!({}), |s| {
            s.ctx.vars.insert("x".into(), Value::from("doc"));
            s.ctx.temp_vars.insert("x".into(), Value::from("loop"));
            assert_eq!(s.resolve("$x", Mode::Value), Value::from("loop"));
            s.ctx.temp_vars.shift_remove("x");
            assert_eq!(s.resolve("$x", Mode::Value), Value::from("doc"));
        });
    }

    #[test]
    fn test_fallback_and_conjunction() {
        with_session(json!({}), |s| {
            s.ctx.vars.insert("b".into(), Value::from("set"));
            assert_eq!(s.resolve("$a | $b", Mode::Value), Value::from("set"));
            assert_eq!(s.resolve("$a | 'default'", Mode::Value), Value::from("default"));
            assert_eq!(s.resolve("$b & 1", Mode::Value), Value::Bool(true));
            assert_eq!(s.resolve("$a & 1", Mode::Value), Value::Undefined);
        });
    }

    #[test]
    fn test_quoted_operators_stay_literal() {
        with_session(json!({}), |s| {
            assert_eq!(s.resolve("'a|b'", Mode::Value), Value::from("a|b"));
            assert_eq!(s.resolve("'1+1'", Mode::Value), Value::from("1+1"));
        });
    }
}
