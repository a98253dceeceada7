//! Script parsing and execution.
//!
//! Script source is normalized before parsing: comments are removed, quoted
//! literals and `{ }` blocks are swapped for placeholders, and function
//! definitions are hoisted. What remains is split into statements, each of
//! which is a `return`, an assignment or a call.

use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::debug;

use crate::context::{
    wrap_block_tokens, Arena, DocumentFunction, Session, MAX_CALL_DEPTH, MAX_NORMALIZE_PASSES,
};
use crate::error::Result;
use crate::registry::Flow;
use crate::resolve::{assign_path, closing_quote, find_matching_paren, lookup_in, parse_path, split_top_level};
use crate::value::{Operator, Value};

static SCRIPT_REGION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<\?(?:js|php)?(.*?)\?>").expect("valid script region regex"));

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

static ELSE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\belse\s*\{").expect("valid else regex"));

static INNER_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([^{}]*)\}").expect("valid block regex"));

static FUNCTION_DEF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"function\s*([\w\-.\[\]]+)\s*\(([^)]*)\)\s*\{\x{E000}b(\d+)\x{E001}\}")
        .expect("valid function definition regex")
});

static STATEMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s).*?[;}]").expect("valid statement regex"));

static ASSIGN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\$(\w+(?:-\w+)*(?:\.\w+(?:-\w+)*|\[[^\]]*\])*)\s*([+\-*/.]?)=(.*)$")
        .expect("valid assignment regex")
});

static CALL_HEAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(else\s+)?([\w\-.]+)\s*\(").expect("valid call regex"));

static BODY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\{\x{E000}b(\d+)\x{E001}\}").expect("valid body regex"));

/// A parsed script block or block body.
#[derive(Debug, Clone, Default)]
pub struct Program {
    source: String,
    statements: Vec<Statement>,
    functions: Vec<FunctionDef>,
}

#[derive(Debug, Clone)]
pub enum Statement {
    Return(String),
    Assign {
        target: String,
        op: Option<Operator>,
        expr: String,
    },
    Call(Call),
}

/// A call such as `name(arg, ...)` with an optional `{ }` body.
#[derive(Debug, Clone)]
pub struct Call {
    pub else_branch: bool,
    pub name: String,
    pub args: Vec<String>,
    pub body: Option<Arc<Program>>,
}

#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Arc<Program>,
}

impl Program {
    /// Parses raw script source, storing literals and blocks in `arena`.
    pub fn parse(source: &str, arena: &mut Arena) -> Program {
        let text = protect_source(source, arena);
        let text = WHITESPACE.replace_all(&text, " ");
        let text = ELSE_BLOCK.replace_all(&text, "else if(true){");
        let text = extract_blocks(&text, arena);
        Program::from_normalized(&text, arena, 0)
    }

    /// Parses text that has already been through [`Program::parse`]'s
    /// normalization, such as a block body. Bodies nested deeper than
    /// [`MAX_CALL_DEPTH`] could never run and parse as empty.
    fn from_normalized(text: &str, arena: &Arena, depth: usize) -> Program {
        if depth > MAX_CALL_DEPTH {
            return Program::default();
        }
        let text = wrap_block_tokens(text);

        let mut defs = Vec::new();
        let text = FUNCTION_DEF.replace_all(&text, |caps: &regex::Captures| {
            defs.push((caps[1].to_string(), caps[2].to_string(), caps[3].to_string()));
            String::new()
        });
        let functions = defs
            .into_iter()
            .map(|(name, params, block)| FunctionDef {
                name,
                params: params
                    .split(',')
                    .map(|p| p.trim().trim_start_matches('$').to_string())
                    .filter(|p| !p.is_empty())
                    .collect(),
                body: Arc::new(block_program(&block, arena, depth + 1)),
            })
            .collect();

        let mut statements = Vec::new();
        let mut last = 0;
        for m in STATEMENT.find_iter(&text) {
            statements.extend(parse_statement(m.as_str(), arena, depth));
            last = m.end();
        }
        statements.extend(parse_statement(&text[last..], arena, depth));

        Program {
            source: arena.restore(&text),
            statements,
            functions,
        }
    }

    /// Source text with literals and blocks restored.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn functions(&self) -> &[FunctionDef] {
        &self.functions
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty() && self.functions.is_empty()
    }
}

fn block_program(index: &str, arena: &Arena, depth: usize) -> Program {
    let body = index
        .parse::<usize>()
        .ok()
        .and_then(|i| arena.block(i))
        .unwrap_or_default();
    Program::from_normalized(body, arena, depth)
}

/// Strips `//` and `/* */` comments and replaces quoted literals with
/// placeholders in a single scan, so comment markers inside strings survive.
fn protect_source(source: &str, arena: &mut Arena) -> String {
    let chars: Vec<char> = source.chars().collect();
    let mut out = String::with_capacity(source.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '/' if next == Some('/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if next == Some('*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i = (i + 2).min(chars.len());
            }
            '\'' | '"' => match closing_quote(&chars, i) {
                Some(end) => {
                    let literal: String = chars[i..=end].iter().collect();
                    out.push_str(&arena.push_literal(literal));
                    i = end + 1;
                }
                None => {
                    out.push(c);
                    i += 1;
                }
            },
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Moves innermost `{ }` blocks into the arena until none are left.
fn extract_blocks(text: &str, arena: &mut Arena) -> String {
    let mut text = text.to_string();
    for _ in 0..MAX_NORMALIZE_PASSES {
        let next = match INNER_BLOCK.replace_all(&text, |caps: &regex::Captures| {
            arena.push_block(caps[1].trim().to_string())
        }) {
            Cow::Borrowed(_) => break,
            Cow::Owned(next) => next,
        };
        text = next;
    }
    text
}

fn keyword<'a>(statement: &'a str, word: &str) -> Option<&'a str> {
    let rest = statement.strip_prefix(word)?;
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest.trim())
    } else {
        None
    }
}

fn parse_statement(text: &str, arena: &Arena, depth: usize) -> Option<Statement> {
    let text = text.trim();
    let text = text.strip_suffix(';').unwrap_or(text).trim();
    if text.is_empty() {
        return None;
    }

    if let Some(expr) = keyword(text, "return") {
        return Some(Statement::Return(expr.to_string()));
    }
    if let Some(expr) = keyword(text, "echo_html") {
        return Some(Statement::Call(echo_call(expr, true)));
    }
    if let Some(expr) = keyword(text, "echo") {
        return Some(Statement::Call(echo_call(expr, false)));
    }
    if let Some(caps) = ASSIGN.captures(text) {
        let expr = caps[3].trim();
        if !expr.starts_with('=') {
            return Some(Statement::Assign {
                target: caps[1].to_string(),
                op: caps[2].chars().next().and_then(Operator::from_symbol),
                expr: expr.to_string(),
            });
        }
    }
    if let Some(call) = parse_call(text, arena, depth) {
        return Some(Statement::Call(call));
    }
    debug!(statement = %arena.restore(text), "ignoring unrecognized statement");
    None
}

fn echo_call(expr: &str, allow_html: bool) -> Call {
    let mut args = vec![expr.to_string()];
    if allow_html {
        args.push("true".to_string());
    }
    Call {
        else_branch: false,
        name: "echo".to_string(),
        args,
        body: None,
    }
}

fn parse_call(text: &str, arena: &Arena, depth: usize) -> Option<Call> {
    let caps = CALL_HEAD.captures(text)?;
    let open = caps.get(0)?.end() - 1;
    let close = find_matching_paren(text, open)?;
    let args = split_top_level(&text[open + 1..close], ',')
        .into_iter()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect();
    let body = BODY
        .captures(text[close + 1..].trim_start())
        .map(|body| block_program(&body[1], arena, depth + 1))
        .filter(|program| !program.is_empty())
        .map(Arc::new);
    Some(Call {
        else_branch: caps.get(1).is_some(),
        name: caps[2].to_string(),
        args,
        body,
    })
}

impl Session<'_> {
    /// Runs every `<? ?>` region in `text` and splices in its output.
    pub fn run_scripts(&mut self, text: &str) -> Result<String> {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in SCRIPT_REGION.captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&text[last..whole.start()]);
            last = whole.end();
            let program = Program::parse(&caps[1], &mut self.ctx.arena);
            out.push_str(&self.run_program(&program)?);
        }
        out.push_str(&text[last..]);
        Ok(out)
    }

    /// Executes `program`, returning its output. A `return` leaves a return
    /// placeholder at the end of the output and stops execution.
    pub fn run_program(&mut self, program: &Program) -> Result<String> {
        self.nested(|session| session.execute(program))
            .unwrap_or_else(|| Ok(String::new()))
    }

    fn execute(&mut self, program: &Program) -> Result<String> {
        for def in &program.functions {
            self.ctx.functions.insert(
                def.name.clone(),
                DocumentFunction {
                    params: def.params.clone(),
                    body: Arc::clone(&def.body),
                },
            );
        }

        let mut out = String::new();
        let mut flow = Flow::Ran;
        for statement in &program.statements {
            match statement {
                Statement::Return(expr) => {
                    let value = self.evaluate(expr, &mut out)?;
                    let token = self.ctx.arena.push_return(value);
                    out.push_str(&token);
                    break;
                }
                Statement::Assign { target, op, expr } => {
                    let value = self.evaluate(expr, &mut out)?;
                    self.assign(target, *op, value);
                }
                Statement::Call(call) => {
                    let dispatch = self.dispatch(call, flow)?;
                    flow = dispatch.flow;
                    out.push_str(&dispatch.output);
                    if dispatch.returned {
                        let token = self
                            .ctx
                            .arena
                            .push_return(dispatch.value.unwrap_or_default());
                        out.push_str(&token);
                        break;
                    }
                }
            }
        }
        Ok(out)
    }

    /// Stores `value` at the variable path `target`. With an operator the
    /// current value is combined with `value`; an unset variable or an
    /// unsupported combination leaves the variable unchanged.
    pub fn assign(&mut self, target: &str, op: Option<Operator>, value: Value) {
        let segments = parse_path(target);
        let value = match op {
            None => value,
            Some(op) => {
                let Some(current) = lookup_in(&self.ctx.vars, &segments) else {
                    return;
                };
                match current.clone().coerce().combine(op, &value) {
                    Some(combined) => combined,
                    None => return,
                }
            }
        };
        assign_path(&mut self.ctx.vars, &segments, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> (Program, Arena) {
        let mut arena = Arena::default();
        let program = Program::parse(source, &mut arena);
        (program, arena)
    }

    #[test]
    fn test_parse_assign_and_echo() {
        let (program, _) = parse("$x = 1; echo $x;");
        assert_eq!(program.statements().len(), 2);
        assert!(matches!(
            &program.statements()[0],
            Statement::Assign { target, op: None, expr } if target == "x" && expr == "1"
        ));
        assert!(matches!(
            &program.statements()[1],
            Statement::Call(Call { name, args, .. }) if name == "echo" && args == &["$x".to_string()]
        ));
    }

    #[test]
    fn test_compound_assign_operators() {
        let (program, _) = parse("$a.b += 2; $s .= 'x'; $n-=1;");
        let ops: Vec<_> = program
            .statements()
            .iter()
            .map(|s| match s {
                Statement::Assign { target, op, .. } => (target.clone(), *op),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(
            ops,
            vec![
                ("a.b".to_string(), Some(Operator::Add)),
                ("s".to_string(), Some(Operator::Concat)),
                ("n".to_string(), Some(Operator::Sub)),
            ]
        );
    }

    #[test]
    fn test_if_else_blocks() {
        let (program, _) = parse("if($x){ echo 'a'; } else { echo 'b'; }");
        let calls: Vec<_> = program
            .statements()
            .iter()
            .map(|s| match s {
                Statement::Call(call) => (call.else_branch, call.name.clone(), call.body.is_some()),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(
            calls,
            vec![(false, "if".to_string(), true), (true, "if".to_string(), true)]
        );
    }

    #[test]
    fn test_comments_removed_but_strings_kept() {
        let (program, arena) = parse("// note\n$u = 'http://x'; /* block */ echo $u;");
        assert_eq!(program.statements().len(), 2);
        match &program.statements()[0] {
            Statement::Assign { expr, .. } => assert_eq!(arena.restore(expr), "'http://x'"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_function_definitions_hoisted() {
        let (program, _) = parse("echo add(1, 2); function add($a, $b){ return $a + $b; }");
        assert_eq!(program.functions().len(), 1);
        assert_eq!(program.functions()[0].params, vec!["a", "b"]);
        assert_eq!(program.statements().len(), 1);
    }

    #[test]
    fn test_nested_body_source() {
        let (program, _) = parse("each($list, $item){ if($item){ echo $item; } }");
        match &program.statements()[0] {
            Statement::Call(call) => {
                let body = call.body.as_ref().unwrap();
                assert_eq!(body.source(), "if($item){echo $item;}");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_string_with_semicolon_and_braces() {
        let (program, _) = parse("echo 'a;{b}';");
        assert_eq!(program.statements().len(), 1);
    }

    #[test]
    fn test_deep_nesting_is_bounded() {
        let source = format!("{}x{}", "{".repeat(3000), "}".repeat(3000));
        let (program, _) = parse(&source);
        assert!(program.statements().len() <= 1);
    }
}
