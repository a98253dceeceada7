//! Built-in tag functions.

use std::cmp::Ordering;
use tracing::{debug, info};

use crate::context::{strip_sentinels, Session};
use crate::error::Result;
use crate::escape::escape_html;
use crate::interpreter::Program;
use crate::registry::{Attrs, TagFlags, TagRegistry, TagResult};
use crate::resolve::{find_matching_paren, Mode};
use crate::value::{is_numeric, Value};

/// Comparison operators of `if` conditions, in matching priority.
const COMPARISONS: &[&str] = &["===", "!==", "==", "!=", ">=", "<=", "=", ">", "<"];

pub fn register_all(registry: &mut TagRegistry) {
    let content = TagFlags::default().with_content();
    registry.register("echo", &["str", "allow_html"], TagFlags::default(), echo);
    registry.register("echo_html", &["str"], TagFlags::default(), echo_html);
    registry.register("if", &["logic"], content, if_tag);
    registry.register("each", &["obj", "as", "of", "from"], content, each);
    registry.register("import", &["path"], TagFlags::default(), import);
    registry.register("setUserVar", &["name", "value"], TagFlags::default(), set_user_var);
    registry.register(
        "typeof",
        &["var", "literal"],
        TagFlags::default().return_result().no_echo(),
        type_of,
    );
    registry.register("log", &[], TagFlags::default(), log);
}

fn echo(session: &mut Session<'_>, attrs: &Attrs, _: Option<&Program>) -> Result<TagResult> {
    let allow_html = attrs
        .get("allow_html")
        .is_some_and(|arg| session.resolve(arg, Mode::Value).is_truthy());
    write_value(session, attrs.get("str"), allow_html)
}

fn echo_html(session: &mut Session<'_>, attrs: &Attrs, _: Option<&Program>) -> Result<TagResult> {
    write_value(session, attrs.get("str"), true)
}

/// Evaluates `expr` and returns its text. Unless `allow_html`, the text is
/// escaped; otherwise any script regions it contains are run.
fn write_value(session: &mut Session<'_>, expr: Option<&str>, allow_html: bool) -> Result<TagResult> {
    let Some(expr) = expr else {
        return Ok(TagResult::Nothing);
    };
    let mut out = String::new();
    let text = session.evaluate(expr, &mut out)?.to_text();
    if !allow_html {
        out.push_str(&escape_html(&text));
    } else if text.contains("<?") {
        let text = strip_sentinels(&text);
        let rendered = session
            .nested(|s| s.run_scripts(&text))
            .transpose()?
            .unwrap_or_default();
        out.push_str(&rendered);
    } else {
        out.push_str(&text);
    }
    Ok(out.into())
}

// `if(logic){ body }`: `&` and `|` fold left to right with no precedence
// beyond parentheses. An operand whose result cannot change the outcome is
// skipped, not evaluated.

enum LogicPiece<'a> {
    Operand(&'a str),
    Op(char),
}

fn split_logic(text: &str) -> Vec<LogicPiece<'_>> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            '&' | '|' if depth == 0 => {
                let operand = text[start..i].trim();
                if !operand.is_empty() {
                    pieces.push(LogicPiece::Operand(operand));
                }
                if !matches!(pieces.last(), Some(LogicPiece::Op(_))) {
                    pieces.push(LogicPiece::Op(c));
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    let operand = text[start..].trim();
    if !operand.is_empty() {
        pieces.push(LogicPiece::Operand(operand));
    }
    pieces
}

fn check_logic(session: &mut Session<'_>, logic: &str, out: &mut String) -> Result<bool> {
    let mut result = false;
    let mut pending = None;
    for piece in split_logic(logic) {
        match piece {
            LogicPiece::Op(op) => pending = Some(op),
            LogicPiece::Operand(operand) => {
                let run = match pending {
                    None => true,
                    Some('&') => result,
                    Some(_) => !result,
                };
                if run {
                    result = check_operand(session, operand, out)?;
                }
            }
        }
    }
    Ok(result)
}

fn check_operand(session: &mut Session<'_>, operand: &str, out: &mut String) -> Result<bool> {
    let mut text = operand.trim();
    let mut negate = false;
    while let Some(rest) = text.strip_prefix('!') {
        negate = !negate;
        text = rest.trim_start();
    }
    let wrapped = text.starts_with('(') && find_matching_paren(text, 0) == Some(text.len() - 1);
    let result = if wrapped {
        session
            .nested(|s| check_logic(s, &text[1..text.len() - 1], out))
            .transpose()?
            .unwrap_or(false)
    } else {
        check_condition(session, text, out)?
    };
    Ok(result != negate)
}

fn check_condition(session: &mut Session<'_>, text: &str, out: &mut String) -> Result<bool> {
    for op in COMPARISONS {
        if let Some((left, right)) = text.split_once(op) {
            let left = condition_value(session, left, out)?;
            let right = condition_value(session, right, out)?;
            let ordering = left.loose_cmp(&right);
            return Ok(match *op {
                "===" | "==" | "=" => left == right,
                "!==" | "!=" => left != right,
                ">=" => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
                "<=" => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
                ">" => ordering == Some(Ordering::Greater),
                _ => ordering == Some(Ordering::Less),
            });
        }
    }
    let value = condition_value(session, text, out)?;
    Ok(value.is_truthy() || value == Value::Number(0.0))
}

/// Resolves one side of a condition. Lists and maps count as whether they
/// are non-empty.
fn condition_value(session: &mut Session<'_>, text: &str, out: &mut String) -> Result<Value> {
    Ok(match session.evaluate(text.trim(), out)? {
        Value::List(items) => Value::Bool(!items.is_empty()),
        Value::Map(map) => Value::Bool(!map.is_empty()),
        other => other,
    })
}

fn if_tag(session: &mut Session<'_>, attrs: &Attrs, body: Option<&Program>) -> Result<TagResult> {
    let (Some(logic), Some(body)) = (attrs.get("logic"), body) else {
        return Ok(TagResult::Else);
    };
    let mut out = String::new();
    if !check_logic(session, logic, &mut out)? {
        return Ok(TagResult::Else);
    }
    out.push_str(&session.run_program(body)?);
    Ok(out.into())
}

/// Name of a loop binding such as `$item`.
fn binding(attrs: &Attrs, name: &str) -> Option<String> {
    attrs
        .get(name)
        .map(|arg| arg.trim().trim_start_matches('$').to_string())
        .filter(|arg| !arg.is_empty())
}

fn each(session: &mut Session<'_>, attrs: &Attrs, body: Option<&Program>) -> Result<TagResult> {
    let (Some(sources), Some(body)) = (attrs.get("obj"), body) else {
        return Ok(TagResult::Nothing);
    };
    let item = binding(attrs, "as");
    let index = binding(attrs, "of");
    let from = binding(attrs, "from");
    let names: Vec<String> = [&item, &index, &from].into_iter().flatten().cloned().collect();

    let result = session.scoped_temps(&names, |session| -> Result<String> {
        let mut out = String::new();
        for source in crate::resolve::split_top_level(sources, '&') {
            let source = source.trim();
            if source.is_empty() {
                continue;
            }
            if let Some(from) = &from {
                let restored = session.ctx.arena.restore(source);
                let name = restored.rsplit('.').next().unwrap_or_default().to_string();
                session.ctx.temp_vars.insert(from.clone(), Value::String(name));
            }
            let collection = session.evaluate(source, &mut out)?;
            for (key, value) in collection.entries() {
                if let Some(item) = &item {
                    session.ctx.temp_vars.insert(item.clone(), value);
                }
                if let Some(index) = &index {
                    session.ctx.temp_vars.insert(index.clone(), key);
                }
                let chunk = session.run_program(body)?;
                let returned = crate::context::contains_return_token(&chunk);
                out.push_str(&chunk);
                if returned {
                    return Ok(out);
                }
            }
        }
        Ok(out)
    })?;
    Ok(result.into())
}

fn import(session: &mut Session<'_>, attrs: &Attrs, _: Option<&Program>) -> Result<TagResult> {
    let Some(arg) = attrs.get("path") else {
        return Ok(TagResult::Nothing);
    };
    let mut out = String::new();
    let mut name = session.evaluate(arg, &mut out)?.to_text();
    if name.trim().is_empty() {
        name = session
            .ctx
            .arena
            .restore(arg)
            .trim()
            .trim_matches(|c| c == '\'' || c == '"')
            .to_string();
    }

    let engine = session.engine();
    let Some(loader) = engine.loader() else {
        debug!(view = %name, "import without a views directory");
        return Ok(out.into());
    };
    let Some(text) = loader.load(&name, engine.cache(), session.ctx.cache_ttl)? else {
        return Ok(out.into());
    };

    let text = engine.close_tags(&format!("\n{}\n", strip_sentinels(&text)));
    let mut rendered = session
        .nested(|s| s.run_scripts(&text))
        .transpose()?
        .unwrap_or_default();
    session.ctx.arena.extract_return(&mut rendered);
    out.push_str(&rendered);
    Ok(out.into())
}

fn set_user_var(session: &mut Session<'_>, attrs: &Attrs, _: Option<&Program>) -> Result<TagResult> {
    let (Some(name), Some(value)) = (attrs.get("name"), attrs.get("value")) else {
        return Ok(TagResult::Nothing);
    };
    let name = session.resolve_text(name);
    if name.is_empty() {
        return Ok(TagResult::Nothing);
    }
    let value = session.resolve_text(value);
    session.ctx.user_vars.insert(name, value);
    Ok(TagResult::Nothing)
}

fn type_of(session: &mut Session<'_>, attrs: &Attrs, _: Option<&Program>) -> Result<TagResult> {
    let Some(arg) = attrs.get("var") else {
        return Ok(Value::from("undefined").into());
    };
    let mut out = String::new();
    let value = session.evaluate(arg, &mut out)?;
    let literal = attrs
        .get("literal")
        .is_some_and(|arg| session.resolve(arg, Mode::Value).is_truthy());
    if literal {
        return Ok(Value::from(value.js_typeof()).into());
    }

    let value = match value {
        Value::String(text) => match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(parsed) => Value::from(parsed),
            Err(_) => Value::String(text),
        },
        other => other,
    };
    let name = match &value {
        Value::String(text) => match text.as_str() {
            "true" | "false" => "boolean",
            "undefined" => "undefined",
            "null" => "null",
            text if is_numeric(text) => "number",
            _ => "string",
        },
        other => other.type_name(),
    };
    Ok(Value::from(name).into())
}

fn log(session: &mut Session<'_>, attrs: &Attrs, _: Option<&Program>) -> Result<TagResult> {
    for (_, arg) in attrs.iter() {
        let value = session.resolve(arg, Mode::Value);
        info!(expr = %session.ctx.arena.restore(arg), value = %value, "log");
    }
    Ok(TagResult::Nothing)
}

#[cfg(test)]
mod tests {
    use crate::config::RenderOptions;
    use crate::context::Session;
    use crate::pipeline::Engine;
    use crate::value::Value;
    use serde_json::json;

    fn run_with(options: serde_json::Value, script: &str) -> String {
        let engine = Engine::new();
        let options = RenderOptions::from_json(options).unwrap();
        let mut session = Session::new(&engine, &options);
        session.run_scripts(&format!("<? {} ?>", script)).unwrap()
    }

    fn run(script: &str) -> String {
        run_with(json!({}), script)
    }

    #[test]
    fn test_echo_escapes() {
        assert_eq!(run("echo '<b>';"), "&lt;b&gt;");
        assert_eq!(run("echo_html '<b>';"), "<b>");
        assert_eq!(run("echo('<i>', true);"), "<i>");
        assert_eq!(run("echo $missing;"), "");
    }

    #[test]
    fn test_echo_html_runs_embedded_scripts() {
        let options = json!({"opts": {"s": "<? echo 1 + 1; ?>"}});
        assert_eq!(run_with(options, "echo_html $Opts.s;"), "2");
    }

    #[test]
    fn test_if_comparisons() {
        assert_eq!(run("$x = 5; if($x > 3){ echo 'big'; }"), "big");
        assert_eq!(run("$x = 5; if($x == '5'){ echo 'eq'; }"), "eq");
        assert_eq!(run("$x = 5; if($x != 5){ echo 'ne'; } else { echo 'same'; }"), "same");
        assert_eq!(run("$x = 'a'; if($x === 'a'){ echo 'yes'; }"), "yes");
        assert_eq!(run("if(2 <= 1){ echo 'no'; } else { echo 'ok'; }"), "ok");
    }

    #[test]
    fn test_if_boolean_grammar() {
        assert_eq!(run("$a = 1; $b = false; if($a & !$b){ echo 'y'; }"), "y");
        assert_eq!(run("if($none | true){ echo 'y'; }"), "y");
        assert_eq!(run("if(!($none | false)){ echo 'y'; }"), "y");
        assert_eq!(run("if($none && true){ echo 'y'; } else { echo 'n'; }"), "n");
        assert_eq!(run("if(false & $x | true){ echo 'y'; }"), "y");
    }

    #[test]
    fn test_if_zero_counts_as_set() {
        assert_eq!(run("$n = 0; if($n){ echo 'set'; }"), "set");
        assert_eq!(run("if($unset){ echo 'set'; } else { echo 'unset'; }"), "unset");
    }

    #[test]
    fn test_else_if_chain() {
        let script = "$x = 2; if($x = 1){ echo 'one'; } else if($x = 2){ echo 'two'; } else { echo 'other'; }";
        assert_eq!(run(script), "two");
    }

    #[test]
    fn test_each_map_and_cleanup() {
        let out = run_with(
            json!({"opts": {"list": {"a": 1, "b": 2}}}),
            "each($Opts.list, $item, $key, $from){ echo_html $from . ':' . $key . '=' . $item . ';'; } echo $item;",
        );
        assert_eq!(out, "list:a=1;list:b=2;");
    }

    #[test]
    fn test_each_list_and_multiple_sources() {
        let out = run("$a = [1, 2]; $b = ['x']; each($a & $b, $v){ echo $v; }");
        assert_eq!(out, "12x");
    }

    #[test]
    fn test_each_stops_on_return() {
        let engine = Engine::new();
        let mut session = Session::new(&engine, &RenderOptions::new());
        let out = session
            .run_scripts("<? function first($l){ each($l, $v){ return $v; } } $f = first([7, 8]); echo $f; ?>")
            .unwrap();
        assert_eq!(out, "7");
        assert!(session.ctx.temp_vars.is_empty());
    }

    #[test]
    fn test_set_user_var() {
        let engine = Engine::new();
        let mut session = Session::new(&engine, &RenderOptions::new());
        session.run_scripts("<? $n = 'Ada'; setUserVar('name', $n); ?>").unwrap();
        assert_eq!(session.ctx.user_vars.get("name").map(String::as_str), Some("Ada"));
    }

    #[test]
    fn test_typeof() {
        assert_eq!(run("$t = typeof([1]); echo $t;"), "array");
        let options = json!({"opts": {"m": {"a": 1}}});
        assert_eq!(run_with(options, "$t = typeof($Opts.m); echo $t;"), "object");
        assert_eq!(run("$t = typeof(3); echo $t;"), "number");
        assert_eq!(run("$t = typeof('hi'); echo $t;"), "string");
        assert_eq!(run("$t = typeof($nope); echo $t;"), "undefined");
        assert_eq!(run("$t = typeof([1], true); echo $t;"), "object");
        assert_eq!(run("typeof(1);"), "");
    }

    #[test]
    fn test_import_without_views_is_silent() {
        assert_eq!(run("import('header'); echo 'x';"), "x");
    }

    #[test]
    fn test_log_outputs_nothing() {
        assert_eq!(run("$x = 1; log($x, 'a');"), "");
    }

    #[test]
    fn test_user_var_lookup_in_expressions() {
        let engine = Engine::new();
        let options = RenderOptions::new().with_user_var("who", "Ada");
        let mut session = Session::new(&engine, &options);
        let out = session.run_scripts("<? echo $who; ?>").unwrap();
        assert_eq!(out, "Ada");
        assert_eq!(session.ctx.vars.get("who"), None::<&Value>);
    }
}
