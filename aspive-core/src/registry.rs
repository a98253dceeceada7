//! Tag functions: the registry of built-in callables and the dispatch
//! protocol shared by statements and inline calls.

use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::builtins;
use crate::context::Session;
use crate::error::Result;
use crate::interpreter::{Call, Program};
use crate::value::Value;

// ============================================================================
// Control flow
// ============================================================================

/// Outcome of a call as seen by the next sibling statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// The call ran.
    Ran,
    /// An `else` call was skipped because the previous call did not signal.
    Skipped,
    /// The call asked a following `else` call to run.
    SignaledElse,
}

// ============================================================================
// Tag functions
// ============================================================================

/// Behavior flags of a tag function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagFlags {
    /// The `{ }` body is passed to the callback.
    pub has_content: bool,
    /// The callback result becomes the call's value.
    pub return_result: bool,
    /// The callback result is not written to the output.
    pub no_echo: bool,
}

impl TagFlags {
    pub fn with_content(mut self) -> Self {
        self.has_content = true;
        self
    }

    pub fn return_result(mut self) -> Self {
        self.return_result = true;
        self
    }

    pub fn no_echo(mut self) -> Self {
        self.no_echo = true;
        self
    }
}

/// What a tag callback produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TagResult {
    Output(Value),
    /// Run a following `else` call. `Output(Value::Bool(false))` signals the same.
    Else,
    Nothing,
}

impl From<String> for TagResult {
    fn from(text: String) -> Self {
        TagResult::Output(Value::String(text))
    }
}

impl From<&str> for TagResult {
    fn from(text: &str) -> Self {
        TagResult::Output(Value::from(text))
    }
}

impl From<Value> for TagResult {
    fn from(value: Value) -> Self {
        TagResult::Output(value)
    }
}

pub type TagCallback =
    Arc<dyn Fn(&mut Session<'_>, &Attrs, Option<&Program>) -> Result<TagResult> + Send + Sync>;

#[derive(Clone)]
pub struct TagFunction {
    pub name: String,
    /// Names given to positional arguments, in order.
    pub attrs: Vec<String>,
    pub flags: TagFlags,
    pub callback: TagCallback,
}

impl fmt::Debug for TagFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagFunction")
            .field("name", &self.name)
            .field("attrs", &self.attrs)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// Positional call arguments keyed by attribute name. Arguments beyond the
/// declared names are keyed by their index.
///
/// Values are the unevaluated argument text; callbacks resolve what they need.
#[derive(Debug, Clone, Default)]
pub struct Attrs {
    values: IndexMap<String, String>,
}

impl Attrs {
    pub fn bind(names: &[String], args: &[String]) -> Self {
        let values = args
            .iter()
            .enumerate()
            .map(|(i, arg)| {
                let key = names.get(i).cloned().unwrap_or_else(|| i.to_string());
                (key, arg.clone())
            })
            .collect();
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Built-in and host-registered tag functions. Read-only once the engine is
/// built; document functions live in the render context instead.
#[derive(Debug, Clone, Default)]
pub struct TagRegistry {
    functions: HashMap<String, TagFunction>,
}

impl TagRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in tag functions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtins::register_all(&mut registry);
        registry
    }

    /// Registers `callback` under `name`, replacing any earlier entry.
    pub fn register<F>(&mut self, name: &str, attrs: &[&str], flags: TagFlags, callback: F)
    where
        F: Fn(&mut Session<'_>, &Attrs, Option<&Program>) -> Result<TagResult>
            + Send
            + Sync
            + 'static,
    {
        self.functions.insert(
            name.to_string(),
            TagFunction {
                name: name.to_string(),
                attrs: attrs.iter().map(|a| a.to_string()).collect(),
                flags,
                callback: Arc::new(callback),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&TagFunction> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Result of dispatching one call.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub output: String,
    pub value: Option<Value>,
    pub flow: Flow,
    /// A `return` ran inside the call's body; the caller must stop too.
    pub returned: bool,
}

impl Default for Dispatch {
    fn default() -> Self {
        Self {
            output: String::new(),
            value: None,
            flow: Flow::Ran,
            returned: false,
        }
    }
}

impl Session<'_> {
    /// Runs `call`. Document functions shadow registered tag functions; an
    /// `else` call runs only when `previous` signaled it.
    pub fn dispatch(&mut self, call: &Call, previous: Flow) -> Result<Dispatch> {
        if call.else_branch && previous != Flow::SignaledElse {
            return Ok(Dispatch {
                flow: Flow::Skipped,
                ..Dispatch::default()
            });
        }

        if let Some(function) = self.ctx.functions.get(&call.name).cloned() {
            let mut output = String::new();
            let mut values = Vec::with_capacity(call.args.len());
            for arg in &call.args {
                values.push(self.evaluate(arg, &mut output)?);
            }
            let params = &function.params;
            let mut text = self.scoped_temps(params, |session| {
                for (i, param) in params.iter().enumerate() {
                    let value = values.get(i).cloned().unwrap_or_default();
                    session.ctx.temp_vars.insert(param.clone(), value);
                }
                session.run_program(&function.body)
            })?;
            let value = self.ctx.arena.extract_return(&mut text);
            output.push_str(&text);
            return Ok(Dispatch {
                output,
                value,
                ..Dispatch::default()
            });
        }

        let engine = self.engine();
        let Some(tag) = engine.registry().get(&call.name) else {
            debug!(name = %call.name, "call to unknown function");
            return Ok(Dispatch::default());
        };

        let attrs = Attrs::bind(&tag.attrs, &call.args);
        let body = if tag.flags.has_content {
            call.body.as_deref()
        } else {
            None
        };

        let mut dispatch = Dispatch::default();
        match (tag.callback)(self, &attrs, body)? {
            TagResult::Else | TagResult::Output(Value::Bool(false)) => {
                dispatch.flow = Flow::SignaledElse;
                if tag.flags.return_result {
                    dispatch.value = Some(Value::Bool(false));
                }
            }
            TagResult::Nothing => {}
            TagResult::Output(value) => {
                let mut output = match &value {
                    Value::String(text) => text.clone(),
                    other => other.to_text(),
                };
                if let Some(returned) = self.ctx.arena.extract_return(&mut output) {
                    dispatch.value = Some(returned);
                    dispatch.returned = true;
                } else if tag.flags.return_result {
                    dispatch.value = Some(value);
                }
                if !tag.flags.no_echo {
                    dispatch.output = output;
                }
            }
        }
        Ok(dispatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderOptions;
    use crate::pipeline::Engine;

    fn run(engine: &Engine, script: &str) -> String {
        let mut session = Session::new(engine, &RenderOptions::new());
        session.run_scripts(&format!("<? {} ?>", script)).unwrap()
    }

    #[test]
    fn test_attrs_bind_extra_by_index() {
        let names = vec!["a".to_string()];
        let args = vec!["1".to_string(), "2".to_string(), "3".to_string()];
        let attrs = Attrs::bind(&names, &args);
        assert_eq!(attrs.get("a"), Some("1"));
        assert_eq!(attrs.get("1"), Some("2"));
        assert_eq!(attrs.get("2"), Some("3"));
        assert_eq!(attrs.len(), 3);
    }

    #[test]
    fn test_builtins_registered() {
        let registry = TagRegistry::with_builtins();
        for name in ["echo", "echo_html", "if", "each", "import", "setUserVar", "typeof", "log"] {
            assert!(registry.contains(name), "missing {}", name);
        }
        let names = registry.names();
        assert!(names.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn test_custom_tag_receives_attrs() {
        let engine = Engine::builder()
            .register("greet", &["name"], TagFlags::default(), |session, attrs, _| {
                let name = session.resolve_text(attrs.get("name").unwrap_or_default());
                Ok(format!("Hello {}", name).into())
            })
            .build()
            .unwrap();
        assert_eq!(run(&engine, "$who = 'Ada'; greet($who);"), "Hello Ada");
        assert_eq!(run(&engine, "greet('Bob');"), "Hello Bob");
    }

    #[test]
    fn test_return_result_and_no_echo() {
        let engine = Engine::builder()
            .register(
                "twice",
                &["n"],
                TagFlags::default().return_result().no_echo(),
                |session, attrs, _| {
                    let mut out = String::new();
                    let n = session.evaluate(attrs.get("n").unwrap_or_default(), &mut out)?;
                    Ok(Value::Number(n.as_number().unwrap_or(0.0) * 2.0).into())
                },
            )
            .build()
            .unwrap();
        assert_eq!(run(&engine, "$x = twice(21); echo $x;"), "42");
        assert_eq!(run(&engine, "twice(1);"), "");
    }

    #[test]
    fn test_else_runs_only_after_signal() {
        let engine = Engine::builder()
            .register("never", &[], TagFlags::default(), |_, _, _| Ok(TagResult::Else))
            .build()
            .unwrap();
        assert_eq!(run(&engine, "never(); else { echo 'b'; }"), "b");
        assert_eq!(run(&engine, "echo 'a'; else { echo 'b'; }"), "a");
    }

    #[test]
    fn test_document_function_shadows_registry() {
        let engine = Engine::builder()
            .register("greet", &[], TagFlags::default(), |_, _, _| Ok("builtin".into()))
            .build()
            .unwrap();
        let out = run(&engine, "function greet($n){ echo 'doc ' . $n; } greet('x');");
        assert_eq!(out, "doc x");
    }

    #[test]
    fn test_unknown_call_is_silent() {
        let engine = Engine::new();
        assert_eq!(run(&engine, "nothing_here(1, 2); echo 'ok';"), "ok");
    }

    #[test]
    fn test_dispatch_skips_else_without_signal() {
        let engine = Engine::new();
        let mut session = Session::new(&engine, &RenderOptions::new());
        let call = Call {
            else_branch: true,
            name: "echo".to_string(),
            args: vec!["'x'".to_string()],
            body: None,
        };
        let dispatch = session.dispatch(&call, Flow::Ran).unwrap();
        assert_eq!(dispatch.flow, Flow::Skipped);
        assert!(dispatch.output.is_empty());
    }
}
