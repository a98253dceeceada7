//! Runtime value model for template scripts.
//!
//! Script variables, options and request scopes all hold [`Value`]s. Maps keep
//! insertion order so `each` iterates keys the way they were written.

use indexmap::IndexMap;
use std::cmp::Ordering;
use std::fmt;

/// Ordered string-keyed map used for objects.
pub type Map = IndexMap<String, Value>;

/// Upper bound on the length of a string produced by `*` repetition.
const MAX_REPEAT_LEN: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Map(Map),
}

/// Binary operators shared by expression folding and compound assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Add,
    Concat,
    Sub,
    Mul,
    Div,
}

impl Operator {
    pub fn from_symbol(symbol: char) -> Option<Self> {
        match symbol {
            '+' => Some(Operator::Add),
            '.' => Some(Operator::Concat),
            '-' => Some(Operator::Sub),
            '*' => Some(Operator::Mul),
            '/' => Some(Operator::Div),
            _ => None,
        }
    }

    pub fn symbol(self) -> char {
        match self {
            Operator::Add => '+',
            Operator::Concat => '.',
            Operator::Sub => '-',
            Operator::Mul => '*',
            Operator::Div => '/',
        }
    }
}

impl Value {
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Strings, numbers and booleans.
    pub fn is_scalar(&self) -> bool {
        matches!(self, Value::String(_) | Value::Number(_) | Value::Bool(_))
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::List(_) | Value::Map(_) => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Text form of a scalar. Composite and empty values render as "".
    pub fn to_text(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Number(n) => format_number(*n),
            Value::Bool(b) => b.to_string(),
            _ => String::new(),
        }
    }

    /// Text form used by `{{ }}` tags: `false` and non-scalars collapse to "".
    pub fn flatten(&self) -> String {
        match self {
            Value::Bool(false) => String::new(),
            other => other.to_text(),
        }
    }

    /// Converts numeric-looking strings and the keywords `true`, `false`,
    /// `null` and `undefined` into typed values.
    pub fn coerce(self) -> Value {
        match self {
            Value::String(s) => {
                let typed = match s.as_str() {
                    "true" => Some(Value::Bool(true)),
                    "false" => Some(Value::Bool(false)),
                    "null" => Some(Value::Null),
                    "undefined" => Some(Value::Undefined),
                    text if is_numeric(text) => text.parse().ok().map(Value::Number),
                    _ => None,
                };
                typed.unwrap_or(Value::String(s))
            }
            other => other,
        }
    }

    /// The JavaScript-style `typeof` name.
    pub fn js_typeof(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Null | Value::List(_) | Value::Map(_) => "object",
        }
    }

    /// A finer type name that separates arrays and null from objects.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::List(_) => "array",
            other => other.js_typeof(),
        }
    }

    /// Key/value pairs visited by `each`. Lists yield their indices, maps
    /// their keys, and a lone string or number is treated as a one-element list.
    pub fn entries(&self) -> Vec<(Value, Value)> {
        match self {
            Value::Map(map) => map
                .iter()
                .map(|(k, v)| (Value::String(k.clone()), v.clone()))
                .collect(),
            Value::List(items) => items
                .iter()
                .enumerate()
                .map(|(i, v)| (Value::Number(i as f64), v.clone()))
                .collect(),
            Value::String(_) | Value::Number(_) => vec![(Value::Number(0.0), self.clone())],
            _ => Vec::new(),
        }
    }

    /// Applies `op` with `rhs` on the right. `None` means the operation is a
    /// no-op for these operand types and the caller keeps the old value.
    pub fn combine(&self, op: Operator, rhs: &Value) -> Option<Value> {
        if rhs.is_undefined() {
            return None;
        }
        match self {
            Value::List(items) => {
                let mut items = items.clone();
                match op {
                    Operator::Add | Operator::Concat | Operator::Mul => items.push(rhs.clone()),
                    Operator::Sub | Operator::Div => {
                        if let Some(pos) = items.iter().position(|item| item == rhs) {
                            items.remove(pos);
                        }
                    }
                }
                Some(Value::List(items))
            }
            Value::Map(map) => match (op, rhs) {
                (Operator::Add | Operator::Concat | Operator::Mul, Value::Map(other)) => {
                    let mut merged = map.clone();
                    for (k, v) in other {
                        merged.insert(k.clone(), v.clone());
                    }
                    Some(Value::Map(merged))
                }
                (Operator::Sub | Operator::Div, Value::Map(other)) => {
                    Some(Value::Map(remove_values(map, other.values())))
                }
                (Operator::Sub | Operator::Div, Value::List(list)) => {
                    Some(Value::Map(remove_values(map, list.iter())))
                }
                (Operator::Sub | Operator::Div, scalar) if scalar.is_scalar() => {
                    Some(Value::Map(remove_values(map, std::iter::once(scalar))))
                }
                _ => None,
            },
            lhs if lhs.is_scalar() && rhs.is_scalar() => combine_scalars(lhs, op, rhs),
            _ => None,
        }
    }

    /// Ordering used by `<`, `>`, `<=` and `>=` in conditions.
    pub fn loose_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Number(a), Value::Bool(b)) => a.partial_cmp(&f64::from(u8::from(*b))),
            (Value::Bool(a), Value::Number(b)) => f64::from(u8::from(*a)).partial_cmp(b),
            (Value::Number(a), Value::String(b)) => b.trim().parse::<f64>().ok().and_then(|b| a.partial_cmp(&b)),
            (Value::String(a), Value::Number(b)) => a.trim().parse::<f64>().ok().and_then(|a| a.partial_cmp(b)),
            _ => None,
        }
    }
}

fn combine_scalars(lhs: &Value, op: Operator, rhs: &Value) -> Option<Value> {
    if let (Value::Number(a), Value::Number(b)) = (lhs, rhs) {
        let n = match op {
            Operator::Add | Operator::Concat => a + b,
            Operator::Sub => a - b,
            Operator::Mul => a * b,
            Operator::Div => a / b,
        };
        return Some(Value::Number(n));
    }

    let left = lhs.to_text();
    let right = rhs.to_text();
    let text = match op {
        Operator::Add | Operator::Concat => left + &right,
        Operator::Sub => left.replacen(&right, "", 1),
        Operator::Mul => match (lhs, rhs) {
            (Value::String(s), Value::Number(n)) => {
                if !n.is_finite() || *n < 0.0 {
                    return None;
                }
                let count = n.trunc() as usize;
                if s.len().saturating_mul(count) > MAX_REPEAT_LEN {
                    return None;
                }
                s.repeat(count)
            }
            _ => left + &right,
        },
        Operator::Div => {
            if right.is_empty() {
                left
            } else {
                left.replace(&right, "")
            }
        }
    };
    Some(Value::String(text))
}

/// Removes, for each needle, the first key whose value equals it.
fn remove_values<'a>(map: &Map, needles: impl Iterator<Item = &'a Value>) -> Map {
    let mut map = map.clone();
    for needle in needles {
        if let Some(index) = map.values().position(|v| v == needle) {
            map.shift_remove_index(index);
        }
    }
    map
}

/// `true` for text of the form `-?[0-9]+(\.[0-9]+)?`.
pub fn is_numeric(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    let (int, frac) = match digits.split_once('.') {
        Some((int, frac)) => (int, Some(frac)),
        None => (digits, None),
    };
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    all_digits(int) && frac.map_or(true, all_digits)
}

/// Formats a number the way a browser would print it.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        let text = if n > 0.0 { "Infinity" } else { "-Infinity" };
        text.to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{:.0}", n)
    } else {
        n.to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::List(_) | Value::Map(_) | Value::Null => {
                let json = serde_json::Value::from(self);
                write!(f, "{}", json)
            }
            other => f.write_str(&other.to_text()),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Undefined | Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Into::into).collect()),
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.into())).collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::Map(map)
    }
}
