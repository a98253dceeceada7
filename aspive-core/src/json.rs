//! Lenient parsing of JSON-like object and array literals written in scripts.
//!
//! Accepts single or double quoted strings, unquoted keys, bare words as
//! string values and trailing commas. Anything else makes the parse fail.

use crate::value::{Map, Value};

/// Parses `text` as a lenient JSON literal. Returns `None` unless the whole
/// input is consumed.
pub fn parse_lenient(text: &str) -> Option<Value> {
    let mut parser = Parser {
        chars: text.chars().collect(),
        pos: 0,
    };
    let value = parser.value()?;
    parser.skip_ws();
    (parser.pos == parser.chars.len()).then_some(value)
}

/// Normalizes a lenient literal into strict JSON text.
pub fn normalize_json(text: &str) -> Option<String> {
    parse_lenient(text).map(|value| serde_json::Value::from(&value).to_string())
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn value(&mut self) -> Option<Value> {
        self.skip_ws();
        match self.peek()? {
            '{' => self.object(),
            '[' => self.array(),
            '"' | '\'' => self.string().map(Value::String),
            _ => self.bare(),
        }
    }

    fn object(&mut self) -> Option<Value> {
        self.bump();
        let mut map = Map::new();
        loop {
            if self.eat('}') {
                return Some(Value::Map(map));
            }
            self.skip_ws();
            let key = match self.peek()? {
                '"' | '\'' => self.string()?,
                _ => self.word(&[':'])?,
            };
            if !self.eat(':') {
                return None;
            }
            let value = self.value()?;
            map.insert(key, value);
            if !self.eat(',') {
                return self.eat('}').then_some(Value::Map(map));
            }
        }
    }

    fn array(&mut self) -> Option<Value> {
        self.bump();
        let mut items = Vec::new();
        loop {
            if self.eat(']') {
                return Some(Value::List(items));
            }
            items.push(self.value()?);
            if !self.eat(',') {
                return self.eat(']').then_some(Value::List(items));
            }
        }
    }

    fn string(&mut self) -> Option<String> {
        let quote = self.bump()?;
        let mut out = String::new();
        loop {
            match self.bump()? {
                '\\' => match self.bump()? {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    other => out.push(other),
                },
                c if c == quote => return Some(out),
                c => out.push(c),
            }
        }
    }

    /// Text up to the next structural character, trimmed.
    fn word(&mut self, stops: &[char]) -> Option<String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if stops.contains(&c) || matches!(c, ',' | '{' | '}' | '[' | ']') {
                break;
            }
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();
        let word = word.trim();
        (!word.is_empty()).then(|| word.to_string())
    }

    fn bare(&mut self) -> Option<Value> {
        let word = self.word(&[])?;
        let value = match word.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            "null" => Value::Null,
            _ => match word.parse::<f64>() {
                Ok(n) if !word.starts_with(['+', '.']) && n.is_finite() => Value::Number(n),
                _ => Value::String(word),
            },
        };
        Some(value)
    }
}
