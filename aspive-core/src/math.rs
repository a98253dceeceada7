//! Arithmetic evaluator for numeric runs inside script expressions.
//!
//! Supports `+ - * / ^`, postfix `!`, parentheses, the constants `pi` and `e`,
//! trigonometry in degrees (`sin cos tan asin acos atan`), `root` for square
//! roots and `pow` as an infix alias for `^`.
//!
//! Precedence (lowest to highest): additive, multiplicative, unary, power,
//! postfix, primary.

use crate::value::format_number;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    Bang,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Option<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
                continue;
            }
            '+' => tokens.push(Token::Plus),
            '-' => tokens.push(Token::Minus),
            '*' => tokens.push(Token::Star),
            '/' => tokens.push(Token::Slash),
            '^' => tokens.push(Token::Caret),
            '!' => tokens.push(Token::Bang),
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // exponent suffix: 1e5, 2.5e-3
                if i < chars.len() && chars[i] == 'e' {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        while j < chars.len() && chars[j].is_ascii_digit() {
                            j += 1;
                        }
                        i = j;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Num(text.parse().ok()?));
                continue;
            }
            c if c.is_ascii_alphabetic() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_alphabetic() {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
                continue;
            }
            _ => return None,
        }
        i += 1;
    }
    Some(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Option<f64> {
        let mut acc = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    acc += self.term()?;
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    acc -= self.term()?;
                }
                _ => return Some(acc),
            }
        }
    }

    fn term(&mut self) -> Option<f64> {
        let mut acc = self.unary()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    acc *= self.unary()?;
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    acc /= self.unary()?;
                }
                _ => return Some(acc),
            }
        }
    }

    fn unary(&mut self) -> Option<f64> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Some(-self.unary()?)
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Option<f64> {
        let base = self.postfix()?;
        match self.peek() {
            Some(Token::Caret) => {
                self.pos += 1;
                Some(base.powf(self.unary()?))
            }
            Some(Token::Ident(name)) if name == "pow" => {
                self.pos += 1;
                Some(base.powf(self.unary()?))
            }
            _ => Some(base),
        }
    }

    fn postfix(&mut self) -> Option<f64> {
        let mut value = self.primary()?;
        while self.peek() == Some(&Token::Bang) {
            self.pos += 1;
            value = factorial(value);
        }
        Some(value)
    }

    fn primary(&mut self) -> Option<f64> {
        match self.next()? {
            Token::Num(n) => Some(n),
            Token::LParen => {
                let value = self.expr()?;
                (self.next()? == Token::RParen).then_some(value)
            }
            Token::Ident(name) => match name.as_str() {
                "pi" => Some(std::f64::consts::PI),
                "e" => Some(std::f64::consts::E),
                func => {
                    let arg = self.postfix()?;
                    apply(func, arg)
                }
            },
            _ => None,
        }
    }
}

fn apply(func: &str, arg: f64) -> Option<f64> {
    let value = match func {
        "sin" => arg.to_radians().sin(),
        "cos" => arg.to_radians().cos(),
        "tan" => arg.to_radians().tan(),
        "asin" => arg.asin().to_degrees(),
        "acos" => arg.acos().to_degrees(),
        "atan" => arg.atan().to_degrees(),
        "root" => arg.sqrt(),
        _ => return None,
    };
    Some(value)
}

fn factorial(n: f64) -> f64 {
    if n < 0.0 || n.fract() != 0.0 {
        return f64::NAN;
    }
    if n > 170.0 {
        return f64::INFINITY;
    }
    (1..=n as u64).fold(1.0, |acc, k| acc * k as f64)
}

/// Evaluates an arithmetic expression. `None` if it does not parse.
pub fn evaluate(expr: &str) -> Option<f64> {
    let tokens = tokenize(expr)?;
    if tokens.is_empty() {
        return None;
    }
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.expr()?;
    (parser.pos == parser.tokens.len()).then_some(value)
}

const FUNCTIONS: &[&str] = &["pi", "e", "pow", "sin", "cos", "tan", "asin", "acos", "atan", "root"];

/// True when `expr` is written entirely in the arithmetic alphabet and has at
/// least one operand, whether or not it parses.
pub fn is_expression(expr: &str) -> bool {
    let Some(tokens) = tokenize(expr) else {
        return false;
    };
    let mut operand = false;
    for token in &tokens {
        match token {
            Token::Num(_) => operand = true,
            Token::Ident(name) if name == "pi" => operand = true,
            Token::Ident(name) if !FUNCTIONS.contains(&name.as_str()) => return false,
            _ => {}
        }
    }
    operand
}

/// Evaluates `expr` and formats the result, yielding `"NaN"` on failure.
pub fn solve(expr: &str) -> String {
    evaluate(expr).map(format_number).unwrap_or_else(|| "NaN".to_string())
}
