//! Validation for regular expressions assembled at runtime.
//!
//! Patterns built from user-influenced input go through [`compile`], which
//! rejects nested unbounded repetition such as `(a+)+` and patterns with an
//! excessive number of repetition operators.

use regex::{Regex, RegexBuilder};
use tracing::warn;

/// Maximum number of repetition operators in one pattern.
pub const MAX_REPETITIONS: usize = 25;

/// Compiled program size limit for runtime patterns.
const SIZE_LIMIT: usize = 1 << 20;

/// Returns `true` when `pattern` has unbounded-repetition star height of at
/// most one and no more than [`MAX_REPETITIONS`] repetition operators.
pub fn is_safe(pattern: &str) -> bool {
    // Each open group tracks whether it contains an unbounded repetition.
    let mut groups: Vec<bool> = vec![false];
    // Whether the previous atom was a group containing unbounded repetition.
    let mut last_group_unbounded = false;
    let mut repetitions = 0;

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        let mut closed_unbounded = false;
        match c {
            '\\' => {
                chars.next();
            }
            '[' => {
                // skip the character class body
                if chars.peek() == Some(&']') {
                    chars.next();
                }
                let mut escaped = false;
                for c in chars.by_ref() {
                    if escaped {
                        escaped = false;
                    } else if c == '\\' {
                        escaped = true;
                    } else if c == ']' {
                        break;
                    }
                }
            }
            '(' => groups.push(false),
            ')' => {
                let inner = groups.pop().unwrap_or(false);
                if groups.is_empty() {
                    return false;
                }
                closed_unbounded = inner;
                if inner {
                    if let Some(outer) = groups.last_mut() {
                        *outer = true;
                    }
                }
            }
            '*' | '+' | '?' | '{' => {
                let unbounded = match c {
                    '*' | '+' => true,
                    '?' => false,
                    _ => {
                        let mut body = String::new();
                        for c in chars.by_ref() {
                            if c == '}' {
                                break;
                            }
                            body.push(c);
                        }
                        body.ends_with(',')
                    }
                };
                // lazy/possessive suffix
                if chars.peek() == Some(&'?') && c != '?' {
                    chars.next();
                }
                repetitions += 1;
                if repetitions > MAX_REPETITIONS {
                    return false;
                }
                if unbounded {
                    if last_group_unbounded {
                        return false;
                    }
                    if let Some(current) = groups.last_mut() {
                        *current = true;
                    }
                }
            }
            _ => {}
        }
        last_group_unbounded = closed_unbounded;
    }
    groups.len() == 1
}

/// Compiles `pattern` if it passes [`is_safe`] and the regex parser.
pub fn compile(pattern: &str) -> Option<Regex> {
    if !is_safe(pattern) {
        warn!(pattern, "rejected unsafe pattern");
        return None;
    }
    match RegexBuilder::new(pattern).size_limit(SIZE_LIMIT).build() {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(pattern, error = %e, "invalid pattern");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_patterns_are_safe() {
        assert!(is_safe(r"a+b*"));
        assert!(is_safe(r"<(style|script)(?:\s[^>]*)?>"));
        assert!(is_safe(r"\(a+\)+"));
        assert!(is_safe(r"(ab)+"));
    }

    #[test]
    fn test_nested_repetition_is_unsafe() {
        assert!(!is_safe(r"(a+)+"));
        assert!(!is_safe(r"(a*)*"));
        assert!(!is_safe(r"((ab)*c)+"));
        assert!(!is_safe(r"(x{2,})*"));
    }

    #[test]
    fn test_too_many_repetitions() {
        let pattern = "a*".repeat(MAX_REPETITIONS + 1);
        assert!(!is_safe(&pattern));
    }

    #[test]
    fn test_unbalanced_groups() {
        assert!(!is_safe("(a"));
        assert!(!is_safe("a)"));
    }

    #[test]
    fn test_compile() {
        assert!(compile(r"<(link|meta)\b").is_some());
        assert!(compile(r"(a+)+$").is_none());
        assert!(compile(r"[unclosed").is_none());
    }
}
