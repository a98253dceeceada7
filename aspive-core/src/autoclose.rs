//! Markup balancing: closes unclosed tags and drops stray closing tags.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::escape::escape_invalid_tags;

/// Tags that never take a closing tag by default.
pub const DEFAULT_VOID_TAGS: &[&str] = &["meta", "link", "img", "br", "hr", "input"];

static TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<(/?)([A-Za-z][A-Za-z0-9_-]*)(\s[^>]*)?>").expect("valid tag regex")
});

/// Balances open and close tags using a stack.
///
/// Open tags are emitted verbatim. A close tag that matches an open tag closes
/// every tag opened after it first; a close tag with no open counterpart is
/// dropped. Tags still open at the end are closed innermost first.
#[derive(Debug, Clone)]
pub struct TagCloser {
    void_tags: Vec<String>,
}

impl Default for TagCloser {
    fn default() -> Self {
        Self::new(DEFAULT_VOID_TAGS.iter().copied())
    }
}

impl TagCloser {
    pub fn new<I, S>(void_tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            void_tags: void_tags
                .into_iter()
                .map(|tag| tag.into().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn add_void_tag(&mut self, tag: &str) {
        let tag = tag.to_ascii_lowercase();
        if !self.void_tags.contains(&tag) {
            self.void_tags.push(tag);
        }
    }

    pub fn is_void(&self, tag: &str) -> bool {
        self.void_tags.iter().any(|void| void.eq_ignore_ascii_case(tag))
    }

    pub fn void_tags(&self) -> &[String] {
        &self.void_tags
    }

    pub fn close(&self, text: &str) -> String {
        let text = escape_invalid_tags(text);
        let mut out = String::with_capacity(text.len());
        let mut open: Vec<String> = Vec::new();
        let mut last = 0;

        for caps in TAG.captures_iter(&text) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&text[last..whole.start()]);
            last = whole.end();

            let name = &caps[2];
            let closing = !caps[1].is_empty();
            let self_closing = caps
                .get(3)
                .is_some_and(|attrs| attrs.as_str().trim_end().ends_with('/'));

            if self.is_void(name) || (!closing && self_closing) {
                out.push_str(whole.as_str());
            } else if closing {
                match open.iter().rposition(|tag| tag.eq_ignore_ascii_case(name)) {
                    Some(pos) => {
                        for tag in open.drain(pos + 1..).rev() {
                            push_close(&mut out, &tag);
                        }
                        open.pop();
                        push_close(&mut out, name);
                    }
                    None => debug!(tag = name, "dropping unmatched closing tag"),
                }
            } else {
                open.push(name.to_string());
                out.push_str(whole.as_str());
            }
        }

        out.push_str(&text[last..]);
        for tag in open.into_iter().rev() {
            push_close(&mut out, &tag);
        }
        out
    }
}

fn push_close(out: &mut String, tag: &str) {
    out.push_str("</");
    out.push_str(tag);
    out.push('>');
}
