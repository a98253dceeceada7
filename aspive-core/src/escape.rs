//! HTML entity escaping for script output and markup cleanup.

use once_cell::sync::Lazy;
use regex::Regex;

/// Characters escaped by [`escape_html`], with their entity names.
const ENTITIES: &[(char, &str)] = &[
    ('&', "amp"),
    ('>', "gt"),
    ('<', "lt"),
    ('{', "lbrace"),
    ('}', "rbrace"),
    ('/', "sol"),
    ('\\', "bsol"),
    ('?', "quest"),
    ('=', "equals"),
    ('[', "lbrack"),
    (']', "rbrack"),
    ('(', "lpar"),
    (')', "rpar"),
    ('|', "vert"),
    ('#', "num"),
    ('§', "sect"),
    ('*', "ast"),
    (',', "comma"),
    ('.', "period"),
    ('`', "grave"),
    ('\'', "apos"),
    ('"', "quot"),
];

/// Matches a tag whose `>` never arrives before the next `<` or the end of input.
static INVALID_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)</?([A-Za-z0-9_-]+)([^>]+)(<|[^>]\z)").expect("valid invalid-tag regex")
});

fn entity_for(c: char) -> Option<&'static str> {
    ENTITIES.iter().find(|(ch, _)| *ch == c).map(|(_, name)| *name)
}

fn char_for(name: &str) -> Option<char> {
    ENTITIES.iter().find(|(_, n)| *n == name).map(|(ch, _)| *ch)
}

/// Length of a known entity (`&name;`) starting at the front of `text`.
fn known_entity_len(text: &str) -> Option<usize> {
    let rest = text.strip_prefix('&')?;
    let end = rest.find(';')?;
    char_for(&rest[..end]).map(|_| end + 2)
}

/// Escapes markup-significant characters into named entities.
///
/// An `&` that already starts a known entity is left alone, so escaping an
/// escaped string does not double-encode it.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for (i, c) in text.char_indices() {
        if c == '&' && known_entity_len(&text[i..]).is_some() {
            out.push('&');
            continue;
        }
        match entity_for(c) {
            Some(name) => {
                out.push('&');
                out.push_str(name);
                out.push(';');
            }
            None => out.push(c),
        }
    }
    out
}

/// Reverses [`escape_html`].
pub fn unescape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        match known_entity_len(rest) {
            Some(len) => {
                if let Some(c) = char_for(&rest[1..len - 1]) {
                    out.push(c);
                }
                rest = &rest[len..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Turns the `<` of an unterminated tag into `&lt;` so it renders as text.
pub fn escape_invalid_tags(text: &str) -> String {
    INVALID_TAG.replace_all(text, "&lt;${1}${2}${3}").into_owned()
}

/// Drops the opening `<name` of an unterminated tag.
pub fn strip_invalid_tags(text: &str) -> String {
    INVALID_TAG.replace_all(text, "${2}${3}").into_owned()
}

/// Escapes regex metacharacters so `text` matches literally.
pub fn escape_regex(text: &str) -> String {
    regex::escape(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_reserved() {
        assert_eq!(escape_html("<b>"), "&lt;b&gt;");
        assert_eq!(escape_html("a, b."), "a&comma; b&period;");
        assert_eq!(escape_html("it's"), "it&apos;s");
        assert_eq!(escape_html("plain text"), "plain text");
    }

    #[test]
    fn test_escape_keeps_existing_entities() {
        assert_eq!(escape_html("&lt;"), "&lt;");
        assert_eq!(escape_html("&copy;"), "&amp;copy;");
        assert_eq!(escape_html("a & b"), "a &amp; b");
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape_html("&lt;p&gt;"), "<p>");
        assert_eq!(unescape_html("&amp;lt;"), "&lt;");
        assert_eq!(unescape_html("&unknown; &"), "&unknown; &");
    }

    #[test]
    fn test_round_trip() {
        let text = "<a href=\"x?y=1&z=[2]\">{#}</a> | * , . ` ' \\ § ( )";
        assert_eq!(unescape_html(&escape_html(text)), text);
    }

    #[test]
    fn test_escape_invalid_tags() {
        assert_eq!(escape_invalid_tags("<div class=\"a\"\n<p>"), "&lt;div class=\"a\"\n<p>");
        assert_eq!(escape_invalid_tags("<p>ok</p>"), "<p>ok</p>");
        assert_eq!(escape_invalid_tags("x <abc"), "x &lt;abc");
    }

    #[test]
    fn test_strip_invalid_tags() {
        assert_eq!(strip_invalid_tags("<div class=\"a\"\n<p>"), " class=\"a\"\n<p>");
    }

    #[test]
    fn test_escape_regex() {
        assert_eq!(escape_regex("a.b*"), r"a\.b\*");
    }
}
