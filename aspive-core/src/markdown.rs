//! Lightweight markdown rewriting applied to rendered output.
//!
//! Rules are independent regex rewrites run in a fixed order. Escaped forms
//! produced by `{{#no-html}}` zones only match when the corresponding
//! [`NoHtmlRules`] flag is set.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::NoHtmlRules;

type Rule = (Regex, &'static str);

fn rule(pattern: &str, replacement: &'static str) -> Rule {
    (Regex::new(pattern).expect("valid markdown regex"), replacement)
}

fn header_rules(hash: &str) -> Vec<Rule> {
    const TAGS: [&str; 6] = [
        "<h6>$1</h6>",
        "<h5>$1</h5>",
        "<h4>$1</h4>",
        "<h3>$1</h3>",
        "<h2>$1</h2>",
        "<h1>$1</h1>",
    ];
    TAGS.iter()
        .enumerate()
        .map(|(i, tag)| {
            let level = 6 - i;
            rule(&format!(r"(?m)^[ \t]*(?:{}){{{}}}[ \t]+(.+)$", hash, level), tag)
        })
        .collect()
}

static EMPHASIS: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        rule(r"(?:\*|&ast;){3}([^*]+?)(?:\*|&ast;){3}", "<strong><em>$1</em></strong>"),
        rule(r"(?:\*|&ast;){2}([^*]+?)(?:\*|&ast;){2}", "<strong>$1</strong>"),
        rule(r"(?:\*|&ast;)([^*\n]+?)(?:\*|&ast;)", "<em>$1</em>"),
        rule(r"__([^_]+)__", "<u>$1</u>"),
        rule(r"(?s)~~([^~]+)~~", "<s>$1</s>"),
    ]
});

static HEADERS: Lazy<Vec<Rule>> = Lazy::new(|| header_rules("#"));

static ESCAPED_HEADERS: Lazy<Vec<Rule>> = Lazy::new(|| header_rules("&num;"));

static BLOCKS: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        rule(r"(?m)^-{3,}[ \t]*$", "<hr>"),
        rule(r"(?s)(?:`|&grave;){3}(.+?)(?:`|&grave;){3}", "<pre>$1</pre>"),
        rule(r"(?:`|&grave;)([^`\n]+?)(?:`|&grave;)", "<code>$1</code>"),
    ]
});

static LINKS: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        rule(r"!\[([^\]\n]*)\]\(([^)\s]*)\)", r#"<img src="$2" alt="$1">"#),
        rule(r"\[([^\]\n]*)\]\(([^)\s]*)\)", r#"<a href="$2">$1</a>"#),
    ]
});

static ESCAPED_IMAGE: Lazy<Rule> = Lazy::new(|| {
    rule(r"!&lbrack;(.*?)&rbrack;&lpar;(.*?)&rpar;", r#"<img src="$2" alt="$1">"#)
});

static ESCAPED_LINK: Lazy<Rule> =
    Lazy::new(|| rule(r"&lbrack;(.*?)&rbrack;&lpar;(.*?)&rpar;", r#"<a href="$2">$1</a>"#));

/// Bare URLs not already inside an attribute or a link.
static AUTOLINK: Lazy<Rule> = Lazy::new(|| {
    rule(
        r#"(^|[^"'=>])(https?://[\w\-.]+(?:[\w.,@?^=%&:/~+#-]*[\w@?^=%&/~+#-])?)"#,
        r#"${1}<a href="${2}">${2}</a>"#,
    )
});

const SYMBOLS: &[(&str, &str)] = &[
    ("[ss]", "§"),
    ("[$c]", "¢"),
    ("[$e]", "€"),
    ("[$p]", "£"),
    ("[c]", "©"),
    ("[r]", "®"),
    ("[tm]", "™"),
    ("[p]", "¶"),
    ("[Dc]", "℃"),
    ("[Df]", "℉"),
    ("[D]", "°"),
    ("[M+]", "+"),
    ("[M-]", "−"),
    ("[Mx]", "×"),
    ("[M/]", "÷"),
    ("[M=]", "="),
    ("[M!=]", "≠"),
    ("[M+-]", "±"),
    ("[M<]", "<"),
    ("[M>]", ">"),
    ("[M<=]", "⋜"),
    ("[M>=]", "⋝"),
    ("[M%]", "%"),
    ("[M%0]", "‰"),
    ("[M%00]", "‱"),
    ("[Msum]", "∑"),
    ("[Msqrt]", "√"),
    ("[M2root]", "√"),
    ("[Mroot]", "√"),
    ("[Mcbrt]", "∛"),
    ("[M3root]", "∛"),
    ("[M4root]", "∜"),
    ("[M00]", "∞"),
    ("[MAr]", "∟"),
    ("[MA90]", "∟"),
    ("[MAa]", "∠"),
    ("[MA45]", "∠"),
    ("[MA]", "∠"),
    ("[M=?]", "≈"),
];

fn apply(text: String, (regex, replacement): &Rule) -> String {
    match regex.replace_all(&text, *replacement) {
        std::borrow::Cow::Owned(replaced) => replaced,
        std::borrow::Cow::Borrowed(_) => text,
    }
}

/// Markdown rewriter configured by the active `noHtmlRules`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownPass {
    rules: NoHtmlRules,
}

impl MarkdownPass {
    pub fn new(rules: NoHtmlRules) -> Self {
        Self { rules }
    }

    pub fn transform(&self, text: &str) -> String {
        let mut text = text.to_string();

        for r in EMPHASIS.iter().chain(HEADERS.iter()) {
            text = apply(text, r);
        }
        if self.rules.allow_headers {
            for r in ESCAPED_HEADERS.iter() {
                text = apply(text, r);
            }
        }
        for r in BLOCKS.iter().chain(LINKS.iter()) {
            text = apply(text, r);
        }
        if self.rules.allow_images {
            text = apply(text, &ESCAPED_IMAGE);
        }
        if self.rules.allow_custom_links {
            text = apply(text, &ESCAPED_LINK);
        }
        text = apply(text, &AUTOLINK);

        for (symbol, replacement) in SYMBOLS {
            if text.contains(symbol) {
                text = text.replace(symbol, replacement);
            }
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn md(text: &str) -> String {
        MarkdownPass::default().transform(text)
    }

    #[test]
    fn test_emphasis() {
        assert_eq!(md("***a***"), "<strong><em>a</em></strong>");
        assert_eq!(md("**b** and *c*"), "<strong>b</strong> and <em>c</em>");
        assert_eq!(md("__u__ ~~s~~"), "<u>u</u> <s>s</s>");
    }

    #[test]
    fn test_headers_need_line_start_and_space() {
        assert_eq!(md("# Title\n## Sub"), "<h1>Title</h1>\n<h2>Sub</h2>");
        assert_eq!(md("color: #fff"), "color: #fff");
        assert_eq!(md("#main { x }"), "#main { x }");
    }

    #[test]
    fn test_links_and_images() {
        assert_eq!(md("[home](/index)"), r#"<a href="/index">home</a>"#);
        assert_eq!(md("![logo](/l.png)"), r#"<img src="/l.png" alt="logo">"#);
        assert_eq!(
            md("see https://example.com now"),
            r#"see <a href="https://example.com">https://example.com</a> now"#
        );
        assert_eq!(
            md(r#"<a href="https://example.com">x</a>"#),
            r#"<a href="https://example.com">x</a>"#
        );
        assert_eq!(
            md("[https://a.io](https://a.io)"),
            r#"<a href="https://a.io">https://a.io</a>"#
        );
    }

    #[test]
    fn test_code_and_rule() {
        assert_eq!(md("```x```"), "<pre>x</pre>");
        assert_eq!(md("`y`"), "<code>y</code>");
        assert_eq!(md("a\n---\nb"), "a\n<hr>\nb");
    }

    #[test]
    fn test_symbols() {
        assert_eq!(md("[c] 2024 [tm] [M!=] [D]"), "© 2024 ™ ≠ °");
    }

    #[test]
    fn test_escaped_forms_need_rules() {
        let text = "&num; Hi\n!&lbrack;a&rbrack;&lpar;b&rpar;";
        assert_eq!(md(text), text);
        let pass = MarkdownPass::new(NoHtmlRules {
            allow_headers: true,
            allow_images: true,
            ..NoHtmlRules::default()
        });
        assert_eq!(pass.transform(text), "<h1>Hi</h1>\n<img src=\"b\" alt=\"a\">");
    }
}
