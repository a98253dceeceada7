use aspive_core::resolve::Mode;
use aspive_core::value::Operator;
use aspive_core::{escape_html, unescape_html, Engine, Map, RenderOptions, Session, TagCloser, Value};
use proptest::prelude::*;

fn markup() -> impl Strategy<Value = String> {
    let piece = prop_oneof![
        Just("<div>"),
        Just("</div>"),
        Just("<span class=\"x\">"),
        Just("</span>"),
        Just("<p>"),
        Just("</p>"),
        Just("<br>"),
        Just("text"),
    ];
    prop::collection::vec(piece, 0..24).prop_map(|pieces| pieces.concat())
}

/// Checks that every `name` tag is closed, and never before it is opened.
fn balanced(text: &str, name: &str) -> bool {
    let open = format!("<{}", name);
    let close = format!("</{}>", name);
    let mut depth = 0i32;
    let mut rest = text;
    while let Some(pos) = rest.find('<') {
        rest = &rest[pos..];
        if rest.starts_with(&close) {
            depth -= 1;
            if depth < 0 {
                return false;
            }
        } else if rest.starts_with(&open) {
            depth += 1;
        }
        rest = &rest[1..];
    }
    depth == 0
}

proptest! {
    /// Escaping then unescaping restores any text over the reserved characters.
    #[test]
    fn escape_round_trip(text in r#"[&<>{}/\\?=\[\]()|#*,.`'"a-z ]*"#) {
        prop_assert_eq!(unescape_html(&escape_html(&text)), text);
    }
}

proptest! {
    #[test]
    fn closing_is_idempotent(text in markup()) {
        let closer = TagCloser::default();
        let once = closer.close(&text);
        prop_assert_eq!(closer.close(&once), once.clone());
    }

    #[test]
    fn closing_balances_every_tag(text in markup()) {
        let closed = TagCloser::default().close(&text);
        for name in ["div", "span", "p"] {
            prop_assert!(balanced(&closed, name), "{} unbalanced in {}", name, closed);
        }
    }
}

proptest! {
    /// Unknown variables resolve to nothing instead of failing.
    #[test]
    fn unknown_variables_resolve_empty(name in "[a-z]{1,8}", field in "[a-z]{1,8}") {
        let engine = Engine::new();
        let session = Session::new(&engine, &RenderOptions::new());
        let expr = format!("$v_{}.{}", name, field);
        prop_assert!(!session.resolve(&expr, Mode::Value).is_truthy());
        prop_assert_eq!(session.resolve_text(&expr), "");

        let out = engine.render(&format!("<? echo $v_{}; ?>{{{{v_{}}}}}", name, name), &RenderOptions::new());
        prop_assert_eq!(out.unwrap(), "");
    }

    /// Arbitrary script-like input never turns into an error.
    #[test]
    fn rendering_never_fails(text in r"[a-z0-9$ .{}()=;'<>?|&!+\-]{0,40}") {
        prop_assert!(Engine::new().render(&text, &RenderOptions::new()).is_ok());
    }

    /// A loop binding shadows a document variable of the same name until it
    /// is removed.
    #[test]
    fn temp_scope_shadows_vars(name in "[a-z]{1,6}", temp in 0i32..1000, var in 0i32..1000) {
        let engine = Engine::new();
        let mut session = Session::new(&engine, &RenderOptions::new());
        let key = format!("v{}", name);
        session.ctx.vars.insert(key.clone(), Value::Number(f64::from(var)));
        session.ctx.temp_vars.insert(key.clone(), Value::Number(f64::from(temp)));

        let expr = format!("${}", key);
        prop_assert_eq!(session.resolve(&expr, Mode::Value), Value::Number(f64::from(temp)));
        session.ctx.temp_vars.shift_remove(&key);
        prop_assert_eq!(session.resolve(&expr, Mode::Value), Value::Number(f64::from(var)));
    }
}

fn numbers(items: &[i32]) -> Value {
    Value::List(items.iter().map(|n| Value::Number(f64::from(*n))).collect())
}

fn map_of(entries: &[(String, i32)]) -> Map {
    entries
        .iter()
        .map(|(k, v)| (k.clone(), Value::Number(f64::from(*v))))
        .collect()
}

proptest! {
    #[test]
    fn list_add_appends_one(items in prop::collection::vec(0i32..50, 0..8), n in 0i32..50) {
        for op in [Operator::Add, Operator::Concat, Operator::Mul] {
            let Some(Value::List(after)) = numbers(&items).combine(op, &Value::Number(f64::from(n))) else {
                panic!("list combine failed");
            };
            prop_assert_eq!(after.len(), items.len() + 1);
            prop_assert_eq!(after.last(), Some(&Value::Number(f64::from(n))));
        }
    }

    #[test]
    fn list_sub_removes_first_match(items in prop::collection::vec(0i32..5, 1..8), pick in 0usize..8) {
        let needle = items[pick % items.len()];
        let Some(Value::List(after)) = numbers(&items).combine(Operator::Sub, &Value::Number(f64::from(needle))) else {
            panic!("list combine failed");
        };
        let mut expected = items.clone();
        let pos = expected.iter().position(|n| *n == needle).unwrap_or_default();
        expected.remove(pos);
        prop_assert_eq!(Value::List(after), numbers(&expected));
    }

    #[test]
    fn map_add_merges_with_rhs_winning(
        lhs in prop::collection::vec(("[a-c]", 0i32..9), 0..4),
        rhs in prop::collection::vec(("[a-c]", 10i32..19), 0..4),
    ) {
        let left = map_of(&lhs);
        let right = map_of(&rhs);
        let Some(Value::Map(merged)) = Value::Map(left.clone()).combine(Operator::Add, &Value::Map(right.clone())) else {
            panic!("map combine failed");
        };
        for (key, value) in &right {
            prop_assert_eq!(merged.get(key), Some(value));
        }
        for key in left.keys() {
            prop_assert!(merged.contains_key(key));
        }
    }

    #[test]
    fn map_sub_removes_matching_key(values in prop::collection::vec(0i32..100, 1..6), pick in 0usize..6) {
        let entries: Vec<(String, i32)> = values
            .iter()
            .enumerate()
            .map(|(i, v)| (format!("k{}", i), *v))
            .collect();
        let needle = entries[pick % entries.len()].1;
        let first_key = entries.iter().find(|(_, v)| *v == needle).map(|(k, _)| k.clone());
        let Some(Value::Map(after)) = Value::Map(map_of(&entries)).combine(Operator::Sub, &Value::Number(f64::from(needle))) else {
            panic!("map combine failed");
        };
        prop_assert_eq!(after.len(), entries.len() - 1);
        prop_assert_eq!(first_key.as_ref().and_then(|k| after.get(k)), None);
    }

    #[test]
    fn number_arithmetic(a in -1000i32..1000, b in 1i32..1000) {
        let (x, y) = (Value::Number(f64::from(a)), Value::Number(f64::from(b)));
        let (fa, fb) = (f64::from(a), f64::from(b));
        prop_assert_eq!(x.combine(Operator::Add, &y), Some(Value::Number(fa + fb)));
        prop_assert_eq!(x.combine(Operator::Sub, &y), Some(Value::Number(fa - fb)));
        prop_assert_eq!(x.combine(Operator::Mul, &y), Some(Value::Number(fa * fb)));
        prop_assert_eq!(x.combine(Operator::Div, &y), Some(Value::Number(fa / fb)));
    }

    #[test]
    fn string_operators(s in "[a-c]{1,6}", part in "[a-c]{1,2}", times in 0u8..5) {
        let text = Value::String(s.clone());
        let needle = Value::String(part.clone());
        prop_assert_eq!(text.combine(Operator::Concat, &needle), Some(Value::String(format!("{}{}", s, part))));
        prop_assert_eq!(text.combine(Operator::Sub, &needle), Some(Value::String(s.replacen(&part, "", 1))));
        prop_assert_eq!(text.combine(Operator::Div, &needle), Some(Value::String(s.replace(&part, ""))));
        prop_assert_eq!(
            text.combine(Operator::Mul, &Value::Number(f64::from(times))),
            Some(Value::String(s.repeat(usize::from(times))))
        );
    }

    #[test]
    fn mismatched_types_are_ignored(n in 0i32..100) {
        let map = Value::Map(Map::new());
        prop_assert_eq!(map.combine(Operator::Add, &Value::Number(f64::from(n))), None);
        prop_assert_eq!(Value::Null.combine(Operator::Add, &numbers(&[n])), None);
    }
}
