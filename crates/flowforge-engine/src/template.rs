//! `{{nodeId.field}}` substitution against the results of earlier nodes.
//!
//! Resolution is best-effort: a placeholder whose node has no result, or
//! whose field path does not exist, is left in the text unchanged.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

use flowforge_core::types::ResultTable;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([^\s{}.]+)\.([^\s{}]+?)\s*\}\}").expect("placeholder pattern is valid")
    })
}

/// Replace every resolvable placeholder in `template`.
pub fn resolve_str(template: &str, results: &ResultTable) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }
    placeholder()
        .replace_all(template, |caps: &Captures<'_>| {
            lookup(results, &caps[1], &caps[2])
                .map(render)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Resolve placeholders in every string inside a JSON value.
pub fn resolve_value(value: &Value, results: &ResultTable) -> Value {
    match value {
        Value::String(s) => Value::String(resolve_str(s, results)),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, results)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, results)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Walk a dotted `path` into the result of `node_id`. Numeric segments
/// index into arrays.
pub fn lookup<'a>(results: &'a ResultTable, node_id: &str, path: &str) -> Option<&'a Value> {
    let mut current = results.get(node_id)?;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Strings are inserted raw; everything else as compact JSON.
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn results() -> ResultTable {
        let mut table = ResultTable::new();
        table.insert("t".to_string(), json!({"id": "42", "count": 3, "user": {"name": "ada"}}));
        table.insert("list".to_string(), json!({"items": [{"v": 1}, {"v": 2}]}));
        table
    }

    #[test]
    fn test_resolves_string_and_number() {
        let table = results();
        assert_eq!(resolve_str("https://x/{{t.id}}", &table), "https://x/42");
        assert_eq!(resolve_str("n={{ t.count }}", &table), "n=3");
    }

    #[test]
    fn test_dotted_paths_and_objects() {
        let table = results();
        assert_eq!(resolve_str("{{t.user.name}}", &table), "ada");
        assert_eq!(resolve_str("{{list.items.1.v}}", &table), "2");
        assert_eq!(resolve_str("{{t.user}}", &table), r#"{"name":"ada"}"#);
    }

    #[test]
    fn test_unresolvable_left_literal() {
        let table = results();
        assert_eq!(resolve_str("{{missing.id}}", &table), "{{missing.id}}");
        assert_eq!(resolve_str("{{t.nope}} and {{t.id}}", &table), "{{t.nope}} and 42");
        assert_eq!(resolve_str("{{noField}}", &table), "{{noField}}");
        assert_eq!(resolve_str("plain text", &table), "plain text");
    }

    #[test]
    fn test_resolve_value_recursive() {
        let table = results();
        let resolved = resolve_value(
            &json!({"q": "{{t.id}}", "tags": ["{{t.user.name}}", 7], "n": null}),
            &table,
        );
        assert_eq!(resolved, json!({"q": "42", "tags": ["ada", 7], "n": null}));
    }
}
