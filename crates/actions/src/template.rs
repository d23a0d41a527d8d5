//! `{{variable}}` substitution for action configs.
//!
//! Placeholders are resolved against a JSON context using dot paths
//! (`{{record.amount}}`, `{{to_state}}`). Unknown paths are left untouched so a
//! misconfigured template stays visible in whatever the handler produces.

use serde_json::Value;

/// Look up a dot-separated path inside `root`.
pub fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for key in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(key)?,
            Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Substitute every `{{path}}` in `template`.
pub fn render(template: &str, context: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };

        let key = after[..end].trim();
        match lookup(context, key) {
            Some(Value::String(s)) => out.push_str(s),
            Some(Value::Null) | None => out.push_str(&rest[start..start + 2 + end + 2]),
            Some(other) => out.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    out
}

/// Recursively render every string inside `config`.
pub fn render_value(config: &Value, context: &Value) -> Value {
    match config {
        Value::String(s) => Value::String(render(s, context)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, context)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_nested_paths() {
        let ctx = json!({ "to_state": "Won", "record": { "amount": 1200, "owner": "ana" } });
        assert_eq!(
            render("Deal moved to {{to_state}} ({{ record.amount }}) by {{record.owner}}", &ctx),
            "Deal moved to Won (1200) by ana"
        );
    }

    #[test]
    fn unknown_placeholder_is_left_alone() {
        let ctx = json!({ "to_state": "Won" });
        assert_eq!(render("{{missing}} -> {{to_state}}", &ctx), "{{missing}} -> Won");
    }

    #[test]
    fn unterminated_placeholder_is_copied_verbatim() {
        assert_eq!(render("hello {{name", &json!({ "name": "x" })), "hello {{name");
    }

    #[test]
    fn render_value_walks_objects_and_arrays() {
        let ctx = json!({ "record_id": "r-1" });
        let config = json!({ "subject": "Follow up {{record_id}}", "tags": ["{{record_id}}", 3] });
        assert_eq!(
            render_value(&config, &ctx),
            json!({ "subject": "Follow up r-1", "tags": ["r-1", 3] })
        );
    }

    #[test]
    fn lookup_indexes_into_arrays() {
        let ctx = json!({ "items": [{ "id": "a" }, { "id": "b" }] });
        assert_eq!(lookup(&ctx, "items.1.id"), Some(&json!("b")));
        assert_eq!(lookup(&ctx, "items.7.id"), None);
    }
}
