pub mod fanin;
pub mod pairwise;

use serde_json::Value;

/// Looks a dot-path up in a JSON value: `"order.id"` → `value["order"]["id"]`.
pub(crate) fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Renders a correlation value as a storage key segment. Strings keep their
/// raw form so `"42"` and `42` correlate the same way they do upstream.
pub(crate) fn value_as_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_path() {
        let v = json!({"order": {"id": "po-42", "lines": [1, 2]}});
        assert_eq!(lookup_path(&v, "order.id"), Some(&json!("po-42")));
        assert_eq!(lookup_path(&v, "order.missing"), None);
        assert_eq!(lookup_path(&v, "order"), Some(&json!({"id": "po-42", "lines": [1, 2]})));
    }

    #[test]
    fn test_value_as_key() {
        assert_eq!(value_as_key(&json!("po-42")), "po-42");
        assert_eq!(value_as_key(&json!(42)), "42");
        assert_eq!(value_as_key(&json!(true)), "true");
    }
}
