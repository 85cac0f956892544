//! Helpers for reading decoded SOAP property values.
//!
//! The XML decoder yields `serde_json::Value` trees. A single-element array
//! and a bare object are indistinguishable on the wire, so every list read
//! goes through [`as_list`].

use crate::types::MoRef;
use serde_json::Value;

/// View a value as a list: arrays as-is, `null`/absent as empty, anything else
/// as a one-element list.
pub fn as_list(v: Option<&Value>) -> Vec<&Value> {
    match v {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().collect(),
        Some(other) => vec![other],
    }
}

/// Follow a dotted path through nested objects.
pub fn at<'a>(v: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .try_fold(v, |cur, seg| cur.get(seg))
}

pub fn str_at<'a>(v: &'a Value, path: &str) -> Option<&'a str> {
    at(v, path).and_then(Value::as_str)
}

pub fn string_at(v: &Value, path: &str) -> String {
    str_at(v, path).unwrap_or_default().to_string()
}

/// Boolean at `path`; accepts the string forms the decoder may leave behind.
pub fn bool_at(v: &Value, path: &str) -> Option<bool> {
    match at(v, path)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub fn i64_at(v: &Value, path: &str) -> Option<i64> {
    match at(v, path)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub fn moref_at(v: &Value, path: &str) -> Option<MoRef> {
    at(v, path).and_then(MoRef::from_value)
}

pub fn morefs_at(v: &Value, path: &str) -> Vec<MoRef> {
    as_list(at(v, path))
        .into_iter()
        .filter_map(MoRef::from_value)
        .collect()
}

/// Strings of a list-valued property, in server order.
pub fn strings_at(v: &Value, path: &str) -> Vec<String> {
    as_list(at(v, path))
        .into_iter()
        .filter_map(|s| s.as_str().map(str::to_string))
        .collect()
}

/// Canonical short form for enum comparison: lowercase with `_`, `-` and
/// spaces removed, so `lockdownNormal`, `LOCKDOWN_NORMAL` and `lockdown-normal`
/// compare equal.
pub fn short_enum(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn list_normalisation() {
        assert!(as_list(None).is_empty());
        assert!(as_list(Some(&Value::Null)).is_empty());
        assert_eq!(as_list(Some(&json!({"a": 1}))).len(), 1);
        assert_eq!(as_list(Some(&json!([1, 2]))).len(), 2);
    }

    #[test]
    fn dotted_paths() {
        let v = json!({"summary": {"config": {"name": "esx1", "port": "443"}, "on": "true"}});
        assert_eq!(str_at(&v, "summary.config.name"), Some("esx1"));
        assert_eq!(i64_at(&v, "summary.config.port"), Some(443));
        assert_eq!(bool_at(&v, "summary.on"), Some(true));
        assert!(at(&v, "summary.missing").is_none());
    }

    #[test]
    fn morefs_from_single_or_many() {
        let one = json!({"host": {"type": "HostSystem", "value": "host-1"}});
        assert_eq!(morefs_at(&one, "host"), vec![MoRef::new("HostSystem", "host-1")]);
        let many = json!({"host": [{"type": "HostSystem", "value": "host-1"}, {"type": "HostSystem", "value": "host-2"}]});
        assert_eq!(morefs_at(&many, "host").len(), 2);
    }

    #[test]
    fn enum_short_form() {
        assert_eq!(short_enum("lockdownNormal"), "lockdownnormal");
        assert_eq!(short_enum("LOCKDOWN_NORMAL"), "lockdownnormal");
        assert_eq!(short_enum("fully-Automated"), "fullyautomated");
    }
}
