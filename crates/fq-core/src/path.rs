//! Dotted-path helpers shared by filters, projections and the in-memory
//! containers.
//!
//! Field names are dotted paths (`build.platform`). A document may store a
//! path either as nested objects or as a literal dotted key, and arrays on
//! the way are flattened, so `values_at` returns every value found.

use serde_json::Value;
use std::cmp::Ordering;

/// Split a dotted path into segments. Empty segments are dropped.
pub fn split_field(field: &str) -> Vec<&str> {
    field.split('.').filter(|s| !s.is_empty()).collect()
}

pub fn join_field(segments: &[&str]) -> String {
    segments.join(".")
}

/// A "simple" path: identifier segments joined by dots.
pub fn is_keyword(field: &str) -> bool {
    !field.is_empty()
        && field.split('.').all(|segment| {
            let mut chars = segment.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '$')
        })
}

/// All values reachable at `path`, flattening arrays.
pub fn values_at<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut out = Vec::new();
    collect(doc, path, &mut out);
    out
}

fn collect<'a>(doc: &'a Value, path: &str, out: &mut Vec<&'a Value>) {
    match doc {
        Value::Array(items) => {
            for item in items {
                collect(item, path, out);
            }
        }
        Value::Object(map) => {
            if path.is_empty() || path == "." {
                out.push(doc);
                return;
            }
            if let Some(v) = map.get(path) {
                push_flat(v, out);
                return;
            }
            // Try every split point so literal dotted keys are found too.
            let mut search = 0;
            while let Some(pos) = path[search..].find('.') {
                let split = search + pos;
                if let Some(child) = map.get(&path[..split]) {
                    collect(child, &path[split + 1..], out);
                }
                search = split + 1;
            }
        }
        other => {
            if path.is_empty() || path == "." {
                out.push(other);
            }
        }
    }
}

fn push_flat<'a>(v: &'a Value, out: &mut Vec<&'a Value>) {
    match v {
        Value::Array(items) => {
            for item in items {
                push_flat(item, out);
            }
        }
        Value::Null => {}
        other => out.push(other),
    }
}

/// The single value at `path`: `Null` when absent, the value itself when
/// exactly one exists, an array otherwise.
pub fn lookup(doc: &Value, path: &str) -> Value {
    let mut found = values_at(doc, path);
    match found.len() {
        0 => Value::Null,
        1 => found.remove(0).clone(),
        _ => Value::Array(found.into_iter().cloned().collect()),
    }
}

/// Unwrap single-element arrays the way list-valued `fields` come back.
pub fn unwrap_list(value: &Value) -> Value {
    match value {
        Value::Array(items) if items.len() == 1 => items[0].clone(),
        Value::Array(items) if items.is_empty() => Value::Null,
        other => other.clone(),
    }
}

/// Copy of `doc` with the array at `path` replaced by one of its elements.
/// Used to evaluate a nested document in the scope of its parent.
pub fn with_element(doc: &Value, path: &str, element: &Value) -> Value {
    let mut out = doc.clone();
    let segments = split_field(path);
    let mut cursor = &mut out;
    for (i, segment) in segments.iter().enumerate() {
        let Value::Object(map) = cursor else {
            return out_of_place(doc, path, element);
        };
        if i + 1 == segments.len() {
            map.insert((*segment).to_string(), element.clone());
            break;
        }
        cursor = map
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    out
}

fn out_of_place(doc: &Value, path: &str, element: &Value) -> Value {
    let mut map = doc.as_object().cloned().unwrap_or_default();
    map.insert(path.to_string(), element.clone());
    Value::Object(map)
}

pub fn value_to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

pub fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(an), Some(bn)) = (number(a), number(b)) {
        return (an - bn).abs() < f64::EPSILON;
    }
    value_to_string(a) == value_to_string(b)
}

fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Total order used for sorting: nulls first, then numbers, then
/// everything else by its string form.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => match (value_to_f64(a), value_to_f64(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => value_to_string(a).cmp(&value_to_string(b)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_values_at_flattens_arrays() {
        let doc = json!({"run": {"tests": [{"name": "a"}, {"name": "b"}]}});
        let found = values_at(&doc, "run.tests.name");
        assert_eq!(found, vec![&json!("a"), &json!("b")]);
    }

    #[test]
    fn test_values_at_reads_literal_dotted_keys() {
        let doc = json!({"build.platform": "linux"});
        assert_eq!(lookup(&doc, "build.platform"), json!("linux"));
    }

    #[test]
    fn test_with_element_substitutes_nested_array() {
        let doc = json!({"id": 1, "f": [{"sub": 1}, {"sub": 2}]});
        let scoped = with_element(&doc, "f", &json!({"sub": 2}));
        assert_eq!(lookup(&scoped, "f.sub"), json!(2));
        assert_eq!(lookup(&scoped, "id"), json!(1));
    }

    #[test]
    fn test_is_keyword() {
        assert!(is_keyword("build.platform"));
        assert!(is_keyword("a.$value"));
        assert!(!is_keyword("a b"));
        assert!(!is_keyword("a..b"));
        assert!(!is_keyword(""));
    }

    #[test]
    fn test_compare_values_orders_nulls_first() {
        assert_eq!(compare_values(&Value::Null, &json!(1)), Ordering::Less);
        assert_eq!(compare_values(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_values(&json!("b"), &json!("a")), Ordering::Greater);
    }
}
