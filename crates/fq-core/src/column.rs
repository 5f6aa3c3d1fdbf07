//! # Column Metadata Model
//!
//! One typed field of one table, including the chain of nested-document
//! boundaries it lives under. `nested_path` lists the boundaries innermost
//! first, outermost last; a root-level column has an empty path.

use crate::domain::{classify, ColumnStats, Domain};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const NESTED: &str = "nested";
pub const OBJECT: &str = "object";

pub fn is_structural_type(data_type: &str) -> bool {
    matches!(data_type, NESTED | OBJECT)
}

pub fn is_numeric_type(data_type: &str) -> bool {
    matches!(
        data_type,
        "integer" | "long" | "short" | "byte" | "float" | "double"
    )
}

pub fn is_boolean_type(data_type: &str) -> bool {
    matches!(data_type, "boolean" | "bool")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub table: String,
    pub name: String,
    pub abs_name: String,
    /// True for the copy whose `name` reads relative to a nested table.
    #[serde(default)]
    pub relative: bool,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub nested_path: Vec<String>,
    pub domain: Option<Domain>,
    #[serde(default)]
    pub use_source: bool,
    pub cardinality: Option<u64>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl Column {
    pub fn new(table: &str, name: &str, data_type: &str, nested_path: Vec<String>) -> Self {
        Self {
            table: table.to_string(),
            name: name.to_string(),
            abs_name: name.to_string(),
            relative: false,
            data_type: data_type.to_string(),
            nested_path,
            domain: None,
            use_source: false,
            cardinality: None,
            last_updated: None,
        }
    }

    /// `nested` and `object` columns only give shape to their children.
    pub fn is_structural(&self) -> bool {
        is_structural_type(&self.data_type)
    }

    pub fn depth(&self) -> usize {
        self.nested_path.len()
    }

    /// Copy of this column with its domain and freshness filled from `stats`.
    /// Stats counting no values still make the column fresh, without a
    /// domain.
    pub fn classified(&self, stats: Option<&ColumnStats>, now: DateTime<Utc>) -> Self {
        Self {
            domain: classify(&self.data_type, stats),
            cardinality: stats.map(|s| s.count),
            last_updated: stats.map(|_| now),
            ..self.clone()
        }
    }

    /// True once statistics have arrived for a leaf column.
    pub fn is_fresh(&self) -> bool {
        self.is_structural() || (self.cardinality.is_some() && self.last_updated.is_some())
    }
}

/// Turn a backend mapping `properties` tree into columns of `table`.
///
/// Children are listed before the structural column that contains them.
pub fn parse_properties(table: &str, properties: &Map<String, Value>) -> Vec<Column> {
    let mut columns = Vec::new();
    collect(table, None, &[], properties, &mut columns);
    columns
}

fn collect(
    table: &str,
    parent: Option<&str>,
    nested_path: &[String],
    properties: &Map<String, Value>,
    out: &mut Vec<Column>,
) {
    for (name, property) in properties {
        let path = match parent {
            Some(p) => format!("{p}.{name}"),
            None => name.clone(),
        };
        let data_type = property.get("type").and_then(Value::as_str);
        let children = property.get("properties").and_then(Value::as_object);

        match (data_type, children) {
            (Some(NESTED), children) => {
                let mut inner = Vec::with_capacity(nested_path.len() + 1);
                inner.push(path.clone());
                inner.extend(nested_path.iter().cloned());
                if let Some(children) = children {
                    collect(table, Some(&path), &inner, children, out);
                }
                out.push(Column::new(table, &path, NESTED, inner));
            }
            (None | Some(OBJECT), Some(children)) => {
                collect(table, Some(&path), nested_path, children, out);
                out.push(Column::new(table, &path, OBJECT, nested_path.to_vec()));
            }
            (Some(data_type), _) => {
                let mut column = Column::new(table, &path, data_type, nested_path.to_vec());
                column.use_source = property.get("index").and_then(Value::as_str) == Some("no");
                out.push(column);
            }
            (None, None) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_parse_flat_properties() {
        let columns = parse_properties(
            "unittest",
            &props(json!({
                "build": {"properties": {"platform": {"type": "string"}}},
                "ok": {"type": "boolean"}
            })),
        );
        let names: Vec<(&str, &str)> = columns
            .iter()
            .map(|c| (c.name.as_str(), c.data_type.as_str()))
            .collect();
        assert_eq!(
            names,
            vec![("build.platform", "string"), ("build", "object"), ("ok", "boolean")]
        );
        assert!(columns.iter().all(|c| c.nested_path.is_empty()));
    }

    #[test]
    fn test_parse_nested_properties_pushes_path() {
        let columns = parse_properties(
            "t",
            &props(json!({
                "f": {"type": "nested", "properties": {
                    "sub": {"type": "long"},
                    "g": {"type": "nested", "properties": {"x": {"type": "string", "index": "no"}}}
                }}
            })),
        );
        let f = columns.iter().find(|c| c.name == "f").unwrap();
        assert_eq!(f.nested_path, vec!["f"]);
        assert!(f.is_structural());

        let sub = columns.iter().find(|c| c.name == "f.sub").unwrap();
        assert_eq!(sub.nested_path, vec!["f"]);

        let x = columns.iter().find(|c| c.name == "f.g.x").unwrap();
        assert_eq!(x.nested_path, vec!["f.g", "f"]);
        assert!(x.use_source);
    }

    #[test]
    fn test_classified_sets_freshness() {
        let now = Utc::now();
        let column = Column::new("t", "a", "string", vec![]);
        assert!(!column.is_fresh());
        let stats = ColumnStats {
            count: 2,
            partitions: vec![json!("x"), json!("y")],
        };
        let fresh = column.classified(Some(&stats), now);
        assert_eq!(fresh.cardinality, Some(2));
        assert_eq!(fresh.last_updated, Some(now));
        assert!(fresh.is_fresh());
    }

    #[test]
    fn test_empty_stats_are_fresh_without_domain() {
        let now = Utc::now();
        let column = Column::new("t", "a", "string", vec![]);
        let stats = ColumnStats {
            count: 0,
            partitions: vec![],
        };
        let classified = column.classified(Some(&stats), now);
        assert_eq!(classified.cardinality, Some(0));
        assert_eq!(classified.domain, None);
        assert!(classified.is_fresh());
        assert!(!column.classified(None, now).is_fresh());
    }
}
