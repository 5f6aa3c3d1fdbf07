//! # Query Algebra
//!
//! The backend-agnostic query a client submits:
//!
//! ```text
//! {"from": "unittest", "select": ["result.test", {"value": "duration", "aggregate": "avg"}],
//!  "edges": ["build.platform"], "where": {"eq": {"result.ok": false}}, "limit": 10}
//! ```
//!
//! `from` may itself be a query (composition) or a literal list of rows.
//! Parsing only checks shape; schema-aware normalization happens in the
//! engine.

use crate::domain::Domain;
use crate::error::QueryError;
use crate::expr::Filter;
use crate::result::Row;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const NO_AGGREGATE: &str = "none";

#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Table(String),
    Query(Box<Query>),
    Rows(Vec<Row>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    /// Output name.
    pub name: String,
    /// Field read, `.` for the whole document.
    pub value: String,
    pub aggregate: String,
}

impl Select {
    pub fn is_aggregate(&self) -> bool {
        self.aggregate != NO_AGGREGATE
    }

    pub fn is_star(&self) -> bool {
        self.value == "*"
    }

    fn parse(value: &Value) -> Result<Self, QueryError> {
        match value {
            Value::String(field) => Ok(Self {
                name: field.clone(),
                value: field.clone(),
                aggregate: NO_AGGREGATE.to_string(),
            }),
            Value::Object(map) => {
                let aggregate = map
                    .get("aggregate")
                    .and_then(Value::as_str)
                    .unwrap_or(NO_AGGREGATE)
                    .to_string();
                let value = match map.get("value") {
                    Some(Value::String(v)) => v.clone(),
                    None => ".".to_string(),
                    Some(other) => {
                        return Err(QueryError::malformed(format!(
                            "expecting select value to be a field name, not {other}"
                        )))
                    }
                };
                let name = match map.get("name").and_then(Value::as_str) {
                    Some(n) => n.to_string(),
                    None if value == "." => aggregate.clone(),
                    None => value.clone(),
                };
                Ok(Self {
                    name,
                    value,
                    aggregate,
                })
            }
            other => Err(QueryError::malformed(format!(
                "expecting select clause to be a name or object, not {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub name: String,
    pub value: String,
    pub domain: Option<Domain>,
}

impl Edge {
    fn parse(value: &Value) -> Result<Self, QueryError> {
        match value {
            Value::String(field) => Ok(Self {
                name: field.clone(),
                value: field.clone(),
                domain: None,
            }),
            Value::Object(map) => {
                let value = map
                    .get("value")
                    .and_then(Value::as_str)
                    .ok_or_else(|| QueryError::malformed("edge needs a `value` field"))?
                    .to_string();
                let name = map
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| value.clone());
                let domain = match map.get("domain") {
                    Some(d) => Some(serde_json::from_value(d.clone()).map_err(|e| {
                        QueryError::malformed(format!("bad domain for edge `{name}`: {e}"))
                    })?),
                    None => None,
                };
                Ok(Self {
                    name,
                    value,
                    domain,
                })
            }
            other => Err(QueryError::malformed(format!(
                "expecting edge to be a name or object, not {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sort {
    pub field: String,
    pub order: SortOrder,
}

impl Sort {
    pub fn asc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            order: SortOrder::Asc,
        }
    }

    fn parse(value: &Value) -> Result<Self, QueryError> {
        match value {
            Value::String(field) => Ok(Self::asc(field)),
            Value::Object(map) => {
                if let Some(field) = map.get("field").or_else(|| map.get("value")) {
                    let field = field
                        .as_str()
                        .ok_or_else(|| QueryError::malformed("sort field must be a name"))?;
                    let order = parse_order(map.get("sort").unwrap_or(&Value::Null))?;
                    return Ok(Self {
                        field: field.to_string(),
                        order,
                    });
                }
                match map.iter().next() {
                    Some((field, order)) if map.len() == 1 => Ok(Self {
                        field: field.clone(),
                        order: parse_order(order)?,
                    }),
                    _ => Err(QueryError::malformed(format!("can not parse sort {value}"))),
                }
            }
            other => Err(QueryError::malformed(format!("can not parse sort {other}"))),
        }
    }
}

fn parse_order(value: &Value) -> Result<SortOrder, QueryError> {
    match value {
        Value::Null => Ok(SortOrder::Asc),
        Value::Number(n) if n.as_i64() == Some(-1) => Ok(SortOrder::Desc),
        Value::Number(n) if n.as_i64() == Some(1) => Ok(SortOrder::Asc),
        Value::String(s) if s == "desc" => Ok(SortOrder::Desc),
        Value::String(s) if s == "asc" => Ok(SortOrder::Asc),
        other => Err(QueryError::malformed(format!("unknown sort order {other}"))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    List,
    Table,
    Cube,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMeta {
    #[serde(default)]
    pub save: bool,
    /// Wait for column statistics to be fresh before running.
    #[serde(default)]
    pub testing: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub from: Source,
    pub select: Vec<Select>,
    pub edges: Vec<Edge>,
    pub groupby: Vec<Edge>,
    pub filter: Filter,
    pub sort: Vec<Sort>,
    pub limit: Option<usize>,
    pub format: Option<Format>,
    pub meta: QueryMeta,
}

impl Query {
    pub fn from_table(table: &str) -> Self {
        Self {
            from: Source::Table(table.to_string()),
            select: Vec::new(),
            edges: Vec::new(),
            groupby: Vec::new(),
            filter: Filter::MatchAll,
            sort: Vec::new(),
            limit: None,
            format: None,
            meta: QueryMeta::default(),
        }
    }

    pub fn from_json(raw: &Value) -> Result<Self, QueryError> {
        let map = raw
            .as_object()
            .ok_or_else(|| QueryError::malformed("expecting a query object"))?;

        let from = match map.get("from") {
            Some(Value::String(name)) if !name.trim().is_empty() => Source::Table(name.clone()),
            Some(Value::Object(_)) => Source::Query(Box::new(Self::from_json(&map["from"])?)),
            Some(Value::Array(items)) => Source::Rows(
                items
                    .iter()
                    .map(|item| match item {
                        Value::Object(row) => Ok(row.clone()),
                        other => Err(QueryError::malformed(format!(
                            "expecting rows to be objects, not {other}"
                        ))),
                    })
                    .collect::<Result<_, _>>()?,
            ),
            Some(other) => {
                return Err(QueryError::malformed(format!(
                    "expecting `from` to be a table name, a query or rows, not {other}"
                )))
            }
            None => return Err(QueryError::malformed("query needs a `from` clause")),
        };

        let limit = match map.get("limit") {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => Some(n.as_u64().ok_or_else(|| {
                QueryError::malformed(format!("expecting a positive limit, not {n}"))
            })? as usize),
            Some(other) => {
                return Err(QueryError::malformed(format!(
                    "expecting limit to be a number, not {other}"
                )))
            }
        };

        let format = match map.get("format") {
            None | Some(Value::Null) => None,
            Some(f) => Some(serde_json::from_value(f.clone()).map_err(|_| {
                QueryError::malformed(format!("unknown format {f}"))
            })?),
        };

        let meta = match map.get("meta") {
            None | Some(Value::Null) => QueryMeta::default(),
            Some(m) => serde_json::from_value(m.clone())
                .map_err(|e| QueryError::malformed(format!("bad meta: {e}")))?,
        };

        Ok(Self {
            from,
            select: list(map.get("select"), Select::parse)?,
            edges: list(map.get("edges"), Edge::parse)?,
            groupby: list(map.get("groupby"), Edge::parse)?,
            filter: Filter::parse(map.get("where").unwrap_or(&Value::Null))?,
            sort: list(map.get("sort"), Sort::parse)?,
            limit,
            format,
            meta,
        })
    }

    /// The table at the bottom of any `from` nesting.
    pub fn root_table(&self) -> Option<&str> {
        match &self.from {
            Source::Table(name) => Some(name),
            Source::Query(inner) => inner.root_table(),
            Source::Rows(_) => None,
        }
    }

    /// Grouping or aggregating, as opposed to row projection.
    pub fn is_aggregating(&self) -> bool {
        !self.edges.is_empty()
            || !self.groupby.is_empty()
            || self.select.iter().any(Select::is_aggregate)
    }

    pub fn dimensions(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter().chain(self.groupby.iter())
    }

    /// Every field this query reads, excluding `.` and `*`.
    pub fn fields(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .select
            .iter()
            .map(|s| s.value.as_str())
            .chain(self.dimensions().map(|e| e.value.as_str()))
            .chain(self.filter.fields())
            .collect();
        out.retain(|f| *f != "." && *f != "*");
        out
    }
}

fn list<T>(
    value: Option<&Value>,
    parse: impl Fn(&Value) -> Result<T, QueryError>,
) -> Result<Vec<T>, QueryError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items.iter().map(&parse).collect(),
        Some(single) => Ok(vec![parse(single)?]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_full_query() {
        let q = Query::from_json(&json!({
            "from": "unittest",
            "select": ["result.test", {"value": "duration", "aggregate": "avg"}],
            "edges": ["build.platform"],
            "where": {"eq": {"result.ok": false}},
            "sort": {"duration": "desc"},
            "limit": 10,
            "format": "table"
        }))
        .unwrap();
        assert_eq!(q.from, Source::Table("unittest".into()));
        assert_eq!(q.select.len(), 2);
        assert_eq!(q.select[1].name, "duration");
        assert_eq!(q.select[1].aggregate, "avg");
        assert_eq!(q.edges[0].name, "build.platform");
        assert_eq!(q.sort[0].order, SortOrder::Desc);
        assert_eq!(q.limit, Some(10));
        assert_eq!(q.format, Some(Format::Table));
        assert!(q.is_aggregating());
    }

    #[test]
    fn test_count_select_defaults_name() {
        let q = Query::from_json(&json!({"from": "t", "select": {"aggregate": "count"}})).unwrap();
        assert_eq!(q.select[0].name, "count");
        assert_eq!(q.select[0].value, ".");
    }

    #[test]
    fn test_nested_from_is_composition() {
        let q = Query::from_json(&json!({
            "from": {"from": "t", "select": "a"},
            "where": {"gt": {"a": 1}}
        }))
        .unwrap();
        assert!(matches!(q.from, Source::Query(_)));
        assert_eq!(q.root_table(), Some("t"));
    }

    #[test]
    fn test_from_must_be_name_query_or_rows() {
        let err = Query::from_json(&json!({"from": 3})).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::MalformedInput);
        assert!(Query::from_json(&json!({"select": "a"})).is_err());
        assert!(Query::from_json(&json!({"from": ""})).is_err());
    }

    #[test]
    fn test_unknown_format_is_malformed() {
        assert!(Query::from_json(&json!({"from": "t", "format": "xml"})).is_err());
    }
}
