//! # Filter Expressions
//!
//! The `where` clause algebra. A [`Filter`] is parsed from JSON, rendered
//! into the backend's filter DSL, evaluated in memory over documents, and
//! can have its field references rewritten.
//!
//! Both the query form (`{"eq": {...}}`) and the backend form
//! (`{"term": {...}}`) parse into the same tree.

use crate::error::QueryError;
use crate::path::{split_field, value_to_f64, value_to_string, values_at, values_equal, with_element};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl RangeOp {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "gt" => Some(Self::Gt),
            "gte" => Some(Self::Gte),
            "lt" => Some(Self::Lt),
            "lte" => Some(Self::Lte),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
        }
    }

    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            Self::Gt => ordering == Ordering::Greater,
            Self::Gte => ordering != Ordering::Less,
            Self::Lt => ordering == Ordering::Less,
            Self::Lte => ordering != Ordering::Greater,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    MatchAll,
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Eq(String, Value),
    Ne(String, Value),
    In(String, Vec<Value>),
    Range(String, RangeOp, Value),
    Exists(String),
    Missing(String),
    Prefix(String, String),
    /// Holds when some document in the nested array at `path` satisfies
    /// the inner filter.
    Nested { path: String, filter: Box<Filter> },
}

impl Default for Filter {
    fn default() -> Self {
        Self::MatchAll
    }
}

impl Filter {
    pub fn parse(value: &Value) -> Result<Self, QueryError> {
        match value {
            Value::Null | Value::Bool(true) => return Ok(Self::MatchAll),
            Value::Object(map) if map.is_empty() => return Ok(Self::MatchAll),
            Value::Object(map) if map.len() == 1 => {
                if let Some((op, arg)) = map.iter().next() {
                    return Self::parse_op(op, arg);
                }
            }
            _ => {}
        }
        Err(QueryError::malformed(format!(
            "expecting a filter with exactly one operator, not {value}"
        )))
    }

    fn parse_op(op: &str, arg: &Value) -> Result<Self, QueryError> {
        match op {
            "match_all" => Ok(Self::MatchAll),
            "and" => Ok(Self::And(parse_list(op, arg)?)),
            "or" => Ok(Self::Or(parse_list(op, arg)?)),
            "not" => Ok(Self::Not(Box::new(Self::parse(arg)?))),
            "eq" | "term" => pairs(op, arg, |f, v| Ok(Self::Eq(f, v.clone()))),
            "ne" | "neq" => pairs(op, arg, |f, v| Ok(Self::Ne(f, v.clone()))),
            "in" | "terms" => pairs(op, arg, |f, v| match v {
                Value::Array(items) => Ok(Self::In(f, items.clone())),
                other => Ok(Self::In(f, vec![other.clone()])),
            }),
            "gt" | "gte" | "lt" | "lte" => {
                let range = RangeOp::parse(op).unwrap_or(RangeOp::Gt);
                pairs(op, arg, |f, v| Ok(Self::Range(f, range, v.clone())))
            }
            "range" => pairs(op, arg, |f, bounds| {
                let bounds = bounds.as_object().ok_or_else(|| {
                    QueryError::malformed(format!("expecting range bounds for `{f}`"))
                })?;
                let mut terms = Vec::with_capacity(bounds.len());
                for (name, v) in bounds {
                    let range = RangeOp::parse(name).ok_or_else(|| {
                        QueryError::malformed(format!("unknown range bound `{name}`"))
                    })?;
                    terms.push(Self::Range(f.clone(), range, v.clone()));
                }
                Ok(single_or_and(terms))
            }),
            "exists" => Ok(Self::Exists(field_arg(op, arg)?)),
            "missing" => Ok(Self::Missing(field_arg(op, arg)?)),
            "prefix" => pairs(op, arg, |f, v| match v {
                Value::String(p) => Ok(Self::Prefix(f, p.clone())),
                other => Err(QueryError::malformed(format!(
                    "expecting a string prefix for `{f}`, not {other}"
                ))),
            }),
            "nested" => {
                let path = arg
                    .get("path")
                    .and_then(Value::as_str)
                    .ok_or_else(|| QueryError::malformed("nested filter needs a `path`"))?;
                let inner = arg.get("filter").or_else(|| arg.get("query"));
                Ok(Self::Nested {
                    path: path.to_string(),
                    filter: Box::new(Self::parse(inner.unwrap_or(&Value::Null))?),
                })
            }
            other => Err(QueryError::malformed(format!(
                "unknown filter operator `{other}`"
            ))),
        }
    }

    /// Render in the backend filter DSL.
    pub fn to_es(&self) -> Value {
        match self {
            Self::MatchAll => json!({"match_all": {}}),
            Self::And(terms) => json!({"and": terms.iter().map(Self::to_es).collect::<Vec<_>>()}),
            Self::Or(terms) => json!({"or": terms.iter().map(Self::to_es).collect::<Vec<_>>()}),
            Self::Not(inner) => json!({"not": inner.to_es()}),
            Self::Eq(f, v) => json!({"term": {f.as_str(): v}}),
            Self::Ne(f, v) => json!({"not": {"term": {f.as_str(): v}}}),
            Self::In(f, vs) => json!({"terms": {f.as_str(): vs}}),
            Self::Range(f, op, v) => json!({"range": {f.as_str(): {op.name(): v}}}),
            Self::Exists(f) => json!({"exists": {"field": f}}),
            Self::Missing(f) => json!({"missing": {"field": f}}),
            Self::Prefix(f, p) => json!({"prefix": {f.as_str(): p}}),
            Self::Nested { path, filter } => {
                json!({"nested": {"path": path, "filter": filter.to_es()}})
            }
        }
    }

    /// Evaluate against one document. Multi-valued fields match when any
    /// of their values does.
    pub fn eval(&self, doc: &Value) -> bool {
        match self {
            Self::MatchAll => true,
            Self::And(terms) => terms.iter().all(|t| t.eval(doc)),
            Self::Or(terms) => terms.iter().any(|t| t.eval(doc)),
            Self::Not(inner) => !inner.eval(doc),
            Self::Eq(f, v) => match v {
                Value::Array(expected) => {
                    let found = values_at(doc, f);
                    found.len() == expected.len()
                        && found.iter().zip(expected).all(|(a, b)| values_equal(a, b))
                }
                _ => values_at(doc, f).into_iter().any(|a| values_equal(a, v)),
            },
            Self::Ne(f, v) => !Self::Eq(f.clone(), v.clone()).eval(doc),
            Self::In(f, vs) => values_at(doc, f)
                .into_iter()
                .any(|a| vs.iter().any(|b| values_equal(a, b))),
            Self::Range(f, op, v) => values_at(doc, f)
                .into_iter()
                .any(|a| range_cmp(a, v).is_some_and(|o| op.accepts(o))),
            Self::Exists(f) => !values_at(doc, f).is_empty(),
            Self::Missing(f) => values_at(doc, f).is_empty(),
            Self::Prefix(f, p) => values_at(doc, f)
                .into_iter()
                .any(|a| value_to_string(a).starts_with(p.as_str())),
            Self::Nested { path, filter } => values_at(doc, path)
                .into_iter()
                .any(|element| filter.eval(&with_element(doc, path, element))),
        }
    }

    /// Every field this filter reads.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::MatchAll => {}
            Self::And(terms) | Self::Or(terms) => {
                for t in terms {
                    t.collect_fields(out);
                }
            }
            Self::Not(inner) => inner.collect_fields(out),
            Self::Eq(f, _)
            | Self::Ne(f, _)
            | Self::In(f, _)
            | Self::Range(f, _, _)
            | Self::Exists(f)
            | Self::Missing(f)
            | Self::Prefix(f, _) => out.push(f),
            Self::Nested { filter, .. } => filter.collect_fields(out),
        }
    }

    /// Rewrite every field reference through `f`.
    pub fn try_map_fields<E>(
        &self,
        f: &mut impl FnMut(&str) -> Result<String, E>,
    ) -> Result<Self, E> {
        Ok(match self {
            Self::MatchAll => Self::MatchAll,
            Self::And(terms) => Self::And(
                terms
                    .iter()
                    .map(|t| t.try_map_fields(f))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Or(terms) => Self::Or(
                terms
                    .iter()
                    .map(|t| t.try_map_fields(f))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Not(inner) => Self::Not(Box::new(inner.try_map_fields(f)?)),
            Self::Eq(field, v) => Self::Eq(f(field)?, v.clone()),
            Self::Ne(field, v) => Self::Ne(f(field)?, v.clone()),
            Self::In(field, vs) => Self::In(f(field)?, vs.clone()),
            Self::Range(field, op, v) => Self::Range(f(field)?, *op, v.clone()),
            Self::Exists(field) => Self::Exists(f(field)?),
            Self::Missing(field) => Self::Missing(f(field)?),
            Self::Prefix(field, p) => Self::Prefix(f(field)?, p.clone()),
            Self::Nested { path, filter } => Self::Nested {
                path: path.clone(),
                filter: Box::new(filter.try_map_fields(f)?),
            },
        })
    }

    /// True when the filter reads any field under `path`.
    pub fn touches(&self, path: &str) -> bool {
        let prefix = split_field(path);
        self.fields().into_iter().any(|f| {
            let segments = split_field(f);
            segments.len() > prefix.len() && segments[..prefix.len()] == prefix[..]
        })
    }
}

fn range_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (value_to_f64(a), value_to_f64(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => match (a, b) {
            (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
            _ => None,
        },
    }
}

fn parse_list(op: &str, arg: &Value) -> Result<Vec<Filter>, QueryError> {
    match arg {
        Value::Array(items) => items.iter().map(Filter::parse).collect(),
        other => Err(QueryError::malformed(format!(
            "expecting a list for `{op}`, not {other}"
        ))),
    }
}

fn pairs(
    op: &str,
    arg: &Value,
    mut build: impl FnMut(String, &Value) -> Result<Filter, QueryError>,
) -> Result<Filter, QueryError> {
    let map: &Map<String, Value> = arg.as_object().ok_or_else(|| {
        QueryError::malformed(format!("expecting {{field: value}} for `{op}`, not {arg}"))
    })?;
    let terms = map
        .iter()
        .map(|(f, v)| build(f.clone(), v))
        .collect::<Result<Vec<_>, _>>()?;
    if terms.is_empty() {
        return Err(QueryError::malformed(format!("`{op}` needs at least one field")));
    }
    Ok(single_or_and(terms))
}

fn single_or_and(mut terms: Vec<Filter>) -> Filter {
    if terms.len() == 1 {
        terms.remove(0)
    } else {
        Filter::And(terms)
    }
}

fn field_arg(op: &str, arg: &Value) -> Result<String, QueryError> {
    match arg {
        Value::String(f) => Ok(f.clone()),
        Value::Object(map) => map
            .get("field")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| QueryError::malformed(format!("`{op}` needs a `field`"))),
        other => Err(QueryError::malformed(format!(
            "expecting a field name for `{op}`, not {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_form_and_backend_form_alike() {
        let a = Filter::parse(&json!({"eq": {"status": "ok"}})).unwrap();
        let b = Filter::parse(&json!({"term": {"status": "ok"}})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_es(), json!({"term": {"status": "ok"}}));
    }

    #[test]
    fn test_multi_field_eq_becomes_and() {
        let f = Filter::parse(&json!({"eq": {"a": 1, "b": 2}})).unwrap();
        assert!(matches!(f, Filter::And(ref terms) if terms.len() == 2));
    }

    #[test]
    fn test_eval_range_and_in() {
        let doc = json!({"amount": 150, "method": "POST"});
        let f = Filter::parse(&json!({"and": [
            {"range": {"amount": {"gte": 100, "lt": 200}}},
            {"in": {"method": ["POST", "PUT"]}}
        ]}))
        .unwrap();
        assert!(f.eval(&doc));
        assert!(!Filter::parse(&json!({"gt": {"amount": 150}})).unwrap().eval(&doc));
    }

    #[test]
    fn test_eval_exists_missing_prefix() {
        let doc = json!({"path": "/api/v1"});
        assert!(Filter::parse(&json!({"exists": "path"})).unwrap().eval(&doc));
        assert!(Filter::parse(&json!({"missing": {"field": "other"}})).unwrap().eval(&doc));
        assert!(Filter::parse(&json!({"prefix": {"path": "/api"}})).unwrap().eval(&doc));
    }

    #[test]
    fn test_eval_nested_requires_one_element_to_match_all_terms() {
        let doc = json!({"f": [{"a": 1, "b": "x"}, {"a": 2, "b": "y"}]});
        let hit = Filter::parse(&json!({"nested": {"path": "f", "filter": {"and": [
            {"eq": {"f.a": 1}}, {"eq": {"f.b": "x"}}
        ]}}}))
        .unwrap();
        let miss = Filter::parse(&json!({"nested": {"path": "f", "filter": {"and": [
            {"eq": {"f.a": 1}}, {"eq": {"f.b": "y"}}
        ]}}}))
        .unwrap();
        assert!(hit.eval(&doc));
        assert!(!miss.eval(&doc));
    }

    #[test]
    fn test_malformed_filters() {
        assert!(Filter::parse(&json!({"bogus": {"a": 1}})).is_err());
        assert!(Filter::parse(&json!({"eq": {"a": 1}, "ne": {"b": 2}})).is_err());
        assert!(Filter::parse(&json!("a")).is_err());
    }

    #[test]
    fn test_map_fields_rewrites_every_reference() {
        let f = Filter::parse(&json!({"or": [{"eq": {"a": 1}}, {"exists": "b"}]})).unwrap();
        let mapped = f
            .try_map_fields(&mut |name: &str| Ok::<_, ()>(format!("{name}.$value")))
            .unwrap();
        assert_eq!(mapped.fields(), vec!["a.$value", "b.$value"]);
    }
}
