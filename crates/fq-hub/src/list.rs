//! # In-Memory Rows
//!
//! Runs a normalized query over rows already held in memory: filter,
//! group by dimensions with aggregates, project, sort, limit. Serves
//! `from` composition, the metadata catalog and nested-row expansion.

use crate::strategy::{default_format, edge_summaries, header_for, project};
use fq_core::path::{compare_values, lookup, value_to_f64, value_to_string, values_at, values_equal};
use fq_core::query::NO_AGGREGATE;
use fq_core::{Query, QueryError, ResultContainer, Row, Select, Sort, SortOrder};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::HashSet;

#[derive(Debug, Clone, Default)]
pub struct ListContainer {
    rows: Vec<Row>,
}

impl ListContainer {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn query(&self, query: &Query) -> Result<ResultContainer, QueryError> {
        let mut docs: Vec<Value> = self
            .rows
            .iter()
            .map(|r| Value::Object(r.clone()))
            .filter(|d| query.filter.eval(d))
            .collect();

        let rows = if query.is_aggregating() {
            let mut rows = group(query, &docs)?;
            sort_rows(&mut rows, &query.sort);
            if let Some(limit) = query.limit {
                rows.truncate(limit);
            }
            rows
        } else {
            sort_documents(&mut docs, &query.sort);
            if let Some(limit) = query.limit {
                docs.truncate(limit);
            }
            docs.iter().map(|d| project(&query.select, d, None)).collect()
        };

        let header = header_for(query, &rows);
        Ok(ResultContainer::new(header, rows, default_format(query)).with_edges(edge_summaries(query)))
    }
}

fn group(query: &Query, docs: &[Value]) -> Result<Vec<Row>, QueryError> {
    let dims: Vec<_> = query.dimensions().collect();
    let mut groups: Vec<(Vec<Value>, Vec<&Value>)> = Vec::new();
    if dims.is_empty() {
        groups.push((Vec::new(), docs.iter().collect()));
    } else {
        for doc in docs {
            let key: Vec<Value> = dims.iter().map(|e| lookup(doc, &e.value)).collect();
            let existing = groups.iter_mut().find(|(k, _)| {
                k.len() == key.len() && k.iter().zip(&key).all(|(a, b)| a == b || values_equal(a, b))
            });
            match existing {
                Some((_, members)) => members.push(doc),
                None => groups.push((key, vec![doc])),
            }
        }
    }

    groups
        .into_iter()
        .map(|(key, members)| {
            let mut row = Map::new();
            for (edge, value) in dims.iter().zip(key) {
                row.insert(edge.name.clone(), value);
            }
            for select in &query.select {
                row.insert(select.name.clone(), aggregate(select, &members)?);
            }
            Ok(row)
        })
        .collect()
}

/// Apply one select's aggregate to a group of documents.
pub fn aggregate(select: &Select, docs: &[&Value]) -> Result<Value, QueryError> {
    let values: Vec<&Value> = docs.iter().flat_map(|d| values_at(d, &select.value)).collect();
    let numbers: Vec<f64> = values.iter().filter_map(|v| value_to_f64(v)).collect();
    let sum: f64 = numbers.iter().sum();

    Ok(match select.aggregate.as_str() {
        "count" if select.value == "." => json!(docs.len()),
        "count" => json!(values.len()),
        "sum" => json!(sum),
        "min" => json!(numbers.iter().cloned().reduce(f64::min)),
        "max" => json!(numbers.iter().cloned().reduce(f64::max)),
        "avg" if numbers.is_empty() => Value::Null,
        "avg" => json!(sum / numbers.len() as f64),
        "cardinality" => {
            let distinct: HashSet<String> = values.iter().map(|v| value_to_string(v)).collect();
            json!(distinct.len())
        }
        "stats" => json!({
            "count": numbers.len(),
            "sum": sum,
            "min": numbers.iter().cloned().reduce(f64::min),
            "max": numbers.iter().cloned().reduce(f64::max),
            "avg": if numbers.is_empty() { Value::Null } else { json!(sum / numbers.len() as f64) },
        }),
        NO_AGGREGATE | "one" => docs
            .first()
            .map(|d| lookup(d, &select.value))
            .unwrap_or(Value::Null),
        other => {
            return Err(QueryError::UnsupportedAggregate {
                select: select.name.clone(),
                aggregate: other.to_string(),
            })
        }
    })
}

fn ordering(a: &Value, b: &Value, sort: &[Sort]) -> Ordering {
    for s in sort {
        let ord = compare_values(&lookup(a, &s.field), &lookup(b, &s.field));
        let ord = match s.order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn sort_documents(docs: &mut [Value], sort: &[Sort]) {
    if !sort.is_empty() {
        docs.sort_by(|a, b| ordering(a, b, sort));
    }
}

/// Stable sort of output rows by output names.
pub fn sort_rows(rows: &mut [Row], sort: &[Sort]) {
    if sort.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        for s in sort {
            let left = a.get(&s.field).unwrap_or(&Value::Null);
            let right = b.get(&s.field).unwrap_or(&Value::Null);
            let ord = compare_values(left, right);
            let ord = match s.order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}
