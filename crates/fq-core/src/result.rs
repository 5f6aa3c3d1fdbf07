//! # Result Container
//!
//! Uniform tabular result every strategy returns. Rows are kept as JSON
//! objects keyed by output name; [`ResultContainer::to_json`] renders them
//! in the requested [`Format`].

use crate::error::QueryError;
use crate::path::values_equal;
use crate::query::Format;
use serde::Serialize;
use serde_json::{json, Map, Value};

pub type Row = Map<String, Value>;

/// Placeholder the HTTP layer replaces with the measured duration.
pub const TOTAL_TIME_PLACEHOLDER: &str = "{{TOTAL_TIME}}";

/// Most cells a `cube` rendering may allocate per measure.
pub const MAX_CUBE_CELLS: usize = 1_000_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timing {
    pub total: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultMeta {
    pub format: Format,
    pub content_type: String,
    pub timing: Timing,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_as: Option<String>,
}

impl ResultMeta {
    pub fn new(format: Format) -> Self {
        Self {
            format,
            content_type: "application/json".to_string(),
            timing: Timing {
                total: Value::String(TOTAL_TIME_PLACEHOLDER.to_string()),
            },
            saved_as: None,
        }
    }
}

/// Name and known partitions of one grouping dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeSummary {
    pub name: String,
    pub partitions: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultContainer {
    pub header: Vec<String>,
    pub rows: Vec<Row>,
    pub edges: Vec<EdgeSummary>,
    pub meta: ResultMeta,
}

impl ResultContainer {
    pub fn new(header: Vec<String>, rows: Vec<Row>, format: Format) -> Self {
        Self {
            header,
            rows,
            edges: Vec::new(),
            meta: ResultMeta::new(format),
        }
    }

    pub fn with_edges(mut self, edges: Vec<EdgeSummary>) -> Self {
        self.edges = edges;
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values of one output column, in row order.
    pub fn column(&self, name: &str) -> Vec<Value> {
        self.rows
            .iter()
            .map(|r| r.get(name).cloned().unwrap_or(Value::Null))
            .collect()
    }

    pub fn to_json(&self) -> Result<Value, QueryError> {
        let mut out = Map::new();
        out.insert("meta".into(), json!(self.meta));
        match self.meta.format {
            Format::List => {
                out.insert(
                    "data".into(),
                    Value::Array(self.rows.iter().cloned().map(Value::Object).collect()),
                );
            }
            Format::Table => {
                out.insert("header".into(), json!(self.header));
                let data: Vec<Value> = self
                    .rows
                    .iter()
                    .map(|row| {
                        Value::Array(
                            self.header
                                .iter()
                                .map(|h| row.get(h).cloned().unwrap_or(Value::Null))
                                .collect(),
                        )
                    })
                    .collect();
                out.insert("data".into(), Value::Array(data));
            }
            Format::Cube => {
                let (edges, data) = self.cube()?;
                out.insert("edges".into(), edges);
                out.insert("data".into(), data);
            }
        }
        Ok(Value::Object(out))
    }

    fn cube(&self) -> Result<(Value, Value), QueryError> {
        let mut dims: Vec<Vec<Value>> = self.edges.iter().map(|e| e.partitions.clone()).collect();
        for (dim, edge) in dims.iter_mut().zip(&self.edges) {
            for row in &self.rows {
                let v = row.get(&edge.name).cloned().unwrap_or(Value::Null);
                if !dim.iter().any(|p| p == &v || (values_equal(p, &v) && !v.is_null())) {
                    dim.push(v);
                }
            }
        }

        let edges_json: Vec<Value> = self
            .edges
            .iter()
            .zip(&dims)
            .map(|(e, parts)| json!({"name": e.name, "domain": {"type": "set", "partitions": parts}}))
            .collect();

        let sizes: Vec<usize> = dims.iter().map(Vec::len).collect();
        let total = sizes
            .iter()
            .try_fold(1usize, |acc, n| acc.checked_mul(*n))
            .filter(|total| *total <= MAX_CUBE_CELLS)
            .ok_or_else(|| {
                QueryError::UnhandledQueryShape(format!(
                    "cube of {sizes:?} partitions exceeds {MAX_CUBE_CELLS} cells, ask for the list or table format"
                ))
            })?;
        let measures = self
            .header
            .iter()
            .filter(|h| !self.edges.iter().any(|e| &e.name == *h));

        let mut data = Map::new();
        for measure in measures {
            let mut flat = vec![Value::Null; total];
            for row in &self.rows {
                let mut index = 0;
                let mut placed = true;
                for (dim, edge) in dims.iter().zip(&self.edges) {
                    let v = row.get(&edge.name).unwrap_or(&Value::Null);
                    match dim.iter().position(|p| p == v || (values_equal(p, v) && !v.is_null())) {
                        Some(pos) => index = index * dim.len() + pos,
                        None => placed = false,
                    }
                }
                if placed && index < total {
                    flat[index] = row.get(measure).cloned().unwrap_or(Value::Null);
                }
            }
            data.insert(measure.clone(), reshape(&flat, &sizes));
        }
        Ok((Value::Array(edges_json), Value::Object(data)))
    }
}

fn reshape(flat: &[Value], sizes: &[usize]) -> Value {
    match sizes {
        [] => flat.first().cloned().unwrap_or(Value::Null),
        [_] => Value::Array(flat.to_vec()),
        [n, rest @ ..] => {
            let stride: usize = rest.iter().product();
            Value::Array(
                (0..*n)
                    .map(|i| reshape(&flat[i * stride..(i + 1) * stride], rest))
                    .collect(),
            )
        }
    }
}
