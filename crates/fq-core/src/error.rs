//! # Structured Errors
//!
//! Every failure the engine reports crosses into the HTTP layer as a
//! [`QueryError`]: a machine-readable [`ErrorKind`], a `{{name}}` style
//! template and the values to substitute into it.

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use serde_json::json;

/// Machine-readable error category.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedInput,
    UnknownField,
    UnsupportedAggregate,
    UnhandledQueryShape,
    CacheConsistencyViolation,
    Backend,
    PartialMutationFailure,
    UnknownMetadataTable,
}

/// One document a bulk update could not apply.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FailedItem {
    pub id: String,
    pub status: u16,
    pub error: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryError {
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("no such field `{field}` in `{table}`")]
    UnknownField { table: String, field: String },

    #[error("can not aggregate `{select}` because `{aggregate}` is not a recognized aggregate")]
    UnsupportedAggregate { select: String, aggregate: String },

    #[error("can not handle query shape: {0}")]
    UnhandledQueryShape(String),

    #[error("using `{name}` for two different containers: {existing} and {conflicting}")]
    CacheConsistencyViolation {
        name: String,
        existing: String,
        conflicting: String,
    },

    #[error("backend error: {message}")]
    Backend {
        message: String,
        status: Option<u16>,
        /// Set when the advisory cache-clear was issued before reporting.
        cache_cleared: bool,
    },

    #[error("could not update {} document(s)", .failures.len())]
    PartialMutationFailure { failures: Vec<FailedItem> },

    #[error("unknown metadata table `{0}`, only `meta.columns` exists")]
    UnknownMetadataTable(String),
}

impl QueryError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedInput(message.into())
    }

    pub fn backend(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Backend {
            message: message.into(),
            status,
            cache_cleared: false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedInput(_) => ErrorKind::MalformedInput,
            Self::UnknownField { .. } => ErrorKind::UnknownField,
            Self::UnsupportedAggregate { .. } => ErrorKind::UnsupportedAggregate,
            Self::UnhandledQueryShape(_) => ErrorKind::UnhandledQueryShape,
            Self::CacheConsistencyViolation { .. } => ErrorKind::CacheConsistencyViolation,
            Self::Backend { .. } => ErrorKind::Backend,
            Self::PartialMutationFailure { .. } => ErrorKind::PartialMutationFailure,
            Self::UnknownMetadataTable(_) => ErrorKind::UnknownMetadataTable,
        }
    }

    pub fn template(&self) -> &'static str {
        match self {
            Self::MalformedInput(_) => "Malformed input: {{reason}}",
            Self::UnknownField { .. } => "No such field {{field}} in {{table}}",
            Self::UnsupportedAggregate { .. } => {
                "Can not aggregate {{select}} because {{aggregate}} is not a recognized aggregate"
            }
            Self::UnhandledQueryShape(_) => "Can not handle query shape: {{reason}}",
            Self::CacheConsistencyViolation { .. } => {
                "Using {{name}} for two different containers\n\t{{existing}}\n\t{{new}}"
            }
            Self::Backend { .. } => "Problem with backend: {{message}}",
            Self::PartialMutationFailure { .. } => "could not update: {{error}}",
            Self::UnknownMetadataTable(_) => {
                "Unknown metadata: {{name}}.  Only `meta.columns` exists for now."
            }
        }
    }

    pub fn params(&self) -> serde_json::Value {
        match self {
            Self::MalformedInput(reason) | Self::UnhandledQueryShape(reason) => {
                json!({ "reason": reason })
            }
            Self::UnknownField { table, field } => json!({ "table": table, "field": field }),
            Self::UnsupportedAggregate { select, aggregate } => {
                json!({ "select": select, "aggregate": aggregate })
            }
            Self::CacheConsistencyViolation {
                name,
                existing,
                conflicting,
            } => json!({ "name": name, "existing": existing, "new": conflicting }),
            Self::Backend {
                message,
                status,
                cache_cleared,
            } => json!({ "message": message, "status": status, "cache_cleared": cache_cleared }),
            Self::PartialMutationFailure { failures } => json!({ "error": failures }),
            Self::UnknownMetadataTable(name) => json!({ "name": name }),
        }
    }
}

impl Serialize for QueryError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("QueryError", 4)?;
        state.serialize_field("kind", &self.kind())?;
        state.serialize_field("template", self.template())?;
        state.serialize_field("params", &self.params())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_kind_template_and_params() {
        let err = QueryError::UnsupportedAggregate {
            select: "total".into(),
            aggregate: "median".into(),
        };
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["kind"], "unsupported_aggregate");
        assert_eq!(value["params"]["select"], "total");
        assert!(value["template"].as_str().unwrap().contains("{{aggregate}}"));
        assert!(value["message"].as_str().unwrap().contains("median"));
    }

    #[test]
    fn test_partial_failure_message_counts_items() {
        let err = QueryError::PartialMutationFailure {
            failures: vec![FailedItem {
                id: "7".into(),
                status: 409,
                error: None,
            }],
        };
        assert_eq!(err.kind(), ErrorKind::PartialMutationFailure);
        assert_eq!(err.to_string(), "could not update 1 document(s)");
    }
}
