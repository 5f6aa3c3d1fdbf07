//! # Domain Classifier
//!
//! Picks how a column's space of values is represented, from the
//! cardinality statistics the backend reports for it.
//!
//! | column type | distinct count | domain                 |
//! |-------------|----------------|------------------------|
//! | boolean     | any            | `Set [false, true]`    |
//! | numeric     | `<= 30`        | `Set` of partitions    |
//! | numeric     | `> 30`         | `Numeric`              |
//! | other       | `<= 1000`      | `Set` of partitions    |
//! | other       | `> 1000`       | `Unique`               |

use crate::column::{is_boolean_type, is_numeric_type};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Largest distinct count for which a numeric column is enumerated.
pub const NUMERIC_SET_LIMIT: u64 = 30;
/// Largest distinct count for which any other column is enumerated.
pub const SET_LIMIT: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Domain {
    /// Explicit, ordered list of observed values.
    Set { partitions: Vec<Value> },
    /// Continuous numeric range.
    Numeric,
    /// Individually distinguishing values, not worth enumerating.
    Unique,
}

impl Domain {
    pub fn boolean() -> Self {
        Self::Set {
            partitions: vec![Value::Bool(false), Value::Bool(true)],
        }
    }

    pub fn partitions(&self) -> Option<&[Value]> {
        match self {
            Self::Set { partitions } => Some(partitions),
            _ => None,
        }
    }
}

/// Per-column statistics reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub count: u64,
    #[serde(default)]
    pub partitions: Vec<Value>,
}

/// Choose the domain for a column of `data_type`.
///
/// Returns `None` when no usable statistics exist: the column is not yet
/// classified, which is not an error.
pub fn classify(data_type: &str, stats: Option<&ColumnStats>) -> Option<Domain> {
    if is_boolean_type(data_type) {
        return Some(Domain::boolean());
    }
    let stats = stats.filter(|s| s.count > 0)?;
    let limit = if is_numeric_type(data_type) {
        NUMERIC_SET_LIMIT
    } else {
        SET_LIMIT
    };
    if stats.count <= limit {
        return Some(Domain::Set {
            partitions: stats.partitions.clone(),
        });
    }
    if is_numeric_type(data_type) {
        Some(Domain::Numeric)
    } else {
        Some(Domain::Unique)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn stats(count: u64, partitions: Vec<Value>) -> ColumnStats {
        ColumnStats { count, partitions }
    }

    #[test]
    fn test_boolean_ignores_counts() {
        assert_eq!(classify("boolean", None), Some(Domain::boolean()));
        assert_eq!(
            classify("boolean", Some(&stats(5000, vec![]))),
            Some(Domain::boolean())
        );
    }

    #[test]
    fn test_missing_or_zero_stats_leave_column_unclassified() {
        assert_eq!(classify("string", None), None);
        assert_eq!(classify("long", Some(&stats(0, vec![]))), None);
    }

    #[test]
    fn test_thresholds_are_inclusive() {
        let parts: Vec<Value> = (0..30).map(|i| json!(i)).collect();
        assert_eq!(
            classify("integer", Some(&stats(30, parts.clone()))),
            Some(Domain::Set { partitions: parts })
        );
        assert_eq!(classify("integer", Some(&stats(31, vec![]))), Some(Domain::Numeric));
        assert_eq!(classify("string", Some(&stats(1001, vec![]))), Some(Domain::Unique));
    }

    #[test]
    fn test_serialized_shape() {
        let value = serde_json::to_value(Domain::Numeric).unwrap();
        assert_eq!(value, json!({"type": "numeric"}));
    }

    proptest! {
        #[test]
        fn numeric_enumerates_up_to_thirty(count in 1u64..=30, ty in prop::sample::select(vec!["integer", "long", "float", "double"])) {
            let parts: Vec<Value> = (0..count).rev().map(|i| json!(i)).collect();
            let domain = classify(ty, Some(&stats(count, parts.clone())));
            prop_assert_eq!(domain, Some(Domain::Set { partitions: parts }));
        }

        #[test]
        fn numeric_above_thirty_is_a_range(count in 31u64..1_000_000, ty in prop::sample::select(vec!["integer", "long", "float", "double"])) {
            prop_assert_eq!(classify(ty, Some(&stats(count, vec![]))), Some(Domain::Numeric));
        }

        #[test]
        fn other_types_enumerate_up_to_a_thousand(count in 1u64..=1000) {
            let parts: Vec<Value> = (0..count.min(50)).map(|i| json!(format!("v{i}"))).collect();
            let domain = classify("string", Some(&stats(count, parts.clone())));
            prop_assert_eq!(domain, Some(Domain::Set { partitions: parts }));
        }

        #[test]
        fn other_types_above_a_thousand_are_unique(count in 1001u64..10_000_000) {
            prop_assert_eq!(classify("keyword", Some(&stats(count, vec![]))), Some(Domain::Unique));
        }

        #[test]
        fn boolean_always_boolean(count in 0u64..10_000_000) {
            prop_assert_eq!(classify("boolean", Some(&stats(count, vec![]))), Some(Domain::boolean()));
        }
    }
}
