//! Field assignments rendered in the backend's update-script language.

use fq_core::QueryError;
use serde_json::Value;

/// Turns an assigned value into a script expression.
pub trait ScriptTranslator: Send + Sync {
    fn translate(&self, value: &Value) -> Result<String, QueryError>;

    /// The statement that sets `field` of the updated document.
    fn assignment(&self, field: &str, value: &Value) -> Result<String, QueryError> {
        Ok(format!("ctx._source.{field} = {};", self.translate(value)?))
    }
}

/// Renders JSON literals. Objects are not literals; they go through a
/// document merge instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiteralTranslator;

impl ScriptTranslator for LiteralTranslator {
    fn translate(&self, value: &Value) -> Result<String, QueryError> {
        if contains_object(value) {
            return Err(QueryError::malformed(format!(
                "can not assign {value} as a script literal, use {{\"doc\": ...}}"
            )));
        }
        serde_json::to_string(value).map_err(|e| QueryError::malformed(e.to_string()))
    }
}

fn contains_object(value: &Value) -> bool {
    match value {
        Value::Object(_) => true,
        Value::Array(items) => items.iter().any(contains_object),
        _ => false,
    }
}
