//! Row and execution result types.

use crate::error::{ErrorBody, GatewayError, RpcError, RpcResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A result row: column name to JSON value.
pub type Row = Map<String, Value>;

/// How a statement should be run on the direct connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryMode {
    pub read_only: bool,
    /// Use the simple query protocol so `;`-separated statements run in one call.
    pub multi_statement: bool,
}

impl QueryMode {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            multi_statement: false,
        }
    }

    pub fn with_multi_statement(mut self, multi: bool) -> Self {
        self.multi_statement = multi;
        self
    }
}

/// Either rows or a structured error; never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecutionResult {
    Rows { rows: Vec<Row> },
    Error { error: ErrorBody },
}

impl ExecutionResult {
    pub fn rows(rows: Vec<Row>) -> Self {
        Self::Rows { rows }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn as_rows(&self) -> Option<&[Row]> {
        match self {
            Self::Rows { rows } => Some(rows),
            Self::Error { .. } => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorBody> {
        match self {
            Self::Error { error } => Some(error),
            Self::Rows { .. } => None,
        }
    }

    /// Row count, or zero for errors.
    pub fn row_count(&self) -> usize {
        self.as_rows().map_or(0, <[Row]>::len)
    }
}

impl From<GatewayError> for ExecutionResult {
    fn from(err: GatewayError) -> Self {
        Self::Error {
            error: err.to_body(),
        }
    }
}

impl From<crate::error::Result<Vec<Row>>> for ExecutionResult {
    fn from(result: crate::error::Result<Vec<Row>>) -> Self {
        match result {
            Ok(rows) => Self::rows(rows),
            Err(e) => e.into(),
        }
    }
}

/// Normalize the helper function's payload into rows.
///
/// `null` means no rows. Anything other than an array of objects is a
/// format error.
pub fn rows_from_json(value: Value) -> RpcResult<Vec<Row>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Object(row) => Ok(row),
                other => Err(RpcError::Format(format!(
                    "row {i} is {} instead of an object",
                    json_kind(&other)
                ))),
            })
            .collect(),
        other => Err(RpcError::Format(format!(
            "expected an array of rows, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SecurityError;
    use serde_json::json;

    #[test]
    fn test_rows_from_json() {
        let rows = rows_from_json(json!([{"id": 1}, {"id": 2}])).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["id"], 2);

        assert!(rows_from_json(Value::Null).unwrap().is_empty());
        assert!(rows_from_json(json!([])).unwrap().is_empty());
    }

    #[test]
    fn test_rows_from_json_rejects_other_shapes() {
        assert!(matches!(
            rows_from_json(json!({"id": 1})),
            Err(RpcError::Format(_))
        ));
        assert!(matches!(
            rows_from_json(json!([1, 2])),
            Err(RpcError::Format(_))
        ));
    }

    #[test]
    fn test_execution_result_serialization() {
        let ok = ExecutionResult::rows(rows_from_json(json!([{"n": 1}])).unwrap());
        assert_eq!(serde_json::to_value(&ok).unwrap(), json!({"rows": [{"n": 1}]}));
        assert_eq!(ok.row_count(), 1);

        let err: ExecutionResult =
            GatewayError::from(SecurityError::InjectionDetected("line comment marker".into()))
                .into();
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["error"]["code"], "INJECTION_DETECTED");
        assert!(value.get("rows").is_none());
        assert!(err.is_error());
    }

    #[test]
    fn test_from_pipeline_result() {
        let rows: crate::error::Result<Vec<Row>> = Ok(rows_from_json(json!([{"n": 1}])).unwrap());
        assert_eq!(ExecutionResult::from(rows).row_count(), 1);

        let failed: crate::error::Result<Vec<Row>> =
            Err(SecurityError::UnbalancedQuoting('\'').into());
        let err = ExecutionResult::from(failed);
        assert_eq!(err.as_error().unwrap().code, "UNBALANCED_QUOTING");
    }
}
