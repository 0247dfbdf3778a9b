use async_trait::async_trait;
use serde_json::Value;

use crate::traits::{ConfigIssue, NodeExecutor, Severity, StepContext, UpstreamResults};
use crate::ExecutorError;

/// Emits the object under `values` as its output.
///
/// Useful for shaping data between connectors and for dry runs.
pub struct SetNode;

#[async_trait]
impl NodeExecutor for SetNode {
    fn required_fields(&self) -> &'static [&'static str] {
        &["values"]
    }

    fn check_config(&self, config: &Value) -> Vec<ConfigIssue> {
        match config.get("values") {
            None | Some(Value::Null) => vec![ConfigIssue::missing("values")],
            Some(Value::Object(_)) => vec![],
            Some(_) => vec![ConfigIssue {
                severity: Severity::Error,
                field: "values".into(),
                message: "'values' must be an object".into(),
                suggested_fix: Some("use a JSON object of field names to values".into()),
            }],
        }
    }

    async fn execute(
        &self,
        config: &Value,
        _upstream: &UpstreamResults,
        _ctx: &StepContext,
    ) -> Result<Value, ExecutorError> {
        match config.get("values") {
            Some(values @ Value::Object(_)) => Ok(values.clone()),
            _ => Err(ExecutorError::permanent("'values' must be an object")),
        }
    }
}
