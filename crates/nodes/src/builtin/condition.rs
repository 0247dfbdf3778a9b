use async_trait::async_trait;
use serde_json::{json, Value};

use crate::predicate::Predicate;
use crate::traits::{upstream_view, ConfigIssue, NodeExecutor, NodeKind, Severity, StepContext, UpstreamResults};
use crate::ExecutorError;

/// Evaluates `{"field", "op", "value"}` against its upstream results and
/// emits `{"result": bool}`.
///
/// Outgoing edges pick a branch with `condition: true` / `condition: false`.
pub struct ConditionNode;

#[async_trait]
impl NodeExecutor for ConditionNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Condition
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["field", "op"]
    }

    fn output_fields(&self) -> Option<&'static [&'static str]> {
        Some(&["result"])
    }

    fn check_config(&self, config: &Value) -> Vec<ConfigIssue> {
        let missing: Vec<ConfigIssue> = self
            .required_fields()
            .iter()
            .filter(|field| crate::traits::is_blank(config, field))
            .map(|field| ConfigIssue::missing(field))
            .collect();
        if !missing.is_empty() {
            return missing;
        }

        match serde_json::from_value::<Predicate>(config.clone()) {
            Err(err) => vec![ConfigIssue {
                severity: Severity::Error,
                field: "op".into(),
                message: format!("invalid condition: {err}"),
                suggested_fix: Some("use one of eq, ne, gt, gte, lt, lte, contains, exists, truthy".into()),
            }],
            Ok(predicate) if predicate.op.needs_value() && predicate.value.is_none() => vec![ConfigIssue {
                severity: Severity::Error,
                field: "value".into(),
                message: "comparison value is required for this operator".into(),
                suggested_fix: Some("set 'value' to compare against".into()),
            }],
            Ok(_) => vec![],
        }
    }

    async fn execute(
        &self,
        config: &Value,
        upstream: &UpstreamResults,
        _ctx: &StepContext,
    ) -> Result<Value, ExecutorError> {
        let predicate: Predicate = serde_json::from_value(config.clone())
            .map_err(|e| ExecutorError::permanent(format!("invalid condition config: {e}")))?;

        let result = predicate.evaluate(&upstream_view(upstream));
        Ok(json!({ "result": result }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::MemoryCredentialResolver;
    use crate::traits::StepContext;
    use std::sync::Arc;
    use std::time::Duration;

    fn ctx() -> StepContext {
        StepContext {
            flow_id: uuid::Uuid::new_v4(),
            run_id: uuid::Uuid::new_v4(),
            node_id: "cond".into(),
            attempt: 1,
            trigger_payload: Value::Null,
            credentials: Arc::new(MemoryCredentialResolver::new()),
            credential_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn evaluates_against_single_upstream() {
        let config = json!({ "field": "amount", "op": "gt", "value": 100 });
        let mut upstream = UpstreamResults::new();
        upstream.insert("trigger".into(), json!({ "amount": 250 }));

        let out = ConditionNode.execute(&config, &upstream, &ctx()).await.unwrap();
        assert_eq!(out, json!({ "result": true }));
    }

    #[tokio::test]
    async fn multiple_upstreams_are_addressed_by_node_id() {
        let config = json!({ "field": "fetch.status", "op": "eq", "value": 404 });
        let mut upstream = UpstreamResults::new();
        upstream.insert("fetch".into(), json!({ "status": 200 }));
        upstream.insert("other".into(), json!({}));

        let out = ConditionNode.execute(&config, &upstream, &ctx()).await.unwrap();
        assert_eq!(out, json!({ "result": false }));
    }

    #[test]
    fn config_checks_report_missing_and_invalid_fields() {
        assert_eq!(ConditionNode.check_config(&json!({ "op": "eq" }))[0].field, "field");
        assert_eq!(
            ConditionNode.check_config(&json!({ "field": "x", "op": "eq" }))[0].field,
            "value"
        );
        assert_eq!(ConditionNode.check_config(&json!({ "field": "x", "op": "like" }))[0].field, "op");
        assert!(ConditionNode.check_config(&json!({ "field": "x", "op": "exists" })).is_empty());
    }
}
