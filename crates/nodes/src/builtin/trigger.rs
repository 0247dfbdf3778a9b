use async_trait::async_trait;
use serde_json::Value;

use crate::traits::{NodeExecutor, NodeKind, StepContext, UpstreamResults};
use crate::ExecutorError;

/// Entry marker for trigger types (`gmail_trigger`, `webhook_trigger`, ...).
///
/// The triggering event supplies the payload externally; the scheduler never
/// dispatches to this executor.
pub struct TriggerNode;

#[async_trait]
impl NodeExecutor for TriggerNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Trigger
    }

    async fn execute(
        &self,
        _config: &Value,
        _upstream: &UpstreamResults,
        ctx: &StepContext,
    ) -> Result<Value, ExecutorError> {
        Err(ExecutorError::permanent(format!(
            "trigger node '{}' is an entry marker and cannot be executed",
            ctx.node_id
        )))
    }
}
