use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::webhook::{classify_status, classify_transport};
use crate::credential::CredentialReference;
use crate::traits::{is_blank, ConfigIssue, NodeExecutor, Severity, StepContext, UpstreamResults};
use crate::ExecutorError;

const SLACK_API: &str = "https://slack.com";

/// Posts a message to a Slack channel with the owner's `slack` credential.
///
/// Config: `channel` (required), `message`, `username`, optional `credential`.
pub struct SlackSendNode {
    client: reqwest::Client,
    api_base: String,
}

impl SlackSendNode {
    pub fn new() -> Self {
        Self::with_api_base(reqwest::Client::new(), SLACK_API)
    }

    pub fn with_api_base(client: reqwest::Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into(),
        }
    }
}

impl Default for SlackSendNode {
    fn default() -> Self {
        Self::new()
    }
}

fn text<'a>(config: &'a Value, name: &str) -> &'a str {
    config.get(name).and_then(Value::as_str).unwrap_or_default()
}

/// Slack answers 200 with `{"ok": false, "error": ...}` on most failures.
pub(crate) fn check_reply(reply: &Value) -> Result<(), ExecutorError> {
    if reply.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(());
    }
    let reason = reply.get("error").and_then(Value::as_str).unwrap_or("unknown_error");
    match reason {
        "ratelimited" | "service_unavailable" | "request_timeout" | "internal_error" => {
            Err(ExecutorError::transient(format!("slack error: {reason}")))
        }
        _ => Err(ExecutorError::permanent(format!("slack error: {reason}"))),
    }
}

#[async_trait]
impl NodeExecutor for SlackSendNode {
    fn required_fields(&self) -> &'static [&'static str] {
        &["channel"]
    }

    fn output_fields(&self) -> Option<&'static [&'static str]> {
        Some(&["channel", "ts"])
    }

    fn credential_provider(&self) -> Option<&'static str> {
        Some("slack")
    }

    fn check_config(&self, config: &Value) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        if is_blank(config, "channel") {
            issues.push(ConfigIssue {
                severity: Severity::Error,
                field: "channel".into(),
                message: "Slack channel is required".into(),
                suggested_fix: Some("Select or enter a channel name".into()),
            });
        }
        if is_blank(config, "message") {
            issues.push(ConfigIssue {
                severity: Severity::Warning,
                field: "message".into(),
                message: "Message content is empty".into(),
                suggested_fix: Some("Add message text".into()),
            });
        }
        issues
    }

    async fn execute(
        &self,
        config: &Value,
        _upstream: &UpstreamResults,
        ctx: &StepContext,
    ) -> Result<Value, ExecutorError> {
        let channel = text(config, "channel");
        if channel.trim().is_empty() {
            return Err(ExecutorError::permanent("missing 'channel'"));
        }
        let mut payload = json!({ "channel": channel, "text": text(config, "message") });
        if !is_blank(config, "username") {
            payload["username"] = json!(text(config, "username"));
        }

        let reference = CredentialReference::from_config(config)
            .unwrap_or_else(|| CredentialReference::provider("slack"));
        let credential = ctx.credential(&reference).await?;

        debug!(node_id = %ctx.node_id, %channel, "posting slack message");
        let response = self
            .client
            .post(format!("{}/api/chat.postMessage", self.api_base))
            .bearer_auth(&credential.secret)
            .json(&payload)
            .send()
            .await
            .map_err(classify_transport)?;

        if let Some(err) = classify_status(response.status()) {
            return Err(err);
        }

        let reply: Value = response.json().await.map_err(classify_transport)?;
        check_reply(&reply)?;
        Ok(json!({
            "channel": reply.get("channel").cloned().unwrap_or_else(|| json!(channel)),
            "ts": reply.get("ts").cloned().unwrap_or(Value::Null),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_is_an_error_message_is_a_warning() {
        let issues = SlackSendNode::new().check_config(&json!({ "message": "" }));
        let severities: Vec<_> = issues.iter().map(|i| (i.field.as_str(), i.severity)).collect();
        assert_eq!(
            severities,
            vec![("channel", Severity::Error), ("message", Severity::Warning)]
        );
        assert!(SlackSendNode::new()
            .check_config(&json!({ "channel": "#ops", "message": "deployed" }))
            .is_empty());
    }

    #[test]
    fn reply_errors_are_classified() {
        assert!(check_reply(&json!({ "ok": true, "ts": "1.2" })).is_ok());
        assert!(check_reply(&json!({ "ok": false, "error": "ratelimited" }))
            .unwrap_err()
            .is_transient());
        let err = check_reply(&json!({ "ok": false, "error": "channel_not_found" })).unwrap_err();
        assert!(!err.is_transient());
        assert!(err.message().contains("channel_not_found"));
        assert!(!check_reply(&json!({})).unwrap_err().is_transient());
    }
}
