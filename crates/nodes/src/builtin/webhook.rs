use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tracing::debug;

use crate::credential::CredentialReference;
use crate::traits::{upstream_view, ConfigIssue, NodeExecutor, Severity, StepContext, UpstreamResults};
use crate::ExecutorError;

/// Outbound HTTP call.
///
/// Config: `url` (required), `method` (default `POST`), `headers` (object),
/// `body` (defaults to the upstream results), `credential` (sent as a bearer token).
pub struct WebhookNode {
    client: reqwest::Client,
}

impl WebhookNode {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for WebhookNode {
    fn default() -> Self {
        Self::new()
    }
}

/// 429 and 5xx are worth retrying; other failures are not.
pub(crate) fn classify_status(status: StatusCode) -> Option<ExecutorError> {
    if status.is_success() {
        None
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Some(ExecutorError::transient(format!("endpoint responded {status}")))
    } else {
        Some(ExecutorError::permanent(format!("endpoint responded {status}")))
    }
}

pub(crate) fn classify_transport(err: reqwest::Error) -> ExecutorError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ExecutorError::transient(format!("request failed: {err}"))
    } else {
        ExecutorError::permanent(format!("request failed: {err}"))
    }
}

#[async_trait]
impl NodeExecutor for WebhookNode {
    fn required_fields(&self) -> &'static [&'static str] {
        &["url"]
    }

    fn output_fields(&self) -> Option<&'static [&'static str]> {
        Some(&["status", "body"])
    }

    fn check_config(&self, config: &Value) -> Vec<ConfigIssue> {
        let Some(url) = config.get("url").and_then(Value::as_str).filter(|u| !u.trim().is_empty()) else {
            return vec![ConfigIssue {
                severity: Severity::Error,
                field: "url".into(),
                message: "Webhook URL is required".into(),
                suggested_fix: Some("Add webhook endpoint URL".into()),
            }];
        };

        let mut issues = Vec::new();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            issues.push(ConfigIssue {
                severity: Severity::Error,
                field: "url".into(),
                message: "Invalid webhook URL format".into(),
                suggested_fix: Some("URL must start with http:// or https://".into()),
            });
        }
        if let Some(method) = config.get("method").and_then(Value::as_str) {
            if Method::from_bytes(method.to_ascii_uppercase().as_bytes()).is_err() {
                issues.push(ConfigIssue {
                    severity: Severity::Error,
                    field: "method".into(),
                    message: format!("unsupported HTTP method '{method}'"),
                    suggested_fix: Some("use GET, POST, PUT, PATCH or DELETE".into()),
                });
            }
        }
        issues
    }

    async fn execute(
        &self,
        config: &Value,
        upstream: &UpstreamResults,
        ctx: &StepContext,
    ) -> Result<Value, ExecutorError> {
        let url = config
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutorError::permanent("missing 'url'"))?;
        let method = config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("POST")
            .to_ascii_uppercase();
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| ExecutorError::permanent(format!("unsupported HTTP method '{method}'")))?;

        let mut request = self.client.request(method.clone(), url);

        if let Some(headers) = config.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name.as_str(), value);
                }
            }
        }

        if let Some(reference) = CredentialReference::from_config(config) {
            let credential = ctx.credential(&reference).await?;
            request = request.bearer_auth(credential.secret);
        }

        if method != Method::GET {
            let body = config.get("body").cloned().unwrap_or_else(|| upstream_view(upstream));
            request = request.json(&body);
        }

        debug!(node_id = %ctx.node_id, %url, attempt = ctx.attempt, "sending webhook request");
        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();

        if let Some(err) = classify_status(status) {
            return Err(err);
        }

        let text = response.text().await.map_err(classify_transport)?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok(json!({ "status": status.as_u16(), "body": body }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_scheme_is_checked() {
        let node = WebhookNode::new();
        assert!(node.check_config(&json!({ "url": "https://hooks.example.com/x" })).is_empty());

        let issues = node.check_config(&json!({ "url": "ftp://example.com" }));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].message, "Invalid webhook URL format");

        let issues = node.check_config(&json!({}));
        assert_eq!(issues[0].field, "url");
    }

    #[test]
    fn bad_method_is_reported() {
        let issues = WebhookNode::new().check_config(&json!({ "url": "http://x", "method": "GE T" }));
        assert_eq!(issues[0].field, "method");
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::OK).is_none());
        assert!(classify_status(StatusCode::BAD_GATEWAY).unwrap().is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS).unwrap().is_transient());
        assert!(!classify_status(StatusCode::NOT_FOUND).unwrap().is_transient());
    }
}
