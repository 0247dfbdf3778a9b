use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{json, Value};
use tracing::debug;

use super::webhook::{classify_status, classify_transport};
use crate::credential::CredentialReference;
use crate::traits::{is_blank, ConfigIssue, NodeExecutor, Severity, StepContext, UpstreamResults};
use crate::ExecutorError;

const GMAIL_API: &str = "https://gmail.googleapis.com";

/// Sends a plain-text e-mail through the Gmail API using the owner's
/// `google` credential.
///
/// Config: `to` (required), `subject`, `body`, optional `credential`
/// to pick a specific account.
pub struct GmailSendNode {
    client: reqwest::Client,
    api_base: String,
}

impl GmailSendNode {
    pub fn new() -> Self {
        Self::with_api_base(reqwest::Client::new(), GMAIL_API)
    }

    pub fn with_api_base(client: reqwest::Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into(),
        }
    }
}

impl Default for GmailSendNode {
    fn default() -> Self {
        Self::new()
    }
}

fn field<'a>(config: &'a Value, name: &str) -> &'a str {
    config.get(name).and_then(Value::as_str).unwrap_or_default()
}

/// Config fields written into message headers.
const HEADER_FIELDS: [&str; 2] = ["to", "subject"];

fn breaks_header(value: &str) -> bool {
    value.contains(['\r', '\n'])
}

/// Build the base64url RFC 2822 message. Header values must be single-line.
pub(crate) fn compose_raw(to: &str, subject: &str, body: &str) -> Result<String, ExecutorError> {
    for (name, value) in [("to", to), ("subject", subject)] {
        if breaks_header(value) {
            return Err(ExecutorError::permanent(format!("'{name}' must not contain line breaks")));
        }
    }
    let message = format!(
        "To: {to}\r\nSubject: {subject}\r\nContent-Type: text/plain; charset=UTF-8\r\n\r\n{body}"
    );
    Ok(URL_SAFE_NO_PAD.encode(message))
}

#[async_trait]
impl NodeExecutor for GmailSendNode {
    fn required_fields(&self) -> &'static [&'static str] {
        &["to"]
    }

    fn output_fields(&self) -> Option<&'static [&'static str]> {
        Some(&["message_id", "thread_id"])
    }

    fn credential_provider(&self) -> Option<&'static str> {
        Some("google")
    }

    fn check_config(&self, config: &Value) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        if is_blank(config, "to") {
            issues.push(ConfigIssue {
                severity: Severity::Error,
                field: "to".into(),
                message: "Email recipient is required".into(),
                suggested_fix: Some("Add recipient email address".into()),
            });
        }
        if is_blank(config, "subject") {
            issues.push(ConfigIssue {
                severity: Severity::Warning,
                field: "subject".into(),
                message: "Email subject is empty".into(),
                suggested_fix: Some("Add a subject line".into()),
            });
        }
        for name in HEADER_FIELDS {
            if breaks_header(field(config, name)) {
                issues.push(ConfigIssue {
                    severity: Severity::Error,
                    field: name.into(),
                    message: format!("Email {name} must be a single line"),
                    suggested_fix: Some("Remove line breaks".into()),
                });
            }
        }
        if is_blank(config, "body") {
            issues.push(ConfigIssue {
                severity: Severity::Warning,
                field: "body".into(),
                message: "Email body is empty".into(),
                suggested_fix: Some("Add email content".into()),
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
        let to = field(config, "to");
        if to.is_empty() {
            return Err(ExecutorError::permanent("missing recipient 'to'"));
        }
        let raw = compose_raw(to, field(config, "subject"), field(config, "body"))?;

        let reference = CredentialReference::from_config(config)
            .unwrap_or_else(|| CredentialReference::provider("google"));
        let credential = ctx.credential(&reference).await?;

        let url = format!("{}/gmail/v1/users/me/messages/send", self.api_base);

        debug!(node_id = %ctx.node_id, account = %credential.account_identifier, "sending gmail message");
        let response = self
            .client
            .post(url)
            .bearer_auth(&credential.secret)
            .json(&json!({ "raw": raw }))
            .send()
            .await
            .map_err(classify_transport)?;

        if let Some(err) = classify_status(response.status()) {
            return Err(err);
        }

        let sent: Value = response.json().await.map_err(classify_transport)?;
        Ok(json!({
            "message_id": sent.get("id").cloned().unwrap_or(Value::Null),
            "thread_id": sent.get("threadId").cloned().unwrap_or(Value::Null),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipient_is_an_error_subject_and_body_are_warnings() {
        let issues = GmailSendNode::new().check_config(&json!({}));
        let severities: Vec<_> = issues.iter().map(|i| (i.field.as_str(), i.severity)).collect();
        assert_eq!(
            severities,
            vec![
                ("to", Severity::Error),
                ("subject", Severity::Warning),
                ("body", Severity::Warning)
            ]
        );
    }

    #[test]
    fn raw_message_is_url_safe_base64() {
        let raw = compose_raw("a@b.c", "Hi", "Body?>").unwrap();
        let decoded = URL_SAFE_NO_PAD.decode(raw).unwrap();
        let text = String::from_utf8(decoded).unwrap();
        assert!(text.starts_with("To: a@b.c\r\nSubject: Hi\r\n"));
        assert!(text.ends_with("\r\n\r\nBody?>"));
    }

    #[test]
    fn line_breaks_in_header_fields_are_rejected() {
        let err = compose_raw("a@b.c\r\nBcc: someone@else.test", "Hi", "body").unwrap_err();
        assert!(!err.is_transient());
        assert!(compose_raw("a@b.c", "Hi\nX-Extra: 1", "body").is_err());
        assert!(compose_raw("a@b.c", "Hi", "line one\r\nline two").is_ok());

        let issues = GmailSendNode::new().check_config(&json!({
            "to": "a@b.c\nBcc: someone@else.test",
            "subject": "Hi\r\nX-Extra: 1",
            "body": "text"
        }));
        let errors: Vec<_> = issues
            .iter()
            .filter(|i| i.severity == Severity::Error)
            .map(|i| i.field.as_str())
            .collect();
        assert_eq!(errors, vec!["to", "subject"]);
    }
}
