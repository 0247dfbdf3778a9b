use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset};
use reqwest::Url;
use serde_json::{json, Value};
use tracing::debug;

use super::webhook::{classify_status, classify_transport};
use crate::credential::CredentialReference;
use crate::traits::{is_blank, ConfigIssue, NodeExecutor, Severity, StepContext, UpstreamResults};
use crate::ExecutorError;

const CALENDAR_API: &str = "https://www.googleapis.com";

/// Minutes an event lasts when `duration` is not set.
const DEFAULT_DURATION_MINUTES: i64 = 60;

/// Creates an event in a Google calendar using the owner's `google` credential.
///
/// Config: `calendar_id`, `title` and `start_time` (RFC 3339) are required;
/// `duration` in minutes, `description`, optional `credential`.
pub struct CalendarCreateEventNode {
    client: reqwest::Client,
    api_base: String,
}

impl CalendarCreateEventNode {
    pub fn new() -> Self {
        Self::with_api_base(reqwest::Client::new(), CALENDAR_API)
    }

    pub fn with_api_base(client: reqwest::Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into(),
        }
    }

    fn events_url(&self, calendar_id: &str) -> Result<Url, ExecutorError> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|err| ExecutorError::permanent(format!("invalid calendar api base: {err}")))?;
        url.path_segments_mut()
            .map_err(|_| ExecutorError::permanent("calendar api base cannot carry a path"))?
            .pop_if_empty()
            .extend(["calendar", "v3", "calendars", calendar_id, "events"]);
        Ok(url)
    }
}

impl Default for CalendarCreateEventNode {
    fn default() -> Self {
        Self::new()
    }
}

fn text<'a>(config: &'a Value, name: &str) -> &'a str {
    config.get(name).and_then(Value::as_str).unwrap_or_default()
}

fn duration_minutes(config: &Value) -> Option<i64> {
    match config.get("duration") {
        None | Some(Value::Null) => Some(DEFAULT_DURATION_MINUTES),
        Some(value) => value.as_i64().filter(|m| *m > 0),
    }
}

/// Build the Calendar API event resource from node config.
pub(crate) fn event_resource(config: &Value) -> Result<Value, ExecutorError> {
    for name in ["title", "start_time"] {
        if is_blank(config, name) {
            return Err(ExecutorError::permanent(format!("missing '{name}'")));
        }
    }
    let start = DateTime::<FixedOffset>::parse_from_rfc3339(text(config, "start_time"))
        .map_err(|err| ExecutorError::permanent(format!("'start_time' is not an RFC 3339 timestamp: {err}")))?;
    let minutes =
        duration_minutes(config).ok_or_else(|| ExecutorError::permanent("'duration' must be a positive number of minutes"))?;
    let end = Duration::try_minutes(minutes)
        .and_then(|span| start.checked_add_signed(span))
        .ok_or_else(|| ExecutorError::permanent("'duration' is out of range"))?;

    let mut event = json!({
        "summary": text(config, "title"),
        "start": { "dateTime": start.to_rfc3339() },
        "end": { "dateTime": end.to_rfc3339() },
    });
    if !is_blank(config, "description") {
        event["description"] = json!(text(config, "description"));
    }
    Ok(event)
}

#[async_trait]
impl NodeExecutor for CalendarCreateEventNode {
    fn required_fields(&self) -> &'static [&'static str] {
        &["calendar_id", "title", "start_time"]
    }

    fn output_fields(&self) -> Option<&'static [&'static str]> {
        Some(&["event_id", "html_link"])
    }

    fn credential_provider(&self) -> Option<&'static str> {
        Some("google")
    }

    fn check_config(&self, config: &Value) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        let required = [
            ("calendar_id", "Calendar ID is required", "Select a calendar from your connected account"),
            ("title", "Event title is required", "Add an event title"),
            ("start_time", "Event start time is required", "Set event start time"),
        ];
        for (field, message, fix) in required {
            if is_blank(config, field) {
                issues.push(ConfigIssue {
                    severity: Severity::Error,
                    field: field.into(),
                    message: message.into(),
                    suggested_fix: Some(fix.into()),
                });
            }
        }
        if duration_minutes(config).is_none() {
            issues.push(ConfigIssue {
                severity: Severity::Error,
                field: "duration".into(),
                message: "Event duration must be a positive number of minutes".into(),
                suggested_fix: Some(format!("Use {DEFAULT_DURATION_MINUTES} for a one hour event")),
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
        let calendar_id = text(config, "calendar_id");
        if calendar_id.trim().is_empty() {
            return Err(ExecutorError::permanent("missing 'calendar_id'"));
        }
        let event = event_resource(config)?;
        let url = self.events_url(calendar_id)?;

        let reference = CredentialReference::from_config(config)
            .unwrap_or_else(|| CredentialReference::provider("google"));
        let credential = ctx.credential(&reference).await?;

        debug!(node_id = %ctx.node_id, %calendar_id, "creating calendar event");
        let response = self
            .client
            .post(url)
            .bearer_auth(&credential.secret)
            .json(&event)
            .send()
            .await
            .map_err(classify_transport)?;

        if let Some(err) = classify_status(response.status()) {
            return Err(err);
        }

        let created: Value = response.json().await.map_err(classify_transport)?;
        Ok(json!({
            "event_id": created.get("id").cloned().unwrap_or(Value::Null),
            "html_link": created.get("htmlLink").cloned().unwrap_or(Value::Null),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calendar_title_and_start_are_required() {
        let issues = CalendarCreateEventNode::new().check_config(&json!({ "duration": 30 }));
        let fields: Vec<_> = issues
            .iter()
            .filter(|i| i.severity == Severity::Error)
            .map(|i| i.field.as_str())
            .collect();
        assert_eq!(fields, vec!["calendar_id", "title", "start_time"]);
        assert_eq!(issues[1].message, "Event title is required");
    }

    #[test]
    fn non_positive_duration_is_an_error() {
        let config = json!({
            "calendar_id": "primary",
            "title": "Sync",
            "start_time": "2026-03-02T09:00:00Z",
            "duration": 0
        });
        let issues = CalendarCreateEventNode::new().check_config(&config);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field, "duration");
    }

    #[test]
    fn event_ends_after_the_configured_duration() {
        let event = event_resource(&json!({
            "title": "Sync",
            "start_time": "2026-03-02T09:00:00+01:00",
            "duration": 90,
            "description": "weekly"
        }))
        .unwrap();
        assert_eq!(event["summary"], "Sync");
        assert_eq!(event["start"]["dateTime"], "2026-03-02T09:00:00+01:00");
        assert_eq!(event["end"]["dateTime"], "2026-03-02T10:30:00+01:00");
        assert_eq!(event["description"], "weekly");

        let default = event_resource(&json!({ "title": "Sync", "start_time": "2026-03-02T09:00:00Z" })).unwrap();
        assert_eq!(default["end"]["dateTime"], "2026-03-02T10:00:00+00:00");
        assert!(default.get("description").is_none());
    }

    #[test]
    fn unparsable_start_time_is_permanent() {
        let err = event_resource(&json!({ "title": "Sync", "start_time": "tomorrow" })).unwrap_err();
        assert!(!err.is_transient());
        assert!(err.message().contains("start_time"));
    }

    #[test]
    fn calendar_id_is_escaped_into_the_path() {
        let node = CalendarCreateEventNode::with_api_base(reqwest::Client::new(), "http://localhost:8080/");
        let url = node.events_url("team@group.calendar.google.com/x").unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8080/calendar/v3/calendars/team@group.calendar.google.com%2Fx/events"
        );
    }
}
