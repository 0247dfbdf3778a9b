//! Run history summaries for one flow: status counts, success rate and
//! durations, plus a digest of recent failures.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Run, RunStatus};
use crate::store::{RunFilter, RunStore};

/// Longest error pattern kept in an [`ErrorDigest`], in characters.
const PATTERN_LEN: usize = 100;

/// Aggregate over the runs of one flow started at or after `since`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStats {
    pub flow_id: Uuid,
    pub since: DateTime<Utc>,
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub success: usize,
    pub error: usize,
    pub timeout: usize,
    pub cancelled: usize,
    /// Share of `success` among all runs in the window, `0.0..=100.0`.
    pub success_rate_percent: f64,
    /// Over completed runs only; `None` when nothing completed.
    pub min_duration_secs: Option<f64>,
    pub avg_duration_secs: Option<f64>,
    pub max_duration_secs: Option<f64>,
    pub runs_per_day: f64,
}

impl RunStats {
    /// Summarize `runs`, ignoring those of other flows or started before `since`.
    pub fn summarize(flow_id: Uuid, runs: &[Run], since: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let window: Vec<&Run> = runs
            .iter()
            .filter(|r| r.flow_id == flow_id && r.started_at >= since)
            .collect();
        let count = |status: RunStatus| window.iter().filter(|r| r.status == status).count();

        let durations: Vec<f64> = window
            .iter()
            .filter_map(|r| r.completed_at.map(|done| done.signed_duration_since(r.started_at)))
            .map(|d| d.num_milliseconds() as f64 / 1000.0)
            .collect();

        let total = window.len();
        let success = count(RunStatus::Success);
        let days = now.signed_duration_since(since).num_seconds() as f64 / 86_400.0;

        Self {
            flow_id,
            since,
            total,
            pending: count(RunStatus::Pending),
            running: count(RunStatus::Running),
            success,
            error: count(RunStatus::Error),
            timeout: count(RunStatus::Timeout),
            cancelled: count(RunStatus::Cancelled),
            success_rate_percent: if total == 0 { 0.0 } else { success as f64 * 100.0 / total as f64 },
            min_duration_secs: durations.iter().copied().reduce(f64::min),
            avg_duration_secs: (!durations.is_empty())
                .then(|| durations.iter().sum::<f64>() / durations.len() as f64),
            max_duration_secs: durations.iter().copied().reduce(f64::max),
            runs_per_day: if days > 0.0 { total as f64 / days } else { 0.0 },
        }
    }
}

/// Recent `error` runs of one flow, newest first, grouped by message.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorDigest {
    pub flow_id: Uuid,
    pub since: DateTime<Utc>,
    pub runs: Vec<Run>,
    /// First line of each error message (truncated) -> occurrences.
    pub patterns: BTreeMap<String, usize>,
}

impl ErrorDigest {
    pub fn collect(flow_id: Uuid, runs: Vec<Run>, since: DateTime<Utc>, limit: usize) -> Self {
        let mut errors: Vec<Run> = runs
            .into_iter()
            .filter(|r| r.flow_id == flow_id && r.status == RunStatus::Error && r.started_at >= since)
            .collect();
        errors.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        errors.truncate(limit);

        let mut patterns = BTreeMap::new();
        for run in &errors {
            *patterns.entry(error_pattern(run.error_message.as_deref())).or_insert(0) += 1;
        }

        Self {
            flow_id,
            since,
            runs: errors,
            patterns,
        }
    }
}

fn error_pattern(message: Option<&str>) -> String {
    let first_line = message.and_then(|m| m.lines().next()).unwrap_or("unknown error");
    first_line.chars().take(PATTERN_LEN).collect()
}

pub async fn run_stats(
    store: &dyn RunStore,
    flow_id: Uuid,
    since: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<RunStats, StoreError> {
    let runs = store.list_runs(RunFilter::flow(flow_id)).await?;
    Ok(RunStats::summarize(flow_id, &runs, since, now))
}

pub async fn recent_errors(
    store: &dyn RunStore,
    flow_id: Uuid,
    since: DateTime<Utc>,
    limit: usize,
) -> Result<ErrorDigest, StoreError> {
    let runs = store
        .list_runs(RunFilter {
            flow_id: Some(flow_id),
            status: Some(RunStatus::Error),
        })
        .await?;
    Ok(ErrorDigest::collect(flow_id, runs, since, limit))
}
