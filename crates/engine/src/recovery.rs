//! Startup recovery for runs left behind by an interrupted process.
//!
//! Only call this before any scheduler in the process starts executing runs:
//! every `pending` or `running` run found is assumed to be orphaned.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{LogEntry, RunStatus};
use crate::store::{RunFilter, RunStore};

/// A run finalized by [`recover_orphaned_runs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredRun {
    pub run_id: Uuid,
    pub flow_id: Uuid,
    pub status: RunStatus,
}

/// Finalize orphaned runs.
///
/// - `running` past `run_timeout` (measured from `started_at`) -> `timeout`
/// - `running` within budget -> `error`
/// - `pending` -> `cancelled`
///
/// A run that cannot be finalized is logged and skipped; only a failure to
/// list runs is returned as an error.
pub async fn recover_orphaned_runs(
    store: &dyn RunStore,
    run_timeout: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<RecoveredRun>, StoreError> {
    let budget = chrono::Duration::from_std(run_timeout).unwrap_or_else(|_| chrono::Duration::weeks(52 * 1000));
    let mut orphans = Vec::new();

    for run in store.list_runs(RunFilter::status(RunStatus::Running)).await? {
        let elapsed = now.signed_duration_since(run.started_at);
        let (status, message) = if elapsed >= budget {
            (RunStatus::Timeout, format!("run exceeded timeout of {run_timeout:?} before the process restarted"))
        } else {
            (RunStatus::Error, "run interrupted by process restart".to_owned())
        };
        orphans.push((run.id, run.flow_id, status, message));
    }

    for run in store.list_runs(RunFilter::status(RunStatus::Pending)).await? {
        let message = "run never started before the process restarted".to_owned();
        orphans.push((run.id, run.flow_id, RunStatus::Cancelled, message));
    }

    let mut recovered = Vec::with_capacity(orphans.len());
    let mut failed = 0usize;
    for (run_id, flow_id, status, message) in orphans {
        match finalize(store, run_id, flow_id, status, message).await {
            Ok(run) => recovered.push(run),
            Err(err) => {
                failed += 1;
                warn!(%run_id, %flow_id, "could not finalize orphaned run: {err}");
            }
        }
    }

    if !recovered.is_empty() || failed > 0 {
        warn!(count = recovered.len(), failed, "finalized orphaned runs");
    }
    Ok(recovered)
}

async fn finalize(
    store: &dyn RunStore,
    run_id: Uuid,
    flow_id: Uuid,
    status: RunStatus,
    message: String,
) -> Result<RecoveredRun, StoreError> {
    store.append_log(run_id, LogEntry::warn(None, message.clone())).await?;
    store.transition_status(run_id, status, Some(message)).await?;
    info!(%run_id, %status, "orphaned run finalized");
    Ok(RecoveredRun { run_id, flow_id, status })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Run, StepResult};
    use crate::store::MemoryRunStore;
    use async_trait::async_trait;
    use serde_json::Value;

    /// Refuses every status change for one run.
    struct StuckRun {
        inner: MemoryRunStore,
        stuck: Uuid,
    }

    #[async_trait]
    impl RunStore for StuckRun {
        async fn create_run(&self, flow_id: Uuid, trigger_payload: Value) -> Result<Uuid, StoreError> {
            self.inner.create_run(flow_id, trigger_payload).await
        }

        async fn append_log(&self, run_id: Uuid, entry: LogEntry) -> Result<(), StoreError> {
            self.inner.append_log(run_id, entry).await
        }

        async fn record_step_result(&self, run_id: Uuid, result: StepResult) -> Result<(), StoreError> {
            self.inner.record_step_result(run_id, result).await
        }

        async fn transition_status(
            &self,
            run_id: Uuid,
            status: RunStatus,
            error_message: Option<String>,
        ) -> Result<Run, StoreError> {
            if run_id == self.stuck {
                return Err(StoreError::Backend("row locked".into()));
            }
            self.inner.transition_status(run_id, status, error_message).await
        }

        async fn get_run(&self, run_id: Uuid) -> Result<Run, StoreError> {
            self.inner.get_run(run_id).await
        }

        async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>, StoreError> {
            self.inner.list_runs(filter).await
        }
    }

    #[tokio::test]
    async fn orphans_are_finalized_by_elapsed_time() {
        let store = MemoryRunStore::new();
        let flow_id = Uuid::new_v4();
        let pending = store.create_run(flow_id, Value::Null).await.unwrap();
        let running = store.create_run(flow_id, Value::Null).await.unwrap();
        store.transition_status(running, RunStatus::Running, None).await.unwrap();
        let finished = store.create_run(flow_id, Value::Null).await.unwrap();
        store.transition_status(finished, RunStatus::Running, None).await.unwrap();
        store.transition_status(finished, RunStatus::Success, None).await.unwrap();

        // Within budget: interrupted.
        let recovered = recover_orphaned_runs(&store, Duration::from_secs(3600), Utc::now())
            .await
            .unwrap();
        assert_eq!(recovered.len(), 2);

        let run = store.get_run(running).await.unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert!(run.completion_invariant_holds());
        assert_eq!(store.get_run(pending).await.unwrap().status, RunStatus::Cancelled);
        assert_eq!(store.get_run(finished).await.unwrap().status, RunStatus::Success);
    }

    #[tokio::test]
    async fn running_run_past_budget_times_out() {
        let store = MemoryRunStore::new();
        let run_id = store.create_run(Uuid::new_v4(), Value::Null).await.unwrap();
        store.transition_status(run_id, RunStatus::Running, None).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(120);
        let recovered = recover_orphaned_runs(&store, Duration::from_secs(60), later).await.unwrap();

        assert_eq!(recovered[0].status, RunStatus::Timeout);
        let run = store.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Timeout);
        assert!(run.error_message.unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn one_failing_orphan_does_not_stop_the_rest() {
        let inner = MemoryRunStore::new();
        let flow_id = Uuid::new_v4();
        let stuck = inner.create_run(flow_id, Value::Null).await.unwrap();
        inner.transition_status(stuck, RunStatus::Running, None).await.unwrap();
        let other = inner.create_run(flow_id, Value::Null).await.unwrap();
        inner.transition_status(other, RunStatus::Running, None).await.unwrap();
        let pending = inner.create_run(flow_id, Value::Null).await.unwrap();

        let store = StuckRun { inner, stuck };
        let recovered = recover_orphaned_runs(&store, Duration::from_secs(3600), Utc::now())
            .await
            .unwrap();

        let ids: Vec<Uuid> = recovered.iter().map(|r| r.run_id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&other) && ids.contains(&pending));
        assert_eq!(store.get_run(stuck).await.unwrap().status, RunStatus::Running);
        assert_eq!(store.get_run(other).await.unwrap().status, RunStatus::Error);
        assert_eq!(store.get_run(pending).await.unwrap().status, RunStatus::Cancelled);
    }
}
