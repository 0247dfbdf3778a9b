//! Run Store: the persistence boundary the scheduler writes through.
//!
//! The scheduler checkpoints after every node, so a crash mid-run leaves the
//! partial history behind. Implementations must serialize writes per run and
//! reject status changes the run state machine does not allow.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{LogEntry, Run, RunEvent, RunStatus, StepResult};

/// Selects runs for listing.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub flow_id: Option<Uuid>,
    pub status: Option<RunStatus>,
}

impl RunFilter {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn flow(flow_id: Uuid) -> Self {
        Self {
            flow_id: Some(flow_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, run: &Run) -> bool {
        self.flow_id.map_or(true, |id| run.flow_id == id) && self.status.map_or(true, |s| run.status == s)
    }
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Create a run in `pending` status.
    async fn create_run(&self, flow_id: Uuid, trigger_payload: Value) -> Result<Uuid, StoreError>;

    async fn append_log(&self, run_id: Uuid, entry: LogEntry) -> Result<(), StoreError>;

    /// Insert or replace the step result for `result.node_id`.
    async fn record_step_result(&self, run_id: Uuid, result: StepResult) -> Result<(), StoreError>;

    /// Move the run to `status`, stamping `completed_at` on terminal statuses.
    ///
    /// # Errors
    /// [`StoreError::InvalidTransition`] if `status` is not reachable from the
    /// current status.
    async fn transition_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error_message: Option<String>,
    ) -> Result<Run, StoreError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Run, StoreError>;

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

struct RunRecord {
    events: Vec<RunEvent>,
    view: Run,
}

impl RunRecord {
    fn push(&mut self, event: RunEvent) {
        self.view.apply(event.clone());
        self.events.push(event);
    }
}

/// Event-sourced in-memory store.
///
/// Each run keeps its append-only event log plus a materialized [`Run`]
/// view. Every run has its own mutex, so concurrent runs never contend and
/// writes to one run are serialized.
#[derive(Default)]
pub struct MemoryRunStore {
    runs: RwLock<HashMap<Uuid, Arc<Mutex<RunRecord>>>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, run_id: Uuid) -> Result<Arc<Mutex<RunRecord>>, StoreError> {
        let runs = self
            .runs
            .read()
            .map_err(|_| StoreError::Backend("run index poisoned".into()))?;
        runs.get(&run_id).cloned().ok_or(StoreError::RunNotFound(run_id))
    }

    fn with_record<T>(&self, run_id: Uuid, f: impl FnOnce(&mut RunRecord) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let record = self.record(run_id)?;
        let mut guard = record
            .lock()
            .map_err(|_| StoreError::Backend(format!("run {run_id} poisoned")))?;
        f(&mut guard)
    }

    fn append(&self, run_id: Uuid, event: RunEvent) -> Result<(), StoreError> {
        self.with_record(run_id, |record| {
            if record.view.status.is_terminal() {
                return Err(StoreError::RunTerminal(run_id));
            }
            record.push(event);
            Ok(())
        })
    }

    /// The raw event log of a run, oldest first.
    pub fn events(&self, run_id: Uuid) -> Result<Vec<RunEvent>, StoreError> {
        self.with_record(run_id, |record| Ok(record.events.clone()))
    }

    /// Re-create a run from a previously captured event log (e.g. after a
    /// restart).
    pub fn restore(&self, events: Vec<RunEvent>) -> Result<Uuid, StoreError> {
        let view = Run::replay(events.clone())
            .ok_or_else(|| StoreError::Backend("event log does not start with a creation event".into()))?;
        let run_id = view.id;
        let mut runs = self
            .runs
            .write()
            .map_err(|_| StoreError::Backend("run index poisoned".into()))?;
        runs.insert(run_id, Arc::new(Mutex::new(RunRecord { events, view })));
        Ok(run_id)
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(&self, flow_id: Uuid, trigger_payload: Value) -> Result<Uuid, StoreError> {
        let run_id = Uuid::new_v4();
        let created = RunEvent::Created {
            run_id,
            flow_id,
            trigger_payload,
            metadata: Value::Null,
            at: Utc::now(),
        };
        let view = Run::replay([created.clone()])
            .ok_or_else(|| StoreError::Backend("failed to materialize run".into()))?;

        let mut runs = self
            .runs
            .write()
            .map_err(|_| StoreError::Backend("run index poisoned".into()))?;
        runs.insert(
            run_id,
            Arc::new(Mutex::new(RunRecord {
                events: vec![created],
                view,
            })),
        );
        debug!(%run_id, %flow_id, "run created");
        Ok(run_id)
    }

    async fn append_log(&self, run_id: Uuid, entry: LogEntry) -> Result<(), StoreError> {
        self.append(run_id, RunEvent::Logged(entry))
    }

    async fn record_step_result(&self, run_id: Uuid, result: StepResult) -> Result<(), StoreError> {
        self.append(run_id, RunEvent::StepRecorded(result))
    }

    async fn transition_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error_message: Option<String>,
    ) -> Result<Run, StoreError> {
        self.with_record(run_id, |record| {
            let from = record.view.status;
            if !from.can_transition_to(status) {
                return Err(StoreError::InvalidTransition { from, to: status });
            }
            record.push(RunEvent::StatusChanged {
                status,
                error_message,
                at: Utc::now(),
            });
            debug!(%run_id, %from, to = %status, "run status changed");
            Ok(record.view.clone())
        })
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Run, StoreError> {
        self.with_record(run_id, |record| Ok(record.view.clone()))
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>, StoreError> {
        let records: Vec<Arc<Mutex<RunRecord>>> = self
            .runs
            .read()
            .map_err(|_| StoreError::Backend("run index poisoned".into()))?
            .values()
            .cloned()
            .collect();

        let mut runs = Vec::new();
        for record in records {
            let guard = record
                .lock()
                .map_err(|_| StoreError::Backend("run record poisoned".into()))?;
            if filter.matches(&guard.view) {
                runs.push(guard.view.clone());
            }
        }
        runs.sort_by_key(|r| r.started_at);
        Ok(runs)
    }
}
