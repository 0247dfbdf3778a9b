//! `PgRunStore`: the run store backed by `workflow_runs`.
//!
//! Logs and step results are appended in place with jsonb operators, guarded
//! by a non-terminal status check. Status changes lock the row with
//! `SELECT ... FOR UPDATE` so concurrent writers to one run are serialized.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use engine::{LogEntry, Run, RunFilter, RunStatus, RunStore, StepResult, StoreError};

use crate::models::RunRow;
use crate::DbError;

const RUN_COLUMNS: &str =
    "id, flow_id, status, started_at, completed_at, error_message, trigger_payload, logs, step_results, metadata";

const TERMINAL: &str = "('success', 'error', 'timeout', 'cancelled')";

#[derive(Debug, Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Explain why a guarded append touched no row.
    async fn append_rejected(&self, run_id: Uuid) -> StoreError {
        match sqlx::query_scalar::<_, String>("SELECT status FROM workflow_runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(Some(_)) => StoreError::RunTerminal(run_id),
            Ok(None) => StoreError::RunNotFound(run_id),
            Err(err) => DbError::from(err).into(),
        }
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    DbError::from(err).into()
}

fn parse_status(raw: &str) -> Result<RunStatus, StoreError> {
    raw.parse::<RunStatus>()
        .map_err(|e| StoreError::from(DbError::Decode(e)))
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn create_run(&self, flow_id: Uuid, trigger_payload: Value) -> Result<Uuid, StoreError> {
        let run_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO workflow_runs (id, flow_id, status, started_at, trigger_payload)
            VALUES ($1, $2, 'pending', $3, $4)
            "#,
        )
        .bind(run_id)
        .bind(flow_id)
        .bind(Utc::now())
        .bind(&trigger_payload)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        debug!(%run_id, %flow_id, "run created");
        Ok(run_id)
    }

    async fn append_log(&self, run_id: Uuid, entry: LogEntry) -> Result<(), StoreError> {
        let result = sqlx::query(&format!(
            "UPDATE workflow_runs SET logs = logs || jsonb_build_array($2::jsonb) \
             WHERE id = $1 AND status NOT IN {TERMINAL}"
        ))
        .bind(run_id)
        .bind(Json(&entry))
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(self.append_rejected(run_id).await);
        }
        Ok(())
    }

    async fn record_step_result(&self, run_id: Uuid, result: StepResult) -> Result<(), StoreError> {
        let outcome = sqlx::query(&format!(
            "UPDATE workflow_runs SET step_results = step_results || jsonb_build_object($2::text, $3::jsonb) \
             WHERE id = $1 AND status NOT IN {TERMINAL}"
        ))
        .bind(run_id)
        .bind(&result.node_id)
        .bind(Json(&result))
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if outcome.rows_affected() == 0 {
            return Err(self.append_rejected(run_id).await);
        }
        Ok(())
    }

    async fn transition_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error_message: Option<String>,
    ) -> Result<Run, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let current = sqlx::query_scalar::<_, String>("SELECT status FROM workflow_runs WHERE id = $1 FOR UPDATE")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?
            .ok_or(StoreError::RunNotFound(run_id))?;
        let from = parse_status(&current)?;
        if !from.can_transition_to(status) {
            return Err(StoreError::InvalidTransition { from, to: status });
        }

        let completed_at = status.is_terminal().then(Utc::now);
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "UPDATE workflow_runs \
             SET status = $2, completed_at = $3, error_message = COALESCE($4, error_message) \
             WHERE id = $1 RETURNING {RUN_COLUMNS}"
        ))
        .bind(run_id)
        .bind(status.to_string())
        .bind(completed_at)
        .bind(error_message)
        .fetch_one(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        debug!(%run_id, %from, to = %status, "run status changed");
        Ok(Run::try_from(row)?)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Run, StoreError> {
        let row = sqlx::query_as::<_, RunRow>(&format!("SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = $1"))
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or(StoreError::RunNotFound(run_id))?;
        Ok(Run::try_from(row)?)
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs \
             WHERE ($1::uuid IS NULL OR flow_id = $1) AND ($2::text IS NULL OR status = $2) \
             ORDER BY started_at"
        ))
        .bind(filter.flow_id)
        .bind(filter.status.map(|s| s.to_string()))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter()
            .map(|row| Run::try_from(row).map_err(StoreError::from))
            .collect()
    }
}
