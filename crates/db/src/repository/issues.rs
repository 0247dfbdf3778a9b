//! Validation issues, open and resolved, per flow.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use engine::ValidationIssue;

use crate::models::IssueRow;
use crate::DbError;

/// All issues for a flow, oldest first. Resolved ones are kept as history.
pub async fn list_issues(pool: &PgPool, flow_id: Uuid) -> Result<Vec<ValidationIssue>, DbError> {
    let rows = sqlx::query_as::<_, IssueRow>(
        r#"
        SELECT id, flow_id, severity, issue_type, node_id, field_name, message,
               suggested_fix, created_at, resolved_at
        FROM workflow_validation_issues
        WHERE flow_id = $1
        ORDER BY created_at, id
        "#,
    )
    .bind(flow_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(ValidationIssue::try_from).collect()
}

/// Write the output of `engine::reconcile` back.
///
/// Existing rows only ever change `resolved_at`; new rows are inserted.
pub async fn save_issues(pool: &PgPool, issues: &[ValidationIssue]) -> Result<(), DbError> {
    let mut tx = pool.begin().await?;

    for issue in issues {
        sqlx::query(
            r#"
            INSERT INTO workflow_validation_issues
                (id, flow_id, severity, issue_type, node_id, field_name, message,
                 suggested_fix, created_at, resolved_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET resolved_at = EXCLUDED.resolved_at
            "#,
        )
        .bind(issue.id)
        .bind(issue.flow_id)
        .bind(issue.severity.to_string())
        .bind(&issue.issue_type)
        .bind(&issue.node_id)
        .bind(&issue.field_name)
        .bind(&issue.message)
        .bind(&issue.suggested_fix)
        .bind(issue.created_at)
        .bind(issue.resolved_at)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    debug!(count = issues.len(), "validation issues saved");
    Ok(())
}

/// Mark one open issue resolved. It reappears if the next validation pass
/// still finds it.
pub async fn dismiss_issue(pool: &PgPool, issue_id: Uuid, at: DateTime<Utc>) -> Result<(), DbError> {
    let result = sqlx::query(
        "UPDATE workflow_validation_issues SET resolved_at = $2 WHERE id = $1 AND resolved_at IS NULL",
    )
    .bind(issue_id)
    .bind(at)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}
