//! Flow definitions and their graph.

use sqlx::types::Json;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use engine::{Flow, FlowStatus};

use crate::models::{EdgeRow, FlowRow, NodeRow};
use crate::DbError;

const FLOW_COLUMNS: &str = "id, owner, org_id, name, type, status, metadata, created_at, updated_at";

/// Load a flow with its nodes and edges, in creation order.
pub async fn load_flow(pool: &PgPool, flow_id: Uuid) -> Result<Flow, DbError> {
    let row = sqlx::query_as::<_, FlowRow>(&format!("SELECT {FLOW_COLUMNS} FROM workflow_flows WHERE id = $1"))
        .bind(flow_id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)?;

    let nodes = sqlx::query_as::<_, NodeRow>(
        r#"
        SELECT id, node_type, label, config, position
        FROM workflow_nodes
        WHERE flow_id = $1
        ORDER BY seq
        "#,
    )
    .bind(flow_id)
    .fetch_all(pool)
    .await?;

    let edges = sqlx::query_as::<_, EdgeRow>(
        r#"
        SELECT id, from_node, to_node, condition, label
        FROM workflow_edges
        WHERE flow_id = $1
        ORDER BY seq
        "#,
    )
    .bind(flow_id)
    .fetch_all(pool)
    .await?;

    row.into_flow(nodes, edges)
}

/// Flows owned by `owner`, newest first, optionally filtered by status.
pub async fn list_flows(pool: &PgPool, owner: Uuid, status: Option<FlowStatus>) -> Result<Vec<Flow>, DbError> {
    let rows = sqlx::query_as::<_, FlowRow>(&format!(
        "SELECT {FLOW_COLUMNS} FROM workflow_flows \
         WHERE owner = $1 AND ($2::text IS NULL OR status = $2) \
         ORDER BY created_at DESC"
    ))
    .bind(owner)
    .bind(status.map(|s| s.to_string()))
    .fetch_all(pool)
    .await?;

    // Listing returns the flow headers only.
    rows.into_iter().map(|row| row.into_flow(Vec::new(), Vec::new())).collect()
}

/// Insert a flow and its graph in one transaction.
pub async fn insert_flow(pool: &PgPool, flow: &Flow) -> Result<(), DbError> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO workflow_flows (id, owner, org_id, name, type, status, metadata, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(flow.id)
    .bind(flow.owner)
    .bind(flow.organization_id)
    .bind(&flow.name)
    .bind(flow.flow_type.to_string())
    .bind(flow.status.to_string())
    .bind(&flow.metadata)
    .bind(flow.created_at)
    .bind(flow.updated_at)
    .execute(&mut *tx)
    .await?;

    for node in &flow.nodes {
        sqlx::query(
            r#"
            INSERT INTO workflow_nodes (flow_id, id, node_type, label, config, position)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(flow.id)
        .bind(&node.id)
        .bind(&node.node_type)
        .bind(&node.label)
        .bind(&node.config)
        .bind(Json(node.position))
        .execute(&mut *tx)
        .await?;
    }

    for edge in &flow.edges {
        sqlx::query(
            r#"
            INSERT INTO workflow_edges (flow_id, id, from_node, to_node, condition, label)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(flow.id)
        .bind(&edge.id)
        .bind(&edge.from)
        .bind(&edge.to)
        .bind(edge.condition.as_ref().map(Json))
        .bind(&edge.label)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    debug!(flow_id = %flow.id, nodes = flow.nodes.len(), edges = flow.edges.len(), "flow inserted");
    Ok(())
}

/// Persist a status change already validated by `Flow::transition_to`.
pub async fn set_flow_status(pool: &PgPool, flow_id: Uuid, status: FlowStatus) -> Result<(), DbError> {
    let result = sqlx::query("UPDATE workflow_flows SET status = $1 WHERE id = $2")
        .bind(status.to_string())
        .bind(flow_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}
