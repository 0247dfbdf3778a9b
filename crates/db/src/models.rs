//! Row structs that map 1-to-1 onto database tables.
//!
//! These are persistence models; the domain types live in the `engine` and
//! `nodes` crates. Each row converts into its domain type, failing with
//! [`DbError::Decode`] when a stored string no longer parses.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use engine::{Edge, Flow, LogEntry, Node, Position, Run, StepResult, ValidationIssue};
use nodes::{Credential, EdgeCondition, Severity};

use crate::DbError;

fn decode<T: std::str::FromStr<Err = String>>(raw: &str) -> Result<T, DbError> {
    raw.parse().map_err(DbError::Decode)
}

// ---------------------------------------------------------------------------
// workflow_flows / workflow_nodes / workflow_edges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct FlowRow {
    pub id: Uuid,
    pub owner: Uuid,
    pub org_id: Option<Uuid>,
    pub name: String,
    #[sqlx(rename = "type")]
    pub flow_type: String,
    pub status: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct NodeRow {
    pub id: String,
    pub node_type: String,
    pub label: Option<String>,
    pub config: Value,
    pub position: Json<Position>,
}

impl From<NodeRow> for Node {
    fn from(row: NodeRow) -> Self {
        Node {
            id: row.id,
            node_type: row.node_type,
            label: row.label,
            config: row.config,
            position: row.position.0,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct EdgeRow {
    pub id: String,
    pub from_node: String,
    pub to_node: String,
    pub condition: Option<Json<EdgeCondition>>,
    pub label: Option<String>,
}

impl From<EdgeRow> for Edge {
    fn from(row: EdgeRow) -> Self {
        Edge {
            id: row.id,
            from: row.from_node,
            to: row.to_node,
            condition: row.condition.map(|c| c.0),
            label: row.label,
        }
    }
}

impl FlowRow {
    /// Assemble the domain flow from its row and graph rows.
    pub fn into_flow(self, nodes: Vec<NodeRow>, edges: Vec<EdgeRow>) -> Result<Flow, DbError> {
        Ok(Flow {
            id: self.id,
            owner: self.owner,
            organization_id: self.org_id,
            name: self.name,
            flow_type: decode(&self.flow_type)?,
            status: decode(&self.status)?,
            metadata: self.metadata,
            nodes: nodes.into_iter().map(Node::from).collect(),
            edges: edges.into_iter().map(Edge::from).collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ---------------------------------------------------------------------------
// workflow_runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct RunRow {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub trigger_payload: Value,
    pub logs: Json<Vec<LogEntry>>,
    pub step_results: Json<BTreeMap<String, StepResult>>,
    pub metadata: Value,
}

impl TryFrom<RunRow> for Run {
    type Error = DbError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(Run {
            id: row.id,
            flow_id: row.flow_id,
            status: decode(&row.status)?,
            started_at: row.started_at,
            completed_at: row.completed_at,
            error_message: row.error_message,
            trigger_payload: row.trigger_payload,
            logs: row.logs.0,
            step_results: row.step_results.0,
            metadata: row.metadata,
        })
    }
}

// ---------------------------------------------------------------------------
// workflow_credentials
// ---------------------------------------------------------------------------

/// A stored credential. The token stays in its at-rest form.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CredentialRow {
    pub id: Uuid,
    pub owner: Uuid,
    pub provider: String,
    pub label: Option<String>,
    pub account_identifier: String,
    pub encrypted_token: String,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<CredentialRow> for Credential {
    fn from(row: CredentialRow) -> Self {
        Credential {
            id: row.id,
            owner: row.owner,
            provider: row.provider,
            account_identifier: row.account_identifier,
            encrypted_token: row.encrypted_token,
            token_expires_at: row.token_expires_at,
            scopes: row.scopes,
            last_used_at: row.last_used_at,
            created_at: row.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// workflow_validation_issues
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct IssueRow {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub severity: String,
    pub issue_type: String,
    pub node_id: Option<String>,
    pub field_name: Option<String>,
    pub message: String,
    pub suggested_fix: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl TryFrom<IssueRow> for ValidationIssue {
    type Error = DbError;

    fn try_from(row: IssueRow) -> Result<Self, Self::Error> {
        let severity: Severity = serde_json::from_value(Value::String(row.severity.clone()))
            .map_err(|_| DbError::Decode(format!("unknown severity: {}", row.severity)))?;
        Ok(ValidationIssue {
            id: row.id,
            flow_id: row.flow_id,
            severity,
            issue_type: row.issue_type,
            node_id: row.node_id,
            field_name: row.field_name,
            message: row.message,
            suggested_fix: row.suggested_fix,
            created_at: row.created_at,
            resolved_at: row.resolved_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::{FlowStatus, RunStatus};
    use serde_json::json;

    fn flow_row(status: &str) -> FlowRow {
        FlowRow {
            id: Uuid::new_v4(),
            owner: Uuid::new_v4(),
            org_id: None,
            name: "f".into(),
            flow_type: "pipeline".into(),
            status: status.into(),
            metadata: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn flow_rows_assemble_into_a_flow() {
        let nodes = vec![NodeRow {
            id: "n1".into(),
            node_type: "manual_trigger".into(),
            label: Some("Start".into()),
            config: json!({}),
            position: Json(Position { x: 1.0, y: 2.0 }),
        }];
        let edges = vec![EdgeRow {
            id: "e1".into(),
            from_node: "n1".into(),
            to_node: "n2".into(),
            condition: Some(Json(EdgeCondition::Branch(true))),
            label: None,
        }];

        let flow = flow_row("active").into_flow(nodes, edges).unwrap();
        assert_eq!(flow.status, FlowStatus::Active);
        assert_eq!(flow.flow_type, engine::FlowType::Pipeline);
        assert_eq!(flow.nodes[0].position, Position { x: 1.0, y: 2.0 });
        assert_eq!(flow.edges[0].from, "n1");
        assert_eq!(flow.edges[0].condition, Some(EdgeCondition::Branch(true)));
    }

    #[test]
    fn unknown_status_is_a_decode_error() {
        assert!(matches!(
            flow_row("deleted").into_flow(vec![], vec![]),
            Err(DbError::Decode(_))
        ));
    }

    #[test]
    fn run_row_converts_with_status() {
        let row = RunRow {
            id: Uuid::new_v4(),
            flow_id: Uuid::new_v4(),
            status: "timeout".into(),
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            error_message: Some("too slow".into()),
            trigger_payload: json!({}),
            logs: Json(vec![LogEntry::info(None, "x")]),
            step_results: Json(BTreeMap::new()),
            metadata: json!({}),
        };
        let run = Run::try_from(row).unwrap();
        assert_eq!(run.status, RunStatus::Timeout);
        assert!(run.completion_invariant_holds());
        assert_eq!(run.logs.len(), 1);
    }
}
