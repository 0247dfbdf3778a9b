//! Core domain models for the flow engine.
//!
//! These types are the source of truth for what a flow and a run look like in
//! memory. Their serialized shapes match the persisted records (lowercase
//! status strings, JSON config/metadata bags).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use nodes::EdgeCondition;

use crate::error::FlowError;

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    #[default]
    Automation,
    Pipeline,
}

impl std::fmt::Display for FlowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Automation => write!(f, "automation"),
            Self::Pipeline => write!(f, "pipeline"),
        }
    }
}

impl std::str::FromStr for FlowType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "automation" => Ok(Self::Automation),
            "pipeline" => Ok(Self::Pipeline),
            other => Err(format!("unknown flow type: {other}")),
        }
    }
}

/// Lifecycle of a flow definition. `Archived` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    #[default]
    Draft,
    Active,
    Paused,
    Archived,
}

impl FlowStatus {
    pub fn can_transition_to(self, next: FlowStatus) -> bool {
        use FlowStatus::*;
        matches!(
            (self, next),
            (Draft, Active) | (Active, Paused) | (Paused, Active) | (Draft | Active | Paused, Archived)
        )
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Archived => write!(f, "archived"),
        }
    }
}

impl std::str::FromStr for FlowStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "archived" => Ok(Self::Archived),
            other => Err(format!("unknown flow status: {other}")),
        }
    }
}

/// UI canvas position. Irrelevant to execution, kept so it round-trips.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A single step in the flow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier within this flow (referenced by edges).
    pub id: String,
    /// Type tag resolved through the node registry.
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Type-specific configuration, validated lazily per node type.
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub position: Position,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, config: Value) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            label: None,
            config,
            position: Position::default(),
        }
    }
}

/// Directed, optionally conditional connection between two nodes.
///
/// An edge read without an `id` is named `"{from}->{to}"`, like [`Edge::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "EdgeDocument")]
pub struct Edge {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<EdgeCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        let from = from.into();
        let to = to.into();
        Self {
            id: format!("{from}->{to}"),
            from,
            to,
            condition: None,
            label: None,
        }
    }

    pub fn when(mut self, condition: EdgeCondition) -> Self {
        self.condition = Some(condition);
        self
    }
}

#[derive(Deserialize)]
struct EdgeDocument {
    #[serde(default)]
    id: Option<String>,
    from: String,
    to: String,
    #[serde(default)]
    condition: Option<EdgeCondition>,
    #[serde(default)]
    label: Option<String>,
}

impl From<EdgeDocument> for Edge {
    fn from(doc: EdgeDocument) -> Self {
        let id = match doc.id {
            Some(id) if !id.is_empty() => id,
            _ => format!("{}->{}", doc.from, doc.to),
        };
        Edge {
            id,
            from: doc.from,
            to: doc.to,
            condition: doc.condition,
            label: doc.label,
        }
    }
}

/// A complete flow definition: metadata plus its nodes and edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: Uuid,
    pub owner: Uuid,
    #[serde(default)]
    pub organization_id: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub flow_type: FlowType,
    #[serde(default)]
    pub status: FlowStatus,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    /// Convenience constructor: a draft automation owned by a random user.
    pub fn new(name: impl Into<String>, nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner: Uuid::new_v4(),
            organization_id: None,
            name: name.into(),
            flow_type: FlowType::Automation,
            status: FlowStatus::Draft,
            metadata: Value::Null,
            nodes,
            edges,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Move to `next`, enforcing the flow lifecycle.
    ///
    /// Activation from `draft` goes through [`Flow::activate`] instead, which
    /// also checks validation issues.
    pub fn transition_to(&mut self, next: FlowStatus) -> Result<(), FlowError> {
        if !self.status.can_transition_to(next) {
            return Err(FlowError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Activate the flow if no unresolved `error` issue blocks it.
    pub fn activate(&mut self, issues: &[ValidationIssue]) -> Result<(), FlowError> {
        let blocking = issues.iter().filter(|i| i.blocks_activation()).count();
        if blocking > 0 {
            return Err(FlowError::ActivationBlocked { errors: blocking });
        }
        self.transition_to(FlowStatus::Active)
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Run-level state machine: `pending -> running -> {success, error, timeout, cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Error,
    Timeout,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Timeout | Self::Cancelled)
    }

    /// A pending run may only start or be cancelled; a running run may end
    /// in any terminal status. Terminal statuses never change.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Cancelled),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "timeout" => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One entry of a run's ordered log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, node_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            level,
            node_id: node_id.map(str::to_owned),
            message: message.into(),
        }
    }

    pub fn info(node_id: Option<&str>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, node_id, message)
    }

    pub fn warn(node_id: Option<&str>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, node_id, message)
    }

    pub fn error(node_id: Option<&str>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, node_id, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    /// No inbound edge fired; the node was skipped without error.
    NotReached,
}

/// Outcome recorded for one node within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub node_id: String,
    pub node_type: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

/// Append-only facts about a run. The [`Run`] record is a fold over these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Created {
        run_id: Uuid,
        flow_id: Uuid,
        trigger_payload: Value,
        metadata: Value,
        at: DateTime<Utc>,
    },
    Logged(LogEntry),
    StepRecorded(StepResult),
    StatusChanged {
        status: RunStatus,
        error_message: Option<String>,
        at: DateTime<Utc>,
    },
}

/// One execution instance of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub trigger_payload: Value,
    pub logs: Vec<LogEntry>,
    pub step_results: BTreeMap<String, StepResult>,
    pub metadata: Value,
}

impl Run {
    /// Materialize a run from its event log (first event must be `Created`).
    pub fn replay(events: impl IntoIterator<Item = RunEvent>) -> Option<Run> {
        let mut events = events.into_iter();
        let mut run = match events.next()? {
            RunEvent::Created {
                run_id,
                flow_id,
                trigger_payload,
                metadata,
                at,
            } => Run {
                id: run_id,
                flow_id,
                status: RunStatus::Pending,
                started_at: at,
                completed_at: None,
                error_message: None,
                trigger_payload,
                logs: Vec::new(),
                step_results: BTreeMap::new(),
                metadata,
            },
            _ => return None,
        };
        for event in events {
            run.apply(event);
        }
        Some(run)
    }

    /// Fold one event into the view. Transition legality is the store's job.
    pub fn apply(&mut self, event: RunEvent) {
        match event {
            RunEvent::Created { .. } => {}
            RunEvent::Logged(entry) => self.logs.push(entry),
            RunEvent::StepRecorded(step) => {
                self.step_results.insert(step.node_id.clone(), step);
            }
            RunEvent::StatusChanged {
                status,
                error_message,
                at,
            } => {
                self.status = status;
                self.completed_at = status.is_terminal().then_some(at);
                if error_message.is_some() {
                    self.error_message = error_message;
                }
            }
        }
    }

    /// `completed_at` is set iff the status is terminal.
    pub fn completion_invariant_holds(&self) -> bool {
        self.completed_at.is_some() == self.status.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// ValidationIssue
// ---------------------------------------------------------------------------

pub use nodes::Severity;

/// A finding from static flow validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub severity: Severity,
    pub issue_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_name: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
    pub created_at: DateTime<Utc>,
    /// `None` while unresolved.
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ValidationIssue {
    pub fn new(flow_id: Uuid, severity: Severity, issue_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            flow_id,
            severity,
            issue_type: issue_type.into(),
            node_id: None,
            field_name: None,
            message: message.into(),
            suggested_fix: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn on_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn on_field(mut self, field: impl Into<String>) -> Self {
        self.field_name = Some(field.into());
        self
    }

    pub fn fix(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_fix = Some(suggestion.into());
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    pub fn blocks_activation(&self) -> bool {
        self.severity == Severity::Error && !self.is_resolved()
    }

    /// Identity of the underlying condition, used to match issues across
    /// validation passes.
    pub fn key(&self) -> (&str, Option<&str>, Option<&str>, &str) {
        (
            self.issue_type.as_str(),
            self.node_id.as_deref(),
            self.field_name.as_deref(),
            self.message.as_str(),
        )
    }

    /// Explicitly dismiss the issue.
    pub fn dismiss(&mut self, at: DateTime<Utc>) {
        if self.resolved_at.is_none() {
            self.resolved_at = Some(at);
        }
    }
}
