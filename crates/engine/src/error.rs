//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

use crate::models::{FlowStatus, RunStatus};

/// Malformed flow graph. Fatal: blocks run creation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    #[error("edge '{edge_id}' connects node '{node_id}' to itself")]
    SelfLoop { edge_id: String, node_id: String },

    #[error("more than one edge from '{from}' to '{to}'")]
    DuplicateEdge { from: String, to: String },

    /// An edge references a node ID that doesn't exist in the flow.
    #[error("edge '{edge_id}' references unknown node '{node_id}' ({side} side)")]
    DanglingReference {
        edge_id: String,
        node_id: String,
        side: &'static str,
    },

    #[error("trigger '{0}' is not a node of this flow")]
    UnknownTrigger(String),

    /// Kahn's algorithm could not order these nodes.
    #[error("flow graph contains a cycle through: {}", .0.join(", "))]
    CycleDetected(Vec<String>),
}

/// Run Store boundary errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run {0} not found")]
    RunNotFound(Uuid),

    /// Requested status is not reachable from the current one.
    #[error("invalid run transition {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("run {0} is terminal and can no longer be written")]
    RunTerminal(Uuid),

    #[error("run store backend error: {0}")]
    Backend(String),
}

/// Flow lifecycle errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlowError {
    #[error("flow cannot move from {from} to {to}")]
    InvalidTransition { from: FlowStatus, to: FlowStatus },

    #[error("flow has {errors} unresolved error issue(s) and cannot be activated")]
    ActivationBlocked { errors: usize },
}

/// Errors produced by the engine before or outside a run's own outcome.
///
/// Node failures do not surface here: they end the run in `error` status and
/// the run record carries the message.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A node's type tag has no registered executor.
    #[error("node '{node_id}' has unknown type '{node_type}'")]
    UnknownNodeType { node_id: String, node_type: String },

    #[error("no trigger node matches event '{0}'")]
    NoMatchingTrigger(String),

    #[error("node '{0}' is not a trigger")]
    NotATrigger(String),

    #[error("invalid engine settings: {0}")]
    InvalidSettings(String),
}
