//! The `NodeExecutor` trait: the contract every node type must fulfil.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::credential::{CredentialReference, CredentialResolver, ResolvedCredential};
use crate::{CredentialError, ExecutorError};

/// Outputs of the predecessors that fired into a node, keyed by node id.
///
/// An activated trigger contributes the trigger payload as its output.
pub type UpstreamResults = BTreeMap<String, Value>;

/// Collapse upstream results into one document: the single upstream output
/// when there is exactly one, otherwise an object keyed by node id.
pub fn upstream_view(upstream: &UpstreamResults) -> Value {
    match upstream.len() {
        0 => Value::Null,
        1 => upstream.values().next().cloned().unwrap_or(Value::Null),
        _ => Value::Object(upstream.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
    }
}

/// Broad role of a node type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Entry marker; never executed, matched against incoming events.
    Trigger,
    /// Evaluates a predicate and emits `{"result": bool}`.
    Condition,
    /// Performs an external effect.
    Action,
}

/// Severity shared by config checks and flow validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A problem with one field of a node's configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigIssue {
    pub severity: Severity,
    pub field: String,
    pub message: String,
    pub suggested_fix: Option<String>,
}

impl ConfigIssue {
    pub fn missing(field: &str) -> Self {
        Self {
            severity: Severity::Error,
            field: field.to_owned(),
            message: format!("required field '{field}' is missing"),
            suggested_fix: Some(format!("set '{field}' in the node configuration")),
        }
    }
}

/// `true` when `field` is absent, null, or an empty string.
pub fn is_blank(config: &Value, field: &str) -> bool {
    match config.get(field) {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

/// Per-invocation context handed to an executor.
#[derive(Clone)]
pub struct StepContext {
    pub flow_id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Inputs that initiated the run.
    pub trigger_payload: Value,
    pub credentials: Arc<dyn CredentialResolver>,
    /// Budget for a single credential resolution, independent of the node's own.
    pub credential_timeout: Duration,
}

impl StepContext {
    /// Resolve a credential under the context's credential timeout.
    pub async fn credential(&self, reference: &CredentialReference) -> Result<ResolvedCredential, CredentialError> {
        tokio::time::timeout(self.credential_timeout, self.credentials.resolve(reference))
            .await
            .map_err(|_| CredentialError::Timeout(self.credential_timeout))?
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("flow_id", &self.flow_id)
            .field("run_id", &self.run_id)
            .field("node_id", &self.node_id)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// The core node trait.
///
/// Every node type, built-in or registered by an integration, implements this.
/// The scheduler only ever sees `Arc<dyn NodeExecutor>` looked up by type tag.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    fn kind(&self) -> NodeKind {
        NodeKind::Action
    }

    /// Config fields that must be present and non-blank.
    fn required_fields(&self) -> &'static [&'static str] {
        &[]
    }

    /// Top-level fields this node's output always carries, if it declares them.
    ///
    /// `None` means the output shape is open and edge conditions are not checked.
    fn output_fields(&self) -> Option<&'static [&'static str]> {
        None
    }

    /// Provider whose credential the node needs when none is given explicitly.
    fn credential_provider(&self) -> Option<&'static str> {
        None
    }

    /// Static configuration checks. Defaults to the required-field check.
    fn check_config(&self, config: &Value) -> Vec<ConfigIssue> {
        self.required_fields()
            .iter()
            .filter(|field| is_blank(config, field))
            .map(|field| ConfigIssue::missing(field))
            .collect()
    }

    /// Execute the node against the outputs of the predecessors that fired.
    async fn execute(
        &self,
        config: &Value,
        upstream: &UpstreamResults,
        ctx: &StepContext,
    ) -> Result<Value, ExecutorError>;
}
