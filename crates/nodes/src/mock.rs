//! `MockNode`: a test double for `NodeExecutor`.
//!
//! Useful in unit and integration tests where a real node implementation is
//! either unavailable or irrelevant. Clones share the call log, so a test can
//! register one clone and assert on another.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::traits::{NodeExecutor, NodeKind, StepContext, UpstreamResults};
use crate::ExecutorError;

/// Behaviour injected into `MockNode` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Return a specific JSON value (merged with `{"node": name}`).
    ReturnValue(Value),
    /// Fail with a `Transient` error on every call.
    FailTransient(String),
    /// Fail with a `Permanent` error.
    FailPermanent(String),
    /// Fail transiently for the first `n` calls, then return the value.
    Flaky { failures: usize, value: Value },
    /// Sleep, then return the value.
    Sleep { delay: Duration, value: Value },
}

/// A mock node that records every call it receives and returns a
/// programmer-specified result.
#[derive(Debug, Clone)]
pub struct MockNode {
    /// Label used in test assertions.
    pub name: String,
    /// What the node will do when `execute` is called.
    pub behaviour: MockBehaviour,
    /// Role reported to the registry.
    pub kind: NodeKind,
    /// All upstream results seen by this node (in call order).
    pub calls: Arc<Mutex<Vec<UpstreamResults>>>,
}

impl MockNode {
    fn with_behaviour(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            kind: NodeKind::Action,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that always fails with a `Permanent` error.
    pub fn failing_permanent(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailPermanent(msg.into()))
    }

    /// Create a mock that always fails with a `Transient` error.
    pub fn failing_transient(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailTransient(msg.into()))
    }

    /// Create a mock that fails transiently `failures` times before succeeding.
    pub fn flaky(name: impl Into<String>, failures: usize, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::Flaky { failures, value })
    }

    /// Create a mock that takes `delay` to succeed.
    pub fn sleeping(name: impl Into<String>, delay: Duration, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::Sleep { delay, value })
    }

    /// Report a different [`NodeKind`] (e.g. to stand in for a condition).
    pub fn with_kind(mut self, kind: NodeKind) -> Self {
        self.kind = kind;
        self
    }

    fn log(&self) -> MutexGuard<'_, Vec<UpstreamResults>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of times this node has been executed.
    pub fn call_count(&self) -> usize {
        self.log().len()
    }

    /// Upstream results passed to the most recent call.
    pub fn last_upstream(&self) -> Option<UpstreamResults> {
        self.log().last().cloned()
    }

    fn output(&self, value: &Value) -> Value {
        // Tag the output so tests can trace data flowing through the graph.
        let mut out = json!({ "node": self.name });
        if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), value.as_object()) {
            for (k, val) in v_obj {
                out_obj.insert(k.clone(), val.clone());
            }
        }
        out
    }
}

#[async_trait]
impl NodeExecutor for MockNode {
    fn kind(&self) -> NodeKind {
        self.kind
    }

    async fn execute(
        &self,
        _config: &Value,
        upstream: &UpstreamResults,
        _ctx: &StepContext,
    ) -> Result<Value, ExecutorError> {
        let call_number = {
            let mut calls = self.log();
            calls.push(upstream.clone());
            calls.len()
        };

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(self.output(v)),
            MockBehaviour::FailTransient(msg) => Err(ExecutorError::Transient(msg.clone())),
            MockBehaviour::FailPermanent(msg) => Err(ExecutorError::Permanent(msg.clone())),
            MockBehaviour::Flaky { failures, value } => {
                if call_number <= *failures {
                    Err(ExecutorError::transient(format!("{} flaked on call {call_number}", self.name)))
                } else {
                    Ok(self.output(value))
                }
            }
            MockBehaviour::Sleep { delay, value } => {
                tokio::time::sleep(*delay).await;
                Ok(self.output(value))
            }
        }
    }
}
