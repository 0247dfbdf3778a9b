//! Run scheduler.
//!
//! `Scheduler` drives one execution of a flow from trigger to terminal status:
//! 1. Builds the graph and orders the subgraph reachable from the matching
//!    trigger nodes; unknown node types are rejected before the run exists.
//! 2. Walks the order, executing a node only when every inbound edge from an
//!    executed predecessor fired; other nodes are recorded as not reached.
//! 3. Retries `ExecutorError::Transient` with exponential back-off up to
//!    `max_attempts`, then treats the failure as permanent.
//! 4. Ends the run on the first permanent failure, on the run timeout, or on
//!    cancellation, checkpointing through the [`RunStore`] after every node.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use nodes::{CredentialResolver, ExecutorError, NodeExecutor, NodeKind, NodeRegistry, StepContext, UpstreamResults};

use crate::config::SchedulerConfig;
use crate::error::{EngineError, StoreError};
use crate::graph::Graph;
use crate::models::{Flow, LogEntry, Node, Run, RunStatus, StepResult, StepStatus};
use crate::store::RunStore;

// ---------------------------------------------------------------------------
// Trigger events
// ---------------------------------------------------------------------------

/// The event that starts a run.
///
/// `node_id` targets one trigger node; otherwise `node_type` selects every
/// trigger node of that type; with neither set (manual run) every trigger
/// node of the flow is activated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl TriggerEvent {
    pub fn manual(payload: Value) -> Self {
        Self {
            payload,
            ..Self::default()
        }
    }

    pub fn of_type(node_type: impl Into<String>, payload: Value) -> Self {
        Self {
            node_type: Some(node_type.into()),
            node_id: None,
            payload,
        }
    }

    pub fn at_node(node_id: impl Into<String>, payload: Value) -> Self {
        Self {
            node_type: None,
            node_id: Some(node_id.into()),
            payload,
        }
    }

    fn describe(&self) -> String {
        match (&self.node_id, &self.node_type) {
            (Some(id), _) => format!("node {id}"),
            (None, Some(tag)) => tag.clone(),
            (None, None) => "manual".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Prepared run
// ---------------------------------------------------------------------------

/// A run that has been planned and persisted in `pending` status.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub run_id: Uuid,
    pub flow_id: Uuid,
    graph: Graph,
    order: Vec<String>,
    triggers: Vec<String>,
    trigger_payload: Value,
}

impl PreparedRun {
    /// Node IDs in the order they will be considered.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn triggers(&self) -> &[String] {
        &self.triggers
    }
}

/// Outcome of driving one node through its attempts.
enum NodeOutcome {
    Succeeded { output: Value, attempts: u32 },
    Failed { error: ExecutorError, attempts: u32 },
    Cancelled,
    RunTimedOut,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Orchestrates run execution. Holds no per-run state, so one instance can
/// drive any number of concurrent runs.
pub struct Scheduler {
    registry: Arc<NodeRegistry>,
    store: Arc<dyn RunStore>,
    credentials: Arc<dyn CredentialResolver>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        registry: Arc<NodeRegistry>,
        store: Arc<dyn RunStore>,
        credentials: Arc<dyn CredentialResolver>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            store,
            credentials,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Plan and persist a run without executing it.
    ///
    /// # Errors
    /// Graph errors, unmatched events and unknown node types are reported here
    /// and no run is created.
    pub async fn prepare(&self, flow: &Flow, event: TriggerEvent) -> Result<PreparedRun, EngineError> {
        let graph = Graph::from_flow(flow)?;
        let triggers = self.matching_triggers(&graph, &event)?;
        let order = graph.topological_order(&triggers)?;

        for node_id in &order {
            let Some(node) = graph.node(node_id) else { continue };
            if !self.registry.is_known(&node.node_type) {
                return Err(EngineError::UnknownNodeType {
                    node_id: node.id.clone(),
                    node_type: node.node_type.clone(),
                });
            }
        }

        let run_id = self.store.create_run(flow.id, event.payload.clone()).await?;
        info!(%run_id, flow_id = %flow.id, nodes = order.len(), trigger = %event.describe(), "run created");

        Ok(PreparedRun {
            run_id,
            flow_id: flow.id,
            graph,
            order,
            triggers,
            trigger_payload: event.payload,
        })
    }

    /// Prepare and execute a run to completion.
    pub async fn run(&self, flow: &Flow, event: TriggerEvent) -> Result<Run, EngineError> {
        let prepared = self.prepare(flow, event).await?;
        self.execute(prepared, CancellationToken::new()).await
    }

    /// Execute a prepared run until it reaches a terminal status.
    ///
    /// Node failures, timeouts and cancellation are reported through the
    /// returned run's status; `Err` means the run store failed.
    #[instrument(skip(self, prepared, cancel), fields(run_id = %prepared.run_id, flow_id = %prepared.flow_id))]
    pub async fn execute(&self, prepared: PreparedRun, cancel: CancellationToken) -> Result<Run, EngineError> {
        let run_id = prepared.run_id;
        match self.drive(&prepared, &cancel).await {
            Ok(run) => Ok(run),
            Err(err) => {
                error!(%run_id, "run aborted: {err}");
                // Leave the run terminal if the store still accepts writes.
                if let Err(finalize_err) = self
                    .store
                    .transition_status(run_id, RunStatus::Error, Some(format!("run aborted: {err}")))
                    .await
                {
                    warn!(%run_id, "could not finalize aborted run: {finalize_err}");
                }
                Err(err)
            }
        }
    }

    fn matching_triggers(&self, graph: &Graph, event: &TriggerEvent) -> Result<Vec<String>, EngineError> {
        let is_trigger = |node: &Node| self.registry.is_trigger(&node.node_type);

        if let Some(node_id) = &event.node_id {
            let node = graph
                .node(node_id)
                .ok_or_else(|| EngineError::NoMatchingTrigger(event.describe()))?;
            if !is_trigger(node) {
                return Err(EngineError::NotATrigger(node_id.clone()));
            }
            return Ok(vec![node_id.clone()]);
        }

        let triggers: Vec<String> = graph
            .nodes()
            .iter()
            .filter(|n| is_trigger(n))
            .filter(|n| event.node_type.as_ref().map_or(true, |tag| &n.node_type == tag))
            .map(|n| n.id.clone())
            .collect();

        if triggers.is_empty() {
            return Err(EngineError::NoMatchingTrigger(event.describe()));
        }
        Ok(triggers)
    }

    async fn drive(&self, prepared: &PreparedRun, cancel: &CancellationToken) -> Result<Run, EngineError> {
        let run_id = prepared.run_id;
        let graph = &prepared.graph;

        if cancel.is_cancelled() {
            return self.finish(run_id, RunStatus::Cancelled, "run cancelled before start").await;
        }

        self.store.transition_status(run_id, RunStatus::Running, None).await?;
        self.log(run_id, LogEntry::info(None, format!("run started with {} node(s) in scope", prepared.order.len())))
            .await?;
        let deadline = Instant::now() + self.config.run_timeout;

        // Outputs of activated triggers and succeeded nodes.
        let mut executed: HashMap<&str, Value> = HashMap::new();
        // Edges that fired, by (from, to).
        let mut fired: HashSet<(&str, &str)> = HashSet::new();

        for trigger in &prepared.triggers {
            executed.insert(trigger.as_str(), prepared.trigger_payload.clone());
            for edge in graph.outgoing_edges(trigger) {
                if edge.condition.as_ref().map_or(true, |c| c.evaluate(&prepared.trigger_payload)) {
                    fired.insert((edge.from.as_str(), edge.to.as_str()));
                }
            }
        }

        for node_id in &prepared.order {
            if executed.contains_key(node_id.as_str()) {
                continue;
            }
            let Some(node) = graph.node(node_id) else { continue };

            if cancel.is_cancelled() {
                return self.finish(run_id, RunStatus::Cancelled, "run cancelled").await;
            }
            if Instant::now() >= deadline {
                return self.finish_timeout(run_id).await;
            }

            // A trigger reached through an edge is only an entry marker.
            if self.registry.kind(&node.node_type) == Some(NodeKind::Trigger) {
                continue;
            }

            let inbound: Vec<(&str, bool)> = graph
                .incoming_edges(node_id)
                .filter(|e| executed.contains_key(e.from.as_str()))
                .map(|e| (e.from.as_str(), fired.contains(&(e.from.as_str(), e.to.as_str()))))
                .collect();

            if inbound.is_empty() || inbound.iter().any(|(_, did_fire)| !did_fire) {
                self.record_not_reached(run_id, node).await?;
                continue;
            }

            let upstream: UpstreamResults = inbound
                .iter()
                .filter_map(|(from, _)| executed.get(from).map(|out| ((*from).to_owned(), out.clone())))
                .collect::<BTreeMap<_, _>>();

            let executor = match self.registry.get(&node.node_type) {
                Ok(executor) => executor,
                Err(err) => {
                    let message = format!("node '{}' cannot be dispatched: {err}", node.id);
                    self.record_failure(run_id, node, &message, 0, None).await?;
                    return self.finish(run_id, RunStatus::Error, &message).await;
                }
            };

            let started_at = Utc::now();
            info!(node_id = %node.id, node_type = %node.node_type, "executing node");

            match self
                .execute_with_retry(prepared, node, executor, upstream, cancel, deadline)
                .await?
            {
                NodeOutcome::Succeeded { output, attempts } => {
                    self.store
                        .record_step_result(
                            run_id,
                            StepResult {
                                node_id: node.id.clone(),
                                node_type: node.node_type.clone(),
                                status: StepStatus::Success,
                                output: Some(output.clone()),
                                error: None,
                                attempts,
                                started_at: Some(started_at),
                                finished_at: Utc::now(),
                            },
                        )
                        .await?;
                    self.log(run_id, LogEntry::info(Some(node.id.as_str()), format!("node succeeded after {attempts} attempt(s)")))
                        .await?;

                    for edge in graph.outgoing_edges(node_id) {
                        if edge.condition.as_ref().map_or(true, |c| c.evaluate(&output)) {
                            fired.insert((edge.from.as_str(), edge.to.as_str()));
                        }
                    }
                    executed.insert(node_id.as_str(), output);
                }
                NodeOutcome::Failed { error, attempts } => {
                    let message = format!("node '{}' failed: {}", node.id, error.message());
                    error!(node_id = %node.id, attempts, "{message}");
                    self.record_failure(run_id, node, &message, attempts, Some(started_at)).await?;
                    return self.finish(run_id, RunStatus::Error, &message).await;
                }
                NodeOutcome::Cancelled => {
                    return self
                        .finish(run_id, RunStatus::Cancelled, &format!("run cancelled while '{}' was executing", node.id))
                        .await;
                }
                NodeOutcome::RunTimedOut => return self.finish_timeout(run_id).await,
            }
        }

        info!(%run_id, "run succeeded");
        self.log(run_id, LogEntry::info(None, "run succeeded")).await?;
        Ok(self.store.transition_status(run_id, RunStatus::Success, None).await?)
    }

    // -----------------------------------------------------------------------
    // Internal: execute a single node with retry logic.
    // -----------------------------------------------------------------------

    async fn execute_with_retry(
        &self,
        prepared: &PreparedRun,
        node: &Node,
        executor: Arc<dyn NodeExecutor>,
        upstream: UpstreamResults,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<NodeOutcome, StoreError> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let ctx = StepContext {
                flow_id: prepared.flow_id,
                run_id: prepared.run_id,
                node_id: node.id.clone(),
                attempt,
                trigger_payload: prepared.trigger_payload.clone(),
                credentials: Arc::clone(&self.credentials),
                credential_timeout: self.config.credential_timeout,
            };

            // The call runs on its own task: on cancellation or timeout the
            // handle is dropped and the task is left to finish unobserved.
            let task_executor = Arc::clone(&executor);
            let config = node.config.clone();
            let task_upstream = upstream.clone();
            let mut handle =
                tokio::spawn(async move { task_executor.execute(&config, &task_upstream, &ctx).await });

            let node_deadline = (Instant::now() + self.config.node_timeout).min(deadline);
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(NodeOutcome::Cancelled),
                joined = &mut handle => match joined {
                    Ok(result) => result,
                    Err(join_err) => Err(ExecutorError::permanent(format!("executor task failed: {join_err}"))),
                },
                _ = tokio::time::sleep_until(node_deadline) => {
                    if node_deadline >= deadline {
                        return Ok(NodeOutcome::RunTimedOut);
                    }
                    Err(ExecutorError::transient(format!(
                        "attempt exceeded node timeout of {:?}",
                        self.config.node_timeout
                    )))
                }
            };

            match result {
                Ok(output) => return Ok(NodeOutcome::Succeeded { output, attempts: attempt }),

                Err(ExecutorError::Transient(msg)) if attempt < self.config.max_attempts => {
                    let delay = self.config.backoff(attempt);
                    warn!(
                        "node '{}' transient error (attempt {}/{}), retrying in {:?}: {}",
                        node.id, attempt, self.config.max_attempts, delay, msg
                    );
                    self.log(
                        prepared.run_id,
                        LogEntry::warn(
                            Some(node.id.as_str()),
                            format!("attempt {attempt} failed, retrying in {delay:?}: {msg}"),
                        ),
                    )
                    .await?;

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(NodeOutcome::Cancelled),
                        _ = tokio::time::sleep_until(deadline) => return Ok(NodeOutcome::RunTimedOut),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }

                Err(ExecutorError::Transient(msg)) => {
                    return Ok(NodeOutcome::Failed {
                        error: ExecutorError::Permanent(format!("retries exhausted after {attempt} attempt(s): {msg}")),
                        attempts: attempt,
                    });
                }

                Err(error) => return Ok(NodeOutcome::Failed { error, attempts: attempt }),
            }
        }
    }

    async fn log(&self, run_id: Uuid, entry: LogEntry) -> Result<(), StoreError> {
        self.store.append_log(run_id, entry).await
    }

    async fn record_not_reached(&self, run_id: Uuid, node: &Node) -> Result<(), StoreError> {
        self.store
            .record_step_result(
                run_id,
                StepResult {
                    node_id: node.id.clone(),
                    node_type: node.node_type.clone(),
                    status: StepStatus::NotReached,
                    output: None,
                    error: None,
                    attempts: 0,
                    started_at: None,
                    finished_at: Utc::now(),
                },
            )
            .await?;
        self.log(run_id, LogEntry::info(Some(node.id.as_str()), "not reached; skipped")).await
    }

    async fn record_failure(
        &self,
        run_id: Uuid,
        node: &Node,
        message: &str,
        attempts: u32,
        started_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.store
            .record_step_result(
                run_id,
                StepResult {
                    node_id: node.id.clone(),
                    node_type: node.node_type.clone(),
                    status: StepStatus::Failed,
                    output: None,
                    error: Some(message.to_owned()),
                    attempts,
                    started_at,
                    finished_at: Utc::now(),
                },
            )
            .await?;
        self.log(run_id, LogEntry::error(Some(node.id.as_str()), message)).await
    }

    async fn finish_timeout(&self, run_id: Uuid) -> Result<Run, EngineError> {
        let message = format!("run exceeded timeout of {:?}", self.config.run_timeout);
        self.finish(run_id, RunStatus::Timeout, &message).await
    }

    async fn finish(&self, run_id: Uuid, status: RunStatus, message: &str) -> Result<Run, EngineError> {
        info!(%run_id, %status, "{message}");
        let entry = match status {
            RunStatus::Cancelled => LogEntry::warn(None, message),
            _ => LogEntry::error(None, message),
        };
        self.log(run_id, entry).await?;
        Ok(self
            .store
            .transition_status(run_id, status, Some(message.to_owned()))
            .await?)
    }
}
