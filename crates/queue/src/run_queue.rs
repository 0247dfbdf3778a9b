//! `RunQueue`: bounded job channel feeding a semaphore-limited worker pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use engine::{EngineError, Flow, PreparedRun, Run, RunStatus, Scheduler, TriggerEvent};

use crate::QueueError;

/// Worker pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Runs executing at the same time.
    pub workers: usize,
    /// Runs waiting for a worker before `submit` starts to wait.
    pub capacity: usize,
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.workers == 0 {
            return Err(QueueError::InvalidSettings("workers must be at least 1".into()));
        }
        if self.capacity == 0 {
            return Err(QueueError::InvalidSettings("capacity must be at least 1".into()));
        }
        Ok(())
    }
}

struct Job {
    prepared: PreparedRun,
    cancel: CancellationToken,
    done: oneshot::Sender<Result<Run, EngineError>>,
}

type ActiveRuns = Arc<Mutex<HashMap<Uuid, CancellationToken>>>;

fn lock(active: &ActiveRuns) -> MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a submitted run.
#[derive(Debug)]
pub struct RunTicket {
    run_id: Uuid,
    outcome: oneshot::Receiver<Result<Run, EngineError>>,
}

impl RunTicket {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Wait for the run to reach a terminal status.
    pub async fn wait(self) -> Result<Run, QueueError> {
        match self.outcome.await {
            Ok(outcome) => Ok(outcome?),
            Err(_) => Err(QueueError::WorkerLost(self.run_id)),
        }
    }
}

pub struct RunQueue {
    scheduler: Arc<Scheduler>,
    sender: mpsc::Sender<Job>,
    active: ActiveRuns,
    dispatcher: JoinHandle<()>,
}

impl RunQueue {
    /// Start the dispatcher. Must be called from within a tokio runtime.
    pub fn start(scheduler: Arc<Scheduler>, config: QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        let (sender, receiver) = mpsc::channel(config.capacity);
        let active: ActiveRuns = Arc::new(Mutex::new(HashMap::new()));
        let dispatcher = tokio::spawn(dispatch(
            Arc::clone(&scheduler),
            receiver,
            Arc::clone(&active),
            config.workers,
        ));
        info!(workers = config.workers, capacity = config.capacity, "run queue started");

        Ok(Self {
            scheduler,
            sender,
            active,
            dispatcher,
        })
    }

    /// Create the run and queue it for execution.
    ///
    /// # Errors
    /// Planning errors (bad graph, unknown node type, unmatched trigger) are
    /// returned here and no run is created.
    #[instrument(skip(self, flow, event), fields(flow_id = %flow.id))]
    pub async fn submit(&self, flow: &Flow, event: TriggerEvent) -> Result<RunTicket, QueueError> {
        let prepared = self.scheduler.prepare(flow, event).await?;
        let run_id = prepared.run_id;
        let cancel = CancellationToken::new();
        lock(&self.active).insert(run_id, cancel.clone());

        let (done, outcome) = oneshot::channel();
        if self.sender.send(Job { prepared, cancel, done }).await.is_err() {
            lock(&self.active).remove(&run_id);
            self.scheduler
                .store()
                .transition_status(run_id, RunStatus::Cancelled, Some("run queue closed before dispatch".into()))
                .await?;
            return Err(QueueError::Closed);
        }

        debug!(%run_id, "run queued");
        Ok(RunTicket { run_id, outcome })
    }

    /// Request cancellation of a queued or running run. Returns `false` if
    /// the run is not in flight on this queue.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match lock(&self.active).get(&run_id) {
            Some(token) => {
                token.cancel();
                info!(%run_id, "run cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Cancel every run in flight. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let active = lock(&self.active);
        for token in active.values() {
            token.cancel();
        }
        active.len()
    }

    /// Runs queued or executing.
    pub fn in_flight(&self) -> usize {
        lock(&self.active).len()
    }

    /// Stop accepting runs and wait for every queued run to finish.
    pub async fn shutdown(self) {
        let Self { sender, dispatcher, .. } = self;
        drop(sender);
        if let Err(err) = dispatcher.await {
            warn!("run dispatcher ended abnormally: {err}");
        }
        info!("run queue stopped");
    }
}

async fn dispatch(scheduler: Arc<Scheduler>, mut receiver: mpsc::Receiver<Job>, active: ActiveRuns, workers: usize) {
    let permits = Arc::new(Semaphore::new(workers));
    let mut running: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            job = receiver.recv() => {
                let Some(job) = job else { break };
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else { break };
                let scheduler = Arc::clone(&scheduler);
                let active = Arc::clone(&active);

                running.spawn(async move {
                    let run_id = job.prepared.run_id;
                    let outcome = scheduler.execute(job.prepared, job.cancel).await;
                    lock(&active).remove(&run_id);
                    if job.done.send(outcome).is_err() {
                        debug!(%run_id, "run ticket dropped before completion");
                    }
                    drop(permit);
                });
            }
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(err) = joined {
                    warn!("run worker failed: {err}");
                }
            }
        }
    }

    while let Some(joined) = running.join_next().await {
        if let Err(err) = joined {
            warn!("run worker failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use engine::{MemoryRunStore, Node, RunStore, SchedulerConfig};
    use nodes::mock::MockNode;
    use nodes::{MemoryCredentialResolver, NodeRegistry};
    use serde_json::{json, Value};

    fn scheduler(mocks: &[&MockNode]) -> (Arc<Scheduler>, Arc<MemoryRunStore>) {
        let mut registry = NodeRegistry::with_builtins();
        for mock in mocks {
            registry.register(mock.name.clone(), (*mock).clone());
        }
        let store = Arc::new(MemoryRunStore::new());
        let config = SchedulerConfig {
            max_attempts: 2,
            retry_base_delay: Duration::from_millis(10),
            retry_max_delay: Duration::from_millis(100),
            run_timeout: Duration::from_secs(300),
            node_timeout: Duration::from_secs(300),
            credential_timeout: Duration::from_secs(5),
        };
        let scheduler = Scheduler::new(
            Arc::new(registry),
            store.clone(),
            Arc::new(MemoryCredentialResolver::new()),
            config,
        );
        (Arc::new(scheduler), store)
    }

    fn flow_for(mock: &MockNode) -> Flow {
        Flow::new(
            mock.name.clone(),
            vec![
                Node::new("start", "manual_trigger", Value::Null),
                Node::new(mock.name.clone(), mock.name.clone(), Value::Null),
            ],
            vec![engine::Edge::new("start", mock.name.clone())],
        )
    }

    fn queue(scheduler: Arc<Scheduler>, workers: usize) -> RunQueue {
        RunQueue::start(scheduler, QueueConfig { workers, capacity: 16 }).unwrap()
    }

    #[tokio::test]
    async fn submitted_run_completes() {
        let action = MockNode::returning("action", json!({ "ok": true }));
        let (scheduler, store) = scheduler(&[&action]);
        let queue = queue(scheduler, 2);

        let ticket = queue.submit(&flow_for(&action), TriggerEvent::manual(json!({}))).await.unwrap();
        let run_id = ticket.run_id();
        let run = ticket.wait().await.unwrap();

        assert_eq!(run.id, run_id);
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(store.get_run(run_id).await.unwrap().status, RunStatus::Success);
        assert_eq!(queue.in_flight(), 0);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn worker_count_bounds_concurrency() {
        let slow = MockNode::sleeping("slow", Duration::from_secs(10), json!({}));
        let (scheduler, _store) = scheduler(&[&slow]);
        let queue = queue(scheduler, 2);
        let flow = flow_for(&slow);

        let started = tokio::time::Instant::now();
        let mut tickets = Vec::new();
        for _ in 0..3 {
            tickets.push(queue.submit(&flow, TriggerEvent::manual(Value::Null)).await.unwrap());
        }
        for ticket in tickets {
            assert_eq!(ticket.wait().await.unwrap().status, RunStatus::Success);
        }

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(20), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(30), "{elapsed:?}");
        assert_eq!(slow.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_reaches_a_running_run() {
        let slow = MockNode::sleeping("slow", Duration::from_secs(30), json!({}));
        let (scheduler, _store) = scheduler(&[&slow]);
        let queue = queue(scheduler, 1);

        let ticket = queue.submit(&flow_for(&slow), TriggerEvent::manual(Value::Null)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(queue.cancel(ticket.run_id()));
        assert!(!queue.cancel(Uuid::new_v4()));
        let run = ticket.wait().await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn run_cancelled_while_queued_never_executes() {
        let slow = MockNode::sleeping("slow", Duration::from_secs(10), json!({}));
        let quick = MockNode::returning("quick", json!({}));
        let (scheduler, _store) = scheduler(&[&slow, &quick]);
        let queue = queue(scheduler, 1);

        let first = queue.submit(&flow_for(&slow), TriggerEvent::manual(Value::Null)).await.unwrap();
        let second = queue.submit(&flow_for(&quick), TriggerEvent::manual(Value::Null)).await.unwrap();
        assert!(queue.cancel(second.run_id()));

        assert_eq!(first.wait().await.unwrap().status, RunStatus::Success);
        assert_eq!(second.wait().await.unwrap().status, RunStatus::Cancelled);
        assert_eq!(quick.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_stops_running_and_queued_runs() {
        let slow = MockNode::sleeping("slow", Duration::from_secs(30), json!({}));
        let (scheduler, _store) = scheduler(&[&slow]);
        let queue = queue(scheduler, 1);
        let flow = flow_for(&slow);

        let running = queue.submit(&flow, TriggerEvent::manual(Value::Null)).await.unwrap();
        let queued = queue.submit(&flow, TriggerEvent::manual(Value::Null)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(queue.cancel_all(), 2);
        assert_eq!(running.wait().await.unwrap().status, RunStatus::Cancelled);
        assert_eq!(queued.wait().await.unwrap().status, RunStatus::Cancelled);
        assert_eq!(slow.call_count(), 1);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn shutdown_drains_queued_runs() {
        let action = MockNode::returning("action", json!({}));
        let (scheduler, store) = scheduler(&[&action]);
        let queue = queue(scheduler, 1);
        let flow = flow_for(&action);

        let a = queue.submit(&flow, TriggerEvent::manual(Value::Null)).await.unwrap();
        let b = queue.submit(&flow, TriggerEvent::manual(Value::Null)).await.unwrap();
        queue.shutdown().await;

        assert_eq!(a.wait().await.unwrap().status, RunStatus::Success);
        assert_eq!(b.wait().await.unwrap().status, RunStatus::Success);
        let runs = store.list_runs(engine::RunFilter::flow(flow.id)).await.unwrap();
        assert!(runs.iter().all(|r| r.status == RunStatus::Success));
    }

    #[tokio::test]
    async fn planning_errors_are_returned_from_submit() {
        let (scheduler, store) = scheduler(&[]);
        let queue = queue(scheduler, 1);
        let flow = Flow::new("empty", vec![Node::new("x", "set", json!({ "values": {} }))], vec![]);

        let err = queue.submit(&flow, TriggerEvent::manual(Value::Null)).await.unwrap_err();
        assert!(matches!(err, QueueError::Engine(EngineError::NoMatchingTrigger(_))));
        assert!(store.list_runs(engine::RunFilter::default()).await.unwrap().is_empty());
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(QueueConfig { workers: 0, capacity: 1 }.validate().is_err());
    }
}
