use engine::{EngineError, StoreError};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue is shutting down and accepts no new runs.
    #[error("run queue is closed")]
    Closed,

    /// The worker dropped the run without reporting an outcome.
    #[error("worker for run {0} exited without a result")]
    WorkerLost(Uuid),

    #[error("invalid queue settings: {0}")]
    InvalidSettings(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        Self::Engine(EngineError::Store(err))
    }
}
