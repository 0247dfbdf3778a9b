//! `engine` crate: flow models, graph validation, the run scheduler and the
//! run store boundary.

pub mod config;
pub mod error;
pub mod graph;
pub mod models;
pub mod recovery;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod validator;

pub use config::{EngineSettings, SchedulerConfig};
pub use error::{EngineError, FlowError, GraphError, StoreError};
pub use graph::Graph;
pub use models::{
    Edge, Flow, FlowStatus, FlowType, LogEntry, LogLevel, Node, Position, Run, RunEvent, RunStatus, StepResult,
    StepStatus, ValidationIssue,
};
pub use recovery::{recover_orphaned_runs, RecoveredRun};
pub use scheduler::{PreparedRun, Scheduler, TriggerEvent};
pub use stats::{recent_errors, run_stats, ErrorDigest, RunStats};
pub use store::{MemoryRunStore, RunFilter, RunStore};
pub use validator::{reconcile, validate, ValidationReport};
