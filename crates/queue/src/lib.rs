//! `queue` crate: in-process dispatch of runs onto a bounded worker pool.
//!
//! Each submitted run is planned and persisted as `pending` right away, then
//! executed by the next free worker. Runs are independent units: any number
//! of them may be in flight, up to the configured worker count.

pub mod error;
pub mod run_queue;

pub use error::QueueError;
pub use run_queue::{QueueConfig, RunQueue, RunTicket};
