//! Worker pool runner.
//!
//! Split into focused submodules:
//! - `core`: Scheduler handle, start/stop, wake and accessor methods
//! - `execution`: worker loop and single-step execution
//! - `queues`: global priority queue and per-worker affinity queues

mod core;
mod execution;
mod queues;

pub use self::core::{current_worker, Scheduler};
pub(crate) use self::core::SchedulerInner;
