//! Cooperative task scheduler over a fixed pool of worker threads.
//!
//! Never-run tasks are dispatched from a global queue ordered by
//! [`Priority`]; a task that suspends is pinned to the worker that first ran
//! it and resumes only from that worker's private queue.

pub mod error;
pub mod metrics;
pub mod priority;
pub mod runner;
pub mod task;

pub use error::SchedulerError;
pub use metrics::SchedulerMetrics;
pub use priority::{lexicographic, Priority, PriorityComparator};
pub use roiflow_core::SchedulerConfig;
pub use runner::{current_worker, Scheduler};
pub use task::{Resumable, Step, StepContext, Task, TaskPhase};
