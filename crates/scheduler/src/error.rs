use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    /// Work was submitted after `stop()` began.
    #[error("scheduler is shutting down")]
    Shutdown,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),

    #[error("task `{0}` is not bound to a scheduler")]
    Unbound(String),
}
