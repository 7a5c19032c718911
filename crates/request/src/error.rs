use roiflow_core::{ComputeError, ConfigurationError};
use roiflow_scheduler::SchedulerError;
use thiserror::Error;

/// Why a request did not produce a result.
///
/// `Clone` so one failure can be reported to completion callbacks and to
/// whoever takes the result.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    #[error(transparent)]
    Compute(#[from] ComputeError),

    #[error("request cancelled")]
    Cancelled,

    #[error("scheduler is shutting down")]
    SchedulerShutdown,

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("invalid roi: {0}")]
    InvalidRoi(String),

    #[error("slot `{0}` is not ready")]
    NotReady(String),

    #[error("request result already taken")]
    Consumed,

    /// A blocking wait was attempted on a worker of the request's own
    /// scheduler; such code must `.await` instead.
    #[error("cannot block a scheduler worker waiting for `{0}`; await it instead")]
    WouldBlock(String),
}

impl RequestError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RequestError::Cancelled)
    }

    /// Shorthand for a compute failure inside `operator`.
    pub fn compute(operator: impl Into<String>, message: impl Into<String>) -> Self {
        RequestError::Compute(ComputeError::new(operator, message))
    }
}

impl From<SchedulerError> for RequestError {
    fn from(_: SchedulerError) -> Self {
        RequestError::SchedulerShutdown
    }
}
