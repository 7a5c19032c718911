use thiserror::Error;

/// Raised by an operator's `configure` step (or by the graph while
/// preparing it) when input metadata is absent, inconsistent, or violates the
/// operator's constraints.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("{operator}: input `{slot}` is not ready")]
    MissingInput { operator: String, slot: String },

    #[error("{operator}: expected rank {expected}, got {actual}")]
    RankMismatch {
        operator: String,
        expected: usize,
        actual: usize,
    },

    #[error("{operator}: resizing the `{axis}` axis is not supported")]
    UnsupportedResize { operator: String, axis: char },

    #[error("{operator}: invalid value for `{slot}`: {reason}")]
    InvalidValue {
        operator: String,
        slot: String,
        reason: String,
    },

    #[error("unsupported shape: {0}")]
    UnsupportedShape(String),

    #[error("invalid roi: {0}")]
    InvalidRoi(String),

    #[error("dtype mismatch: expected {expected}, got {actual}")]
    DTypeMismatch { expected: String, actual: String },

    #[error("{0}")]
    Other(String),
}

/// Failure inside an operator's `compute`.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{operator}: {message}")]
pub struct ComputeError {
    pub operator: String,
    pub message: String,
}

impl ComputeError {
    pub fn new(operator: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            message: message.into(),
        }
    }

    /// A panic captured while running a task.
    pub fn panicked(task: impl Into<String>, payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            format!("panicked: {s}")
        } else if let Some(s) = payload.downcast_ref::<String>() {
            format!("panicked: {s}")
        } else {
            "panicked".to_string()
        };
        Self::new(task, message)
    }
}

/// Errors loading the runtime configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config error: {0}")]
    Invalid(String),
}
