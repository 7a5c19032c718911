use roiflow_core::ConfigurationError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("operator `{operator}` has no slot named `{slot}`")]
    UnknownSlot { operator: String, slot: String },

    /// The operator or slot was removed from the graph.
    #[error("stale handle: {0}")]
    StaleHandle(String),

    #[error("cannot connect {from} to {to}: {reason}")]
    Incompatible {
        from: String,
        to: String,
        reason: String,
    },

    #[error("input `{0}` is already connected")]
    AlreadyConnected(String),

    #[error("connecting {from} to {to} would create a cycle")]
    Cycle { from: String, to: String },

    #[error("bad dirty region for {slot}: {source}")]
    InvalidRoi {
        slot: String,
        #[source]
        source: ConfigurationError,
    },

    #[error("configuring `{operator}` failed: {source}")]
    Configuration {
        operator: String,
        #[source]
        source: ConfigurationError,
    },
}
