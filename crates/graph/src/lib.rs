//! Graph of operators connected slot to slot.
//!
//! Metadata flows down eagerly: every structural edit reconfigures the
//! affected operators before it returns. Data flows lazily: nothing is
//! computed until an output region is requested, and only what that region
//! needs is pulled from upstream. Staleness flows down as dirty regions.

mod context;
pub mod dirty;
pub mod error;
mod graph;
pub mod ids;
pub mod operator;
mod slot;
mod store;

pub use context::{ComputeContext, ConfigureContext, DirtyContext};
pub use dirty::DirtySet;
pub use error::GraphError;
pub use graph::Graph;
pub use ids::{OperatorId, SlotId};
pub use operator::{InputSpec, Operator, OutputSpec, SlotType};
pub use slot::{InputSlot, OperatorHandle, OutputSlot};
pub use store::GraphStats;
