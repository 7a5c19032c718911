//! The operator contract.
//!
//! An operator declares its slots once, publishes output metadata in
//! [`Operator::configure`], fills requested output regions in
//! [`Operator::compute`], and maps stale input regions to stale output regions
//! in [`Operator::notify_dirty`]. Slots are addressed by their index in the
//! declared lists.

use async_trait::async_trait;
use roiflow_core::{Buffer, ConfigurationError, Roi, Value};
use roiflow_request::RequestError;

use crate::context::{ComputeContext, ConfigureContext, DirtyContext};

/// What a slot carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotType {
    /// Array data, computed region by region.
    Array,
    /// A single literal value, published whole.
    Value,
}

/// Declaration of an input slot.
#[derive(Debug, Clone, PartialEq)]
pub struct InputSpec {
    pub name: String,
    pub slot_type: SlotType,
    /// Value the slot holds until it is set or connected.
    pub default: Option<Value>,
    /// An optional input does not hold back configuration.
    pub optional: bool,
}

impl InputSpec {
    pub fn array(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slot_type: SlotType::Array,
            default: None,
            optional: false,
        }
    }

    pub fn value(name: impl Into<String>) -> Self {
        Self {
            slot_type: SlotType::Value,
            ..Self::array(name)
        }
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Declaration of an output slot.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub name: String,
    pub slot_type: SlotType,
}

impl OutputSpec {
    pub fn array(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slot_type: SlotType::Array,
        }
    }

    pub fn value(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slot_type: SlotType::Value,
        }
    }
}

/// A node of the dataflow graph.
///
/// `configure` and `notify_dirty` run synchronously on the thread editing the
/// graph and must not block. `compute` runs on the scheduler and may be
/// called concurrently for different regions.
#[async_trait]
pub trait Operator: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn inputs(&self) -> Vec<InputSpec>;

    fn outputs(&self) -> Vec<OutputSpec>;

    /// Derive output metadata (and value outputs) from the inputs. Called
    /// only once every required input is ready; must be deterministic.
    fn configure(&self, cx: &mut ConfigureContext) -> Result<(), ConfigurationError>;

    /// Fill `dest`, whose shape is `roi`'s, with output `output` over `roi`.
    async fn compute(
        &self,
        cx: &ComputeContext,
        output: usize,
        roi: &Roi,
        dest: &mut Buffer,
    ) -> Result<(), RequestError> {
        let _ = (cx, roi, dest);
        Err(RequestError::compute(
            self.name(),
            format!("output {output} cannot be computed"),
        ))
    }

    /// Input `input` went stale over `roi`; report every output region that
    /// depends on it. The default marks all outputs dirty in full.
    fn notify_dirty(&self, cx: &mut DirtyContext, input: usize, roi: &Roi) {
        let _ = (input, roi);
        for output in 0..cx.output_count() {
            cx.set_output_dirty_all(output);
        }
    }
}
