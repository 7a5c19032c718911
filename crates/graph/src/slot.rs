//! Public handles to operators and their slots.
//!
//! Handles are cheap to clone and stay valid only while their operator is in
//! the graph; after removal every call reports [`GraphError::StaleHandle`].

use std::fmt;
use std::sync::Arc;

use roiflow_core::{Buffer, ConfigurationError, Metadata, Roi, Value};
use roiflow_request::{Request, RequestError};

use crate::error::GraphError;
use crate::graph::Graph;
use crate::ids::{OperatorId, SlotId};
use crate::store::InputSource;

/// An operator inside a [`Graph`].
#[derive(Clone)]
pub struct OperatorHandle {
    graph: Graph,
    id: OperatorId,
}

impl OperatorHandle {
    pub(crate) fn new(graph: Graph, id: OperatorId) -> Self {
        Self { graph, id }
    }

    pub fn id(&self) -> OperatorId {
        self.id
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn name(&self) -> Result<String, GraphError> {
        Ok(self.graph.read().operator(self.id)?.name.clone())
    }

    fn find(&self, name: &str, inputs: bool) -> Result<SlotId, GraphError> {
        let store = self.graph.read();
        let entry = store.operator(self.id)?;
        let slots = if inputs { &entry.inputs } else { &entry.outputs };
        slots
            .iter()
            .copied()
            .find(|&s| store.slot(s).is_ok_and(|s| s.name() == name))
            .ok_or_else(|| GraphError::UnknownSlot {
                operator: entry.name.clone(),
                slot: name.to_string(),
            })
    }

    fn nth(&self, index: usize, inputs: bool) -> Result<SlotId, GraphError> {
        let store = self.graph.read();
        let entry = store.operator(self.id)?;
        let slots = if inputs { &entry.inputs } else { &entry.outputs };
        slots.get(index).copied().ok_or_else(|| GraphError::UnknownSlot {
            operator: entry.name.clone(),
            slot: format!("#{index}"),
        })
    }

    pub fn input(&self, name: &str) -> Result<InputSlot, GraphError> {
        Ok(InputSlot::new(self.graph.clone(), self.find(name, true)?))
    }

    pub fn output(&self, name: &str) -> Result<OutputSlot, GraphError> {
        Ok(OutputSlot::new(self.graph.clone(), self.find(name, false)?))
    }

    pub fn input_at(&self, index: usize) -> Result<InputSlot, GraphError> {
        Ok(InputSlot::new(self.graph.clone(), self.nth(index, true)?))
    }

    pub fn output_at(&self, index: usize) -> Result<OutputSlot, GraphError> {
        Ok(OutputSlot::new(self.graph.clone(), self.nth(index, false)?))
    }

    /// Error from the operator's last configure, if it failed.
    pub fn configuration_error(&self) -> Option<ConfigurationError> {
        self.graph.read().operator(self.id).ok()?.error.clone()
    }

    pub fn is_configured(&self) -> bool {
        self.graph.read().operator(self.id).is_ok_and(|e| e.configured)
    }

    pub fn is_alive(&self) -> bool {
        self.graph.read().operator(self.id).is_ok()
    }

    /// Remove the operator. Consumers of its outputs fall back to their
    /// defaults and are reconfigured.
    pub fn remove(&self) -> Result<(), GraphError> {
        self.graph.remove_operator(self.id)
    }
}

impl fmt::Debug for OperatorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorHandle")
            .field("id", &self.id)
            .field("name", &self.name().ok())
            .finish()
    }
}

/// An input slot.
#[derive(Clone)]
pub struct InputSlot {
    graph: Graph,
    id: SlotId,
}

impl InputSlot {
    pub(crate) fn new(graph: Graph, id: SlotId) -> Self {
        Self { graph, id }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn name(&self) -> Result<String, GraphError> {
        Ok(self.graph.read().slot(self.id)?.name().to_string())
    }

    /// Feed this input from `output`.
    pub fn connect(&self, output: &OutputSlot) -> Result<(), GraphError> {
        self.graph.connect(self.id, output.id)
    }

    /// Detach from the upstream output; the input falls back to its default.
    pub fn disconnect(&self) -> Result<(), GraphError> {
        self.graph.disconnect(self.id)
    }

    /// Hold a literal value, detaching from any upstream output. Setting the
    /// value the input already holds does nothing.
    pub fn set_value(&self, value: impl Into<Value>) -> Result<(), GraphError> {
        self.graph.set_value(self.id, value.into())
    }

    /// Declare `roi` of this input's data stale.
    pub fn set_dirty(&self, roi: Roi) -> Result<(), GraphError> {
        self.graph.set_input_dirty(self.id, Some(roi))
    }

    pub fn set_dirty_all(&self) -> Result<(), GraphError> {
        self.graph.set_input_dirty(self.id, None)
    }

    pub fn meta(&self) -> Option<Metadata> {
        self.graph.read().input_meta(self.id)
    }

    pub fn value(&self) -> Option<Value> {
        self.graph.read().input_value(self.id)
    }

    pub fn is_ready(&self) -> bool {
        self.meta().is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.graph
            .read()
            .input(self.id)
            .is_ok_and(|i| matches!(i.source, InputSource::Upstream(_)))
    }

    /// The output feeding this input, if connected.
    pub fn upstream(&self) -> Option<OutputSlot> {
        match self.graph.read().input(self.id).ok()?.source {
            InputSource::Upstream(out) => Some(OutputSlot::new(self.graph.clone(), out)),
            _ => None,
        }
    }

    /// Request `roi` of this input's data.
    pub fn get(&self, roi: Roi) -> Request<Buffer> {
        self.graph.request_input(self.id, roi, None)
    }
}

impl fmt::Debug for InputSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InputSlot({})", self.graph.read().label(self.id))
    }
}

/// An output slot.
#[derive(Clone)]
pub struct OutputSlot {
    graph: Graph,
    id: SlotId,
}

impl OutputSlot {
    pub(crate) fn new(graph: Graph, id: SlotId) -> Self {
        Self { graph, id }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn name(&self) -> Result<String, GraphError> {
        Ok(self.graph.read().slot(self.id)?.name().to_string())
    }

    /// `Operator.Slot`.
    pub fn label(&self) -> String {
        self.graph.read().label(self.id)
    }

    pub fn meta(&self) -> Option<Metadata> {
        self.graph.read().output(self.id).ok()?.meta.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.meta().is_some()
    }

    /// Literal value of a value-type output.
    pub fn value(&self) -> Option<Value> {
        self.graph.read().output(self.id).ok()?.value.clone()
    }

    /// Request `roi` of this output. Nothing runs until the request is
    /// submitted, waited on, or awaited.
    pub fn get(&self, roi: Roi) -> Request<Buffer> {
        self.graph.request_output(self.id, roi, None)
    }

    /// Compute `roi` and copy it into `dest`, which must have the region's
    /// shape and this output's dtype. On failure `dest` is left untouched.
    pub fn get_into(&self, roi: Roi, dest: &mut Buffer) -> Result<(), RequestError> {
        if dest.shape() != roi.shape().as_slice() {
            return Err(RequestError::InvalidRoi(format!(
                "destination shape {:?} does not match region {roi}",
                dest.shape()
            )));
        }
        let data = self.get(roi).wait()?;
        dest.write_region(&Roi::full(data.shape()), &data)?;
        Ok(())
    }

    /// Call `listener` with each region of this output that becomes stale.
    /// Returns an id for [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe_dirty<F>(&self, listener: F) -> Result<u64, GraphError>
    where
        F: Fn(&OutputSlot, &Roi) + Send + Sync + 'static,
    {
        self.graph.subscribe_dirty(self.id, Arc::new(listener))
    }

    /// Call `listener` whenever this output's metadata changes, including
    /// when it stops being ready.
    pub fn subscribe_meta_changed<F>(&self, listener: F) -> Result<u64, GraphError>
    where
        F: Fn(&OutputSlot) + Send + Sync + 'static,
    {
        self.graph.subscribe_meta(self.id, Arc::new(listener))
    }

    pub fn unsubscribe(&self, listener: u64) -> Result<bool, GraphError> {
        self.graph.unsubscribe(self.id, listener)
    }

    /// Stale regions accumulated since the last configure.
    pub fn dirty_regions(&self) -> Vec<Roi> {
        self.graph
            .read()
            .output(self.id)
            .map(|o| o.dirty.regions().to_vec())
            .unwrap_or_default()
    }

    /// Return and clear the stale regions.
    pub fn take_dirty_regions(&self) -> Result<Vec<Roi>, GraphError> {
        self.graph.take_dirty(self.id)
    }

    /// Declare `roi` of this output stale, notifying listeners and
    /// consumers.
    pub fn set_dirty(&self, roi: Roi) -> Result<(), GraphError> {
        self.graph.set_output_dirty(self.id, Some(roi))
    }

    pub fn set_dirty_all(&self) -> Result<(), GraphError> {
        self.graph.set_output_dirty(self.id, None)
    }

    /// The operator owning this slot.
    pub fn operator(&self) -> Result<OperatorHandle, GraphError> {
        let operator = self.graph.read().slot(self.id)?.operator;
        Ok(OperatorHandle::new(self.graph.clone(), operator))
    }
}

impl fmt::Debug for OutputSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutputSlot({})", self.label())
    }
}
