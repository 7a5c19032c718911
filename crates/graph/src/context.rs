//! What an operator sees while it configures, propagates dirtiness, or
//! computes.
//!
//! Configure and dirty contexts are detached copies of the relevant slot
//! state; the graph applies what the operator wrote back after the callback
//! returns. A compute context keeps a snapshot of the metadata it was
//! created with and reaches upstream through the live graph.

use std::future::Future;
use std::sync::Arc;

use roiflow_core::{Buffer, ConfigurationError, Metadata, Roi, Value};
use roiflow_request::{Request, RequestContext, RequestError};
use tracing::warn;

use crate::graph::Graph;
use crate::ids::{OperatorId, SlotId};
use crate::operator::SlotType;
use crate::store::{GraphStore, SlotKind};

/// State of one input as seen by an operator callback.
#[derive(Debug, Clone)]
pub(crate) struct InputView {
    pub(crate) slot: SlotId,
    pub(crate) name: String,
    pub(crate) optional: bool,
    pub(crate) meta: Option<Metadata>,
    pub(crate) value: Option<Value>,
}

pub(crate) fn input_views(store: &GraphStore, inputs: &[SlotId]) -> Vec<InputView> {
    inputs
        .iter()
        .filter_map(|&slot| {
            let entry = store.input(slot).ok()?;
            Some(InputView {
                slot,
                name: entry.spec.name.clone(),
                optional: entry.spec.optional,
                meta: store.input_meta(slot),
                value: store.input_value(slot),
            })
        })
        .collect()
}

// ── Configure ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct OutputDraft {
    name: String,
    slot_type: SlotType,
    pub(crate) meta: Option<Metadata>,
    pub(crate) value: Option<Value>,
}

/// Passed to [`Operator::configure`](crate::Operator::configure).
#[derive(Debug)]
pub struct ConfigureContext {
    operator: String,
    inputs: Vec<InputView>,
    outputs: Vec<OutputDraft>,
}

impl ConfigureContext {
    pub(crate) fn snapshot(store: &GraphStore, id: OperatorId) -> Option<Self> {
        let entry = store.operator(id).ok()?;
        let outputs = entry
            .outputs
            .iter()
            .filter_map(|&o| store.output(o).ok())
            .map(|o| OutputDraft {
                name: o.spec.name.clone(),
                slot_type: o.spec.slot_type,
                meta: None,
                value: None,
            })
            .collect();
        Some(Self {
            operator: entry.name.clone(),
            inputs: input_views(store, &entry.inputs),
            outputs,
        })
    }

    /// Every non-optional input has metadata.
    pub(crate) fn required_inputs_ready(&self) -> bool {
        self.inputs.iter().all(|i| i.optional || i.meta.is_some())
    }

    pub(crate) fn into_outputs(self) -> Vec<OutputDraft> {
        self.outputs
    }

    pub fn operator_name(&self) -> &str {
        &self.operator
    }

    pub fn input_ready(&self, input: usize) -> bool {
        self.inputs.get(input).is_some_and(|i| i.meta.is_some())
    }

    pub fn input_meta(&self, input: usize) -> Result<&Metadata, ConfigurationError> {
        self.inputs
            .get(input)
            .and_then(|i| i.meta.as_ref())
            .ok_or_else(|| ConfigurationError::MissingInput {
                operator: self.operator.clone(),
                slot: self
                    .inputs
                    .get(input)
                    .map_or_else(|| format!("#{input}"), |i| i.name.clone()),
            })
    }

    pub fn input_value(&self, input: usize) -> Option<&Value> {
        self.inputs.get(input).and_then(|i| i.value.as_ref())
    }

    /// An input's literal value, or `MissingInput`.
    pub fn require_value(&self, input: usize) -> Result<&Value, ConfigurationError> {
        self.input_value(input)
            .ok_or_else(|| ConfigurationError::MissingInput {
                operator: self.operator.clone(),
                slot: self
                    .inputs
                    .get(input)
                    .map_or_else(|| format!("#{input}"), |i| i.name.clone()),
            })
    }

    pub fn output_meta(&self, output: usize) -> Option<&Metadata> {
        self.outputs.get(output).and_then(|o| o.meta.as_ref())
    }

    pub fn set_output_meta(&mut self, output: usize, meta: Metadata) {
        match self.outputs.get_mut(output) {
            Some(o) => o.meta = Some(meta),
            None => warn!(operator = %self.operator, output, "set_output_meta on unknown output"),
        }
    }

    /// Publish a literal value on a value-type output. Its metadata follows
    /// from the value.
    pub fn set_output_value(&mut self, output: usize, value: Value) {
        match self.outputs.get_mut(output) {
            Some(o) => {
                if o.slot_type != SlotType::Value {
                    warn!(operator = %self.operator, output = %o.name, "publishing a value on an array output");
                }
                o.meta = Some(value.meta());
                o.value = Some(value);
            }
            None => warn!(operator = %self.operator, output, "set_output_value on unknown output"),
        }
    }
}

// ── Dirty ─────────────────────────────────────────────────────

/// Passed to [`Operator::notify_dirty`](crate::Operator::notify_dirty).
#[derive(Debug)]
pub struct DirtyContext {
    operator: String,
    inputs: Vec<Option<Metadata>>,
    outputs: Vec<(Option<Metadata>, Option<Value>)>,
    pub(crate) dirty: Vec<(usize, Roi)>,
    pub(crate) values: Vec<(usize, Value)>,
}

impl DirtyContext {
    pub(crate) fn snapshot(store: &GraphStore, id: OperatorId) -> Option<Self> {
        let entry = store.operator(id).ok()?;
        let outputs = entry
            .outputs
            .iter()
            .filter_map(|&o| store.slot(o).ok())
            .filter_map(|s| match &s.kind {
                SlotKind::Output(o) => Some((o.meta.clone(), o.value.clone())),
                SlotKind::Input(_) => None,
            })
            .collect();
        Some(Self {
            operator: entry.name.clone(),
            inputs: entry.inputs.iter().map(|&i| store.input_meta(i)).collect(),
            outputs,
            dirty: Vec::new(),
            values: Vec::new(),
        })
    }

    pub fn operator_name(&self) -> &str {
        &self.operator
    }

    pub fn input_meta(&self, input: usize) -> Option<&Metadata> {
        self.inputs.get(input).and_then(Option::as_ref)
    }

    pub fn output_meta(&self, output: usize) -> Option<&Metadata> {
        self.outputs.get(output).and_then(|(m, _)| m.as_ref())
    }

    pub fn output_value(&self, output: usize) -> Option<&Value> {
        self.outputs.get(output).and_then(|(_, v)| v.as_ref())
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn set_output_dirty(&mut self, output: usize, roi: Roi) {
        self.dirty.push((output, roi));
    }

    /// Mark a whole output dirty. Unconfigured outputs have nothing to
    /// invalidate and are skipped.
    pub fn set_output_dirty_all(&mut self, output: usize) {
        if let Some(meta) = self.output_meta(output) {
            let roi = Roi::full(&meta.shape);
            self.dirty.push((output, roi));
        }
    }

    /// Replace a value-type output. Consumers are reconfigured and see the
    /// new value dirty in full.
    pub fn set_output_value(&mut self, output: usize, value: Value) {
        if let Some(slot) = self.outputs.get_mut(output) {
            *slot = (Some(value.meta()), Some(value.clone()));
            self.values.push((output, value));
        }
    }
}

// ── Compute ───────────────────────────────────────────────────

pub(crate) struct ComputeSnapshot {
    pub(crate) graph: Graph,
    pub(crate) operator: String,
    pub(crate) inputs: Vec<InputView>,
    pub(crate) outputs: Vec<Option<Metadata>>,
}

/// Passed to [`Operator::compute`](crate::Operator::compute).
///
/// Upstream data is fetched with [`request_input`](Self::request_input);
/// those requests are children of the current one, so cancelling the
/// consumer cancels them too.
#[derive(Clone)]
pub struct ComputeContext {
    snapshot: Arc<ComputeSnapshot>,
    request: RequestContext,
}

impl ComputeContext {
    pub(crate) fn new(snapshot: Arc<ComputeSnapshot>, request: RequestContext) -> Self {
        Self { snapshot, request }
    }

    pub fn operator_name(&self) -> &str {
        &self.snapshot.operator
    }

    pub fn input_meta(&self, input: usize) -> Result<&Metadata, RequestError> {
        self.snapshot
            .inputs
            .get(input)
            .and_then(|i| i.meta.as_ref())
            .ok_or_else(|| RequestError::NotReady(format!("{}: input #{input}", self.snapshot.operator)))
    }

    pub fn output_meta(&self, output: usize) -> Result<&Metadata, RequestError> {
        self.snapshot
            .outputs
            .get(output)
            .and_then(Option::as_ref)
            .ok_or_else(|| RequestError::NotReady(format!("{}: output #{output}", self.snapshot.operator)))
    }

    pub fn input_value(&self, input: usize) -> Option<&Value> {
        self.snapshot.inputs.get(input).and_then(|i| i.value.as_ref())
    }

    /// Child request for `roi` of input `input`'s data.
    pub fn request_input(&self, input: usize, roi: Roi) -> Request<Buffer> {
        match self.snapshot.inputs.get(input) {
            Some(view) => self
                .snapshot
                .graph
                .request_input(view.slot, roi, Some(&self.request)),
            None => Request::finished(
                self.request.scheduler(),
                format!("{}.#{input}", self.snapshot.operator),
                Err(RequestError::NotReady(format!(
                    "{}: no input #{input}",
                    self.snapshot.operator
                ))),
            ),
        }
    }

    /// Child request running `f` with a context of its own, for splitting
    /// work into parallel parts.
    pub fn spawn<U, F, Fut>(&self, name: impl Into<String>, f: F) -> Request<U>
    where
        U: Send + 'static,
        F: FnOnce(ComputeContext) -> Fut,
        Fut: Future<Output = Result<U, RequestError>> + Send + 'static,
    {
        let snapshot = Arc::clone(&self.snapshot);
        self.request
            .request(name, move |request| f(ComputeContext { snapshot, request }))
    }

    pub fn is_cancelled(&self) -> bool {
        self.request.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<(), RequestError> {
        self.request.check_cancelled()
    }

    pub fn request_context(&self) -> &RequestContext {
        &self.request
    }
}
