//! The operator graph: structural edits, the configure cascade, dirty
//! propagation and request construction.
//!
//! Structural edits are serialized by a re-entrant edit lock, so a listener
//! that edits the graph from inside a notification does not deadlock.
//! Operator callbacks and listeners never run while the store lock is held.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, ThreadId};

use roiflow_core::{Buffer, ConfigurationError, Roi, Value};
use roiflow_request::{Request, RequestBuilder, RequestContext, RequestError};
use roiflow_scheduler::Scheduler;
use tracing::{debug, warn};

use crate::context::{input_views, ComputeContext, ComputeSnapshot, ConfigureContext, DirtyContext};
use crate::error::GraphError;
use crate::ids::{OperatorId, SlotId};
use crate::operator::{Operator, SlotType};
use crate::slot::{OperatorHandle, OutputSlot};
use crate::store::{DirtyListener, GraphStats, GraphStore, InputSource, MetaListener};

struct EditLock {
    owner: Mutex<Option<(ThreadId, usize)>>,
    released: Condvar,
}

struct EditGuard<'a> {
    lock: &'a EditLock,
}

impl EditLock {
    fn new() -> Self {
        Self {
            owner: Mutex::new(None),
            released: Condvar::new(),
        }
    }

    fn lock(&self) -> EditGuard<'_> {
        let me = thread::current().id();
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let current = *owner;
            match current {
                None => {
                    *owner = Some((me, 1));
                    break;
                }
                Some((id, depth)) if id == me => {
                    *owner = Some((id, depth + 1));
                    break;
                }
                Some(_) => {
                    owner = self
                        .released
                        .wait(owner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        EditGuard { lock: self }
    }
}

impl Drop for EditGuard<'_> {
    fn drop(&mut self) {
        let mut owner = self.lock.owner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((id, depth)) = *owner {
            if depth <= 1 {
                *owner = None;
                self.lock.released.notify_all();
            } else {
                *owner = Some((id, depth - 1));
            }
        }
    }
}

/// A pending step of dirty propagation.
enum Dirty {
    /// An input went stale; ask its operator which outputs follow.
    Input(SlotId, Roi),
    /// An output went stale; record it and forward to consumers.
    Output(SlotId, Roi),
}

pub(crate) struct GraphInner {
    scheduler: Scheduler,
    store: RwLock<GraphStore>,
    edit: EditLock,
    next_listener: AtomicU64,
}

/// Shared handle to a dataflow graph. Clones refer to the same graph.
#[derive(Clone)]
pub struct Graph {
    inner: Arc<GraphInner>,
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("Graph")
            .field("operators", &stats.operator_count)
            .field("connections", &stats.connection_count)
            .finish()
    }
}

impl Graph {
    /// An empty graph whose requests run on `scheduler`.
    pub fn new(scheduler: &Scheduler) -> Self {
        Self {
            inner: Arc::new(GraphInner {
                scheduler: scheduler.clone(),
                store: RwLock::new(GraphStore::new()),
                edit: EditLock::new(),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, GraphStore> {
        self.inner.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, GraphStore> {
        self.inner.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an operator. Inputs start at their declared defaults; an
    /// operator whose required inputs all have defaults is configured
    /// right away, and a failure there is kept on the operator.
    pub fn add_operator<O: Operator>(&self, op: O) -> OperatorHandle {
        let _edit = self.inner.edit.lock();
        let id = self.write().insert_operator(Arc::new(op));
        debug!(operator = %id, name = %self.read().operator(id).map(|e| e.name.clone()).unwrap_or_default(), "operator added");
        if let Err(e) = self.configure_cascade(id) {
            debug!(operator = %id, error = %e, "operator not configured at creation");
        }
        OperatorHandle::new(self.clone(), id)
    }

    pub fn operators(&self) -> Vec<OperatorHandle> {
        self.read()
            .operator_ids()
            .into_iter()
            .map(|id| OperatorHandle::new(self.clone(), id))
            .collect()
    }

    pub fn stats(&self) -> GraphStats {
        self.read().stats()
    }

    // ── Structural edits ──────────────────────────────────────

    pub(crate) fn connect(&self, input: SlotId, output: SlotId) -> Result<(), GraphError> {
        let _edit = self.inner.edit.lock();
        let downstream = {
            let mut store = self.write();
            let from = store.label(output);
            let to = store.label(input);
            let out_entry = store.output(output)?;
            let out_type = out_entry.spec.slot_type;
            let upstream = store.slot(output)?.operator;
            let downstream = store.slot(input)?.operator;
            let in_entry = store.input(input)?;

            match in_entry.source {
                InputSource::Upstream(existing) if existing == output => return Ok(()),
                InputSource::Upstream(_) => return Err(GraphError::AlreadyConnected(to)),
                _ => {}
            }
            if in_entry.spec.slot_type != out_type {
                return Err(GraphError::Incompatible {
                    from,
                    to,
                    reason: format!("{:?} output into {:?} input", out_type, in_entry.spec.slot_type),
                });
            }
            if upstream == downstream || store.reaches(downstream, upstream) {
                return Err(GraphError::Cycle { from, to });
            }

            store.input_mut(input)?.source = InputSource::Upstream(output);
            store.output_mut(output)?.consumers.push(input);
            debug!(%from, %to, "connected");
            downstream
        };

        let result = self.configure_cascade(downstream);
        // Whatever was derived from the old source is stale for listeners
        // further down.
        let seeds = self.full_outputs(downstream);
        self.propagate(seeds);
        result
    }

    pub(crate) fn disconnect(&self, input: SlotId) -> Result<(), GraphError> {
        let _edit = self.inner.edit.lock();
        let operator = {
            let mut store = self.write();
            let operator = store.slot(input)?.operator;
            if !matches!(store.input(input)?.source, InputSource::Upstream(_)) {
                return Ok(());
            }
            store.reset_input(input)?;
            debug!(input = %store.label(input), "disconnected");
            operator
        };
        self.configure_cascade(operator)
    }

    pub(crate) fn set_value(&self, input: SlotId, value: Value) -> Result<(), GraphError> {
        let _edit = self.inner.edit.lock();
        let operator = {
            let mut store = self.write();
            let operator = store.slot(input)?.operator;
            let entry = store.input(input)?;
            if entry.spec.slot_type == SlotType::Array && value.as_array().is_none() {
                return Err(GraphError::Incompatible {
                    from: value.kind().to_string(),
                    to: store.label(input),
                    reason: "array input needs an array value".to_string(),
                });
            }
            if matches!(&entry.source, InputSource::Value(current) if *current == value) {
                return Ok(());
            }
            store.reset_input(input)?;
            store.input_mut(input)?.source = InputSource::Value(value.clone());
            debug!(input = %store.label(input), kind = value.kind(), "value set");
            operator
        };

        let result = self.configure_cascade(operator);
        let configured = self.read().operator(operator).is_ok_and(|e| e.configured);
        if configured {
            self.propagate(vec![Dirty::Input(input, Roi::full(&value.meta().shape))]);
        }
        result
    }

    pub(crate) fn remove_operator(&self, id: OperatorId) -> Result<(), GraphError> {
        let _edit = self.inner.edit.lock();
        let affected = {
            let mut store = self.write();
            let name = store.operator(id)?.name.clone();
            let affected = store.remove_operator(id)?;
            debug!(operator = %id, %name, "operator removed");
            affected
        };
        let mut first_error = None;
        for op in affected {
            if let Err(e) = self.configure_cascade(op) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // ── Configuration ─────────────────────────────────────────

    /// Configure `start` and everything downstream of it, upstream first.
    /// Returns the first configuration error; every operator in the cascade
    /// is still visited.
    fn configure_cascade(&self, start: OperatorId) -> Result<(), GraphError> {
        let order = self.read().downstream_order(start);
        let mut first_error = None;
        let mut changed: Vec<(SlotId, Vec<MetaListener>)> = Vec::new();

        for id in order {
            let snapshot = {
                let store = self.read();
                store
                    .operator(id)
                    .ok()
                    .map(|e| Arc::clone(&e.op))
                    .zip(ConfigureContext::snapshot(&store, id))
            };
            let Some((op, mut cx)) = snapshot else {
                continue;
            };

            let ready = cx.required_inputs_ready();
            let outcome = if ready {
                op.configure(&mut cx)
            } else {
                Ok(())
            };
            let name = cx.operator_name().to_string();
            let drafts = cx.into_outputs();

            let mut store = self.write();
            let Ok(entry) = store.operator_mut(id) else {
                continue;
            };
            let (configured, error) = match outcome {
                Ok(()) => (ready, None),
                Err(e) => {
                    warn!(operator = %name, error = %e, "configuration failed");
                    first_error.get_or_insert(GraphError::Configuration {
                        operator: name.clone(),
                        source: e.clone(),
                    });
                    (false, Some(e))
                }
            };
            entry.configured = configured;
            entry.error = error;
            let outputs = entry.outputs.clone();

            for (slot, draft) in outputs.into_iter().zip(drafts) {
                let Ok(out) = store.output_mut(slot) else {
                    continue;
                };
                let (meta, value) = if configured {
                    (draft.meta, draft.value)
                } else {
                    (None, None)
                };
                if out.meta != meta {
                    changed.push((slot, out.meta_listeners.iter().map(|(_, l)| Arc::clone(l)).collect()));
                }
                out.meta = meta;
                out.value = value;
                out.dirty.clear();
            }
            if configured {
                debug!(operator = %name, "configured");
            }
        }

        for (slot, listeners) in changed {
            let handle = OutputSlot::new(self.clone(), slot);
            for listener in listeners {
                listener(&handle);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // ── Dirty propagation ─────────────────────────────────────

    fn full_outputs(&self, operator: OperatorId) -> Vec<Dirty> {
        let store = self.read();
        let Ok(entry) = store.operator(operator) else {
            return Vec::new();
        };
        entry
            .outputs
            .iter()
            .filter_map(|&o| {
                let meta = store.output(o).ok()?.meta.as_ref()?;
                Some(Dirty::Output(o, Roi::full(&meta.shape)))
            })
            .collect()
    }

    pub(crate) fn set_input_dirty(&self, input: SlotId, roi: Option<Roi>) -> Result<(), GraphError> {
        let _edit = self.inner.edit.lock();
        let (meta, label) = {
            let store = self.read();
            store.input(input)?;
            (store.input_meta(input), store.label(input))
        };
        // Nothing has been derived from an input without data.
        if let Some(meta) = meta {
            let roi = roi.unwrap_or_else(|| Roi::full(&meta.shape));
            roi.check_within(&meta.shape)
                .map_err(|source| GraphError::InvalidRoi { slot: label, source })?;
            self.propagate(vec![Dirty::Input(input, roi)]);
        }
        Ok(())
    }

    pub(crate) fn set_output_dirty(&self, output: SlotId, roi: Option<Roi>) -> Result<(), GraphError> {
        let _edit = self.inner.edit.lock();
        let (meta, label) = {
            let store = self.read();
            (store.output(output)?.meta.clone(), store.label(output))
        };
        if let Some(meta) = meta {
            let roi = roi.unwrap_or_else(|| Roi::full(&meta.shape));
            roi.check_within(&meta.shape)
                .map_err(|source| GraphError::InvalidRoi { slot: label, source })?;
            self.propagate(vec![Dirty::Output(output, roi)]);
        }
        Ok(())
    }

    fn propagate(&self, seeds: Vec<Dirty>) {
        let mut queue: VecDeque<Dirty> = seeds.into();
        while let Some(step) = queue.pop_front() {
            match step {
                Dirty::Input(input, roi) => self.dirty_input(input, &roi, &mut queue),
                Dirty::Output(output, roi) => self.dirty_output(output, roi, &mut queue),
            }
        }
    }

    fn dirty_input(&self, input: SlotId, roi: &Roi, queue: &mut VecDeque<Dirty>) {
        let prepared = {
            let store = self.read();
            let Ok(slot) = store.slot(input) else {
                return;
            };
            let (operator, index) = (slot.operator, slot.index);
            match store.operator(operator) {
                Ok(entry) if entry.configured => DirtyContext::snapshot(&store, operator)
                    .map(|cx| (Arc::clone(&entry.op), cx, operator, index, entry.outputs.clone())),
                _ => None,
            }
        };
        let Some((op, mut cx, operator, index, outputs)) = prepared else {
            return;
        };

        op.notify_dirty(&mut cx, index, roi);

        for (output, value) in std::mem::take(&mut cx.values) {
            let Some(&slot) = outputs.get(output) else {
                continue;
            };
            let (consumers, listeners) = {
                let mut store = self.write();
                let Ok(out) = store.output_mut(slot) else {
                    continue;
                };
                let meta = value.meta();
                let listeners: Vec<MetaListener> = if out.meta.as_ref() != Some(&meta) {
                    out.meta_listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
                } else {
                    Vec::new()
                };
                out.meta = Some(meta);
                out.value = Some(value.clone());
                let consumers = out.consumers.clone();
                let mut consumers: Vec<OperatorId> = consumers
                    .into_iter()
                    .filter_map(|c| store.slot(c).ok().map(|s| s.operator))
                    .collect();
                consumers.dedup();
                (consumers, listeners)
            };
            debug!(operator = %operator, output, kind = value.kind(), "output value changed");

            let handle = OutputSlot::new(self.clone(), slot);
            for listener in listeners {
                listener(&handle);
            }
            for consumer_op in consumers {
                if let Err(e) = self.configure_cascade(consumer_op) {
                    debug!(error = %e, "downstream reconfiguration failed");
                }
            }
            // Consumers see the new value as dirty in full via the output.
            queue.push_back(Dirty::Output(slot, Roi::full(&value.meta().shape)));
        }

        for (output, roi) in std::mem::take(&mut cx.dirty) {
            if let Some(&slot) = outputs.get(output) {
                queue.push_back(Dirty::Output(slot, roi));
            }
        }
    }

    fn dirty_output(&self, output: SlotId, roi: Roi, queue: &mut VecDeque<Dirty>) {
        let (roi, listeners, consumers) = {
            let mut store = self.write();
            let label = store.label(output);
            let Ok(out) = store.output_mut(output) else {
                return;
            };
            let Some(meta) = out.meta.as_ref() else {
                return;
            };
            if roi.rank() != meta.rank() {
                warn!(output = %label, %roi, "dirty region of wrong rank ignored");
                return;
            }
            let Some(roi) = roi.intersection(&Roi::full(&meta.shape)) else {
                return;
            };
            out.dirty.insert(roi.clone());
            let listeners: Vec<DirtyListener> =
                out.dirty_listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
            (roi, listeners, out.consumers.clone())
        };

        let handle = OutputSlot::new(self.clone(), output);
        for listener in listeners {
            listener(&handle, &roi);
        }
        for consumer in consumers {
            queue.push_back(Dirty::Input(consumer, roi.clone()));
        }
    }

    // ── Listeners ─────────────────────────────────────────────

    fn listener_id(&self) -> u64 {
        self.inner.next_listener.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn subscribe_dirty(&self, output: SlotId, listener: DirtyListener) -> Result<u64, GraphError> {
        let id = self.listener_id();
        self.write().output_mut(output)?.dirty_listeners.push((id, listener));
        Ok(id)
    }

    pub(crate) fn subscribe_meta(&self, output: SlotId, listener: MetaListener) -> Result<u64, GraphError> {
        let id = self.listener_id();
        self.write().output_mut(output)?.meta_listeners.push((id, listener));
        Ok(id)
    }

    pub(crate) fn unsubscribe(&self, output: SlotId, id: u64) -> Result<bool, GraphError> {
        let mut store = self.write();
        let out = store.output_mut(output)?;
        let before = out.dirty_listeners.len() + out.meta_listeners.len();
        out.dirty_listeners.retain(|(l, _)| *l != id);
        out.meta_listeners.retain(|(l, _)| *l != id);
        Ok(before != out.dirty_listeners.len() + out.meta_listeners.len())
    }

    pub(crate) fn take_dirty(&self, output: SlotId) -> Result<Vec<Roi>, GraphError> {
        Ok(self.write().output_mut(output)?.dirty.take())
    }

    // ── Requests ──────────────────────────────────────────────

    fn failed(&self, name: String, err: RequestError) -> Request<Buffer> {
        Request::finished(&self.inner.scheduler, name, Err(err))
    }

    /// Request `roi` of `output`, as a child of `parent` when given.
    pub(crate) fn request_output(
        &self,
        output: SlotId,
        roi: Roi,
        parent: Option<&RequestContext>,
    ) -> Request<Buffer> {
        let prepared = {
            let store = self.read();
            let label = store.label(output);
            let (out, slot) = match (store.output(output), store.slot(output)) {
                (Ok(out), Ok(slot)) => (out, slot),
                _ => return self.failed(label.clone(), RequestError::NotReady(format!("{label} was removed"))),
            };
            let Some(meta) = out.meta.clone() else {
                return self.failed(label.clone(), RequestError::NotReady(label));
            };
            if let Err(e) = roi.check_within(&meta.shape) {
                return self.failed(label, RequestError::InvalidRoi(e.to_string()));
            }
            if let Some(Value::Array(buf)) = &out.value {
                let result = buf.region(&roi).map_err(|e| RequestError::InvalidRoi(e.to_string()));
                return Request::finished(&self.inner.scheduler, label, result);
            }
            let Some(dtype) = meta.dtype else {
                return self.failed(
                    label.clone(),
                    RequestError::Configuration(ConfigurationError::Other(format!(
                        "{label} carries a value, not array data"
                    ))),
                );
            };
            let Ok(entry) = store.operator(slot.operator) else {
                return self.failed(label.clone(), RequestError::NotReady(label));
            };
            let outputs = entry
                .outputs
                .iter()
                .map(|&o| store.output(o).ok().and_then(|o| o.meta.clone()))
                .collect();
            let snapshot = Arc::new(ComputeSnapshot {
                graph: self.clone(),
                operator: entry.name.clone(),
                inputs: input_views(&store, &entry.inputs),
                outputs,
            });
            (label, Arc::clone(&entry.op), snapshot, slot.index, dtype)
        };
        let (label, op, snapshot, index, dtype) = prepared;
        debug!(output = %label, %roi, "request created");

        let compute = move |request: RequestContext| async move {
            let cx = ComputeContext::new(snapshot, request);
            let shape = roi.shape();
            let mut dest = Buffer::zeros(dtype, &shape);
            op.compute(&cx, index, &roi, &mut dest).await?;
            if dest.shape() != shape.as_slice() {
                return Err(RequestError::compute(
                    cx.operator_name(),
                    format!("produced shape {:?} for region {roi}", dest.shape()),
                ));
            }
            Ok(dest)
        };
        match parent {
            Some(parent) => parent.request(label, compute),
            None => RequestBuilder::new(&self.inner.scheduler).name(label).build(compute),
        }
    }

    /// Request `roi` of whatever feeds `input`.
    pub(crate) fn request_input(
        &self,
        input: SlotId,
        roi: Roi,
        parent: Option<&RequestContext>,
    ) -> Request<Buffer> {
        let source = {
            let store = self.read();
            let label = store.label(input);
            match store.input(input) {
                Ok(entry) => Ok(entry.source.clone()),
                Err(_) => Err(label),
            }
        };
        match source {
            Ok(InputSource::Upstream(output)) => self.request_output(output, roi, parent),
            Ok(InputSource::Value(Value::Array(buf))) => {
                let label = self.read().label(input);
                let result = roi
                    .check_within(buf.shape())
                    .and_then(|()| buf.region(&roi))
                    .map_err(|e| RequestError::InvalidRoi(e.to_string()));
                Request::finished(&self.inner.scheduler, label, result)
            }
            Ok(_) => {
                let label = self.read().label(input);
                self.failed(label.clone(), RequestError::NotReady(label))
            }
            Err(label) => self.failed(label.clone(), RequestError::NotReady(format!("{label} was removed"))),
        }
    }
}
