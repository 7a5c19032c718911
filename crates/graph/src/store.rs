use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use roiflow_core::{ConfigurationError, Metadata, Roi, Value};
use serde::Serialize;
use slab::Slab;

use crate::dirty::DirtySet;
use crate::error::GraphError;
use crate::ids::{OperatorId, SlotId};
use crate::operator::{InputSpec, Operator, OutputSpec};
use crate::slot::OutputSlot;

pub(crate) type DirtyListener = Arc<dyn Fn(&OutputSlot, &Roi) + Send + Sync>;
pub(crate) type MetaListener = Arc<dyn Fn(&OutputSlot) + Send + Sync>;

/// Where an input gets its data from.
#[derive(Clone)]
pub(crate) enum InputSource {
    Empty,
    Value(Value),
    Upstream(SlotId),
}

pub(crate) struct InputEntry {
    pub(crate) spec: InputSpec,
    pub(crate) source: InputSource,
}

pub(crate) struct OutputEntry {
    pub(crate) spec: OutputSpec,
    /// `None` until the operator configured successfully.
    pub(crate) meta: Option<Metadata>,
    pub(crate) value: Option<Value>,
    /// Downstream input slots fed by this output.
    pub(crate) consumers: Vec<SlotId>,
    pub(crate) dirty: DirtySet,
    pub(crate) dirty_listeners: Vec<(u64, DirtyListener)>,
    pub(crate) meta_listeners: Vec<(u64, MetaListener)>,
}

pub(crate) enum SlotKind {
    Input(InputEntry),
    Output(OutputEntry),
}

pub(crate) struct SlotEntry {
    generation: u64,
    pub(crate) operator: OperatorId,
    pub(crate) index: usize,
    pub(crate) kind: SlotKind,
}

impl SlotEntry {
    pub(crate) fn name(&self) -> &str {
        match &self.kind {
            SlotKind::Input(i) => &i.spec.name,
            SlotKind::Output(o) => &o.spec.name,
        }
    }
}

pub(crate) struct OperatorEntry {
    generation: u64,
    pub(crate) op: Arc<dyn Operator>,
    pub(crate) name: String,
    pub(crate) inputs: Vec<SlotId>,
    pub(crate) outputs: Vec<SlotId>,
    /// Last configure succeeded with every required input ready.
    pub(crate) configured: bool,
    pub(crate) error: Option<ConfigurationError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphStats {
    pub operator_count: usize,
    pub slot_count: usize,
    pub connection_count: usize,
    pub operators_by_name: HashMap<String, usize>,
    /// Outputs with no metadata (unconfigured or failed).
    pub unready_outputs: usize,
    /// Outputs holding at least one stale region.
    pub dirty_outputs: usize,
}

/// Arena of operators and slots plus the connections between them.
pub(crate) struct GraphStore {
    operators: Slab<OperatorEntry>,
    slots: Slab<SlotEntry>,
    next_generation: u64,
}

impl GraphStore {
    pub(crate) fn new() -> Self {
        Self {
            operators: Slab::new(),
            slots: Slab::new(),
            next_generation: 1,
        }
    }

    fn generation(&mut self) -> u64 {
        let g = self.next_generation;
        self.next_generation += 1;
        g
    }

    // ── Lookup ────────────────────────────────────────────────

    pub(crate) fn operator(&self, id: OperatorId) -> Result<&OperatorEntry, GraphError> {
        self.operators
            .get(id.index)
            .filter(|e| e.generation == id.generation)
            .ok_or_else(|| GraphError::StaleHandle(id.to_string()))
    }

    pub(crate) fn operator_mut(&mut self, id: OperatorId) -> Result<&mut OperatorEntry, GraphError> {
        self.operators
            .get_mut(id.index)
            .filter(|e| e.generation == id.generation)
            .ok_or_else(|| GraphError::StaleHandle(id.to_string()))
    }

    pub(crate) fn slot(&self, id: SlotId) -> Result<&SlotEntry, GraphError> {
        self.slots
            .get(id.index)
            .filter(|e| e.generation == id.generation)
            .ok_or_else(|| GraphError::StaleHandle(id.to_string()))
    }

    fn slot_mut(&mut self, id: SlotId) -> Result<&mut SlotEntry, GraphError> {
        self.slots
            .get_mut(id.index)
            .filter(|e| e.generation == id.generation)
            .ok_or_else(|| GraphError::StaleHandle(id.to_string()))
    }

    pub(crate) fn input(&self, id: SlotId) -> Result<&InputEntry, GraphError> {
        match &self.slot(id)?.kind {
            SlotKind::Input(i) => Ok(i),
            SlotKind::Output(_) => Err(GraphError::StaleHandle(format!("{id} is not an input"))),
        }
    }

    pub(crate) fn input_mut(&mut self, id: SlotId) -> Result<&mut InputEntry, GraphError> {
        match &mut self.slot_mut(id)?.kind {
            SlotKind::Input(i) => Ok(i),
            SlotKind::Output(_) => Err(GraphError::StaleHandle(format!("{id} is not an input"))),
        }
    }

    pub(crate) fn output(&self, id: SlotId) -> Result<&OutputEntry, GraphError> {
        match &self.slot(id)?.kind {
            SlotKind::Output(o) => Ok(o),
            SlotKind::Input(_) => Err(GraphError::StaleHandle(format!("{id} is not an output"))),
        }
    }

    pub(crate) fn output_mut(&mut self, id: SlotId) -> Result<&mut OutputEntry, GraphError> {
        match &mut self.slot_mut(id)?.kind {
            SlotKind::Output(o) => Ok(o),
            SlotKind::Input(_) => Err(GraphError::StaleHandle(format!("{id} is not an output"))),
        }
    }

    /// `Operator.Slot`, for messages.
    pub(crate) fn label(&self, id: SlotId) -> String {
        match self.slot(id) {
            Ok(slot) => match self.operator(slot.operator) {
                Ok(op) => format!("{}.{}", op.name, slot.name()),
                Err(_) => slot.name().to_string(),
            },
            Err(_) => id.to_string(),
        }
    }

    pub(crate) fn operator_ids(&self) -> Vec<OperatorId> {
        self.operators
            .iter()
            .map(|(index, e)| OperatorId {
                index,
                generation: e.generation,
            })
            .collect()
    }

    // ── Insertion & removal ───────────────────────────────────

    pub(crate) fn insert_operator(&mut self, op: Arc<dyn Operator>) -> OperatorId {
        let generation = self.generation();
        let index = self.operators.vacant_key();
        let id = OperatorId { index, generation };

        let mut inputs = Vec::new();
        for (i, spec) in op.inputs().into_iter().enumerate() {
            let source = match &spec.default {
                Some(v) => InputSource::Value(v.clone()),
                None => InputSource::Empty,
            };
            let generation = self.generation();
            let index = self.slots.insert(SlotEntry {
                generation,
                operator: id,
                index: i,
                kind: SlotKind::Input(InputEntry { spec, source }),
            });
            inputs.push(SlotId { index, generation });
        }

        let mut outputs = Vec::new();
        for (i, spec) in op.outputs().into_iter().enumerate() {
            let generation = self.generation();
            let index = self.slots.insert(SlotEntry {
                generation,
                operator: id,
                index: i,
                kind: SlotKind::Output(OutputEntry {
                    spec,
                    meta: None,
                    value: None,
                    consumers: Vec::new(),
                    dirty: DirtySet::new(),
                    dirty_listeners: Vec::new(),
                    meta_listeners: Vec::new(),
                }),
            });
            outputs.push(SlotId { index, generation });
        }

        let name = op.name().to_string();
        let inserted = self.operators.insert(OperatorEntry {
            generation,
            op,
            name,
            inputs,
            outputs,
            configured: false,
            error: None,
        });
        debug_assert_eq!(inserted, index);
        id
    }

    /// Point `input` back at its default (or nothing), detaching it from any
    /// upstream output.
    pub(crate) fn reset_input(&mut self, input: SlotId) -> Result<(), GraphError> {
        let entry = self.input_mut(input)?;
        let previous = std::mem::replace(
            &mut entry.source,
            match &entry.spec.default {
                Some(v) => InputSource::Value(v.clone()),
                None => InputSource::Empty,
            },
        );
        if let InputSource::Upstream(out) = previous {
            if let Ok(o) = self.output_mut(out) {
                o.consumers.retain(|&c| c != input);
            }
        }
        Ok(())
    }

    /// Remove an operator and its slots. Returns the downstream operators
    /// whose inputs were detached.
    pub(crate) fn remove_operator(&mut self, id: OperatorId) -> Result<Vec<OperatorId>, GraphError> {
        let (inputs, outputs) = {
            let entry = self.operator(id)?;
            (entry.inputs.clone(), entry.outputs.clone())
        };

        for &input in &inputs {
            self.reset_input(input)?;
        }

        let mut affected = Vec::new();
        for &output in &outputs {
            let consumers = std::mem::take(&mut self.output_mut(output)?.consumers);
            for consumer in consumers {
                if let Ok(slot) = self.slot(consumer) {
                    affected.push(slot.operator);
                }
                self.reset_input(consumer)?;
            }
        }

        for slot in inputs.into_iter().chain(outputs) {
            self.slots.remove(slot.index);
        }
        self.operators.remove(id.index);
        affected.dedup();
        Ok(affected)
    }

    // ── Derived data ──────────────────────────────────────────

    /// Metadata an input currently sees.
    pub(crate) fn input_meta(&self, input: SlotId) -> Option<Metadata> {
        match &self.input(input).ok()?.source {
            InputSource::Empty => None,
            InputSource::Value(v) => Some(v.meta()),
            InputSource::Upstream(out) => self.output(*out).ok()?.meta.clone(),
        }
    }

    /// Literal value an input currently sees, if any.
    pub(crate) fn input_value(&self, input: SlotId) -> Option<Value> {
        match &self.input(input).ok()?.source {
            InputSource::Empty => None,
            InputSource::Value(v) => Some(v.clone()),
            InputSource::Upstream(out) => self.output(*out).ok()?.value.clone(),
        }
    }

    /// Operators fed directly by `id`'s outputs, once per connection.
    fn direct_downstream(&self, id: OperatorId) -> Vec<OperatorId> {
        let Ok(entry) = self.operator(id) else {
            return Vec::new();
        };
        entry
            .outputs
            .iter()
            .filter_map(|&o| self.output(o).ok())
            .flat_map(|o| o.consumers.iter())
            .filter_map(|&c| self.slot(c).ok().map(|s| s.operator))
            .collect()
    }

    /// Is `to` reachable from `from` along connections?
    pub(crate) fn reaches(&self, from: OperatorId, to: OperatorId) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![from];
        while let Some(op) = stack.pop() {
            if op == to {
                return true;
            }
            if seen.insert(op) {
                stack.extend(self.direct_downstream(op));
            }
        }
        false
    }

    /// `start` and everything downstream of it, upstream operators first.
    pub(crate) fn downstream_order(&self, start: OperatorId) -> Vec<OperatorId> {
        let mut closure = HashSet::new();
        let mut stack = vec![start];
        while let Some(op) = stack.pop() {
            if closure.insert(op) {
                stack.extend(self.direct_downstream(op));
            }
        }

        let mut indegree: HashMap<OperatorId, usize> = closure.iter().map(|&o| (o, 0)).collect();
        for &op in &closure {
            for d in self.direct_downstream(op) {
                if let Some(n) = indegree.get_mut(&d) {
                    *n += 1;
                }
            }
        }

        let mut order = Vec::with_capacity(closure.len());
        let mut ready: VecDeque<OperatorId> = VecDeque::from([start]);
        while let Some(op) = ready.pop_front() {
            order.push(op);
            for d in self.direct_downstream(op) {
                if let Some(n) = indegree.get_mut(&d) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push_back(d);
                    }
                }
            }
        }
        order
    }

    pub(crate) fn stats(&self) -> GraphStats {
        let mut operators_by_name: HashMap<String, usize> = HashMap::new();
        for (_, op) in &self.operators {
            *operators_by_name.entry(op.name.clone()).or_default() += 1;
        }
        let mut connection_count = 0;
        let mut unready_outputs = 0;
        let mut dirty_outputs = 0;
        for (_, slot) in &self.slots {
            if let SlotKind::Output(o) = &slot.kind {
                connection_count += o.consumers.len();
                unready_outputs += usize::from(o.meta.is_none());
                dirty_outputs += usize::from(!o.dirty.is_clean());
            }
        }
        GraphStats {
            operator_count: self.operators.len(),
            slot_count: self.slots.len(),
            connection_count,
            operators_by_name,
            unready_outputs,
            dirty_outputs,
        }
    }
}
