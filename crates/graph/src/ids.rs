use std::fmt;

/// Generation-checked handle into the operator arena.
///
/// A removed operator's index can be reused; the generation tells a stale id
/// apart from the new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperatorId {
    pub(crate) index: usize,
    pub(crate) generation: u64,
}

/// Generation-checked handle into the slot arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId {
    pub(crate) index: usize,
    pub(crate) generation: u64,
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}v{}", self.index, self.generation)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}v{}", self.index, self.generation)
    }
}
