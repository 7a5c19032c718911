use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Dispatch priority key. Lower keys run first.
///
/// Keys are compared lexicographically by default. A child request's key is
/// its parent's key extended by its sibling index, so work stays biased
/// towards finishing one subtree before starting the next.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Priority(Vec<u64>);

impl Priority {
    /// The empty key, which sorts before every other key.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn new(keys: Vec<u64>) -> Self {
        Self(keys)
    }

    /// Key for the `index`-th child of a task with this key.
    pub fn child(&self, index: u64) -> Self {
        let mut keys = self.0.clone();
        keys.push(index);
        Self(keys)
    }

    pub fn keys(&self) -> &[u64] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl From<u64> for Priority {
    fn from(key: u64) -> Self {
        Self(vec![key])
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Orders two priority keys; `Less` runs first.
pub type PriorityComparator = Arc<dyn Fn(&Priority, &Priority) -> Ordering + Send + Sync>;

/// The default comparator: plain lexicographic order of the keys.
pub fn lexicographic() -> PriorityComparator {
    Arc::new(|a: &Priority, b: &Priority| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_sort_after_parent_and_by_index() {
        let parent = Priority::from(3);
        let first = parent.child(0);
        let second = parent.child(1);
        assert!(parent < first);
        assert!(first < second);
        assert!(second < Priority::from(4));
        assert_eq!(second.keys(), &[3, 1]);
        assert_eq!(second.depth(), 2);
    }

    #[test]
    fn root_sorts_first() {
        assert!(Priority::root() < Priority::from(0));
    }
}
