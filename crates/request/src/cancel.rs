use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::task::Waker;

use futures::task::AtomicWaker;

struct Node {
    cancelled: AtomicBool,
    waker: AtomicWaker,
    children: Mutex<Vec<Weak<Node>>>,
}

impl Node {
    fn new(cancelled: bool) -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(cancelled),
            waker: AtomicWaker::new(),
            children: Mutex::new(Vec::new()),
        })
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.waker.wake();
        self.cancel_children();
    }

    fn cancel_children(&self) {
        let children: Vec<Arc<Node>> = {
            let mut guard = self.children.lock().unwrap_or_else(PoisonError::into_inner);
            guard.retain(|c| c.strong_count() > 0);
            guard.iter().filter_map(Weak::upgrade).collect()
        };
        for child in children {
            child.cancel();
        }
    }
}

/// Cancellation flag shared along a request tree.
///
/// Cancelling a token cancels every token derived from it with
/// [`CancelToken::child`], and wakes the task registered on each.
#[derive(Clone)]
pub struct CancelToken {
    node: Arc<Node>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            node: Node::new(false),
        }
    }

    /// A token cancelled whenever this one is. Born cancelled if this one
    /// already is.
    pub fn child(&self) -> CancelToken {
        let mut children = self
            .node
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let node = Node::new(self.is_cancelled());
        children.push(Arc::downgrade(&node));
        CancelToken { node }
    }

    pub fn cancel(&self) {
        self.node.cancel();
    }

    /// Cancel all descendants but leave this token untouched.
    pub fn cancel_children(&self) {
        self.node.cancel_children();
    }

    pub fn is_cancelled(&self) -> bool {
        self.node.cancelled.load(Ordering::Acquire)
    }

    /// Wake `waker` when the token is cancelled. Replaces any earlier waker.
    pub fn register(&self, waker: &Waker) {
        self.node.waker.register(waker);
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_reaches_grandchildren() {
        let root = CancelToken::new();
        let child = root.child();
        let grandchild = child.child();
        root.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn cancel_children_spares_self() {
        let root = CancelToken::new();
        let a = root.child();
        let b = root.child();
        root.cancel_children();
        assert!(!root.is_cancelled());
        assert!(a.is_cancelled() && b.is_cancelled());
    }

    #[test]
    fn child_of_cancelled_token_starts_cancelled() {
        let root = CancelToken::new();
        root.cancel();
        assert!(root.child().is_cancelled());
    }

    #[test]
    fn child_cancel_does_not_reach_parent() {
        let root = CancelToken::new();
        let child = root.child();
        child.cancel();
        assert!(!root.is_cancelled());
    }

    #[test]
    fn dropped_children_are_pruned() {
        let root = CancelToken::new();
        for _ in 0..10 {
            let _ = root.child();
        }
        root.cancel_children();
        assert!(root.node.children.lock().unwrap().is_empty());
    }
}
