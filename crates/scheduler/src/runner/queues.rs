use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

use crate::priority::PriorityComparator;
use crate::task::Task;

/// Entry of the global ready queue.
pub(super) struct Ready {
    pub(super) task: Task,
    seq: u64,
    comparator: PriorityComparator,
}

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ready {}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ready {
    // BinaryHeap pops the greatest entry: invert so the lowest key (then the
    // earliest submission) comes out first.
    fn cmp(&self, other: &Self) -> Ordering {
        (self.comparator)(self.task.priority(), other.task.priority())
            .then(self.seq.cmp(&other.seq))
            .reverse()
    }
}

/// Everything guarded by the scheduler's queue lock.
pub(super) struct Queues {
    global: BinaryHeap<Ready>,
    affine: Vec<VecDeque<Task>>,
    /// Workers parked on their condvar, most recent last.
    idle: Vec<usize>,
    next_seq: u64,
    pub(super) stopping: bool,
}

/// Where a popped task came from.
pub(super) enum Source {
    Affine,
    Global,
}

impl Queues {
    pub(super) fn new(workers: usize) -> Self {
        Self {
            global: BinaryHeap::new(),
            affine: (0..workers).map(|_| VecDeque::new()).collect(),
            idle: Vec::with_capacity(workers),
            next_seq: 0,
            stopping: false,
        }
    }

    /// Queue a never-run task; returns an idle worker to notify, if any.
    pub(super) fn push_global(&mut self, task: Task, cmp: &PriorityComparator) -> Option<usize> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.global.push(Ready {
            task,
            seq,
            comparator: cmp.clone(),
        });
        self.idle.pop()
    }

    /// Queue a resumption for `worker`. Returns false if no such worker exists.
    pub(super) fn push_affine(&mut self, worker: usize, task: Task) -> bool {
        match self.affine.get_mut(worker) {
            Some(q) => {
                q.push_back(task);
                self.idle.retain(|&w| w != worker);
                true
            }
            None => false,
        }
    }

    /// Next task for `worker`: its own resumptions first, then the global queue.
    pub(super) fn pop_for(&mut self, worker: usize) -> Option<(Task, Source)> {
        if let Some(task) = self.affine.get_mut(worker).and_then(VecDeque::pop_front) {
            return Some((task, Source::Affine));
        }
        self.global.pop().map(|r| (r.task, Source::Global))
    }

    pub(super) fn park(&mut self, worker: usize) {
        if !self.idle.contains(&worker) {
            self.idle.push(worker);
        }
    }

    pub(super) fn unpark(&mut self, worker: usize) {
        self.idle.retain(|&w| w != worker);
    }

    /// Remove every queued task.
    pub(super) fn drain(&mut self) -> Vec<Task> {
        let mut out: Vec<Task> = self.global.drain().map(|r| r.task).collect();
        for q in &mut self.affine {
            out.extend(q.drain(..));
        }
        out
    }

    pub(super) fn global_len(&self) -> usize {
        self.global.len()
    }
}
