//! Schedulable units of work.
//!
//! A [`Task`] is a cheap, cloneable handle. Its body is either a one-shot
//! closure or a [`Resumable`] state machine that may suspend at a yield point
//! and be woken later. Futures are driven as resumable tasks whose waker wakes
//! the task.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll, Waker};

use futures::task::ArcWake;

use crate::error::SchedulerError;
use crate::priority::Priority;
use crate::runner::SchedulerInner;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome of one step of a resumable task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The task is finished and its body can be dropped.
    Complete,
    /// The task yielded; it resumes, on the same worker, once woken.
    Suspend,
}

/// A multi-step computation driven by the scheduler.
///
/// Every call to `step` runs up to the next yield point. Whoever satisfies the
/// awaited condition calls [`Task::wake`] to get it resumed.
pub trait Resumable: Send + 'static {
    fn step(&mut self, cx: &mut StepContext<'_>) -> Step;
}

/// What a step can see of its surroundings.
pub struct StepContext<'a> {
    worker: usize,
    task: &'a Task,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(worker: usize, task: &'a Task) -> Self {
        Self { worker, task }
    }

    /// Index of the worker running this step.
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Handle to the running task, e.g. to hand to whoever will wake it.
    pub fn task(&self) -> &Task {
        self.task
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }
}

pub(crate) enum Body {
    OneShot(Box<dyn FnOnce() + Send>),
    Resumable(Box<dyn Resumable>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    /// Never submitted.
    New,
    /// Sitting in the global queue or a worker's affinity queue.
    Queued,
    Running,
    /// Yielded and waiting to be woken.
    Suspended,
    Done,
}

pub(crate) struct TaskState {
    pub(crate) phase: TaskPhase,
    pub(crate) body: Option<Body>,
    /// Worker that ran the first step; resumptions go only there.
    pub(crate) worker: Option<usize>,
    /// Woken while running: requeue instead of suspending.
    pub(crate) notified: bool,
    pub(crate) scheduler: Weak<SchedulerInner>,
    pub(crate) panic: Option<String>,
}

pub(crate) struct TaskShared {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) priority: Priority,
    pub(crate) cancelled: AtomicBool,
    pub(crate) state: Mutex<TaskState>,
}

/// Handle to a schedulable task.
#[derive(Clone)]
pub struct Task {
    pub(crate) shared: Arc<TaskShared>,
}

impl Task {
    fn with_body(name: impl Into<String>, body: Body) -> Self {
        Self {
            shared: Arc::new(TaskShared {
                id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                priority: Priority::root(),
                cancelled: AtomicBool::new(false),
                state: Mutex::new(TaskState {
                    phase: TaskPhase::New,
                    body: Some(body),
                    worker: None,
                    notified: false,
                    scheduler: Weak::new(),
                    panic: None,
                }),
            }),
        }
    }

    /// A task that runs `f` once, on whichever worker claims it.
    pub fn one_shot<F>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_body(name, Body::OneShot(Box::new(f)))
    }

    pub fn resumable<R: Resumable>(name: impl Into<String>, body: R) -> Self {
        Self::with_body(name, Body::Resumable(Box::new(body)))
    }

    /// A task that polls `future` to completion. Every poll after the first
    /// happens on the worker that polled it first.
    pub fn from_future<F>(name: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self::resumable(
            name,
            FutureTask {
                future: Box::pin(future),
                waker: None,
            },
        )
    }

    /// Set the dispatch priority. Only meaningful before submission.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.priority = priority;
        } else {
            tracing::warn!(task = %self.name(), "priority ignored: task handle already shared");
        }
        self
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn priority(&self) -> &Priority {
        &self.shared.priority
    }

    pub fn phase(&self) -> TaskPhase {
        self.lock().phase
    }

    /// Worker the task is pinned to, once it has run.
    pub fn worker(&self) -> Option<usize> {
        self.lock().worker
    }

    pub fn is_done(&self) -> bool {
        self.phase() == TaskPhase::Done
    }

    /// Message of a panic captured while stepping this task.
    pub fn panic_message(&self) -> Option<String> {
        self.lock().panic.clone()
    }

    /// Ask the task to stop at its next yield point.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Wake through the scheduler the task was submitted to.
    pub fn wake(&self) -> Result<(), SchedulerError> {
        let scheduler = self.lock().scheduler.upgrade();
        match scheduler {
            Some(inner) => inner.wake(self),
            None => Err(SchedulerError::Unbound(self.name().to_string())),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("priority", &self.shared.priority)
            .finish()
    }
}

// ── Futures as resumable tasks ────────────────────────────────

struct FutureTask {
    future: Pin<Box<dyn Future<Output = ()> + Send>>,
    /// Built on the first step and reused, so `Waker::will_wake` holds
    /// across polls. Dropped on completion.
    waker: Option<Waker>,
}

impl Resumable for FutureTask {
    fn step(&mut self, cx: &mut StepContext<'_>) -> Step {
        let waker = self
            .waker
            .get_or_insert_with(|| futures::task::waker(Arc::new(TaskWaker(cx.task().clone()))));
        let mut poll_cx = Context::from_waker(waker);
        match self.future.as_mut().poll(&mut poll_cx) {
            Poll::Ready(()) => {
                self.waker = None;
                Step::Complete
            }
            Poll::Pending => Step::Suspend,
        }
    }
}

/// Waker that resubmits its task. A suspended future task is kept alive only
/// by the wakers parked on whatever it awaits.
struct TaskWaker(Task);

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let task = &arc_self.0;
        if let Err(e) = task.wake() {
            tracing::debug!(task = %task.name(), error = %e, "wake dropped");
        }
    }
}
