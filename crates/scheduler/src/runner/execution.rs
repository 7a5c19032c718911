use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError};
use std::time::Instant;

use roiflow_core::ComputeError;
use tracing::{debug, error};

use crate::task::{Body, Step, StepContext, Task, TaskPhase};

use super::core::{enter_worker, SchedulerInner};
use super::queues::Source;

/// Body of worker thread `id`. Returns once the scheduler stops.
pub(super) fn worker_loop(inner: Arc<SchedulerInner>, id: usize) {
    enter_worker(&inner, id);
    debug!(worker = id, "worker started");

    while let Some((task, source)) = next_task(&inner, id) {
        inner.with_metrics(|m| match source {
            Source::Affine => m.affine_resumptions += 1,
            Source::Global => m.global_dispatches += 1,
        });
        run_step(&inner, id, task);
    }

    debug!(worker = id, "worker exiting");
}

/// Block until there is work for `id`, or return `None` on shutdown.
fn next_task(inner: &SchedulerInner, id: usize) -> Option<(Task, Source)> {
    let mut q = inner.lock_queues();
    loop {
        if q.stopping {
            return None;
        }
        if let Some(next) = q.pop_for(id) {
            return Some(next);
        }
        q.park(id);
        q = inner.signals[id]
            .wait(q)
            .unwrap_or_else(PoisonError::into_inner);
        q.unpark(id);
    }
}

/// Run one step of `task` on worker `id`.
fn run_step(inner: &Arc<SchedulerInner>, id: usize, task: Task) {
    let body = {
        let mut st = task.lock();
        if st.phase != TaskPhase::Queued {
            return;
        }
        st.phase = TaskPhase::Running;
        st.notified = false;
        if st.worker.is_none() {
            st.worker = Some(id);
        }
        st.body.take()
    };
    let Some(body) = body else {
        return;
    };

    let started = Instant::now();
    let (outcome, body) = match body {
        Body::OneShot(f) => (catch_unwind(AssertUnwindSafe(f)).map(|()| Step::Complete), None),
        Body::Resumable(mut r) => {
            let mut cx = StepContext::new(id, &task);
            let outcome = catch_unwind(AssertUnwindSafe(|| r.step(&mut cx)));
            (outcome, Some(Body::Resumable(r)))
        }
    };
    let elapsed = started.elapsed();

    let step = match outcome {
        Ok(step) => step,
        Err(payload) => {
            let err = ComputeError::panicked(task.name(), &*payload);
            error!(worker = id, task = %task.name(), "task panicked: {}", err.message);
            task.lock().panic = Some(err.message);
            inner.with_metrics(|m| m.panics += 1);
            Step::Complete
        }
    };
    inner.with_metrics(|m| m.record_step(task.name(), elapsed));

    let dropped = match step {
        Step::Complete => {
            {
                let mut st = task.lock();
                st.phase = TaskPhase::Done;
                st.notified = false;
            }
            inner.with_metrics(|m| m.record_completion(task.name()));
            debug!(worker = id, task = %task.name(), "task complete");
            body
        }
        Step::Suspend => suspend(inner, id, &task, body),
    };
    drop(dropped);
}

/// Park a task that yielded, or requeue it on this worker if it was woken
/// during the step. Returns the body if the task can never resume.
fn suspend(inner: &Arc<SchedulerInner>, id: usize, task: &Task, body: Option<Body>) -> Option<Body> {
    let mut st = task.lock();
    st.body = body;
    if !st.notified {
        st.phase = TaskPhase::Suspended;
        return None;
    }
    st.notified = false;

    let mut q = inner.lock_queues();
    if q.stopping {
        st.phase = TaskPhase::Done;
        drop(q);
        inner.with_metrics(|m| m.discarded += 1);
        return st.body.take();
    }
    st.phase = TaskPhase::Queued;
    q.push_affine(id, task.clone());
    None
}
