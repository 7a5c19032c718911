use std::cell::Cell;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use roiflow_core::SchedulerConfig;
use tracing::{debug, error, info, warn};

use crate::error::SchedulerError;
use crate::metrics::SchedulerMetrics;
use crate::priority::{lexicographic, PriorityComparator};
use crate::task::{Task, TaskPhase};

use super::queues::Queues;

thread_local! {
    /// (scheduler identity, worker index) of the current worker thread.
    static CURRENT: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

/// Index of the worker running the calling code, if it runs on any
/// scheduler's worker thread.
pub fn current_worker() -> Option<usize> {
    CURRENT.with(|c| c.get()).map(|(_, w)| w)
}

pub(super) fn enter_worker(inner: &Arc<SchedulerInner>, worker: usize) {
    CURRENT.with(|c| c.set(Some((inner.identity(), worker))));
}

pub(crate) struct SchedulerInner {
    pub(super) queues: Mutex<Queues>,
    /// One condvar per worker, all paired with `queues`.
    pub(super) signals: Vec<Condvar>,
    pub(super) comparator: PriorityComparator,
    pub(super) metrics: RwLock<SchedulerMetrics>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl SchedulerInner {
    fn identity(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    pub(super) fn lock_queues(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn with_metrics(&self, f: impl FnOnce(&mut SchedulerMetrics)) {
        let mut m = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut m);
    }

    /// Make `task` runnable.
    ///
    /// A never-run task goes to the global queue. A suspended task goes to the
    /// private queue of the worker that first ran it. Waking a running task
    /// makes it run again right after its current step.
    pub(crate) fn wake(self: &Arc<Self>, task: &Task) -> Result<(), SchedulerError> {
        let mut discarded = None;
        let result = {
            let mut st = task.lock();
            match st.phase {
                TaskPhase::New => {
                    st.scheduler = Arc::downgrade(self);
                    let mut q = self.lock_queues();
                    if q.stopping {
                        st.phase = TaskPhase::Done;
                        discarded = st.body.take();
                        Err(SchedulerError::Shutdown)
                    } else {
                        st.phase = TaskPhase::Queued;
                        if let Some(w) = q.push_global(task.clone(), &self.comparator) {
                            self.signals[w].notify_one();
                        }
                        Ok(())
                    }
                }
                TaskPhase::Suspended => {
                    let worker = st.worker;
                    let mut q = self.lock_queues();
                    let queued = match worker {
                        Some(w) if !q.stopping => q.push_affine(w, task.clone()).then_some(w),
                        _ => None,
                    };
                    match queued {
                        Some(w) => {
                            st.phase = TaskPhase::Queued;
                            self.signals[w].notify_one();
                            Ok(())
                        }
                        None if q.stopping => {
                            st.phase = TaskPhase::Done;
                            discarded = st.body.take();
                            Err(SchedulerError::Shutdown)
                        }
                        None => {
                            // The affine worker does not exist; the
                            // continuation can never run again.
                            error!(task = %task.name(), worker = ?worker, "affine worker lost, dropping task");
                            st.phase = TaskPhase::Done;
                            discarded = st.body.take();
                            Err(SchedulerError::Shutdown)
                        }
                    }
                }
                TaskPhase::Running => {
                    st.notified = true;
                    Ok(())
                }
                TaskPhase::Queued | TaskPhase::Done => Ok(()),
            }
        };
        if discarded.is_some() {
            self.with_metrics(|m| m.discarded += 1);
            debug!(task = %task.name(), "task discarded on wake");
        }
        // Bodies are dropped with no lock held: dropping a future may wake
        // other tasks.
        drop(discarded);
        result
    }
}

/// Handle to a fixed pool of worker threads. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    pub(super) inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Start the pool with the default lexicographic priority order.
    pub fn start(config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        Self::start_with_comparator(config, lexicographic())
    }

    /// Start `workers` threads with default settings otherwise.
    pub fn with_workers(workers: usize) -> Result<Self, SchedulerError> {
        Self::start(&SchedulerConfig::with_workers(workers))
    }

    /// Start the pool with an application-supplied priority comparator.
    pub fn start_with_comparator(
        config: &SchedulerConfig,
        comparator: PriorityComparator,
    ) -> Result<Self, SchedulerError> {
        let workers = config.effective_workers();
        let inner = Arc::new(SchedulerInner {
            queues: Mutex::new(Queues::new(workers)),
            signals: (0..workers).map(|_| Condvar::new()).collect(),
            comparator,
            metrics: RwLock::new(SchedulerMetrics {
                workers,
                ..SchedulerMetrics::default()
            }),
            handles: Mutex::new(Vec::with_capacity(workers)),
        });
        let scheduler = Self { inner };

        for id in 0..workers {
            let inner = Arc::clone(&scheduler.inner);
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name_prefix, id))
                .spawn(move || super::execution::worker_loop(inner, id));
            match spawned {
                Ok(handle) => scheduler.lock_handles().push(handle),
                Err(e) => {
                    scheduler.stop();
                    return Err(SchedulerError::Spawn(e.to_string()));
                }
            }
        }

        info!(
            "Scheduler started with {} workers (thread prefix: {})",
            workers, config.thread_name_prefix
        );
        Ok(scheduler)
    }

    fn lock_handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submit a never-run task, or resume a suspended one.
    pub fn wake(&self, task: &Task) -> Result<(), SchedulerError> {
        self.inner.wake(task)
    }

    /// Submit `task` and hand the handle back.
    pub fn spawn(&self, task: Task) -> Result<Task, SchedulerError> {
        self.wake(&task)?;
        Ok(task)
    }

    pub fn worker_count(&self) -> usize {
        self.inner.signals.len()
    }

    /// Index of the calling worker thread if it belongs to this scheduler.
    pub fn current_worker(&self) -> Option<usize> {
        let me = self.inner.identity();
        CURRENT
            .with(|c| c.get())
            .and_then(|(id, w)| (id == me).then_some(w))
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.lock_queues().stopping
    }

    /// Number of tasks waiting in the global queue.
    pub fn pending(&self) -> usize {
        self.inner.lock_queues().global_len()
    }

    /// Get a snapshot of the current scheduler metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        self.inner
            .metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop the pool: workers exit after their current step, queued tasks are
    /// discarded and the threads are joined. Idempotent.
    ///
    /// Called from a worker thread, that worker is not joined; it exits once
    /// the current step returns.
    pub fn stop(&self) {
        let drained = {
            let mut q = self.inner.lock_queues();
            if !q.stopping {
                info!("Scheduler shutdown requested");
            }
            q.stopping = true;
            q.drain()
        };
        for signal in &self.inner.signals {
            signal.notify_all();
        }

        let mut bodies = Vec::with_capacity(drained.len());
        for task in &drained {
            let mut st = task.lock();
            st.phase = TaskPhase::Done;
            if let Some(body) = st.body.take() {
                bodies.push(body);
            }
        }
        if !bodies.is_empty() {
            warn!("Discarding {} queued tasks on shutdown", bodies.len());
            let n = bodies.len() as u64;
            self.inner.with_metrics(|m| m.discarded += n);
        }
        drop(bodies);

        let me = thread::current().id();
        let handles: Vec<JoinHandle<()>> = self.lock_handles().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                error!("worker thread exited abnormally");
            }
        }
        debug!("Scheduler stopped");
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.worker_count())
            .finish()
    }
}
