//! Awaitable, cancellable computations running on the scheduler.
//!
//! A [`Request`] wraps a future producing `Result<T, RequestError>`. It does
//! nothing until submitted (explicitly, by [`Request::wait`], or by being
//! awaited); it then runs as one scheduler task. A request awaited from inside
//! another request's computation suspends the parent's task, which later
//! resumes on the same worker.

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use roiflow_core::ComputeError;
use roiflow_scheduler::{Priority, Scheduler, Task};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::context::RequestContext;
use crate::error::RequestError;

type BoxedCompute<T> = Pin<Box<dyn Future<Output = Result<T, RequestError>> + Send>>;
type FinishCallback = Box<dyn FnOnce(&Result<(), RequestError>) + Send>;

enum Outcome<T> {
    Pending,
    Finished {
        /// Taken by the first waiter.
        result: Option<Result<T, RequestError>>,
        status: Result<(), RequestError>,
    },
}

struct State<T> {
    /// The computation, until submitted.
    body: Option<BoxedCompute<T>>,
    submitted: bool,
    outcome: Outcome<T>,
    callbacks: Vec<FinishCallback>,
    wakers: Vec<Waker>,
}

pub(crate) struct Inner<T> {
    name: String,
    priority: Priority,
    token: CancelToken,
    scheduler: Scheduler,
    state: Mutex<State<T>>,
    done: Condvar,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the outcome, release waiters and fire callbacks. Only the first
    /// call has any effect.
    fn finish(&self, result: Result<T, RequestError>) {
        let status = match &result {
            Ok(_) => Ok(()),
            Err(e) => Err(e.clone()),
        };
        if status.is_err() {
            // Nothing below a failed request can be used any more.
            self.token.cancel_children();
        }

        let (callbacks, wakers) = {
            let mut st = self.lock();
            if matches!(st.outcome, Outcome::Finished { .. }) {
                return;
            }
            st.outcome = Outcome::Finished {
                result: Some(result),
                status: status.clone(),
            };
            (
                std::mem::take(&mut st.callbacks),
                std::mem::take(&mut st.wakers),
            )
        };
        self.done.notify_all();

        match &status {
            Ok(()) => debug!(request = %self.name, "request finished"),
            Err(e) => debug!(request = %self.name, error = %e, "request failed"),
        }
        for cb in callbacks {
            cb(&status);
        }
        for waker in wakers {
            waker.wake();
        }
    }
}

/// Handle to a computation producing a `T`. Clones share the request.
pub struct Request<T> {
    pub(crate) inner: Arc<Inner<T>>,
}

impl<T> Clone for Request<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("name", &self.inner.name)
            .field("priority", &self.inner.priority)
            .field("cancelled", &self.inner.token.is_cancelled())
            .finish()
    }
}

/// Configures a [`Request`] before its computation is bound.
pub struct RequestBuilder {
    scheduler: Scheduler,
    name: String,
    priority: Priority,
    token: Option<CancelToken>,
}

impl RequestBuilder {
    /// Default name and root priority; the value type is fixed by `build`.
    pub fn new(scheduler: &Scheduler) -> Self {
        Self {
            scheduler: scheduler.clone(),
            name: "request".to_string(),
            priority: Priority::root(),
            token: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Use `token` instead of a fresh one, e.g. a child of a parent's token.
    pub fn token(mut self, token: CancelToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Bind the computation. `f` is called right away to build the future,
    /// which is not polled until the request is submitted.
    pub fn build<T, F, Fut>(self, f: F) -> Request<T>
    where
        T: Send + 'static,
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = Result<T, RequestError>> + Send + 'static,
    {
        let token = self.token.unwrap_or_default();
        let cx = RequestContext::new(self.scheduler.clone(), token.clone(), self.priority.clone());
        let body: BoxedCompute<T> = Box::pin(f(cx));
        Request::from_parts(
            self.scheduler,
            self.name,
            self.priority,
            token,
            State {
                body: Some(body),
                submitted: false,
                outcome: Outcome::Pending,
                callbacks: Vec::new(),
                wakers: Vec::new(),
            },
        )
    }
}

impl<T: Send + 'static> Request<T> {
    /// A request with default name and priority running `f`.
    pub fn new<F, Fut>(scheduler: &Scheduler, f: F) -> Self
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = Result<T, RequestError>> + Send + 'static,
    {
        RequestBuilder::new(scheduler).build(f)
    }

    /// A request that is already finished with `result`.
    pub fn finished(scheduler: &Scheduler, name: impl Into<String>, result: Result<T, RequestError>) -> Self {
        let status = match &result {
            Ok(_) => Ok(()),
            Err(e) => Err(e.clone()),
        };
        Self::from_parts(
            scheduler.clone(),
            name.into(),
            Priority::root(),
            CancelToken::new(),
            State {
                body: None,
                submitted: true,
                outcome: Outcome::Finished {
                    result: Some(result),
                    status,
                },
                callbacks: Vec::new(),
                wakers: Vec::new(),
            },
        )
    }

    fn from_parts(
        scheduler: Scheduler,
        name: String,
        priority: Priority,
        token: CancelToken,
        state: State<T>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                priority,
                token,
                scheduler,
                state: Mutex::new(state),
                done: Condvar::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn priority(&self) -> &Priority {
        &self.inner.priority
    }

    pub fn token(&self) -> &CancelToken {
        &self.inner.token
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.inner.lock().outcome, Outcome::Finished { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Hand the computation to the scheduler. Later calls do nothing.
    ///
    /// Fails with `SchedulerShutdown` if the scheduler is stopping; the
    /// request is then finished with that error.
    pub fn submit(&self) -> Result<(), RequestError> {
        let body = {
            let mut st = self.inner.lock();
            if st.submitted {
                return Ok(());
            }
            st.submitted = true;
            st.body.take()
        };
        let Some(body) = body else {
            return Ok(());
        };

        debug!(request = %self.inner.name, priority = %self.inner.priority, "submitting request");
        let driver = Driver {
            body,
            inner: Some(Arc::clone(&self.inner)),
        };
        let task = Task::from_future(self.inner.name.clone(), driver)
            .with_priority(self.inner.priority.clone());
        // On failure the scheduler drops the driver, which finishes the
        // request.
        self.inner.scheduler.wake(&task)?;
        Ok(())
    }

    /// Submit if needed and block the calling thread until finished.
    ///
    /// The result can be taken once; later calls return `Consumed`. On a
    /// worker of this request's scheduler an unfinished request is left
    /// untouched and `WouldBlock` is returned, since parking the worker
    /// could starve the very tasks being waited for.
    pub fn wait(&self) -> Result<T, RequestError> {
        if self.inner.scheduler.current_worker().is_some() {
            if let Some(result) = self.try_take() {
                return result;
            }
            warn!(request = %self.inner.name, "blocking wait refused on a worker thread");
            return Err(RequestError::WouldBlock(self.inner.name.clone()));
        }
        // A failed submit has already finished the request.
        let _ = self.submit();
        let mut st = self.inner.lock();
        loop {
            if let Outcome::Finished { result, .. } = &mut st.outcome {
                return result.take().unwrap_or(Err(RequestError::Consumed));
            }
            st = self
                .inner
                .done
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Cancel this request and every request spawned under it.
    ///
    /// A request cancelled before submission finishes immediately and its
    /// computation never runs.
    pub fn cancel(&self) {
        self.inner.token.cancel();
        let body = {
            let mut st = self.inner.lock();
            if st.submitted {
                None
            } else {
                st.submitted = true;
                st.body.take()
            }
        };
        if body.is_some() {
            self.inner.finish(Err(RequestError::Cancelled));
        }
        drop(body);
    }

    /// Call `callback` once with the final status, on the thread that
    /// finishes the request, or right now if it already finished.
    pub fn notify_finished<F>(&self, callback: F)
    where
        F: FnOnce(&Result<(), RequestError>) + Send + 'static,
    {
        let status = {
            let mut st = self.inner.lock();
            match &st.outcome {
                Outcome::Finished { status, .. } => status.clone(),
                Outcome::Pending => {
                    st.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&status);
    }

    /// Take the result of a finished request without blocking.
    pub fn try_take(&self) -> Option<Result<T, RequestError>> {
        match &mut self.inner.lock().outcome {
            Outcome::Pending => None,
            Outcome::Finished { result, .. } => Some(result.take().unwrap_or(Err(RequestError::Consumed))),
        }
    }
}

impl<T: Send + 'static> Future for Request<T> {
    type Output = Result<T, RequestError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let _ = self.submit();
        let mut guard = self.inner.lock();
        let st = &mut *guard;
        match &mut st.outcome {
            Outcome::Finished { result, .. } => {
                Poll::Ready(result.take().unwrap_or(Err(RequestError::Consumed)))
            }
            Outcome::Pending => {
                if !st.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    st.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

/// Runs a request's computation inside its scheduler task.
///
/// Checks cancellation around every poll, turns panics into compute errors,
/// and finishes the request even if the scheduler drops it unpolled.
struct Driver<T> {
    body: BoxedCompute<T>,
    inner: Option<Arc<Inner<T>>>,
}

impl<T> Future for Driver<T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_ref() else {
            return Poll::Ready(());
        };

        inner.token.register(cx.waker());
        if inner.token.is_cancelled() {
            this.complete(Err(RequestError::Cancelled));
            return Poll::Ready(());
        }

        let body = &mut this.body;
        let result = match catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(cx))) {
            Ok(Poll::Pending) => return Poll::Pending,
            // Work that finished after cancellation is discarded.
            Ok(Poll::Ready(_)) if inner.token.is_cancelled() => Err(RequestError::Cancelled),
            Ok(Poll::Ready(result)) => result,
            Err(payload) => {
                let err = ComputeError::panicked(inner.name.clone(), &*payload);
                tracing::error!(request = %inner.name, "computation panicked: {}", err.message);
                Err(RequestError::Compute(err))
            }
        };
        this.complete(result);
        Poll::Ready(())
    }
}

impl<T> Driver<T> {
    fn complete(&mut self, result: Result<T, RequestError>) {
        if let Some(inner) = self.inner.take() {
            inner.finish(result);
        }
    }
}

impl<T> Drop for Driver<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let err = if inner.token.is_cancelled() {
                RequestError::Cancelled
            } else {
                RequestError::SchedulerShutdown
            };
            inner.finish(Err(err));
        }
    }
}
