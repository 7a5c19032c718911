use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::task::AtomicWaker;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::RequestError;
use crate::request::Request;

/// Fan-out/fan-in over a set of requests.
///
/// Waiting submits every request and returns once all have settled. On the
/// first failure the remaining requests are cancelled; the pool still waits
/// for them before reporting the error, so nothing is left running.
pub struct RequestPool<T> {
    requests: Vec<Request<T>>,
}

struct Settle {
    state: Mutex<SettleState>,
    done: Condvar,
    waker: AtomicWaker,
}

struct SettleState {
    remaining: usize,
    error: Option<RequestError>,
}

impl Settle {
    fn lock(&self) -> std::sync::MutexGuard<'_, SettleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn poll_settled(&self, cx: &mut Context<'_>) -> Poll<()> {
        self.waker.register(cx.waker());
        if self.lock().remaining == 0 {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl<T: Send + 'static> RequestPool<T> {
    pub fn new() -> Self {
        Self {
            requests: Vec::new(),
        }
    }

    pub fn add(&mut self, request: Request<T>) {
        self.requests.push(request);
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn requests(&self) -> &[Request<T>] {
        &self.requests
    }

    /// Cancel every request in the pool.
    pub fn cancel(&self) {
        for r in &self.requests {
            r.cancel();
        }
    }

    /// Register completion tracking on every request and submit them.
    fn start(&self) -> Arc<Settle> {
        let settle = Arc::new(Settle {
            state: Mutex::new(SettleState {
                remaining: self.requests.len(),
                error: None,
            }),
            done: Condvar::new(),
            waker: AtomicWaker::new(),
        });
        let tokens: Arc<Vec<CancelToken>> =
            Arc::new(self.requests.iter().map(|r| r.token().clone()).collect());

        for request in &self.requests {
            let settle = Arc::clone(&settle);
            let tokens = Arc::clone(&tokens);
            let name = request.name().to_string();
            request.notify_finished(move |status| {
                let first_failure = {
                    let mut st = settle.lock();
                    st.remaining -= 1;
                    let mut first = false;
                    if let Err(e) = status {
                        match &st.error {
                            None => {
                                st.error = Some(e.clone());
                                first = true;
                            }
                            // A real failure beats the cancellations it caused.
                            Some(prev) if prev.is_cancelled() && !e.is_cancelled() => {
                                st.error = Some(e.clone());
                            }
                            Some(_) => {}
                        }
                    }
                    if st.remaining == 0 {
                        settle.done.notify_all();
                    }
                    first
                };
                if first_failure {
                    debug!(request = %name, "pool member failed, cancelling siblings");
                    for token in tokens.iter() {
                        token.cancel();
                    }
                }
                settle.waker.wake();
            });
        }

        for request in &self.requests {
            if let Err(e) = request.submit() {
                warn!(request = %request.name(), error = %e, "pool member not submitted");
            }
        }
        settle
    }

    fn collect(self, settle: &Settle) -> Result<Vec<T>, RequestError> {
        if let Some(err) = settle.lock().error.take() {
            return Err(err);
        }
        self.requests
            .into_iter()
            .map(|r| r.try_take().unwrap_or(Err(RequestError::Consumed)))
            .collect()
    }

    /// Submit everything and block until all requests have settled.
    /// Results come back in the order the requests were added.
    ///
    /// On a worker of a member's scheduler nothing is submitted and
    /// `WouldBlock` is returned unless every member has already finished;
    /// use [`join`](Self::join) there.
    pub fn wait(self) -> Result<Vec<T>, RequestError> {
        let blocking = self
            .requests
            .iter()
            .find(|r| !r.is_finished() && r.scheduler().current_worker().is_some());
        if let Some(request) = blocking {
            warn!(request = %request.name(), "blocking pool wait refused on a worker thread");
            return Err(RequestError::WouldBlock(request.name().to_string()));
        }
        let settle = self.start();
        {
            let mut st = settle.lock();
            while st.remaining > 0 {
                st = settle.done.wait(st).unwrap_or_else(PoisonError::into_inner);
            }
        }
        self.collect(&settle)
    }

    /// Like [`wait`](Self::wait), but suspends the awaiting task instead of
    /// blocking its thread.
    pub async fn join(self) -> Result<Vec<T>, RequestError> {
        let settle = self.start();
        futures::future::poll_fn(|cx| settle.poll_settled(cx)).await;
        self.collect(&settle)
    }
}

impl<T: Send + 'static> Default for RequestPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Extend<Request<T>> for RequestPool<T> {
    fn extend<I: IntoIterator<Item = Request<T>>>(&mut self, iter: I) {
        self.requests.extend(iter);
    }
}

impl<T: Send + 'static> FromIterator<Request<T>> for RequestPool<T> {
    fn from_iter<I: IntoIterator<Item = Request<T>>>(iter: I) -> Self {
        Self {
            requests: iter.into_iter().collect(),
        }
    }
}

impl<T: Send + 'static> IntoFuture for RequestPool<T> {
    type Output = Result<Vec<T>, RequestError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.join())
    }
}
