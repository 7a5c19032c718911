use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use roiflow_scheduler::{Priority, Scheduler};

use crate::cancel::CancelToken;
use crate::error::RequestError;
use crate::request::{Request, RequestBuilder};

/// Handed to a request's computation; spawns child requests that inherit
/// its cancellation and sort just after it.
#[derive(Clone)]
pub struct RequestContext {
    scheduler: Scheduler,
    token: CancelToken,
    priority: Priority,
    next_child: Arc<AtomicU64>,
}

impl RequestContext {
    pub(crate) fn new(scheduler: Scheduler, token: CancelToken, priority: Priority) -> Self {
        Self {
            scheduler,
            token,
            priority,
            next_child: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A detached context with its own token, for code that starts a
    /// request tree outside any request.
    pub fn root(scheduler: &Scheduler) -> Self {
        Self::new(scheduler.clone(), CancelToken::new(), Priority::root())
    }

    /// Create (but do not submit) a child request.
    pub fn request<U, F, Fut>(&self, name: impl Into<String>, f: F) -> Request<U>
    where
        U: Send + 'static,
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = Result<U, RequestError>> + Send + 'static,
    {
        let index = self.next_child.fetch_add(1, Ordering::Relaxed);
        RequestBuilder::new(&self.scheduler)
            .name(name)
            .priority(self.priority.child(index))
            .token(self.token.child())
            .build(f)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn priority(&self) -> &Priority {
        &self.priority
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `Err(Cancelled)` once the request has been cancelled, for computations
    /// that want an early exit between stages.
    pub fn check_cancelled(&self) -> Result<(), RequestError> {
        if self.is_cancelled() {
            Err(RequestError::Cancelled)
        } else {
            Ok(())
        }
    }
}
