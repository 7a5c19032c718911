use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

type Listener = Box<dyn Fn(u8) + Send + Sync>;

/// Percent-complete notifications from a long-running compute.
///
/// Clones share listeners, so a signal can be kept by the caller after its
/// operator has been moved into a graph.
#[derive(Clone, Default)]
pub struct ProgressSignal {
    listeners: Arc<Mutex<Vec<Listener>>>,
}

impl ProgressSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        self.lock().push(Box::new(listener));
    }

    /// Report `percent` (clamped to 100) to every listener.
    pub fn emit(&self, percent: u8) {
        let percent = percent.min(100);
        for listener in self.lock().iter() {
            listener(percent);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Listener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ProgressSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressSignal")
            .field("listeners", &self.lock().len())
            .finish()
    }
}
