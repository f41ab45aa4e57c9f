use crate::error::StreamError;
use crate::utils::CancelToken;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// First-failure-wins slot shared by every thread of a session.
///
/// Recording a failure cancels the session token, so the feeder stops and
/// workers discard the remaining work. Later failures are only counted.
#[derive(Clone)]
pub struct FailureCell {
    first: Arc<Mutex<Option<StreamError>>>,
    total: Arc<AtomicUsize>,
    cancel: CancelToken,
}

impl FailureCell {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            first: Arc::new(Mutex::new(None)),
            total: Arc::new(AtomicUsize::new(0)),
            cancel,
        }
    }

    pub fn record(&self, err: StreamError) {
        let n = self.total.fetch_add(1, Ordering::AcqRel);
        if n == 0 {
            tracing::error!("[Stream] failure recorded, cancelling: {}", err);
        } else {
            tracing::warn!("[Stream] additional failure #{}: {}", n + 1, err);
        }

        {
            let mut slot = self.first.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.cancel.cancel();
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    /// Moves the first failure out, leaving the cell empty.
    pub fn take(&self) -> Option<StreamError> {
        self.first.lock().take()
    }
}

impl std::fmt::Debug for FailureCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureCell")
            .field("count", &self.count())
            .finish()
    }
}
