use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared cancellation state; a child observes its own flag and every ancestor's.
struct CancelState {
    cancelled: AtomicBool,
    parent: Option<Arc<CancelState>>,
}

impl CancelState {
    #[inline]
    fn new_root() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            parent: None,
        })
    }

    #[inline]
    fn child_of(parent: Arc<CancelState>) -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            parent: Some(parent),
        })
    }

    #[inline]
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[inline]
    fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return true;
        }
        match self.parent {
            Some(ref p) => p.is_cancelled(),
            None => false,
        }
    }
}

/// Hierarchical cancellation token.
///
/// Every session gets its own token. Passing a parent with
/// [`Stream::with_cancel`](crate::pipeline::Stream::with_cancel) lets outside
/// code cancel a running stream; cancelling a session never touches the parent.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("is_cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new_root()
    }
}

impl CancelToken {
    #[inline]
    pub fn new_root() -> Self {
        Self {
            state: CancelState::new_root(),
        }
    }

    /// Cancel this token and all of its children.
    #[inline]
    pub fn cancel(&self) {
        self.state.cancel();
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    #[inline]
    pub fn new_child(&self) -> Self {
        Self {
            state: CancelState::child_of(self.state.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CancelToken;

    #[test]
    fn child_sees_parent_cancel_but_not_vice_versa() {
        let root = CancelToken::new_root();
        let child = root.new_child();
        let other = root.new_child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
        assert!(!other.is_cancelled());

        root.cancel();
        assert!(other.is_cancelled());
    }
}
