use crate::error::{StreamError, StreamResult};
use crossbeam::utils::{Backoff, CachePadded};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Counter of unfinished tasks, shared by every producer and consumer of a set of queues.
///
/// Producers call [`add`](Self::add) before a send, consumers call
/// [`done`](Self::done) once an item is fully handled. [`join`](Self::join)
/// waits for the count to reach zero.
#[derive(Clone, Default)]
pub struct TaskTracker {
    pending: Arc<CachePadded<AtomicUsize>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn done(&self) {
        let prev = self.pending.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "task tracker underflow");
    }

    #[inline]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Wait until no task is pending. `what` names the wait in the timeout error.
    pub fn join(&self, what: &'static str, timeout: Duration) -> StreamResult<()> {
        let start = Instant::now();
        let backoff = Backoff::new();
        let mut spins: u32 = 0;

        while self.pending() > 0 {
            if start.elapsed() >= timeout {
                return Err(StreamError::timeout(what, timeout));
            }
            spins = spins.saturating_add(1);
            if spins < 64 {
                backoff.spin();
            } else if spins < 256 {
                backoff.snooze();
            } else {
                thread::sleep(Duration::from_micros(200));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for TaskTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskTracker")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_returns_once_all_done() {
        let tracker = TaskTracker::new();
        tracker.add();
        tracker.add();

        let t = tracker.clone();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            t.done();
            t.done();
        });

        tracker
            .join("test join", Duration::from_secs(5))
            .expect("should settle");
        h.join().expect("helper thread");
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn join_times_out_when_stuck() {
        let tracker = TaskTracker::new();
        tracker.add();
        let err = tracker
            .join("stuck join", Duration::from_millis(20))
            .expect_err("never settles");
        assert!(err.is_timeout());
    }
}
