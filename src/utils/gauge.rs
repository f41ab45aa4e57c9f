use crossbeam::utils::CachePadded;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Cheaply clonable counter of live stream threads (workers and feeders).
///
/// Hand one to [`Stream::with_gauge`](crate::pipeline::Stream::with_gauge) and it
/// reads zero again once every session that used it has closed.
#[derive(Clone, Default)]
#[repr(transparent)]
pub struct LiveGauge(Arc<CachePadded<AtomicUsize>>);

impl LiveGauge {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// Count one more live thread until the returned guard drops.
    #[inline]
    pub fn enter(&self) -> LiveGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        LiveGuard(self.clone())
    }
}

impl fmt::Debug for LiveGauge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveGauge")
            .field("live", &self.get())
            .finish()
    }
}

/// Decrements its gauge on drop, including during unwinding.
#[must_use]
pub struct LiveGuard(LiveGauge);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::LiveGauge;

    #[test]
    fn guard_releases_on_drop() {
        let gauge = LiveGauge::new();
        let a = gauge.enter();
        let b = gauge.clone().enter();
        assert_eq!(gauge.get(), 2);
        drop(a);
        assert_eq!(gauge.get(), 1);
        drop(b);
        assert_eq!(gauge.get(), 0);
    }
}
