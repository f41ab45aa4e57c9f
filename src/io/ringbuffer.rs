use crate::error::{RecvError, SendError, TryRecvError};
use crate::io::base::{BaseRx, BaseTx};
use crate::utils::CancelToken;
use crossbeam::utils::{Backoff, CachePadded};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Single-producer single-consumer ring. Used for low-volume control traffic.
pub struct RingBuffer;

impl RingBuffer {
    pub fn bounded<T>(capacity: usize) -> (RingSender<T>, RingReceiver<T>) {
        let rb = HeapRb::<T>::new(capacity.max(1));
        let (prod, cons) = rb.split();
        let hung_up = Arc::new(CachePadded::new(AtomicBool::new(false)));

        (
            RingSender {
                prod,
                hung_up: hung_up.clone(),
            },
            RingReceiver { cons, hung_up },
        )
    }
}

#[inline]
fn relax(backoff: &Backoff, spins: &mut u32) {
    *spins = spins.saturating_add(1);
    if *spins < 64 {
        backoff.spin();
    } else if *spins < 256 {
        backoff.snooze();
    } else {
        thread::sleep(Duration::from_micros(50));
    }
}

pub struct RingSender<E> {
    prod: HeapProd<E>,
    hung_up: Arc<CachePadded<AtomicBool>>,
}

impl<E> Drop for RingSender<E> {
    fn drop(&mut self) {
        self.hung_up.store(true, Ordering::Release);
    }
}

impl<E: Send + 'static> BaseTx for RingSender<E> {
    type EventType = E;

    #[inline]
    fn try_send(&mut self, a: E) -> Result<(), SendError<E>> {
        self.prod.try_push(a).map_err(|v| SendError::full(Some(v)))
    }

    fn send(
        &mut self,
        mut a: E,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<(), SendError<E>> {
        let start = Instant::now();
        let backoff = Backoff::new();
        let mut spins: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(SendError::cancelled(Some(a)));
            }
            if let Some(t) = timeout
                && start.elapsed() >= t
            {
                return Err(SendError::timeout(Some(a)));
            }

            match self.prod.try_push(a) {
                Ok(()) => return Ok(()),
                Err(back) => {
                    a = back;
                    relax(&backoff, &mut spins);
                }
            }
        }
    }
}

pub struct RingReceiver<E> {
    cons: HeapCons<E>,
    hung_up: Arc<CachePadded<AtomicBool>>,
}

impl<E> RingReceiver<E> {
    /// True once the sender was dropped.
    #[inline]
    pub fn is_hung_up(&self) -> bool {
        self.hung_up.load(Ordering::Acquire)
    }
}

impl<E: Send + 'static> BaseRx for RingReceiver<E> {
    type EventType = E;

    #[inline]
    fn try_recv(&mut self) -> Result<E, TryRecvError> {
        match self.cons.try_pop() {
            Some(v) => Ok(v),
            None if self.is_hung_up() => Err(TryRecvError::Disconnected),
            None => Err(TryRecvError::Empty),
        }
    }

    fn recv(&mut self, cancel: &CancelToken, timeout: Option<Duration>) -> Result<E, RecvError> {
        let start = Instant::now();
        let backoff = Backoff::new();
        let mut spins: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RecvError::Cancelled);
            }
            if let Some(t) = timeout
                && start.elapsed() >= t
            {
                return Err(RecvError::Timeout);
            }

            match self.try_recv() {
                Ok(a) => return Ok(a),
                Err(TryRecvError::Empty) => relax(&backoff, &mut spins),
                Err(TryRecvError::Disconnected) => return Err(RecvError::Disconnected),
            }
        }
    }
}
