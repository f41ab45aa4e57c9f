use crate::error::{RecvError, SendError, TryRecvError};
use crate::io::base::{BaseRx, BaseTx};
use crate::utils::CancelToken;
use crossbeam::channel as cbchan;
use std::time::{Duration, Instant};

/// Upper bound on a single blocking wait, so cancellation is noticed promptly.
const WAIT_SLICE: Duration = Duration::from_millis(5);

pub struct MpmcChannel;

impl MpmcChannel {
    #[inline]
    pub fn bounded<T: Send + 'static>(capacity: usize) -> (MpmcSender<T>, MpmcReceiver<T>) {
        let (tx, rx) = cbchan::bounded::<T>(capacity);
        (MpmcSender { tx }, MpmcReceiver { rx })
    }

    #[inline]
    pub fn unbounded<T: Send + 'static>() -> (MpmcSender<T>, MpmcReceiver<T>) {
        let (tx, rx) = cbchan::unbounded::<T>();
        (MpmcSender { tx }, MpmcReceiver { rx })
    }
}

#[inline]
fn next_slice(start: Instant, timeout: Option<Duration>) -> Option<Duration> {
    match timeout {
        None => Some(WAIT_SLICE),
        Some(t) => {
            let left = t.checked_sub(start.elapsed())?;
            if left.is_zero() {
                None
            } else {
                Some(left.min(WAIT_SLICE))
            }
        }
    }
}

pub struct MpmcSender<E> {
    tx: cbchan::Sender<E>,
}

// Handles clone without `E: Clone`; work items are not cloneable.
impl<E> Clone for MpmcSender<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E: Send + 'static> BaseTx for MpmcSender<E> {
    type EventType = E;

    #[inline]
    fn try_send(&mut self, a: E) -> Result<(), SendError<E>> {
        match self.tx.try_send(a) {
            Ok(()) => Ok(()),
            Err(cbchan::TrySendError::Full(v)) => Err(SendError::full(Some(v))),
            Err(cbchan::TrySendError::Disconnected(v)) => Err(SendError::closed(Some(v))),
        }
    }

    fn send(
        &mut self,
        mut a: E,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<(), SendError<E>> {
        let start = Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Err(SendError::cancelled(Some(a)));
            }
            let Some(slice) = next_slice(start, timeout) else {
                return Err(SendError::timeout(Some(a)));
            };

            match self.tx.send_timeout(a, slice) {
                Ok(()) => return Ok(()),
                Err(cbchan::SendTimeoutError::Timeout(v)) => a = v,
                Err(cbchan::SendTimeoutError::Disconnected(v)) => {
                    return Err(SendError::closed(Some(v)));
                }
            }
        }
    }
}

pub struct MpmcReceiver<E> {
    rx: cbchan::Receiver<E>,
}

impl<E> Clone for MpmcReceiver<E> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<E> MpmcReceiver<E> {
    /// Blocks until an item arrives, every sender is gone, or `timeout` passes.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<E, RecvError> {
        match self.rx.recv_timeout(timeout) {
            Ok(v) => Ok(v),
            Err(cbchan::RecvTimeoutError::Timeout) => Err(RecvError::Timeout),
            Err(cbchan::RecvTimeoutError::Disconnected) => Err(RecvError::Disconnected),
        }
    }

    /// Underlying receiver, for readiness selection over several queues.
    #[inline]
    pub(crate) fn raw(&self) -> &cbchan::Receiver<E> {
        &self.rx
    }
}

impl<E: Send + 'static> BaseRx for MpmcReceiver<E> {
    type EventType = E;

    #[inline]
    fn try_recv(&mut self) -> Result<E, TryRecvError> {
        match self.rx.try_recv() {
            Ok(v) => Ok(v),
            Err(cbchan::TryRecvError::Empty) => Err(TryRecvError::Empty),
            Err(cbchan::TryRecvError::Disconnected) => Err(TryRecvError::Disconnected),
        }
    }

    fn recv(&mut self, cancel: &CancelToken, timeout: Option<Duration>) -> Result<E, RecvError> {
        let start = Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Err(RecvError::Cancelled);
            }
            let Some(slice) = next_slice(start, timeout) else {
                return Err(RecvError::Timeout);
            };

            match self.rx.recv_timeout(slice) {
                Ok(v) => return Ok(v),
                Err(cbchan::RecvTimeoutError::Timeout) => continue,
                Err(cbchan::RecvTimeoutError::Disconnected) => {
                    return Err(RecvError::Disconnected);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_send_times_out_when_full() {
        let (mut tx, _rx) = MpmcChannel::bounded::<u32>(1);
        let cancel = CancelToken::new_root();
        tx.try_send(1).expect("first send fits");

        let err = tx
            .send(2, &cancel, Some(Duration::from_millis(20)))
            .expect_err("queue is full");
        assert_eq!(err.reason, crate::error::SendFailReason::Timeout);
        assert_eq!(err.value, Some(2));
    }

    #[test]
    fn bounded_send_observes_cancel() {
        let (mut tx, _rx) = MpmcChannel::bounded::<u32>(1);
        let cancel = CancelToken::new_root();
        tx.try_send(1).expect("first send fits");
        cancel.cancel();

        let err = tx.send(2, &cancel, None).expect_err("cancelled");
        assert_eq!(err.reason, crate::error::SendFailReason::Cancelled);
    }

    #[test]
    fn recv_reports_disconnect_after_senders_drop() {
        let (mut tx, mut rx) = MpmcChannel::unbounded::<u32>();
        tx.try_send(7).expect("send");
        drop(tx);

        let cancel = CancelToken::new_root();
        assert_eq!(rx.recv(&cancel, None).expect("buffered item"), 7);
        assert!(matches!(
            rx.recv(&cancel, None),
            Err(RecvError::Disconnected)
        ));
    }

    #[test]
    fn handles_clone_for_non_clone_items() {
        struct Opaque(Box<dyn Send>);
        impl std::fmt::Debug for Opaque {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("Opaque")
            }
        }

        let (tx, rx) = MpmcChannel::unbounded::<Opaque>();
        let mut tx2 = tx.clone();
        let mut rx2 = rx.clone();
        drop(tx);
        drop(rx);

        tx2.try_send(Opaque(Box::new(5u8))).expect("send through clone");
        let cancel = CancelToken::new_root();
        assert!(rx2.recv(&cancel, Some(Duration::from_millis(50))).is_ok());
    }
}
