use crate::error::{SendFailReason, StreamError, StreamResult, TryRecvError};
use crate::io::base::{BaseRx, BaseTx};
use crate::io::ringbuffer::{RingBuffer, RingReceiver, RingSender};
use crate::io::tracker::TaskTracker;
use crate::utils::CancelToken;
use std::time::Duration;

/// Control sentinels, delivered apart from data so they never queue behind it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Signal {
    /// Flush layer-local buffered state into real work items.
    EmptyBuffers,
    /// Leave the worker loop.
    End,
}

const SIGNAL_CAPACITY: usize = 4;

/// Controller side of one worker's signal queue.
pub struct SignalSender {
    tx: RingSender<Signal>,
    acks: TaskTracker,
    worker: usize,
}

/// Worker side of the signal queue.
pub struct SignalReceiver {
    rx: RingReceiver<Signal>,
    acks: TaskTracker,
}

pub fn signal_queue(worker: usize) -> (SignalSender, SignalReceiver) {
    let (tx, rx) = RingBuffer::bounded(SIGNAL_CAPACITY);
    let acks = TaskTracker::new();
    (
        SignalSender {
            tx,
            acks: acks.clone(),
            worker,
        },
        SignalReceiver { rx, acks },
    )
}

impl SignalSender {
    /// Enqueue a signal; it counts as unacknowledged until the worker handles it.
    pub fn put(&mut self, signal: Signal, timeout: Duration) -> StreamResult<()> {
        self.acks.add();
        // a fresh token: shutdown signals must go out even when the session is cancelled
        let never = CancelToken::new_root();
        match self.tx.send(signal, &never, Some(timeout)) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.acks.done();
                match e.reason {
                    SendFailReason::Timeout => {
                        Err(StreamError::timeout("signal queue put", timeout))
                    }
                    _ => Err(StreamError::Disconnected("signal queue")),
                }
            }
        }
    }

    /// Wait until the worker acknowledged every signal sent so far.
    pub fn join(&self, timeout: Duration) -> StreamResult<()> {
        self.acks.join("signal acknowledgement", timeout)
    }

    #[inline]
    pub fn worker(&self) -> usize {
        self.worker
    }
}

impl SignalReceiver {
    /// `Ok(None)` when nothing is pending; `Err` once the controller is gone.
    #[inline]
    pub fn poll(&mut self) -> Result<Option<Signal>, TryRecvError> {
        match self.rx.try_recv() {
            Ok(s) => Ok(Some(s)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TryRecvError::Disconnected),
        }
    }

    /// Acknowledge the signal returned by the last `poll`.
    #[inline]
    pub fn ack(&self) {
        self.acks.done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn join_waits_for_ack() {
        let (mut tx, mut rx) = signal_queue(0);
        tx.put(Signal::EmptyBuffers, Duration::from_secs(1))
            .expect("put");
        assert!(tx.join(Duration::from_millis(10)).is_err());

        let worker = thread::spawn(move || {
            let s = rx.poll().expect("connected");
            rx.ack();
            s
        });
        assert_eq!(worker.join().expect("worker"), Some(Signal::EmptyBuffers));
        tx.join(Duration::from_secs(1)).expect("acknowledged");
    }
}
