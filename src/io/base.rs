use crate::error::{RecvError, SendError, TryRecvError};
use crate::utils::CancelToken;
use std::time::Duration;

/// Sending half of a stream queue.
pub trait BaseTx: Send + 'static {
    /// Element type carried by this transport.
    type EventType: Send + 'static;

    /// Non-blocking send. Returns `Err` if the queue is full or disconnected.
    fn try_send(&mut self, a: Self::EventType) -> Result<(), SendError<Self::EventType>>;

    /// Blocking send that gives up on cancellation or after `timeout`.
    fn send(
        &mut self,
        a: Self::EventType,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<(), SendError<Self::EventType>>;
}

/// Receiving half of a stream queue.
pub trait BaseRx: Send + 'static {
    /// Element type carried by this transport.
    type EventType: Send + 'static;

    /// Non-blocking receive. Returns `Empty` if no data, `Disconnected` if the queue is closed.
    fn try_recv(&mut self) -> Result<Self::EventType, TryRecvError>;

    /// Blocking receive that gives up on cancellation or after `timeout`.
    fn recv(
        &mut self,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<Self::EventType, RecvError>;

    /// Drain up to `max` currently available items.
    fn drain(&mut self, max: usize) -> Vec<Self::EventType> {
        let mut out = Vec::new();

        for _ in 0..max {
            match self.try_recv() {
                Ok(a) => out.push(a),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }

    /// Drain everything currently available.
    fn drain_max(&mut self) -> Vec<Self::EventType> {
        self.drain(usize::MAX)
    }
}
