use crate::error::{SendFailReason, StreamError, StreamResult};
use crate::io::base::BaseTx;
use crate::io::mpmc::MpmcSender;
use crate::model::{BoxedChunk, downcast};
use std::marker::PhantomData;
use std::time::Duration;

/// Terminal consumer of the chunks leaving the last layer.
///
/// Every worker delivers through its own fork, so implementations only need
/// to be `Send`.
pub trait Sink: Send + 'static {
    fn deliver(&mut self, chunk: BoxedChunk) -> StreamResult<()>;

    fn fork(&self) -> Box<dyn Sink>;

    fn name(&self) -> &'static str;
}

/// Forwards every chunk to the consuming thread.
pub struct CollectSink<T> {
    tx: MpmcSender<Vec<T>>,
}

impl<T: Send + 'static> CollectSink<T> {
    pub fn new(tx: MpmcSender<Vec<T>>) -> Self {
        Self { tx }
    }
}

impl<T: Send + 'static> Sink for CollectSink<T> {
    fn deliver(&mut self, chunk: BoxedChunk) -> StreamResult<()> {
        let chunk = downcast::<T>(chunk)?;
        self.tx.try_send(chunk).map_err(|e| match e.reason {
            SendFailReason::Closed => StreamError::Disconnected("result channel"),
            _ => StreamError::invariant(format!("result channel rejected a chunk: {}", e.reason)),
        })
    }

    fn fork(&self) -> Box<dyn Sink> {
        Box::new(Self {
            tx: self.tx.clone(),
        })
    }

    fn name(&self) -> &'static str {
        "collect"
    }
}

/// Offers chunks to a small bounded channel and drops them once it is full.
pub struct TakeSink<T> {
    tx: MpmcSender<Vec<T>>,
}

impl<T: Send + 'static> TakeSink<T> {
    pub fn new(tx: MpmcSender<Vec<T>>) -> Self {
        Self { tx }
    }
}

impl<T: Send + 'static> Sink for TakeSink<T> {
    fn deliver(&mut self, chunk: BoxedChunk) -> StreamResult<()> {
        let chunk = downcast::<T>(chunk)?;
        match self.tx.try_send(chunk) {
            Ok(()) => {}
            Err(e) if e.reason == SendFailReason::Full => {
                crate::debug_throttled!(Duration::from_secs(5), "[Stream] take buffer full, dropping chunk");
            }
            // the consumer already has everything it asked for
            Err(_) => {}
        }
        Ok(())
    }

    fn fork(&self) -> Box<dyn Sink> {
        Box::new(Self {
            tx: self.tx.clone(),
        })
    }

    fn name(&self) -> &'static str {
        "take"
    }
}

/// Raises a flag once any delivered `true` shows up.
pub struct FlagSink {
    tx: MpmcSender<()>,
}

impl FlagSink {
    pub fn new(tx: MpmcSender<()>) -> Self {
        Self { tx }
    }
}

impl Sink for FlagSink {
    fn deliver(&mut self, chunk: BoxedChunk) -> StreamResult<()> {
        if downcast::<bool>(chunk)?.into_iter().any(|b| b) {
            // one flag is enough, later ones may be dropped
            let _ = self.tx.try_send(());
        }
        Ok(())
    }

    fn fork(&self) -> Box<dyn Sink> {
        Box::new(Self {
            tx: self.tx.clone(),
        })
    }

    fn name(&self) -> &'static str {
        "flag"
    }
}

/// For pipelines whose last layer already did the work (`foreach`).
pub struct DiscardSink<T>(PhantomData<fn(T)>);

impl<T> Default for DiscardSink<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T: Send + 'static> Sink for DiscardSink<T> {
    fn deliver(&mut self, chunk: BoxedChunk) -> StreamResult<()> {
        downcast::<T>(chunk).map(drop)
    }

    fn fork(&self) -> Box<dyn Sink> {
        Box::new(Self::default())
    }

    fn name(&self) -> &'static str {
        "discard"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::base::BaseRx;
    use crate::io::mpmc::MpmcChannel;
    use crate::model::boxed;

    #[test]
    fn take_sink_drops_when_full() {
        let (tx, mut rx) = MpmcChannel::bounded::<Vec<u8>>(1);
        let mut sink = TakeSink::new(tx);
        sink.deliver(boxed(vec![1u8])).expect("fits");
        sink.deliver(boxed(vec![2u8])).expect("dropped silently");

        assert_eq!(rx.drain_max(), vec![vec![1u8]]);
    }

    #[test]
    fn flag_sink_only_fires_on_true() {
        let (tx, mut rx) = MpmcChannel::bounded::<()>(1);
        let mut sink = FlagSink::new(tx);
        sink.deliver(boxed(vec![false, false])).expect("no match");
        assert!(rx.drain_max().is_empty());
        sink.deliver(boxed(vec![false, true])).expect("match");
        sink.deliver(boxed(vec![true])).expect("second match ignored");
        assert_eq!(rx.drain_max().len(), 1);
    }

    #[test]
    fn collect_sink_reports_closed_channel() {
        let (tx, rx) = MpmcChannel::unbounded::<Vec<u8>>();
        drop(rx);
        let mut sink = CollectSink::new(tx);
        let err = sink.deliver(boxed(vec![1u8])).expect_err("closed");
        assert!(matches!(err, StreamError::Disconnected(_)));
    }
}
