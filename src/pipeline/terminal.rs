use crate::error::{RecvError, StreamError, StreamResult};
use crate::io::base::BaseRx;
use crate::io::mpmc::{MpmcChannel, MpmcReceiver};
use crate::pipeline::{Layer, Stream};
use crate::runtime::{Canceller, join_cleanup, spawn_cleanup};
use crate::sink::{CollectSink, DiscardSink, FlagSink, TakeSink};
use std::hash::Hash;
use std::iter::Sum;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

fn passthrough<T: Send + 'static>(name: &'static str) -> Layer {
    Layer::unkeyed(name, |chunk: Vec<T>| Ok(chunk))
}

impl<T: Send + 'static> Stream<T> {
    /// Runs the pipeline with `terminal` as its last layer and returns every
    /// chunk that layer emitted.
    fn run_collecting<A: Send + 'static>(self, terminal: Layer) -> StreamResult<Vec<Vec<A>>> {
        let (tx, mut rx) = MpmcChannel::unbounded::<Vec<A>>();
        self.into_session(terminal, Box::new(CollectSink::new(tx)))?
            .run()?;
        Ok(rx.drain_max())
    }

    /// Two-level reduction: `from_chunk` reduces each chunk on a worker,
    /// `combine` folds the per-chunk results on the calling thread.
    /// `None` when the stream produced no elements.
    pub fn collect<A, F, C>(self, from_chunk: F, combine: C) -> StreamResult<Option<A>>
    where
        A: Send + 'static,
        F: Fn(Vec<T>) -> A + Send + Sync + 'static,
        C: FnMut(A, A) -> A,
    {
        let layer = Layer::unkeyed("collect", move |chunk: Vec<T>| Ok(vec![from_chunk(chunk)]));
        Ok(self
            .run_collecting::<A>(layer)?
            .into_iter()
            .flatten()
            .reduce(combine))
    }

    /// [`collect`](Self::collect) followed by `finisher`.
    pub fn collect_with<A, R, F, C, G>(self, from_chunk: F, combine: C, finisher: G) -> StreamResult<R>
    where
        A: Send + 'static,
        F: Fn(Vec<T>) -> A + Send + Sync + 'static,
        C: FnMut(A, A) -> A,
        G: FnOnce(Option<A>) -> R,
    {
        self.collect(from_chunk, combine).map(finisher)
    }

    /// Folds every chunk from `identity` with `f`, then folds the per-chunk results.
    pub fn reduce<F>(self, identity: T, f: F) -> StreamResult<T>
    where
        T: Clone + Sync,
        F: Fn(T, T) -> T + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let per_chunk = f.clone();
        let seed = identity.clone();
        let folded = self.collect(
            move |chunk: Vec<T>| chunk.into_iter().fold(seed.clone(), |a, b| (*per_chunk)(a, b)),
            |a, b| (*f)(a, b),
        )?;
        Ok(folded.unwrap_or(identity))
    }

    /// Calls `f` for every element on the worker threads.
    pub fn foreach<F>(self, f: F) -> StreamResult<()>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let layer = Layer::unkeyed("foreach", move |chunk: Vec<T>| {
            chunk.into_iter().for_each(&f);
            Ok(Vec::<()>::new())
        });
        self.into_session(layer, Box::new(DiscardSink::<()>::default()))?
            .run()
    }

    pub fn count(self) -> StreamResult<usize> {
        Ok(self.collect(|chunk: Vec<T>| chunk.len(), |a, b| a + b)?.unwrap_or(0))
    }

    pub fn sum<S>(self) -> StreamResult<S>
    where
        S: Sum<T> + Sum<S> + Send + 'static,
    {
        let total = self.collect(
            |chunk: Vec<T>| chunk.into_iter().sum::<S>(),
            |a, b| [a, b].into_iter().sum(),
        )?;
        Ok(total.unwrap_or_else(|| std::iter::empty::<S>().sum()))
    }

    pub fn min(self) -> StreamResult<Option<T>>
    where
        T: Ord,
    {
        let m = self.collect(
            |chunk: Vec<T>| chunk.into_iter().min(),
            |a, b| a.into_iter().chain(b).min(),
        )?;
        Ok(m.flatten())
    }

    pub fn max(self) -> StreamResult<Option<T>>
    where
        T: Ord,
    {
        let m = self.collect(
            |chunk: Vec<T>| chunk.into_iter().max(),
            |a, b| a.into_iter().chain(b).max(),
        )?;
        Ok(m.flatten())
    }

    pub fn count_distinct(self) -> StreamResult<usize>
    where
        T: Hash + Eq,
    {
        self.distinct().count()
    }

    /// Every element, in no particular order.
    pub fn to_vec(self) -> StreamResult<Vec<T>> {
        Ok(self
            .run_collecting::<T>(passthrough::<T>("to_vec"))?
            .into_iter()
            .flatten()
            .collect())
    }

    /// First `n` elements to reach the sink. The stream is cancelled as soon
    /// as they are in hand, so only a bounded prefix of the input is read.
    pub fn take(self, n: usize) -> StreamResult<Vec<T>> {
        if n == 0 {
            return Ok(Vec::new());
        }

        // n chunks always hold at least n elements: empty chunks never reach a sink
        let (tx, rx) = MpmcChannel::bounded::<Vec<T>>(n);
        let mut session = self.into_session(passthrough::<T>("take"), Box::new(TakeSink::new(tx)))?;
        session.start()?;
        let canceller = session.canceller();
        let timeout = session.settings().long_timeout;
        let cleanup = spawn_cleanup(session)?;

        let mut out = Vec::with_capacity(n);
        let mut stalled = false;
        while out.len() < n {
            match rx.recv_timeout(timeout) {
                Ok(chunk) => {
                    let room = n - out.len();
                    out.extend(chunk.into_iter().take(room));
                }
                Err(RecvError::Disconnected) => break,
                Err(_) => {
                    stalled = true;
                    break;
                }
            }
        }

        canceller.cancel();
        drop(rx);
        let closed = join_cleanup(cleanup);
        if stalled {
            return Err(StreamError::timeout("take result recv", timeout));
        }
        closed?;
        Ok(out)
    }

    pub fn take_one(self) -> StreamResult<Option<T>> {
        Ok(self.take(1)?.into_iter().next())
    }

    /// `true` once any element matches; the stream is cancelled on the first match.
    pub fn any<F>(self, pred: F) -> StreamResult<bool>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let layer = Layer::unkeyed("any", move |chunk: Vec<T>| {
            Ok(if chunk.iter().any(|x| pred(x)) {
                vec![true]
            } else {
                Vec::new()
            })
        });

        let (tx, rx) = MpmcChannel::bounded::<()>(1);
        let mut session = self.into_session(layer, Box::new(FlagSink::new(tx)))?;
        session.start()?;
        let canceller = session.canceller();
        let timeout = session.settings().long_timeout;
        let cleanup = spawn_cleanup(session)?;

        let found = match rx.recv_timeout(timeout) {
            Ok(()) => Ok(true),
            Err(RecvError::Disconnected) => Ok(false),
            Err(_) => Err(StreamError::timeout("any result recv", timeout)),
        };

        canceller.cancel();
        drop(rx);
        let closed = join_cleanup(cleanup);
        let found = found?;
        closed?;
        Ok(found)
    }

    /// `!any(!pred)`.
    pub fn all<F>(self, pred: F) -> StreamResult<bool>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.any(move |x| !pred(x)).map(|found| !found)
    }

    /// Lazily consume results as workers produce them.
    pub fn iter(self) -> StreamResult<StreamIter<T>> {
        let (tx, rx) = MpmcChannel::unbounded::<Vec<T>>();
        let mut session = self.into_session(passthrough::<T>("iter"), Box::new(CollectSink::new(tx)))?;
        session.start()?;
        let canceller = session.canceller();
        let timeout = session.settings().long_timeout;
        let cleanup = spawn_cleanup(session)?;

        Ok(StreamIter {
            rx: Some(rx),
            buf: Vec::new().into_iter(),
            canceller: Some(canceller),
            cleanup: Some(cleanup),
            pending: None,
            timeout,
        })
    }
}

impl<T: Send + 'static> IntoIterator for Stream<T> {
    type Item = StreamResult<T>;
    type IntoIter = StreamIter<T>;

    /// A stream that fails to start yields that error once.
    fn into_iter(self) -> StreamIter<T> {
        self.iter().unwrap_or_else(StreamIter::failed)
    }
}

/// Results of a running stream, chunk by chunk.
///
/// A failure ends the iteration with one `Err`. Dropping the iterator early
/// cancels the stream and waits for its threads.
pub struct StreamIter<T> {
    rx: Option<MpmcReceiver<Vec<T>>>,
    buf: std::vec::IntoIter<T>,
    canceller: Option<Canceller>,
    cleanup: Option<JoinHandle<StreamResult<()>>>,
    pending: Option<StreamError>,
    timeout: Duration,
}

impl<T> StreamIter<T> {
    fn failed(err: StreamError) -> Self {
        Self {
            rx: None,
            buf: Vec::new().into_iter(),
            canceller: None,
            cleanup: None,
            pending: Some(err),
            timeout: Duration::ZERO,
        }
    }

    fn finish(&mut self) -> StreamResult<()> {
        self.rx = None;
        match self.cleanup.take() {
            Some(handle) => join_cleanup(handle),
            None => Ok(()),
        }
    }

    fn cancel(&self) {
        if let Some(c) = &self.canceller {
            c.cancel();
        }
    }
}

impl<T> Iterator for StreamIter<T> {
    type Item = StreamResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(x) = self.buf.next() {
                return Some(Ok(x));
            }
            if let Some(err) = self.pending.take() {
                return Some(Err(err));
            }
            let rx = self.rx.as_ref()?;

            match rx.recv_timeout(self.timeout) {
                Ok(chunk) => self.buf = chunk.into_iter(),
                Err(RecvError::Disconnected) => return self.finish().err().map(Err),
                Err(_) => {
                    self.cancel();
                    let _ = self.finish();
                    return Some(Err(StreamError::timeout("result recv", self.timeout)));
                }
            }
        }
    }
}

impl<T> Drop for StreamIter<T> {
    fn drop(&mut self) {
        if self.cleanup.is_some() {
            self.cancel();
            if let Err(e) = self.finish() {
                tracing::debug!("[Stream] abandoned iterator: {}", e);
            }
        }
    }
}
