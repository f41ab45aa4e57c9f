use crate::config::StreamConfig;
use crate::error::StreamResult;
use crate::model::{Key, stable_hash};
use crate::pipeline::{ChunkSource, Layer, Pipeline, Source};
use crate::runtime::Session;
use crate::sink::Sink;
use crate::utils::{CancelToken, LiveGauge};
use ahash::{AHashMap, AHashSet};
use rand::seq::SliceRandom;
use std::hash::Hash;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Lazy parallel stream of `T`.
///
/// A `Stream` is only a description: the input, the ordered layers and the
/// knobs. Nothing runs until a terminal operation consumes it and starts a
/// [`Session`]. Every combinator consumes the builder, so a pipeline can not
/// be extended once it runs.
///
/// ```no_run
/// use parastream::prelude::*;
///
/// let total: i32 = Stream::new(vec![1, 2, 3, 4, 5])
///     .workers(2)
///     .filter(|x| x % 2 == 0)
///     .map(|x| x * 10)
///     .sum()?;
/// assert_eq!(total, 60);
/// # Ok::<(), parastream::error::StreamError>(())
/// ```
pub struct Stream<T> {
    source: Box<dyn ChunkSource>,
    layers: Vec<Layer>,
    cfg: StreamConfig,
    cancel: Option<CancelToken>,
    gauge: LiveGauge,
    _elem: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> Stream<T> {
    /// Stream over any iterable; an exact size hint makes it sized.
    pub fn new<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::from_source(Source::new(items))
    }

    pub fn from_source(source: Source<T>) -> Self {
        Self {
            source: Box::new(source),
            layers: Vec::new(),
            cfg: StreamConfig::default(),
            cancel: None,
            gauge: LiveGauge::new(),
            _elem: PhantomData,
        }
    }

    // ---- knobs

    pub fn workers(mut self, n: usize) -> Self {
        self.cfg.workers = Some(n);
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.cfg.chunk_size = Some(size);
        self
    }

    /// Timeout of every blocking queue operation.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.cfg.long_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Bucket count of later `shuffle` / `distinct` calls.
    pub fn buckets(mut self, n: usize) -> Self {
        self.cfg.buckets = Some(n);
        self
    }

    pub fn max_pending_chunks(mut self, n: usize) -> Self {
        self.cfg.max_pending_chunks = Some(n);
        self
    }

    pub fn pin_cores(mut self, pin: bool) -> Self {
        self.cfg.pin_cores = pin;
        self
    }

    pub fn with_config(mut self, cfg: StreamConfig) -> Self {
        self.cfg = cfg;
        self
    }

    /// Count this stream's threads on `gauge`.
    pub fn with_gauge(mut self, gauge: LiveGauge) -> Self {
        self.gauge = gauge;
        self
    }

    /// Cancelling `parent` cancels the running stream.
    pub fn with_cancel(mut self, parent: &CancelToken) -> Self {
        self.cancel = Some(parent.clone());
        self
    }

    #[inline]
    pub fn config(&self) -> &StreamConfig {
        &self.cfg
    }

    fn push<U>(mut self, layer: Layer) -> Stream<U> {
        self.layers.push(layer);
        Stream {
            source: self.source,
            layers: self.layers,
            cfg: self.cfg,
            cancel: self.cancel,
            gauge: self.gauge,
            _elem: PhantomData,
        }
    }

    /// Appends the terminal layer and builds the session that will run the pipeline.
    pub(crate) fn into_session(self, terminal: Layer, sink: Box<dyn Sink>) -> StreamResult<Session> {
        let mut layers = self.layers;
        layers.push(terminal);
        let pipeline = Pipeline::freeze(layers)?;
        Ok(Session::new(
            self.source,
            pipeline,
            sink,
            &self.cfg,
            self.cancel.as_ref(),
            self.gauge,
        ))
    }

    // ---- layers

    pub fn map<U, F>(self, f: F) -> Stream<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.push(Layer::unkeyed("map", move |chunk: Vec<T>| {
            Ok(chunk.into_iter().map(&f).collect::<Vec<U>>())
        }))
    }

    /// `map` whose errors fail the stream with a `TransformFailure`.
    pub fn try_map<U, F>(self, f: F) -> Stream<U>
    where
        U: Send + 'static,
        F: Fn(T) -> anyhow::Result<U> + Send + Sync + 'static,
    {
        self.push(Layer::unkeyed("try_map", move |chunk: Vec<T>| {
            chunk.into_iter().map(&f).collect::<anyhow::Result<Vec<U>>>()
        }))
    }

    pub fn filter<F>(self, f: F) -> Stream<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.push(Layer::unkeyed("filter", move |mut chunk: Vec<T>| {
            chunk.retain(|x| f(x));
            Ok(chunk)
        }))
    }

    /// Each element expands into a finite sequence.
    pub fn flat_map<U, I, F>(self, f: F) -> Stream<U>
    where
        U: Send + 'static,
        I: IntoIterator<Item = U>,
        F: Fn(T) -> I + Send + Sync + 'static,
    {
        self.push(Layer::unkeyed("flat_map", move |chunk: Vec<T>| {
            Ok(chunk.into_iter().flat_map(&f).collect::<Vec<U>>())
        }))
    }

    /// Splits every chunk into per-key groups. All elements sharing a key,
    /// across the whole input, reach the next layer as a single chunk.
    ///
    /// Groups are held by their owning worker until the input is exhausted,
    /// so nothing after this layer runs before then. `take` or `any` over an
    /// infinite input therefore wait until the long timeout and fail.
    pub fn chunk_by_key<K, F>(self, key_fn: F) -> Stream<T>
    where
        K: Hash,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        self.push(Layer::typed("chunk_by_key", move |chunk: Vec<T>| {
            let mut slots: AHashMap<u64, usize> = AHashMap::new();
            let mut groups: Vec<(Key, Vec<T>)> = Vec::new();
            for x in chunk {
                let h = stable_hash(&key_fn(&x));
                let slot = *slots.entry(h).or_insert_with(|| {
                    groups.push((Key::Part(h), Vec::new()));
                    groups.len() - 1
                });
                groups[slot].1.push(x);
            }
            Ok(groups)
        }))
    }

    /// Whole-chunk transformation.
    pub fn map_chunks<U, F>(self, f: F) -> Stream<U>
    where
        U: Send + 'static,
        F: Fn(Vec<T>) -> Vec<U> + Send + Sync + 'static,
    {
        self.push(Layer::unkeyed("map_chunks", move |chunk: Vec<T>| Ok(f(chunk))))
    }

    /// Collapses every chunk into one value.
    pub fn reduce_once<U, F>(self, f: F) -> Stream<U>
    where
        U: Send + 'static,
        F: Fn(Vec<T>) -> U + Send + Sync + 'static,
    {
        self.push(Layer::unkeyed("reduce_once", move |chunk: Vec<T>| Ok(vec![f(chunk)])))
    }

    /// Observe elements as they pass. Runs on worker threads, in no particular order.
    pub fn peek<F>(self, f: F) -> Stream<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.push(Layer::unkeyed("peek", move |chunk: Vec<T>| {
            chunk.iter().for_each(&f);
            Ok(chunk)
        }))
    }

    /// Passes at most `n` elements downstream. Which ones is up to the scheduler;
    /// the input keeps being consumed.
    pub fn limit(self, n: usize) -> Stream<T> {
        let remaining = Arc::new(AtomicUsize::new(n));
        self.push(Layer::unkeyed("limit", move |mut chunk: Vec<T>| {
            let want = chunk.len();
            let granted = remaining
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
                    (left > 0).then(|| left.saturating_sub(want))
                })
                .map_or(0, |left| left.min(want));
            chunk.truncate(granted);
            Ok(chunk)
        }))
    }

    fn bucketed(self) -> Stream<T>
    where
        T: Hash,
    {
        let buckets = self.cfg.buckets() as u64;
        self.chunk_by_key(move |x: &T| stable_hash(x) % buckets)
    }

    /// Randomizes order within hash buckets. Keyed like
    /// [`chunk_by_key`](Self::chunk_by_key), so it needs finite input.
    pub fn shuffle(self) -> Stream<T>
    where
        T: Hash,
    {
        self.bucketed().map_chunks(|mut chunk: Vec<T>| {
            chunk.shuffle(&mut rand::thread_rng());
            chunk
        })
    }

    /// Drops duplicates. Equal elements share a bucket, and a bucket is
    /// deduplicated as one chunk, so the result is exact. Like
    /// [`chunk_by_key`](Self::chunk_by_key), output only appears once the
    /// input is exhausted.
    pub fn distinct(self) -> Stream<T>
    where
        T: Hash + Eq,
    {
        self.bucketed().map_chunks(|chunk: Vec<T>| {
            let keep: Vec<bool> = {
                let mut seen = AHashSet::with_capacity(chunk.len());
                chunk.iter().map(|x| seen.insert(x)).collect()
            };
            chunk
                .into_iter()
                .zip(keep)
                .filter_map(|(x, keep)| keep.then_some(x))
                .collect()
        })
    }
}

impl Stream<String> {
    /// Lines of a text file. The file is closed as soon as feeding stops.
    pub fn lines(path: impl AsRef<Path>) -> StreamResult<Self> {
        Ok(Self::from_source(Source::lines(path)?))
    }
}
