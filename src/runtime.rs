use crate::config::{Settings, StreamConfig};
use crate::control::phase::Phase;
use crate::control::signals::{Signal, SignalReceiver, SignalSender, signal_queue};
use crate::error::{FailureCell, StreamError, StreamResult, panic_message};
use crate::feeder::{self, FeederCtx};
use crate::io::base::BaseRx;
use crate::io::mpmc::{MpmcChannel, MpmcReceiver, MpmcSender};
use crate::io::tracker::TaskTracker;
use crate::model::WorkItem;
use crate::pipeline::{ChunkSource, Pipeline};
use crate::sink::Sink;
use crate::utils::{CancelToken, LiveGauge};
use crate::worker::{self, WorkerCtx};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;
use uuid::fmt::Simple;

const JOIN_POLL: Duration = Duration::from_millis(1);

/// One execution of a frozen pipeline: the queues, the feeder, the workers
/// and the shutdown protocol that tears them down.
///
/// A session runs exactly once. `start` spawns the threads, `shutdown`
/// drains every queue, flushes keyed state, stops the workers and returns
/// the first failure any thread recorded. A session stopped through its
/// parent token closes with [`StreamError::Cancelled`]; cancelling the
/// session itself is not an error.
pub struct Session {
    id: Simple,
    phase: Phase,
    settings: Settings,
    pipeline: Pipeline,
    source: Option<Box<dyn ChunkSource>>,
    sink: Option<Box<dyn Sink>>,
    cancel: CancelToken,
    parent: Option<CancelToken>,
    failures: FailureCell,
    tracker: TaskTracker,
    gauge: LiveGauge,
    feed_tx: Option<MpmcSender<WorkItem>>,
    feed_rx: MpmcReceiver<WorkItem>,
    cont_tx: MpmcSender<WorkItem>,
    cont_rx: MpmcReceiver<WorkItem>,
    routes: Vec<MpmcSender<WorkItem>>,
    inboxes: Vec<MpmcReceiver<WorkItem>>,
    signals: Vec<SignalSender>,
    signal_rx: Vec<SignalReceiver>,
    flushed: Arc<AtomicUsize>,
    feeder: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl Session {
    pub fn new(
        source: Box<dyn ChunkSource>,
        pipeline: Pipeline,
        sink: Box<dyn Sink>,
        cfg: &StreamConfig,
        parent: Option<&CancelToken>,
        gauge: LiveGauge,
    ) -> Self {
        let settings = cfg.resolve(source.len_hint());
        let cancel = parent.map_or_else(CancelToken::new_root, CancelToken::new_child);
        let failures = FailureCell::new(cancel.clone());

        let (feed_tx, feed_rx) = MpmcChannel::bounded(settings.max_pending_chunks);
        let (cont_tx, cont_rx) = MpmcChannel::unbounded();

        let mut routes = Vec::with_capacity(settings.workers);
        let mut inboxes = Vec::with_capacity(settings.workers);
        let mut signals = Vec::with_capacity(settings.workers);
        let mut signal_rx = Vec::with_capacity(settings.workers);
        for i in 0..settings.workers {
            let (tx, rx) = MpmcChannel::unbounded();
            routes.push(tx);
            inboxes.push(rx);
            let (tx, rx) = signal_queue(i);
            signals.push(tx);
            signal_rx.push(rx);
        }

        Self {
            id: Uuid::new_v4().simple(),
            phase: Phase::Built,
            settings,
            pipeline,
            source: Some(source),
            sink: Some(sink),
            cancel,
            parent: parent.cloned(),
            failures,
            tracker: TaskTracker::new(),
            gauge,
            feed_tx: Some(feed_tx),
            feed_rx,
            cont_tx,
            cont_rx,
            routes,
            inboxes,
            signals,
            signal_rx,
            flushed: Arc::new(AtomicUsize::new(0)),
            feeder: None,
            workers: Vec::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> Simple {
        self.id
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[inline]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[inline]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn canceller(&self) -> Canceller {
        Canceller {
            cancel: self.cancel.clone(),
            feed_rx: self.feed_rx.clone(),
            cont_rx: self.cont_rx.clone(),
            tracker: self.tracker.clone(),
        }
    }

    /// Stop feeding and discard queued work; the session still has to be shut down.
    pub fn cancel(&self) {
        self.canceller().cancel();
    }

    fn thread_name(&self, role: &str) -> String {
        let id = self.id.to_string();
        format!("parastream-{}-{}", &id[..8], role)
    }

    /// Spawns the workers and the feeder. A session can be started once.
    pub fn start(&mut self) -> StreamResult<()> {
        self.phase.advance(Phase::Running)?;

        let (Some(source), Some(sink), Some(feed_tx)) =
            (self.source.take(), self.sink.take(), self.feed_tx.clone())
        else {
            return Err(StreamError::invariant("session parts already consumed"));
        };

        tracing::info!(
            "[Stream {}] starting: {} workers, chunk size {}, pipeline {}",
            self.id,
            self.settings.workers,
            self.settings.chunk_size,
            self.pipeline.describe()
        );

        let inboxes = std::mem::take(&mut self.inboxes);
        let signal_rx = std::mem::take(&mut self.signal_rx);
        for (index, (inbox, signals)) in inboxes.into_iter().zip(signal_rx).enumerate() {
            let ctx = WorkerCtx {
                index,
                session: self.id,
                pipeline: self.pipeline.clone(),
                sink: sink.fork(),
                feed_rx: self.feed_rx.clone(),
                cont_tx: self.cont_tx.clone(),
                cont_rx: self.cont_rx.clone(),
                inbox,
                routes: self.routes.clone(),
                signals,
                tracker: self.tracker.clone(),
                cancel: self.cancel.clone(),
                failures: self.failures.clone(),
                flushed: self.flushed.clone(),
                pin_cores: self.settings.pin_cores,
                _live: Some(self.gauge.enter()),
            };
            let name = self.thread_name(&format!("worker-{index}"));
            match worker::spawn(ctx, name) {
                Ok(handle) => self.workers.push(handle),
                Err(e) => {
                    self.cancel.cancel();
                    return Err(StreamError::Spawn(e));
                }
            }
        }
        drop(sink);

        let ctx = FeederCtx {
            session: self.id,
            source,
            chunk_size: self.settings.chunk_size,
            feed_tx,
            tracker: self.tracker.clone(),
            cancel: self.cancel.clone(),
            failures: self.failures.clone(),
            timeout: self.settings.long_timeout,
            live: Some(self.gauge.enter()),
        };
        match feeder::spawn(ctx, self.thread_name("feeder")) {
            Ok(handle) => self.feeder = Some(handle),
            Err(e) => {
                self.cancel.cancel();
                return Err(StreamError::Spawn(e));
            }
        }
        Ok(())
    }

    /// Drains the queues, flushes keyed state, ends the workers and closes the session.
    pub fn shutdown(&mut self) -> StreamResult<()> {
        if !self.phase.is_started() {
            return Err(StreamError::invariant("shutdown of a session that never started"));
        }
        if self.phase.is_closed() {
            return Err(StreamError::invariant("session already closed"));
        }
        let started = Instant::now();

        self.phase.advance(Phase::Draining)?;
        if let Some(feeder) = self.feeder.take()
            && let Err(p) = feeder.join()
        {
            self.failures
                .record(StreamError::JoinPanic(panic_message(p.as_ref())));
        }
        self.settle("drain");

        self.phase.advance(Phase::Flushing)?;
        self.flush_rounds();

        self.phase.advance(Phase::Terminating)?;
        self.end_workers();

        self.feed_tx = None;
        self.routes.clear();
        self.signals.clear();
        self.phase.advance(Phase::Closed)?;

        let failures = self.failures.count();
        match self.failures.take() {
            Some(err) => {
                tracing::warn!(
                    "[Stream {}] closed after {:?} with {} failure(s)",
                    self.id,
                    started.elapsed(),
                    failures
                );
                Err(err)
            }
            None if self.parent.as_ref().is_some_and(CancelToken::is_cancelled) => {
                tracing::info!(
                    "[Stream {}] cancelled by caller after {:?}",
                    self.id,
                    started.elapsed()
                );
                Err(StreamError::Cancelled)
            }
            None => {
                tracing::info!("[Stream {}] closed after {:?}", self.id, started.elapsed());
                Ok(())
            }
        }
    }

    /// Start, wait for completion, shut down.
    pub fn run(mut self) -> StreamResult<()> {
        self.start()?;
        self.shutdown()
    }

    /// Waits for every queued item; a timeout is recorded, the queues discarded and the wait retried once.
    fn settle(&self, what: &'static str) {
        let timeout = self.settings.long_timeout;
        if let Err(e) = self.tracker.join(what, timeout) {
            self.failures.record(e);
            self.canceller().cancel();
            if let Err(e) = self.tracker.join(what, timeout) {
                self.failures.record(e);
            }
        }
    }

    /// Repeats EmptyBuffers rounds until one of them releases nothing.
    fn flush_rounds(&mut self) {
        let timeout = self.settings.long_timeout;
        let max_rounds = self.pipeline.len() + 1;
        let mut round = 0;

        while !self.cancel.is_cancelled() {
            round += 1;
            if round > max_rounds {
                self.failures.record(StreamError::invariant(format!(
                    "keyed state still pending after {max_rounds} flush rounds"
                )));
                return;
            }

            self.flushed.store(0, Ordering::Release);
            for s in self.signals.iter_mut() {
                if let Err(e) = s.put(Signal::EmptyBuffers, timeout) {
                    self.failures.record(e);
                    return;
                }
            }
            for s in self.signals.iter() {
                if let Err(e) = s.join(timeout) {
                    tracing::error!("[Stream {}] worker {} did not flush", self.id, s.worker());
                    self.failures.record(e);
                    return;
                }
            }
            self.settle("flush");

            let released = self.flushed.load(Ordering::Acquire);
            tracing::debug!(
                "[Stream {}] flush round {}: {} groups released",
                self.id,
                round,
                released
            );
            if released == 0 {
                return;
            }
        }
    }

    /// Sends End to every worker and joins them against one shared deadline.
    /// A worker still running at the deadline is detached.
    fn end_workers(&mut self) {
        let timeout = self.settings.long_timeout;
        for s in self.signals.iter_mut() {
            if let Err(e) = s.put(Signal::End, timeout) {
                self.failures.record(e);
            }
        }

        let deadline = Instant::now() + timeout;
        for (index, handle) in self.workers.drain(..).enumerate() {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL);
            }
            if !handle.is_finished() {
                tracing::error!("[Stream {}] worker {} detached after {:?}", self.id, index, timeout);
                self.failures.record(StreamError::timeout("worker join", timeout));
                continue;
            }
            if let Err(p) = handle.join() {
                self.failures
                    .record(StreamError::JoinPanic(panic_message(p.as_ref())));
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.phase.is_started() && !self.phase.is_closed() {
            self.cancel();
            if let Err(e) = self.shutdown() {
                tracing::debug!("[Stream {}] dropped while running: {}", self.id, e);
            }
        }
    }
}

/// Cloneable handle that cancels a running session from any thread.
#[derive(Clone)]
pub struct Canceller {
    cancel: CancelToken,
    feed_rx: MpmcReceiver<WorkItem>,
    cont_rx: MpmcReceiver<WorkItem>,
    tracker: TaskTracker,
}

impl Canceller {
    /// Cancels the token and discards everything still queued.
    pub fn cancel(&self) {
        self.cancel.cancel();
        let mut feed = self.feed_rx.clone();
        let mut cont = self.cont_rx.clone();
        for _ in feed.drain_max().into_iter().chain(cont.drain_max()) {
            self.tracker.done();
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Moves a started session to a thread that shuts it down, so the caller can
/// consume results while the pipeline is still running.
pub(crate) fn spawn_cleanup(session: Session) -> StreamResult<JoinHandle<StreamResult<()>>> {
    let name = session.thread_name("cleanup");
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            let mut session = session;
            session.shutdown()
        })
        .map_err(StreamError::Spawn)
}

pub(crate) fn join_cleanup(handle: JoinHandle<StreamResult<()>>) -> StreamResult<()> {
    handle
        .join()
        .map_err(|p| StreamError::JoinPanic(panic_message(p.as_ref())))?
}
