use crate::control::signals::{Signal, SignalReceiver};
use crate::error::{FailureCell, StreamError, panic_message};
use crate::io::base::{BaseRx, BaseTx};
use crate::io::mpmc::{MpmcReceiver, MpmcSender};
use crate::io::tracker::TaskTracker;
use crate::model::{BoxedChunk, Key, WorkItem};
use crate::pipeline::Pipeline;
use crate::sink::Sink;
use crate::utils::{CancelToken, LiveGuard, pin_worker};
use ahash::AHashMap;
use crossbeam::channel::Select;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use uuid::fmt::Simple;

/// Upper bound on how long an idle worker sleeps before re-checking its signals.
const IDLE_WAIT: Duration = Duration::from_millis(1);

/// Everything one worker thread owns.
pub(crate) struct WorkerCtx {
    pub index: usize,
    pub session: Simple,
    pub pipeline: Pipeline,
    pub sink: Box<dyn Sink>,
    pub feed_rx: MpmcReceiver<WorkItem>,
    pub cont_tx: MpmcSender<WorkItem>,
    pub cont_rx: MpmcReceiver<WorkItem>,
    pub inbox: MpmcReceiver<WorkItem>,
    pub routes: Vec<MpmcSender<WorkItem>>,
    pub signals: SignalReceiver,
    pub tracker: TaskTracker,
    pub cancel: CancelToken,
    pub failures: FailureCell,
    /// Groups released during the current flush round, across all workers.
    pub flushed: Arc<AtomicUsize>,
    pub pin_cores: bool,
    pub _live: Option<LiveGuard>,
}

pub(crate) fn spawn(ctx: WorkerCtx, thread_name: String) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(thread_name)
        .spawn(move || Worker::new(ctx).run())
}

struct Worker {
    ctx: WorkerCtx,
    /// Keyed chunks owned by this worker, per (stage, partition).
    groups: AHashMap<(usize, u64), BoxedChunk>,
    processed: usize,
}

impl Worker {
    fn new(ctx: WorkerCtx) -> Self {
        Self {
            ctx,
            groups: AHashMap::new(),
            processed: 0,
        }
    }

    fn run(mut self) {
        let idx = self.ctx.index;
        let session = self.ctx.session;

        if self.ctx.pin_cores {
            match pin_worker(idx) {
                Ok(core) => tracing::info!("[Stream {}] worker {} pinned to core {}", session, idx, core),
                Err(e) => tracing::warn!("[Stream {}] worker {} not pinned: {}", session, idx, e),
            }
        }
        tracing::debug!("[Stream {}] worker {} started", session, idx);

        loop {
            match self.ctx.signals.poll() {
                Ok(Some(Signal::EmptyBuffers)) => {
                    self.flush();
                    self.ctx.signals.ack();
                    continue;
                }
                Ok(Some(Signal::End)) => {
                    self.ctx.signals.ack();
                    break;
                }
                Ok(None) => {}
                Err(_) => {
                    tracing::warn!("[Stream {}] worker {} lost its controller", session, idx);
                    break;
                }
            }

            match self.next_item() {
                Some(item) => {
                    if !self.ctx.cancel.is_cancelled() {
                        self.handle(item);
                    }
                    self.ctx.tracker.done();
                }
                None => self.wait_ready(),
            }
        }

        if !self.groups.is_empty() && !self.ctx.cancel.is_cancelled() {
            self.ctx.failures.record(StreamError::invariant(format!(
                "worker {} ended holding {} unflushed groups",
                idx,
                self.groups.len()
            )));
        }
        tracing::debug!(
            "[Stream {}] worker {} done: {} items processed",
            session,
            idx,
            self.processed
        );
    }

    /// Routed inbox first, then continuations, then fresh input.
    fn next_item(&mut self) -> Option<WorkItem> {
        let c = &mut self.ctx;
        if let Ok(item) = c.inbox.try_recv() {
            return Some(item);
        }
        if let Ok(item) = c.cont_rx.try_recv() {
            return Some(item);
        }
        c.feed_rx.try_recv().ok()
    }

    fn wait_ready(&self) {
        let mut sel = Select::new();
        sel.recv(self.ctx.inbox.raw());
        sel.recv(self.ctx.cont_rx.raw());
        sel.recv(self.ctx.feed_rx.raw());
        let _ = sel.ready_timeout(IDLE_WAIT);
    }

    fn handle(&mut self, item: WorkItem) {
        self.processed += 1;
        match item.key {
            Key::Part(h) => self.absorb(item.stage, h, item.chunk),
            Key::NoKey => self.process(item.stage, item.chunk),
        }
    }

    fn absorb(&mut self, stage: usize, part: u64, chunk: BoxedChunk) {
        match self.groups.get_mut(&(stage, part)) {
            Some(group) => {
                if let Err(e) = group.absorb(chunk) {
                    self.ctx.failures.record(e);
                }
            }
            None => {
                self.groups.insert((stage, part), chunk);
            }
        }
    }

    fn process(&mut self, stage: usize, chunk: BoxedChunk) {
        let Some(layer) = self.ctx.pipeline.get(stage) else {
            self.ctx.failures.record(StreamError::invariant(format!(
                "work item addressed to stage {stage} of a {}-layer pipeline",
                self.ctx.pipeline.len()
            )));
            return;
        };
        let name = layer.name();
        let chunk_len = chunk.len();

        let outputs = match catch_unwind(AssertUnwindSafe(|| layer.apply(chunk))) {
            Ok(Ok(outputs)) => outputs,
            Ok(Err(err)) => {
                self.fail(stage, name, chunk_len, err);
                return;
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                self.fail(stage, name, chunk_len, anyhow::anyhow!("panicked: {msg}"));
                return;
            }
        };

        let last = self.ctx.pipeline.is_sink_stage(stage);
        for out in outputs {
            if out.chunk.is_empty() {
                continue;
            }
            if last {
                if let Err(e) = self.ctx.sink.deliver(out.chunk) {
                    tracing::warn!(
                        "[Stream {}] worker {} could not deliver to {} sink: {}",
                        self.ctx.session,
                        self.ctx.index,
                        self.ctx.sink.name(),
                        e
                    );
                    self.ctx.failures.record(e);
                    return;
                }
            } else {
                self.forward(stage + 1, out.key, out.chunk);
            }
        }
    }

    /// Unkeyed output goes to the shared continuation queue, keyed output to its owner.
    fn forward(&mut self, next: usize, key: Key, chunk: BoxedChunk) {
        let workers = self.ctx.routes.len();
        let c = &mut self.ctx;

        c.tracker.add();
        let sent = match key.route(workers) {
            None => c.cont_tx.try_send(WorkItem::new(next, Key::NoKey, chunk)),
            Some(owner) => c.routes[owner].try_send(WorkItem::new(next, key, chunk)),
        };
        if sent.is_err() {
            c.tracker.done();
            c.failures.record(StreamError::Disconnected("continuation queue"));
        }
    }

    /// Releases every held group as an ordinary work item for its stage.
    fn flush(&mut self) {
        if self.groups.is_empty() {
            return;
        }
        if self.ctx.cancel.is_cancelled() {
            self.groups.clear();
            return;
        }

        let released = self.groups.len();
        for ((stage, _), chunk) in self.groups.drain() {
            let c = &mut self.ctx;
            c.tracker.add();
            if c.cont_tx.try_send(WorkItem::new(stage, Key::NoKey, chunk)).is_err() {
                c.tracker.done();
                c.failures.record(StreamError::Disconnected("continuation queue"));
                return;
            }
        }
        self.ctx.flushed.fetch_add(released, Ordering::AcqRel);
        tracing::debug!(
            "[Stream {}] worker {} released {} groups",
            self.ctx.session,
            self.ctx.index,
            released
        );
    }

    fn fail(&self, stage: usize, layer: &'static str, chunk_len: usize, err: anyhow::Error) {
        let err = match err.downcast::<StreamError>() {
            Ok(StreamError::InvariantViolation(msg)) => StreamError::InvariantViolation(msg),
            Ok(other) => StreamError::TransformFailure {
                stage,
                layer,
                chunk_len,
                source: anyhow::Error::new(other),
            },
            Err(source) => StreamError::TransformFailure {
                stage,
                layer,
                chunk_len,
                source,
            },
        };
        self.ctx.failures.record(err);
    }
}
