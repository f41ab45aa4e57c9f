use crate::error::{FailureCell, SendFailReason, StreamError};
use crate::io::base::BaseTx;
use crate::io::mpmc::MpmcSender;
use crate::io::tracker::TaskTracker;
use crate::model::{Key, WorkItem};
use crate::pipeline::ChunkSource;
use crate::utils::{CancelToken, LiveGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use uuid::fmt::Simple;

/// Everything the feeder thread owns.
pub(crate) struct FeederCtx {
    pub session: Simple,
    pub source: Box<dyn ChunkSource>,
    pub chunk_size: usize,
    pub feed_tx: MpmcSender<WorkItem>,
    pub tracker: TaskTracker,
    pub cancel: CancelToken,
    pub failures: FailureCell,
    pub timeout: Duration,
    pub live: Option<LiveGuard>,
}

pub(crate) fn spawn(ctx: FeederCtx, thread_name: String) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(thread_name)
        .spawn(move || run(ctx))
}

/// Slices the source into `WorkItem(0, chunk)`s until it is exhausted, the
/// session is cancelled or a put fails. Blocking on the bounded feed queue is
/// the engine's backpressure.
fn run(ctx: FeederCtx) {
    let FeederCtx {
        session,
        mut source,
        chunk_size,
        mut feed_tx,
        tracker,
        cancel,
        failures,
        timeout,
        live: _live,
    } = ctx;

    tracing::debug!(
        "[Stream {}] feeder started: {} source, chunk size {}",
        session,
        source.kind(),
        chunk_size
    );

    let mut chunks: usize = 0;
    let mut elements: usize = 0;

    loop {
        if cancel.is_cancelled() {
            tracing::debug!("[Stream {}] feeder cancelled", session);
            break;
        }

        let chunk = match source.next_chunk(chunk_size) {
            None => break,
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => {
                failures.record(StreamError::Source(err));
                break;
            }
        };
        let len = chunk.len();

        tracker.add();
        match feed_tx.send(WorkItem::new(0, Key::NoKey, chunk), &cancel, Some(timeout)) {
            Ok(()) => {
                chunks += 1;
                elements += len;
            }
            Err(e) => {
                tracker.done();
                match e.reason {
                    SendFailReason::Cancelled => {
                        tracing::debug!("[Stream {}] feeder cancelled while blocked", session);
                    }
                    SendFailReason::Timeout => {
                        failures.record(StreamError::timeout("feed queue put", timeout));
                    }
                    SendFailReason::Full | SendFailReason::Closed => {
                        failures.record(StreamError::Disconnected("feed queue"));
                    }
                }
                break;
            }
        }
    }

    let kind = source.kind();
    drop(source);
    tracing::info!(
        "[Stream {}] done feeding: {} chunks, {} elements, {} source released",
        session,
        chunks,
        elements,
        kind
    );
}
