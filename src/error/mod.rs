use std::time::Duration;
use std::{error::Error, fmt};

pub use failure::FailureCell;

mod failure;

const ERR_MSG_QUEUE_FULL: &str = "queue is full";
const ERR_MSG_TRANSPORT_CLOSED: &str = "queue is closed";
const ERR_MSG_TIMEOUT: &str = "operation timed out";
const ERR_MSG_DISCONNECTED: &str = "queue disconnected";
const ERR_MSG_CANCELLED: &str = "operation cancelled";

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendFailReason {
    Timeout,
    Cancelled,
    Full,
    Closed,
}

impl fmt::Display for SendFailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendFailReason::Timeout => write!(f, "{ERR_MSG_TIMEOUT}"),
            SendFailReason::Cancelled => write!(f, "{ERR_MSG_CANCELLED}"),
            SendFailReason::Full => write!(f, "{ERR_MSG_QUEUE_FULL}"),
            SendFailReason::Closed => write!(f, "{ERR_MSG_TRANSPORT_CLOSED}"),
        }
    }
}

/// Failed send. The rejected value is handed back when the transport still owns it.
#[derive(Debug)]
pub struct SendError<T> {
    pub value: Option<T>,
    pub reason: SendFailReason,
}

impl<T> SendError<T> {
    pub fn full(value: Option<T>) -> Self {
        Self {
            value,
            reason: SendFailReason::Full,
        }
    }

    pub fn closed(value: Option<T>) -> Self {
        Self {
            value,
            reason: SendFailReason::Closed,
        }
    }

    pub fn cancelled(value: Option<T>) -> Self {
        Self {
            value,
            reason: SendFailReason::Cancelled,
        }
    }

    pub fn timeout(value: Option<T>) -> Self {
        Self {
            value,
            reason: SendFailReason::Timeout,
        }
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl<T: fmt::Debug> Error for SendError<T> {}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TryRecvError {
    Empty,
    Disconnected,
}

#[derive(Debug)]
pub enum RecvError {
    Timeout,
    Disconnected,
    Cancelled,
}

impl Error for RecvError {}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecvError::Timeout => write!(f, "{ERR_MSG_TIMEOUT}"),
            RecvError::Disconnected => write!(f, "{ERR_MSG_DISCONNECTED}"),
            RecvError::Cancelled => write!(f, "{ERR_MSG_CANCELLED}"),
        }
    }
}

pub type StreamResult<T> = Result<T, StreamError>;

/// Everything a stream can fail with.
#[derive(Debug)]
pub enum StreamError {
    /// The pipeline or the session was used in a way its lifecycle forbids.
    InvariantViolation(String),
    /// A blocking queue operation exceeded the long timeout.
    ResourceTimeout { what: &'static str, after: Duration },
    /// A user function failed (returned an error or panicked) inside a worker.
    TransformFailure {
        stage: usize,
        layer: &'static str,
        chunk_len: usize,
        source: anyhow::Error,
    },
    /// The input source could not be opened or read.
    Source(anyhow::Error),
    /// A queue was closed while the pipeline still needed it.
    Disconnected(&'static str),
    /// A stream thread could not be spawned.
    Spawn(std::io::Error),
    /// A stream thread panicked outside of user code.
    JoinPanic(String),
    /// The caller's cancel token fired before the stream finished; partial results are discarded.
    Cancelled,
}

impl StreamError {
    pub fn invariant(msg: impl Into<String>) -> Self {
        StreamError::InvariantViolation(msg.into())
    }

    pub fn timeout(what: &'static str, after: Duration) -> Self {
        StreamError::ResourceTimeout { what, after }
    }

    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, StreamError::ResourceTimeout { .. })
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StreamError::Cancelled)
    }

    #[inline]
    pub fn is_transform_failure(&self) -> bool {
        matches!(self, StreamError::TransformFailure { .. })
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvariantViolation(s) => write!(f, "invariant violation: {s}"),
            Self::ResourceTimeout { what, after } => {
                write!(f, "{what} timed out after {after:?}")
            }
            Self::TransformFailure {
                stage,
                layer,
                chunk_len,
                source,
            } => write!(
                f,
                "stage {stage} ({layer}) failed on a chunk of {chunk_len} elements: {source}"
            ),
            Self::Source(err) => write!(f, "source error: {err}"),
            Self::Disconnected(what) => write!(f, "{what}: {ERR_MSG_DISCONNECTED}"),
            Self::Spawn(err) => write!(f, "failed to spawn stream thread: {err}"),
            Self::JoinPanic(s) => write!(f, "stream thread panicked: {s}"),
            Self::Cancelled => write!(f, "stream {ERR_MSG_CANCELLED}"),
        }
    }
}

impl Error for StreamError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::TransformFailure { source, .. } => Some(source.as_ref()),
            Self::Source(err) => Some(err.as_ref()),
            Self::Spawn(err) => Some(err),
            _ => None,
        }
    }
}

/// Turns a `catch_unwind` / `join` payload into a readable message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic (unknown type)".into())
}
