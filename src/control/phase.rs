use crate::error::{StreamError, StreamResult};
use std::fmt;

/// Lifecycle of an execution session.
///
/// `Built -> Running -> Draining -> Flushing -> Terminating -> Closed`.
/// Cancellation and failures do not add states: they shorten `Draining`
/// by discarding queued work, the remaining steps always run in order.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Phase {
    Built,
    Running,
    Draining,
    Flushing,
    Terminating,
    Closed,
}

impl Phase {
    #[inline]
    fn rank(self) -> u8 {
        match self {
            Phase::Built => 0,
            Phase::Running => 1,
            Phase::Draining => 2,
            Phase::Flushing => 3,
            Phase::Terminating => 4,
            Phase::Closed => 5,
        }
    }

    /// Moves one step forward; any other transition is an invariant violation.
    pub fn advance(&mut self, to: Phase) -> StreamResult<()> {
        if to.rank() != self.rank() + 1 {
            return Err(StreamError::invariant(format!(
                "illegal session transition {self} -> {to}"
            )));
        }
        *self = to;
        Ok(())
    }

    #[inline]
    pub fn is_started(self) -> bool {
        self != Phase::Built
    }

    #[inline]
    pub fn is_closed(self) -> bool {
        self == Phase::Closed
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Built => "built",
            Phase::Running => "running",
            Phase::Draining => "draining",
            Phase::Flushing => "flushing",
            Phase::Terminating => "terminating",
            Phase::Closed => "closed",
        };
        f.write_str(s)
    }
}
