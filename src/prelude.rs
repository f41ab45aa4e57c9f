pub use crate::config::StreamConfig;
pub use crate::error::{StreamError, StreamResult};
pub use crate::pipeline::{Source, Stream, StreamIter};
pub use crate::runtime::Canceller;
pub use crate::sequential::SequentialStream;
pub use crate::utils::logger::LoggerConfig;
pub use crate::utils::{CancelToken, LiveGauge};
