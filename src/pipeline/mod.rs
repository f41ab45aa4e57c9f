pub use layer::{Layer, Pipeline, StageFn};
pub use source::{ChunkSource, Source};
pub use stream::Stream;
pub use terminal::StreamIter;

mod layer;
mod source;
mod stream;
mod terminal;
