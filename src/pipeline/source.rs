use crate::error::{StreamError, StreamResult};
use crate::model::{BoxedChunk, boxed};
use anyhow::Context;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Erased input the feeder slices into chunks.
///
/// Dropping the source releases whatever it holds (files, sockets); the
/// feeder drops it on every exit path.
pub trait ChunkSource: Send + 'static {
    /// Total number of elements when known up front.
    fn len_hint(&self) -> Option<usize>;

    /// Next chunk of at most `size` elements, `None` once exhausted.
    fn next_chunk(&mut self, size: usize) -> Option<anyhow::Result<BoxedChunk>>;

    fn kind(&self) -> &'static str;
}

type BoxedIter<T> = Box<dyn Iterator<Item = anyhow::Result<T>> + Send>;

/// Sized or unsized sequence of elements feeding a stream.
pub struct Source<T> {
    iter: BoxedIter<T>,
    len: Option<usize>,
    kind: &'static str,
}

impl<T: Send + 'static> Source<T> {
    /// The length is taken from the iterator when its size hint is exact.
    pub fn new<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let iter = items.into_iter();
        let len = match iter.size_hint() {
            (lo, Some(hi)) if lo == hi => Some(lo),
            _ => None,
        };
        Self {
            iter: Box::new(iter.map(Ok)),
            len,
            kind: if len.is_some() { "sized" } else { "unsized" },
        }
    }

    /// Treat the input as unsized even if its length is known.
    pub fn without_len<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self {
            iter: Box::new(items.into_iter().map(Ok)),
            len: None,
            kind: "unsized",
        }
    }

    /// Input whose reads can fail; the first error aborts the stream.
    pub fn fallible<I>(items: I) -> Self
    where
        I: IntoIterator<Item = anyhow::Result<T>>,
        I::IntoIter: Send + 'static,
    {
        Self {
            iter: Box::new(items.into_iter()),
            len: None,
            kind: "fallible",
        }
    }
}

impl Source<String> {
    /// Lines of a text file, without their terminators.
    pub fn lines(path: impl AsRef<Path>) -> StreamResult<Self> {
        let path = path.as_ref();
        let shown = path.display().to_string();
        let file = File::open(path)
            .with_context(|| format!("failed to open {shown}"))
            .map_err(StreamError::Source)?;

        let iter = BufReader::new(file)
            .lines()
            .map(move |line| line.with_context(|| format!("failed to read a line of {shown}")));

        Ok(Self {
            iter: Box::new(iter),
            len: None,
            kind: "lines",
        })
    }
}

impl<T: Send + 'static> ChunkSource for Source<T> {
    #[inline]
    fn len_hint(&self) -> Option<usize> {
        self.len
    }

    fn next_chunk(&mut self, size: usize) -> Option<anyhow::Result<BoxedChunk>> {
        let mut chunk = Vec::with_capacity(size.min(4096));
        while chunk.len() < size {
            match self.iter.next() {
                Some(Ok(x)) => chunk.push(x),
                Some(Err(e)) => return Some(Err(e)),
                None => break,
            }
        }
        if chunk.is_empty() {
            None
        } else {
            Some(Ok(boxed(chunk)))
        }
    }

    #[inline]
    fn kind(&self) -> &'static str {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::downcast;

    #[test]
    fn slices_into_bounded_chunks() {
        let mut src = Source::new(0..7u32);
        assert_eq!(src.len_hint(), Some(7));

        let mut sizes = Vec::new();
        while let Some(chunk) = src.next_chunk(3) {
            sizes.push(downcast::<u32>(chunk.expect("infallible")).expect("u32").len());
        }
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[test]
    fn infinite_input_is_unsized() {
        let src = Source::new(0u64..);
        assert_eq!(src.len_hint(), None);
        assert_eq!(Source::without_len(vec![1, 2]).len_hint(), None);
    }

    #[test]
    fn missing_file_is_a_source_error() {
        let err = Source::lines("/definitely/not/here.txt")
            .err()
            .expect("missing file");
        assert!(matches!(err, StreamError::Source(_)));
    }
}
