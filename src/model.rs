use crate::error::{StreamError, StreamResult};
use ahash::RandomState;
use std::any::Any;
use std::fmt;
use std::hash::{BuildHasher, Hash};

// Fixed seeds: every worker must agree on a key's hash.
const KEY_SEEDS: (u64, u64, u64, u64) = (
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
);

#[inline]
fn key_hasher() -> RandomState {
    RandomState::with_seeds(KEY_SEEDS.0, KEY_SEEDS.1, KEY_SEEDS.2, KEY_SEEDS.3)
}

/// Deterministic hash shared by key routing and bucketing.
#[inline]
pub fn stable_hash<K: Hash + ?Sized>(k: &K) -> u64 {
    BuildHasher::hash_one(&key_hasher(), k)
}

/// Partitioning tag attached to a chunk leaving a layer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
pub enum Key {
    /// No partitioning requirement; any worker may run the next stage.
    #[default]
    NoKey,
    /// Every chunk with the same partition is grouped on one worker.
    Part(u64),
}

impl Key {
    pub fn of<K: Hash + ?Sized>(k: &K) -> Self {
        Key::Part(stable_hash(k))
    }

    /// Index of the worker owning this key, `None` for [`Key::NoKey`].
    #[inline]
    pub fn route(&self, workers: usize) -> Option<usize> {
        match self {
            Key::NoKey => None,
            Key::Part(h) => Some((*h % workers.max(1) as u64) as usize),
        }
    }
}

/// Type-erased chunk travelling between layers.
pub trait AnyChunk: Send + 'static {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `other`, which must carry the same element type.
    fn absorb(&mut self, other: BoxedChunk) -> StreamResult<()>;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

pub type BoxedChunk = Box<dyn AnyChunk>;

impl<T: Send + 'static> AnyChunk for Vec<T> {
    #[inline]
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn absorb(&mut self, other: BoxedChunk) -> StreamResult<()> {
        let other = downcast::<T>(other)?;
        self.extend(other);
        Ok(())
    }

    #[inline]
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

#[inline]
pub fn boxed<T: Send + 'static>(chunk: Vec<T>) -> BoxedChunk {
    Box::new(chunk)
}

/// Recovers the concrete chunk; a mismatch means the pipeline was wired wrong.
pub fn downcast<T: Send + 'static>(chunk: BoxedChunk) -> StreamResult<Vec<T>> {
    chunk
        .into_any()
        .downcast::<Vec<T>>()
        .map(|v| *v)
        .map_err(|_| {
            StreamError::invariant(format!(
                "chunk element type mismatch, expected {}",
                std::any::type_name::<T>()
            ))
        })
}

/// One output of a layer: a partition key plus the chunk it tags.
pub struct KeyedChunk {
    pub key: Key,
    pub chunk: BoxedChunk,
}

impl KeyedChunk {
    #[inline]
    pub fn new(key: Key, chunk: BoxedChunk) -> Self {
        Self { key, chunk }
    }

    #[inline]
    pub fn unkeyed(chunk: BoxedChunk) -> Self {
        Self::new(Key::NoKey, chunk)
    }
}

impl fmt::Debug for KeyedChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedChunk")
            .field("key", &self.key)
            .field("len", &self.chunk.len())
            .finish()
    }
}

/// A chunk tagged with the index of the next layer to apply.
pub struct WorkItem {
    pub stage: usize,
    pub key: Key,
    pub chunk: BoxedChunk,
}

impl WorkItem {
    #[inline]
    pub fn new(stage: usize, key: Key, chunk: BoxedChunk) -> Self {
        Self { stage, key, chunk }
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("stage", &self.stage)
            .field("key", &self.key)
            .field("len", &self.chunk.len())
            .finish()
    }
}
