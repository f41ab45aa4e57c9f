use crate::error::{StreamError, StreamResult};
use crate::model::{BoxedChunk, Key, KeyedChunk, boxed, downcast};
use std::fmt;
use std::sync::Arc;

/// Erased stage body: one chunk in, zero or more keyed chunks out.
pub type StageFn = dyn Fn(BoxedChunk) -> anyhow::Result<Vec<KeyedChunk>> + Send + Sync;

/// One transformation stage of a pipeline.
#[derive(Clone)]
pub struct Layer {
    name: &'static str,
    apply: Arc<StageFn>,
}

impl Layer {
    pub fn new<F>(name: &'static str, f: F) -> Self
    where
        F: Fn(BoxedChunk) -> anyhow::Result<Vec<KeyedChunk>> + Send + Sync + 'static,
    {
        Self {
            name,
            apply: Arc::new(f),
        }
    }

    /// Wraps a function over concrete chunks, handling the erasure on both sides.
    pub fn typed<I, O, F>(name: &'static str, f: F) -> Self
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(Vec<I>) -> anyhow::Result<Vec<(Key, Vec<O>)>> + Send + Sync + 'static,
    {
        Self::new(name, move |chunk| {
            let input = downcast::<I>(chunk)?;
            Ok(f(input)?
                .into_iter()
                .map(|(key, out)| KeyedChunk::new(key, boxed(out)))
                .collect())
        })
    }

    /// Same as [`typed`](Self::typed) for stages emitting a single unkeyed chunk.
    pub fn unkeyed<I, O, F>(name: &'static str, f: F) -> Self
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(Vec<I>) -> anyhow::Result<Vec<O>> + Send + Sync + 'static,
    {
        Self::typed(name, move |chunk: Vec<I>| Ok(vec![(Key::NoKey, f(chunk)?)]))
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn apply(&self, chunk: BoxedChunk) -> anyhow::Result<Vec<KeyedChunk>> {
        (self.apply)(chunk)
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer").field("name", &self.name).finish()
    }
}

/// Frozen, ordered layer list shared read-only by every worker of a session.
#[derive(Clone, Debug)]
pub struct Pipeline {
    layers: Arc<[Layer]>,
}

impl Pipeline {
    pub fn freeze(layers: Vec<Layer>) -> StreamResult<Self> {
        if layers.is_empty() {
            return Err(StreamError::invariant("pipeline has no terminal layer"));
        }
        Ok(Self {
            layers: layers.into(),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    #[inline]
    pub fn get(&self, stage: usize) -> Option<&Layer> {
        self.layers.get(stage)
    }

    /// The last stage feeds the sink instead of the queues.
    #[inline]
    pub fn is_sink_stage(&self, stage: usize) -> bool {
        stage + 1 == self.layers.len()
    }

    pub fn describe(&self) -> String {
        self.layers
            .iter()
            .map(|l| l.name)
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_layer_round_trips_erasure() {
        let layer = Layer::unkeyed("double", |v: Vec<i32>| {
            Ok(v.into_iter().map(|x| x * 2).collect::<Vec<_>>())
        });
        let out = layer.apply(boxed(vec![1, 2, 3])).expect("applies");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key, Key::NoKey);
        let chunk = out.into_iter().next().expect("one chunk").chunk;
        assert_eq!(downcast::<i32>(chunk).expect("i32"), vec![2, 4, 6]);
    }

    #[test]
    fn wrong_input_type_surfaces_as_stream_error() {
        let layer = Layer::unkeyed("len", |v: Vec<String>| Ok(vec![v.len()]));
        let err = layer.apply(boxed(vec![1u8])).expect_err("mismatch");
        assert!(matches!(
            err.downcast_ref::<StreamError>(),
            Some(StreamError::InvariantViolation(_))
        ));
    }

    #[test]
    fn empty_pipeline_is_rejected() {
        assert!(Pipeline::freeze(Vec::new()).is_err());
    }
}
