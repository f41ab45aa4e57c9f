use std::iter::Sum;

/// Single-threaded lazy stream with the same surface as [`Stream`](crate::pipeline::Stream).
///
/// Used as the baseline in benchmarks and as the reference result in tests.
pub struct SequentialStream<'a, T> {
    iter: Box<dyn Iterator<Item = T> + 'a>,
}

impl<'a, T: 'a> SequentialStream<'a, T> {
    pub fn new<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: 'a,
    {
        Self {
            iter: Box::new(items.into_iter()),
        }
    }

    pub fn map<U: 'a, F>(self, f: F) -> SequentialStream<'a, U>
    where
        F: FnMut(T) -> U + 'a,
    {
        SequentialStream {
            iter: Box::new(self.iter.map(f)),
        }
    }

    pub fn filter<F>(self, f: F) -> Self
    where
        F: FnMut(&T) -> bool + 'a,
    {
        Self {
            iter: Box::new(self.iter.filter(f)),
        }
    }

    pub fn flat_map<U: 'a, I, F>(self, f: F) -> SequentialStream<'a, U>
    where
        I: IntoIterator<Item = U> + 'a,
        F: FnMut(T) -> I + 'a,
    {
        SequentialStream {
            iter: Box::new(self.iter.flat_map(f)),
        }
    }

    pub fn sum<S: Sum<T>>(self) -> S {
        self.iter.sum()
    }

    pub fn count(self) -> usize {
        self.iter.count()
    }

    pub fn foreach<F: FnMut(T)>(self, f: F) {
        self.iter.for_each(f)
    }

    pub fn collect<B: FromIterator<T>>(self) -> B {
        self.iter.collect()
    }
}

impl<'a, T: 'a> IntoIterator for SequentialStream<'a, T> {
    type Item = T;
    type IntoIter = Box<dyn Iterator<Item = T> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter
    }
}

#[cfg(test)]
mod tests {
    use super::SequentialStream;

    #[test]
    fn chains_lazily() {
        let total: i32 = SequentialStream::new(1..=5)
            .filter(|x| x % 2 == 0)
            .map(|x| x * 10)
            .sum();
        assert_eq!(total, 60);

        let words = SequentialStream::new(vec!["ab", "c"])
            .flat_map(|w| w.chars())
            .collect::<String>();
        assert_eq!(words, "abc");
        assert_eq!(SequentialStream::new(0u64..).map(|x| x * 2).into_iter().nth(3), Some(6));
    }
}
