#[cfg(test)]
mod tests {
    use crate::config::StreamConfig;
    use crate::error::StreamError;
    use crate::pipeline::{Source, Stream};
    use crate::sequential::SequentialStream;
    use crate::utils::*;
    use serde_json::json;
    use std::io::Write;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    const SHORT: Duration = Duration::from_secs(30);

    fn sorted<T: Ord>(mut v: Vec<T>) -> Vec<T> {
        v.sort();
        v
    }

    #[test]
    fn filter_then_map_sums_to_sixty() {
        let total: i32 = Stream::new(vec![1, 2, 3, 4, 5])
            .workers(2)
            .filter(|x| x % 2 == 0)
            .map(|x| x * 10)
            .sum()
            .expect("stream runs");
        assert_eq!(total, 60);
    }

    #[test]
    fn string_lengths_sum_to_six() {
        let total: usize = Stream::new(vec!["a", "bb", "ccc"])
            .map(|s| s.len())
            .sum()
            .expect("stream runs");
        assert_eq!(total, 6);
    }

    #[test]
    fn map_yields_the_sequential_multiset() {
        let input: Vec<u64> = (0..5_000).collect();
        let f = |x: u64| x.wrapping_mul(2_654_435_761) % 1_000;

        let parallel = Stream::new(input.clone())
            .workers(4)
            .chunk_size(37)
            .map(f)
            .to_vec()
            .expect("stream runs");
        let sequential: Vec<u64> = SequentialStream::new(input).map(f).collect();

        assert_eq!(sorted(parallel), sorted(sequential));
    }

    #[test]
    fn results_do_not_depend_on_workers_or_chunking() {
        let input: Vec<u32> = (0..600).map(|x| x % 97).collect();
        let expected_sum: u32 = input.iter().sum();
        let expected_distinct = 97;

        for workers in [1, 2, 8] {
            for chunk in [1, 10, 1000] {
                let stream = || {
                    Stream::new(input.clone())
                        .workers(workers)
                        .chunk_size(chunk)
                        .timeout(SHORT)
                };
                let ctx = format!("workers={workers} chunk={chunk}");

                assert_eq!(stream().sum::<u32>().expect("sum"), expected_sum, "{ctx}");
                assert_eq!(stream().count().expect("count"), input.len(), "{ctx}");
                assert_eq!(
                    stream().count_distinct().expect("distinct"),
                    expected_distinct,
                    "{ctx}"
                );
                assert!(stream().any(|x| *x == 96).expect("any"), "{ctx}");
                assert!(!stream().any(|x| *x > 96).expect("any"), "{ctx}");
                assert!(stream().all(|x| *x < 97).expect("all"), "{ctx}");
                assert!(!stream().all(|x| *x < 96).expect("all"), "{ctx}");
            }
        }
    }

    #[test]
    fn distinct_keeps_one_of_each() {
        for buckets in [1, 3, 64] {
            let out = Stream::new(vec![1, 2, 2, 3, 3, 3])
                .workers(2)
                .buckets(buckets)
                .distinct()
                .to_vec()
                .expect("stream runs");
            assert_eq!(sorted(out), vec![1, 2, 3], "buckets={buckets}");
        }
    }

    #[test]
    fn chained_keyed_stages_drain_completely() {
        let n = Stream::new(vec![5, 1, 5, 2, 2, 9, 1])
            .workers(3)
            .chunk_size(2)
            .distinct()
            .map(|x| x % 2)
            .distinct()
            .count()
            .expect("stream runs");
        assert_eq!(n, 2);
    }

    #[test]
    fn take_reads_a_bounded_prefix_of_infinite_input() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();

        let out = Stream::new(0u64..)
            .workers(2)
            .chunk_size(4)
            .peek(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .map(|x| x)
            .take(2)
            .expect("stream runs");

        assert_eq!(out.len(), 2);
        assert!(seen.load(Ordering::Relaxed) < 1_000_000);
    }

    #[test]
    fn take_returns_fewer_when_input_is_short() {
        let out = Stream::new(vec![7, 8, 9]).workers(2).take(10).expect("stream runs");
        assert_eq!(sorted(out), vec![7, 8, 9]);
        assert_eq!(Stream::new(vec![1]).take(0).expect("no-op"), Vec::<i32>::new());
        assert_eq!(Stream::new(vec![4]).take_one().expect("stream runs"), Some(4));
        assert_eq!(Stream::new(Vec::<u8>::new()).take_one().expect("stream runs"), None);
    }

    #[test]
    fn any_stops_early_on_a_match() {
        let started = Instant::now();
        let found = Stream::new(0..1_000_000u32)
            .workers(4)
            .chunk_size(1_000)
            .any(|x| *x == 5)
            .expect("stream runs");
        assert!(found);
        assert!(started.elapsed() < SHORT);
    }

    #[test]
    fn threads_are_released_after_success_and_failure() {
        let gauge = LiveGauge::new();

        let n = Stream::new(0..10_000)
            .workers(4)
            .with_gauge(gauge.clone())
            .count()
            .expect("stream runs");
        assert_eq!(n, 10_000);
        assert_eq!(gauge.get(), 0);

        let err = Stream::new(0..10_000)
            .workers(4)
            .chunk_size(10)
            .with_gauge(gauge.clone())
            .map(|x| if x == 1_234 { panic!("bad element") } else { x })
            .count()
            .expect_err("map panics");
        assert!(err.is_transform_failure());
        assert_eq!(gauge.get(), 0);

        let out = Stream::new(0u64..)
            .workers(3)
            .with_gauge(gauge.clone())
            .take(5)
            .expect("stream runs");
        assert_eq!(out.len(), 5);
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn panic_in_user_code_names_the_stage() {
        let err = Stream::new(vec![1, 2, 3, 4])
            .workers(2)
            .map(|x| x + 1)
            .map(|x| if x == 3 { panic!("three") } else { x })
            .to_vec()
            .expect_err("second map panics");

        match err {
            StreamError::TransformFailure {
                stage,
                layer,
                chunk_len,
                source,
            } => {
                assert_eq!(stage, 1);
                assert_eq!(layer, "map");
                assert!(chunk_len > 0);
                assert!(source.to_string().contains("three"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn try_map_errors_fail_the_stream() {
        let err = Stream::new(vec!["1", "2", "x", "4"])
            .try_map(|s| Ok(s.parse::<i32>()?))
            .sum::<i32>()
            .expect_err("x does not parse");
        assert!(matches!(
            err,
            StreamError::TransformFailure { layer: "try_map", stage: 0, .. }
        ));
    }

    #[test]
    fn failing_source_is_reported() {
        let src = Source::fallible(vec![Ok(1), Ok(2), Err(anyhow::anyhow!("disk gone"))]);
        let err = Stream::from_source(src)
            .workers(2)
            .count()
            .expect_err("source fails");
        assert!(matches!(err, StreamError::Source(_)));
    }

    #[test]
    fn lines_are_streamed_from_a_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "alpha").expect("write");
        writeln!(file, "be").expect("write");
        writeln!(file, "c").expect("write");
        file.flush().expect("flush");

        let total: usize = Stream::lines(file.path())
            .expect("file opens")
            .workers(2)
            .map(|line| line.len())
            .sum()
            .expect("stream runs");
        assert_eq!(total, 8);
    }

    #[test]
    fn config_loads_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".json")
            .tempfile()
            .expect("temp file");
        let body = json!({ "workers": 3, "chunk_size": 16, "buckets": 8 });
        write!(file, "{body}").expect("write");
        file.flush().expect("flush");

        let path = file.path().to_string_lossy().to_string();
        let cfg = StreamConfig::load(&path).expect("valid config");
        assert_eq!(cfg.workers, Some(3));
        assert_eq!(cfg.chunk_size, Some(16));
        assert_eq!(cfg.buckets(), 8);

        let n = Stream::new(0..100)
            .with_config(cfg)
            .distinct()
            .count()
            .expect("stream runs");
        assert_eq!(n, 100);
    }

    #[test]
    fn iterator_streams_every_result() {
        let mut out: Vec<i32> = Stream::new(0..1_000)
            .workers(3)
            .chunk_size(50)
            .map(|x| x * 2)
            .into_iter()
            .collect::<Result<_, _>>()
            .expect("no failure");
        out.sort();
        assert_eq!(out, (0..1_000).map(|x| x * 2).collect::<Vec<_>>());
    }

    #[test]
    fn iterator_ends_with_the_failure() {
        let items: Vec<_> = Stream::new(0..100)
            .workers(2)
            .chunk_size(10)
            .map(|x| if x == 55 { panic!("late") } else { x })
            .into_iter()
            .collect();
        let last = items.last().expect("at least the failure");
        assert!(matches!(last, Err(StreamError::TransformFailure { .. })));
        assert_eq!(items.iter().filter(|r| r.is_err()).count(), 1);
    }

    #[test]
    fn dropping_an_iterator_early_stops_the_stream() {
        let gauge = LiveGauge::new();
        let mut it = Stream::new(0u64..)
            .workers(2)
            .chunk_size(8)
            .with_gauge(gauge.clone())
            .iter()
            .expect("stream starts");

        for _ in 0..3 {
            it.next().expect("infinite input").expect("no failure");
        }
        drop(it);
        assert_eq!(gauge.get(), 0);
    }

    fn cancel_after(token: &CancelToken, delay: Duration) -> thread::JoinHandle<()> {
        let token = token.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            token.cancel();
        })
    }

    #[test]
    fn parent_token_cancels_a_running_stream() {
        let parent = CancelToken::new_root();
        let helper = cancel_after(&parent, Duration::from_millis(50));

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let err = Stream::new(0u64..)
            .workers(2)
            .with_cancel(&parent)
            .foreach(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .expect_err("caller cancelled");
        assert!(err.is_cancelled());

        helper.join().expect("helper thread");
        assert!(seen.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn parent_cancel_discards_partial_aggregates() {
        let parent = CancelToken::new_root();
        let helper = cancel_after(&parent, Duration::from_millis(50));

        let res = Stream::new(0u64..).workers(2).with_cancel(&parent).count();
        helper.join().expect("helper thread");
        assert!(matches!(res, Err(StreamError::Cancelled)));

        let live = CancelToken::new_root();
        let out = Stream::new(0u64..)
            .workers(2)
            .with_cancel(&live)
            .take(3)
            .expect("own short-circuit is not a cancellation");
        assert_eq!(out.len(), 3);
        assert!(!live.is_cancelled());
    }

    #[test]
    fn blocked_feed_surfaces_a_resource_timeout() {
        let gauge = LiveGauge::new();
        let err = Stream::new(0u32..16)
            .workers(1)
            .chunk_size(1)
            .max_pending_chunks(1)
            .timeout(Duration::from_millis(100))
            .with_gauge(gauge.clone())
            .map(|x| {
                thread::sleep(Duration::from_millis(300));
                x
            })
            .count()
            .expect_err("feed queue stays full");
        assert!(err.is_timeout(), "{err}");

        // a worker stuck in user code is detached, it still exits on its own
        let deadline = Instant::now() + SHORT;
        while gauge.get() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(gauge.get(), 0);
    }

    struct Naturals {
        next: u64,
        dropped: Arc<AtomicBool>,
    }

    impl Iterator for Naturals {
        type Item = u64;

        fn next(&mut self) -> Option<u64> {
            self.next += 1;
            Some(self.next - 1)
        }
    }

    impl Drop for Naturals {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::Release);
        }
    }

    #[test]
    fn source_is_released_when_take_cancels() {
        let dropped = Arc::new(AtomicBool::new(false));
        let naturals = Naturals {
            next: 0,
            dropped: dropped.clone(),
        };

        let out = Stream::new(naturals).workers(2).take(3).expect("stream runs");
        assert_eq!(out.len(), 3);
        assert!(dropped.load(Ordering::Acquire));
    }

    #[test]
    fn keyed_take_waits_for_the_end_of_input() {
        let out = Stream::new(0u64..100)
            .workers(2)
            .chunk_by_key(|x| x % 4)
            .take(2)
            .expect("finite keyed input");
        assert_eq!(out.len(), 2);

        let gauge = LiveGauge::new();
        let err = Stream::new(0u64..)
            .workers(2)
            .chunk_size(1)
            .timeout(Duration::from_millis(200))
            .with_gauge(gauge.clone())
            .chunk_by_key(|x| x % 4)
            .take(2)
            .expect_err("groups are never released");
        assert!(err.is_timeout(), "{err}");
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn folds_and_side_effects() {
        let data = vec![4, 9, 1, 7, 3];
        let stream = || Stream::new(data.clone()).workers(2).chunk_size(2);

        assert_eq!(stream().min().expect("min"), Some(1));
        assert_eq!(stream().max().expect("max"), Some(9));
        assert_eq!(stream().reduce(0, |a, b| a + b).expect("reduce"), 24);
        assert_eq!(
            stream()
                .reduce_once(|chunk| chunk.len())
                .sum::<usize>()
                .expect("sum"),
            5
        );
        assert_eq!(
            stream()
                .collect_with(|c| c.len(), |a, b| a + b, |n| n.unwrap_or(0) * 10)
                .expect("collect"),
            50
        );

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        stream()
            .foreach(move |x| {
                h.fetch_add(x as usize, Ordering::Relaxed);
            })
            .expect("foreach");
        assert_eq!(hits.load(Ordering::Relaxed), 24);
    }

    #[test]
    fn empty_input_yields_identities() {
        let stream = || Stream::new(Vec::<i64>::new()).workers(2);
        assert_eq!(stream().sum::<i64>().expect("sum"), 0);
        assert_eq!(stream().count().expect("count"), 0);
        assert_eq!(stream().min().expect("min"), None);
        assert_eq!(stream().reduce(7, |a, b| a + b).expect("reduce"), 7);
        assert!(!stream().any(|_| true).expect("any"));
        assert!(stream().all(|_| false).expect("all"));
    }

    #[test]
    fn limit_flat_map_and_shuffle() {
        let limited = Stream::new(0..1_000)
            .workers(4)
            .chunk_size(7)
            .limit(25)
            .count()
            .expect("stream runs");
        assert_eq!(limited, 25);

        let expanded = Stream::new(vec![1usize, 2, 3])
            .flat_map(|n| vec![n; n])
            .to_vec()
            .expect("stream runs");
        assert_eq!(sorted(expanded), vec![1, 2, 2, 3, 3, 3]);

        let input: Vec<u32> = (0..500).collect();
        let shuffled = Stream::new(input.clone())
            .workers(3)
            .buckets(5)
            .shuffle()
            .to_vec()
            .expect("stream runs");
        assert_eq!(sorted(shuffled), input);
    }
}
