use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng as _, SeedableRng as _};

use re_chunk_batch::test_util::{MemoryFetcher, RecordingChunkMetrics, chunk_data, chunk_ref};
use re_chunk_batch::{
    BatchError, CancelCause, ChunkBatchQuery, ChunkMetrics, ChunkRef, CountOverTimeExtractor,
    DefaultExternalKeyer, Direction, EntryBatchIterator, FetchError, FetchResult, FetchedChunk,
    Fetcher, IdentityPipeline, LabelMatcher, Labels, LazyChunk, MatchStatus, NoopChunkMetrics,
    QueryContext, new_log_batch_iterator, new_sample_batch_iterator,
};

/// Registers `[from, through]` spans of `labels` in `fetcher`, returning their unloaded chunks.
fn register(
    fetcher: &Arc<MemoryFetcher>,
    labels: &Labels,
    spans: &[(i64, i64)],
) -> Vec<Arc<LazyChunk>> {
    spans
        .iter()
        .map(|&(from, through)| {
            let chunk_ref = chunk_ref(labels, from, through);
            fetcher.insert(chunk_ref.clone(), chunk_data(labels, from..=through, 3));
            Arc::new(LazyChunk::new(chunk_ref, fetcher.clone()))
        })
        .collect()
}

fn log_iterator(
    ctx: &QueryContext,
    metrics: Arc<dyn ChunkMetrics>,
    query: ChunkBatchQuery,
) -> EntryBatchIterator {
    new_log_batch_iterator(
        ctx,
        Arc::new(DefaultExternalKeyer),
        metrics,
        query,
        Arc::new(IdentityPipeline),
    )
}

/// `(timestamp, labels)` of everything left in the stream.
fn drain(it: &mut EntryBatchIterator) -> Vec<(i64, String)> {
    it.items()
        .map(|item| (item.value.timestamp.as_i64(), item.labels.to_string()))
        .collect()
}

#[test]
fn forward_overlapping_chunks_are_deduplicated() -> anyhow::Result<()> {
    re_log::setup_logging();

    let labels = Labels::new([("app", "foo")]);
    let fetcher = Arc::new(MemoryFetcher::default());
    let chunks = register(&fetcher, &labels, &[(0, 9), (5, 14), (20, 29)]);

    let ctx = QueryContext::background();
    let mut it = log_iterator(
        &ctx,
        Arc::new(NoopChunkMetrics),
        ChunkBatchQuery::new(chunks, 0, 30).with_batch_size(2),
    );

    let timestamps: Vec<_> = drain(&mut it).into_iter().map(|(ts, _)| ts).collect();
    assert!(it.err().is_none());

    let expected: Vec<_> = (0..=14).chain(20..=29).collect();
    similar_asserts::assert_eq!(timestamps, expected);
    assert_eq!(ctx.stats().batches(), 2);
    assert_eq!(ctx.stats().chunks_downloaded(), 3);

    Ok(())
}

#[test]
fn backward_overlapping_chunks_are_deduplicated() -> anyhow::Result<()> {
    re_log::setup_logging();

    let labels = Labels::new([("app", "foo")]);
    let fetcher = Arc::new(MemoryFetcher::default());
    let chunks = register(&fetcher, &labels, &[(0, 9), (5, 14), (20, 29)]);

    let ctx = QueryContext::background();
    let mut it = log_iterator(
        &ctx,
        Arc::new(NoopChunkMetrics),
        ChunkBatchQuery::new(chunks, 0, 30)
            .with_batch_size(2)
            .with_direction(Direction::Backward),
    );

    let timestamps: Vec<_> = drain(&mut it).into_iter().map(|(ts, _)| ts).collect();
    assert!(it.err().is_none());

    let expected: Vec<_> = (20..=29).rev().chain((0..=14).rev()).collect();
    similar_asserts::assert_eq!(timestamps, expected);
    assert_eq!(ctx.stats().batches(), 2);

    Ok(())
}

#[test]
fn filtered_series_only_fetch_their_first_chunk() -> anyhow::Result<()> {
    re_log::setup_logging();

    let foo = Labels::new([("app", "foo")]);
    let bar = Labels::new([("app", "bar")]);
    let (foo_fetcher, bar_fetcher) = (
        Arc::new(MemoryFetcher::default()),
        Arc::new(MemoryFetcher::default()),
    );

    let mut chunks = register(&foo_fetcher, &foo, &[(0, 9), (10, 19)]);
    chunks.extend(register(&bar_fetcher, &bar, &[(0, 9), (10, 19), (20, 29)]));

    let metrics = Arc::new(RecordingChunkMetrics::default());
    let mut it = log_iterator(
        &QueryContext::background(),
        metrics.clone(),
        ChunkBatchQuery::new(chunks, 0, 100)
            .with_batch_size(5)
            .with_filterer(|labels: &Labels| labels.get("app") == "bar"),
    );

    let items = drain(&mut it);
    assert!(it.err().is_none());
    assert_eq!(items.len(), 20);
    assert!(items.iter().all(|(_, labels)| labels == r#"{app="foo"}"#));

    assert_eq!(bar_fetcher.num_fetched_chunks(), 1);
    assert_eq!(foo_fetcher.num_fetched_chunks(), 2);
    assert_eq!(metrics.series(MatchStatus::Discarded), 1);
    assert_eq!(metrics.chunks(MatchStatus::Discarded), 3);
    assert_eq!(metrics.series(MatchStatus::Matched), 1);
    assert_eq!(metrics.chunk_refs(MatchStatus::Matched), 5);

    Ok(())
}

#[test]
fn matchers_exclude_series() -> anyhow::Result<()> {
    re_log::setup_logging();

    let foo = Labels::new([("app", "foo"), ("env", "prod")]);
    let bar = Labels::new([("app", "bar"), ("env", "dev")]);
    let fetcher = Arc::new(MemoryFetcher::default());
    let mut chunks = register(&fetcher, &foo, &[(0, 4)]);
    chunks.extend(register(&fetcher, &bar, &[(0, 4)]));

    let mut it = log_iterator(
        &QueryContext::background(),
        Arc::new(NoopChunkMetrics),
        ChunkBatchQuery::new(chunks, 0, 100).with_matchers([
            LabelMatcher::regex("env", "prod|staging")?,
            // Reserved labels never exclude anything.
            LabelMatcher::equal(re_chunk_batch::SHARD_LABEL, "1_of_16"),
        ]),
    );

    let items = drain(&mut it);
    assert!(it.err().is_none());
    assert_eq!(items.len(), 5);
    let is_prod = |(_, labels): &(i64, String)| labels.contains(r#"env="prod""#);
    assert!(items.iter().all(is_prod));

    Ok(())
}

#[test]
fn cancellation_stops_the_stream() -> anyhow::Result<()> {
    re_log::setup_logging();

    let labels = Labels::new([("app", "foo")]);
    let spans: Vec<_> = (0..10).map(|i| (i * 10, i * 10 + 9)).collect();

    // With an explicit cause: reported.
    {
        let fetcher = Arc::new(MemoryFetcher::default());
        let ctx = QueryContext::background();
        let mut it = log_iterator(
            &ctx,
            Arc::new(NoopChunkMetrics),
            ChunkBatchQuery::new(register(&fetcher, &labels, &spans), 0, 100).with_batch_size(1),
        );

        for _ in 0..15 {
            assert!(it.next());
        }
        ctx.cancel_with_cause("client went away");

        assert!(!it.next());
        assert!(it.at().is_none());
        let Some(BatchError::Cancelled(CancelCause::Cause(reason))) = it.err() else {
            anyhow::bail!("expected a cancellation cause, got {:?}", it.err());
        };
        assert_eq!(reason.as_ref(), "client went away");
        assert!(fetcher.num_calls() < spans.len());
    }

    // Plain cancellation: a clean stop.
    {
        let fetcher = Arc::new(MemoryFetcher::default());
        let ctx = QueryContext::background();
        let mut it = log_iterator(
            &ctx,
            Arc::new(NoopChunkMetrics),
            ChunkBatchQuery::new(register(&fetcher, &labels, &spans), 0, 100).with_batch_size(1),
        );

        assert!(it.next());
        ctx.cancel();
        assert!(!it.next());
        assert!(it.err().is_none());
    }

    // Expired deadline.
    {
        let fetcher = Arc::new(MemoryFetcher::default());
        let ctx = QueryContext::background().with_timeout(Duration::ZERO);
        let mut it = log_iterator(
            &ctx,
            Arc::new(NoopChunkMetrics),
            ChunkBatchQuery::new(register(&fetcher, &labels, &spans), 0, 100),
        );

        assert!(!it.next());
        assert!(matches!(
            it.err(),
            Some(BatchError::Cancelled(CancelCause::DeadlineExceeded))
        ));
    }

    Ok(())
}

#[test]
fn cancellation_during_a_fetch_discards_the_batch() -> anyhow::Result<()> {
    re_log::setup_logging();

    let labels = Labels::new([("app", "foo")]);
    let spans: Vec<_> = (0..10).map(|i| (i * 10, i * 10 + 9)).collect();

    // Cancelled while loading the first batch: nothing at all is emitted.
    {
        let fetcher = Arc::new(MemoryFetcher::default());
        fetcher.cancel_on_call(1, None);
        let mut it = log_iterator(
            &QueryContext::background(),
            Arc::new(NoopChunkMetrics),
            ChunkBatchQuery::new(register(&fetcher, &labels, &spans), 0, 100).with_batch_size(1),
        );

        assert!(!it.next());
        assert!(it.at().is_none());
        assert!(it.err().is_none());
        assert_eq!(fetcher.num_calls(), 1);
    }

    // Cancelled with a cause while loading the second batch: only the first one can be seen.
    {
        let fetcher = Arc::new(MemoryFetcher::default());
        fetcher.cancel_on_call(2, Some("client went away"));
        let mut it = log_iterator(
            &QueryContext::background(),
            Arc::new(NoopChunkMetrics),
            ChunkBatchQuery::new(register(&fetcher, &labels, &spans), 0, 100).with_batch_size(1),
        );

        let items = drain(&mut it);
        assert!(items.len() <= 10, "{items:?}");
        assert!(items.iter().all(|&(ts, _)| ts < 10), "{items:?}");

        assert!(!it.next());
        let Some(BatchError::Cancelled(CancelCause::Cause(reason))) = it.err() else {
            anyhow::bail!("expected a cancellation cause, got {:?}", it.err());
        };
        assert_eq!(reason.as_ref(), "client went away");
        assert_eq!(fetcher.num_calls(), 2);
    }

    Ok(())
}

#[test]
fn checksum_errors_drop_the_series_silently() -> anyhow::Result<()> {
    re_log::setup_logging();

    let foo = Labels::new([("app", "foo")]);
    let bar = Labels::new([("app", "bar")]);
    let (foo_fetcher, bar_fetcher) = (
        Arc::new(MemoryFetcher::default()),
        Arc::new(MemoryFetcher::default()),
    );
    let mut chunks = register(&foo_fetcher, &foo, &[(0, 9)]);
    chunks.extend(register(&bar_fetcher, &bar, &[(0, 9)]));

    foo_fetcher.fail_with(FetchError::InvalidChecksum {
        key: chunks[0].chunk_ref().to_string(),
    });

    let mut it = log_iterator(
        &QueryContext::background(),
        Arc::new(NoopChunkMetrics),
        ChunkBatchQuery::new(chunks, 0, 100),
    );

    let items = drain(&mut it);
    assert!(it.err().is_none());
    assert_eq!(items.len(), 10);
    assert!(items.iter().all(|(_, labels)| labels == r#"{app="bar"}"#));

    Ok(())
}

#[test]
fn storage_errors_end_the_stream() -> anyhow::Result<()> {
    re_log::setup_logging();

    let labels = Labels::new([("app", "foo")]);
    let fetcher = Arc::new(MemoryFetcher::default());
    let chunks = register(&fetcher, &labels, &[(0, 9), (10, 19)]);
    let err = std::io::Error::other("bucket unavailable");
    fetcher.fail_with(FetchError::storage(err));

    let mut it = log_iterator(
        &QueryContext::background(),
        Arc::new(NoopChunkMetrics),
        ChunkBatchQuery::new(chunks, 0, 100).with_batch_size(1),
    );

    assert!(!it.next());
    assert!(matches!(
        it.err(),
        Some(BatchError::Fetch(FetchError::Storage(_)))
    ));

    // The error sticks.
    assert!(!it.next());
    assert!(it.err().is_some());
    assert_eq!(fetcher.num_calls(), 1);

    Ok(())
}

struct PanickingFetcher;

impl Fetcher for PanickingFetcher {
    fn fetch_chunks(
        &self,
        _ctx: &QueryContext,
        _chunks: &[ChunkRef],
    ) -> FetchResult<Vec<FetchedChunk>> {
        panic!("corrupted index");
    }
}

#[test]
fn panics_become_errors() -> anyhow::Result<()> {
    re_log::setup_logging();

    let labels = Labels::new([("app", "foo")]);
    let chunks = vec![Arc::new(LazyChunk::new(
        chunk_ref(&labels, 0, 9),
        Arc::new(PanickingFetcher),
    ))];

    let mut it = log_iterator(
        &QueryContext::background(),
        Arc::new(NoopChunkMetrics),
        ChunkBatchQuery::new(chunks, 0, 100),
    );

    assert!(!it.next());
    match it.err() {
        Some(BatchError::Panic { reason }) => assert_eq!(reason, "corrupted index"),
        err => anyhow::bail!("expected a panic error, got {err:?}"),
    }

    Ok(())
}

#[test]
fn instant_queries_return_a_single_instant() -> anyhow::Result<()> {
    re_log::setup_logging();

    let foo = Labels::new([("app", "foo")]);
    let bar = Labels::new([("app", "bar")]);

    for direction in [Direction::Forward, Direction::Backward] {
        let fetcher = Arc::new(MemoryFetcher::default());
        let mut chunks = register(&fetcher, &foo, &[(0, 9), (5, 14)]);
        chunks.extend(register(&fetcher, &bar, &[(7, 20)]));

        let mut it = log_iterator(
            &QueryContext::background(),
            Arc::new(NoopChunkMetrics),
            ChunkBatchQuery::new(chunks, 7, 7)
                .with_batch_size(1)
                .with_direction(direction),
        );

        similar_asserts::assert_eq!(
            drain(&mut it),
            vec![
                (7, r#"{app="bar"}"#.to_owned()),
                (7, r#"{app="foo"}"#.to_owned()),
            ],
            "{direction}"
        );
        assert!(it.err().is_none());
    }

    Ok(())
}

#[test]
fn samples_from_overlapping_chunks() -> anyhow::Result<()> {
    re_log::setup_logging();

    let foo = Labels::new([("app", "foo")]);
    let bar = Labels::new([("app", "bar")]);
    let fetcher = Arc::new(MemoryFetcher::default());
    let mut chunks = register(&fetcher, &foo, &[(0, 9), (5, 14)]);
    chunks.extend(register(&fetcher, &bar, &[(10, 12)]));

    let mut it = new_sample_batch_iterator(
        &QueryContext::background(),
        Arc::new(DefaultExternalKeyer),
        Arc::new(NoopChunkMetrics),
        ChunkBatchQuery::new(chunks, 0, 100).with_batch_size(1),
        vec![Arc::new(CountOverTimeExtractor)],
    );

    let samples: Vec<_> = it.items().collect();
    assert!(it.err().is_none());
    assert_eq!(samples.len(), 15 + 3);
    assert!(samples.iter().all(|sample| sample.value.value == 1.0));
    assert!(
        samples
            .windows(2)
            .all(|pair| pair[0].value.timestamp <= pair[1].value.timestamp)
    );

    Ok(())
}

// ---

/// The entries any correct plan must produce: every `(timestamp, labels)` within the query,
/// once, in direction order.
fn expected_entries(
    series: &[(Labels, Vec<(i64, i64)>)],
    start: i64,
    end: i64,
    direction: Direction,
) -> Vec<(i64, String)> {
    let in_query = |ts: i64| {
        if start == end {
            ts == start
        } else {
            start <= ts && ts < end
        }
    };

    let unique: BTreeSet<(i64, String)> = series
        .iter()
        .flat_map(|(labels, spans)| {
            spans.iter().flat_map(move |&(from, through)| {
                (from..=through)
                    .filter(move |&ts| in_query(ts))
                    .map(move |ts| (ts, labels.to_string()))
            })
        })
        .collect();

    let mut entries: Vec<_> = unique.into_iter().collect();
    if direction == Direction::Backward {
        // Descending time, but labels still ascending.
        entries.sort_by(|lhs, rhs| rhs.0.cmp(&lhs.0).then_with(|| lhs.1.cmp(&rhs.1)));
    }
    entries
}

fn random_series(rng: &mut SmallRng) -> Vec<(Labels, Vec<(i64, i64)>)> {
    ["api", "db", "web"]
        .into_iter()
        .map(|app| {
            let mut spans = BTreeSet::new();
            for _ in 0..rng.random_range(1..6) {
                let from = rng.random_range(0..80);
                spans.insert((from, from + rng.random_range(0..25)));
            }
            (Labels::new([("app", app)]), spans.into_iter().collect())
        })
        .collect()
}

#[test]
fn every_batch_size_yields_the_same_entries() -> anyhow::Result<()> {
    re_log::setup_logging();

    let mut rng = SmallRng::seed_from_u64(0xbadf00d);

    for _ in 0..8 {
        let series = random_series(&mut rng);
        let num_chunks: usize = series.iter().map(|(_, spans)| spans.len()).sum();

        let start = rng.random_range(-5..60);
        let end = if rng.random_bool(0.2) {
            start
        } else {
            rng.random_range(start + 1..120)
        };

        for direction in [Direction::Forward, Direction::Backward] {
            let expected = expected_entries(&series, start, end, direction);

            for batch_size in 1..=num_chunks {
                // Fresh chunks every time: one fetcher per series.
                let mut chunks = Vec::with_capacity(num_chunks);
                for (labels, spans) in &series {
                    let fetcher = Arc::new(MemoryFetcher::default());
                    chunks.extend(register(&fetcher, labels, spans));
                }

                let mut it = log_iterator(
                    &QueryContext::background(),
                    Arc::new(NoopChunkMetrics),
                    ChunkBatchQuery::new(chunks, start, end)
                        .with_batch_size(batch_size)
                        .with_direction(direction),
                );

                let entries = drain(&mut it);
                assert!(it.err().is_none());
                similar_asserts::assert_eq!(
                    entries,
                    expected,
                    "{direction} [{start}, {end}) with batches of {batch_size}: {series:?}"
                );
            }
        }
    }

    Ok(())
}

#[test]
fn closing_stops_the_planner() {
    re_log::setup_logging();

    let labels = Labels::new([("app", "foo")]);
    let fetcher = Arc::new(MemoryFetcher::default());
    let spans: Vec<_> = (0..10).map(|i| (i * 10, i * 10 + 9)).collect();
    let mut it = log_iterator(
        &QueryContext::background(),
        Arc::new(NoopChunkMetrics),
        ChunkBatchQuery::new(register(&fetcher, &labels, &spans), 0, 100).with_batch_size(1),
    );

    assert!(it.next());
    drop(it);

    // The planner thread is at most one batch ahead, and exits on its own.
    std::thread::sleep(Duration::from_millis(50));
    assert!(fetcher.num_calls() <= 2, "{}", fetcher.num_calls());
}
