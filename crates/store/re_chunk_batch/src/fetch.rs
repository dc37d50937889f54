//! Loading chunk payloads and dropping the series a query does not select.

use std::sync::Arc;
use std::time::Instant;

use itertools::Itertools as _;
use rayon::prelude::*;

use crate::partition::{ChunksBySeries, DisjointSequence, partition_by_series};
use crate::{
    BatchResult, ChunkData, ChunkMetrics, ChunkRef, FetchResult, Filterer, Fingerprint,
    LabelMatcher, Labels, LazyChunk, MatchStatus, QueryContext,
};

/// A payload returned by a [`Fetcher`].
#[derive(Clone, Debug)]
pub struct FetchedChunk {
    pub chunk_ref: ChunkRef,
    pub data: Arc<ChunkData>,
}

/// Loads chunk payloads from storage.
pub trait Fetcher: Send + Sync {
    /// Fetches the given chunks in bulk.
    ///
    /// Results may come back in any order. Chunks missing from the result stay unloaded.
    fn fetch_chunks(&self, ctx: &QueryContext, refs: &[ChunkRef]) -> FetchResult<Vec<FetchedChunk>>;
}

/// Derives the storage key of a chunk, used to match fetched payloads with their references.
pub trait ExternalKeyer: Send + Sync {
    fn external_key(&self, chunk_ref: &ChunkRef) -> String;
}

/// `{user}/{fingerprint}:{from}:{through}:{checksum}`, all in hex.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultExternalKeyer;

impl ExternalKeyer for DefaultExternalKeyer {
    #[inline]
    fn external_key(&self, chunk_ref: &ChunkRef) -> String {
        chunk_ref.to_string()
    }
}

// ---

/// The series-level predicates of a query.
#[derive(Clone, Copy)]
pub struct SeriesFilter<'a> {
    /// Must not contain matchers on reserved labels, see [`crate::remove_reserved_matchers`].
    pub matchers: &'a [LabelMatcher],
    pub filterer: Option<&'a dyn Filterer>,
}

impl SeriesFilter<'_> {
    fn keeps(&self, labels: &Labels) -> bool {
        self.matchers
            .iter()
            .all(|matcher| matcher.matches_labels(labels))
            && !self
                .filterer
                .is_some_and(|filterer| filterer.should_filter(labels))
    }
}

/// Loads the chunks of one batch, grouped by series, dropping the series that `filter` rejects.
///
/// Only the first chunk of every sequence is loaded before filtering, so that rejected series
/// cost a single fetch per sequence.
pub fn fetch_chunks_by_series(
    ctx: &QueryContext,
    keyer: &dyn ExternalKeyer,
    metrics: &dyn ChunkMetrics,
    chunks: &[Arc<LazyChunk>],
    filter: SeriesFilter<'_>,
) -> BatchResult<ChunksBySeries> {
    re_tracing::profile_function!();

    let mut chunks_by_series = partition_by_series(chunks);

    load_first_chunks(ctx, keyer, &chunks_by_series)?;

    let undecided = filter_series(&mut chunks_by_series, filter, metrics);

    let all_chunks = chunks_by_series
        .values()
        .flatten()
        .flatten()
        .cloned()
        .collect_vec();
    fetch_lazy_chunks(ctx, keyer, &all_chunks)?;

    // Series whose first chunks all failed to load could not be filtered yet.
    if !undecided.is_empty() {
        re_tracing::profile_scope!("filter_undecided_series");
        let mut late: ChunksBySeries = undecided
            .iter()
            .filter_map(|fingerprint| chunks_by_series.remove_entry(fingerprint))
            .collect();
        filter_series(&mut late, filter, metrics);
        chunks_by_series.extend(late);
    }

    let num_series = chunks_by_series.len() as u64;
    let num_chunks: usize = chunks_by_series
        .values()
        .flatten()
        .map(|sequence| sequence.len())
        .sum();

    metrics.add_chunks(MatchStatus::Matched, num_chunks as u64);
    metrics.add_series(MatchStatus::Matched, num_series);
    metrics.observe_batch_size(MatchStatus::Matched, num_chunks as u64);
    metrics.observe_batch_size(
        MatchStatus::Discarded,
        chunks.len().saturating_sub(num_chunks) as u64,
    );

    Ok(chunks_by_series)
}

/// The labels of a series, read from the first of its chunks that is loaded.
pub(crate) fn series_labels(sequences: &[DisjointSequence]) -> Option<&Labels> {
    sequences.iter().flatten().find_map(|chunk| chunk.labels())
}

fn load_first_chunks(
    ctx: &QueryContext,
    keyer: &dyn ExternalKeyer,
    chunks_by_series: &ChunksBySeries,
) -> BatchResult<()> {
    let first_chunks = chunks_by_series
        .values()
        .flatten()
        .filter_map(|sequence| sequence.first().cloned())
        .collect_vec();
    fetch_lazy_chunks(ctx, keyer, &first_chunks)
}

/// Removes the series rejected by `filter`, and returns the ones without any loaded chunk.
fn filter_series(
    chunks_by_series: &mut ChunksBySeries,
    filter: SeriesFilter<'_>,
    metrics: &dyn ChunkMetrics,
) -> Vec<Fingerprint> {
    let mut undecided = Vec::new();
    let mut filtered_series = 0;
    let mut filtered_chunks = 0;

    chunks_by_series.retain(|fingerprint, sequences| {
        let Some(labels) = series_labels(sequences) else {
            undecided.push(*fingerprint);
            return true;
        };

        let keep = filter.keeps(labels);
        if !keep {
            filtered_series += 1;
            filtered_chunks += sequences
                .iter()
                .map(|sequence| sequence.len() as u64)
                .sum::<u64>();
        }
        keep
    });

    metrics.add_chunks(MatchStatus::Discarded, filtered_chunks);
    metrics.add_series(MatchStatus::Discarded, filtered_series);

    undecided
}

/// Loads every chunk that is not loaded yet, with one concurrent call per [`Fetcher`].
///
/// Every given chunk holding a non-empty payload afterwards is marked valid.
pub(crate) fn fetch_lazy_chunks(
    ctx: &QueryContext,
    keyer: &dyn ExternalKeyer,
    chunks: &[Arc<LazyChunk>],
) -> BatchResult<()> {
    re_tracing::profile_function!();

    if ctx.is_done() {
        return Ok(());
    }

    let mut chunks_by_fetcher: Vec<(&Arc<dyn Fetcher>, Vec<&Arc<LazyChunk>>)> = Vec::new();
    for chunk in chunks.iter().filter(|chunk| !chunk.is_loaded()) {
        let group = chunks_by_fetcher
            .iter_mut()
            .find(|group| Arc::ptr_eq(group.0, chunk.fetcher()));
        match group {
            Some((_, group)) => group.push(chunk),
            None => chunks_by_fetcher.push((chunk.fetcher(), vec![chunk])),
        }
    }

    if chunks_by_fetcher.is_empty() {
        return Ok(());
    }

    let num_chunks: usize = chunks_by_fetcher.iter().map(|(_, group)| group.len()).sum();
    re_log::debug!(
        "loading {num_chunks} lazy chunks from {} fetchers",
        chunks_by_fetcher.len()
    );

    let start = Instant::now();
    let results = {
        re_tracing::profile_wait!("chunk_fetchers");
        chunks_by_fetcher
            .par_iter()
            .map(|(fetcher, group)| fetch_group(ctx, keyer, fetcher, group))
            .collect::<Vec<_>>()
    };

    let stats = ctx.stats();
    stats.add_chunks_download_time(start.elapsed());
    stats.add_chunks_downloaded(num_chunks as u64);

    if let Some(err) = results.into_iter().find_map(Result::err) {
        return Err(err);
    }

    for chunk in chunks {
        chunk.update_validity();
    }

    Ok(())
}

fn fetch_group(
    ctx: &QueryContext,
    keyer: &dyn ExternalKeyer,
    fetcher: &Arc<dyn Fetcher>,
    chunks: &[&Arc<LazyChunk>],
) -> BatchResult<()> {
    re_tracing::profile_function!();

    let mut index: ahash::HashMap<String, &LazyChunk> = ahash::HashMap::default();
    let mut chunk_refs = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        index.insert(keyer.external_key(chunk.chunk_ref()), chunk);
        chunk_refs.push(chunk.chunk_ref().clone());
    }

    let result = fetcher.fetch_chunks(ctx, &chunk_refs);

    // Whoever cancelled the query does not care about this batch anymore.
    if ctx.err().is_some() {
        return Ok(());
    }

    let fetched = match result {
        Ok(fetched) => fetched,

        Err(err) if err.is_invalid_chunk_error() => {
            re_log::warn!("checksum of chunks does not match: {err}");
            return Ok(());
        }

        Err(err) => {
            re_log::error!("error fetching chunks: {err}");
            return Err(err.into());
        }
    };

    // Fetchers do not guarantee any order.
    for FetchedChunk { chunk_ref, data } in fetched {
        match index.get(&keyer.external_key(&chunk_ref)) {
            Some(chunk) => {
                chunk.set_data(data);
            }
            None => re_log::warn_once!("fetcher returned an unrequested chunk: {chunk_ref}"),
        }
    }

    Ok(())
}
