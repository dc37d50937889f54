//! Ordered streams of entries and samples over batched chunks.

use std::sync::Arc;

use itertools::Itertools as _;

use crate::fetch::series_labels;
use crate::merge::{LabeledIter, MergeIterator, MergeMode, non_overlapping};
use crate::partition::{ChunksBySeries, DisjointSequence};
use crate::{
    BatchChunkIterator, BatchError, BatchResult, ChunkBatch, ChunkBatchQuery, ChunkMetrics,
    Direction, Entry, ExternalKeyer, Labeled, METRIC_NAME_LABEL, Pipeline, QueryContext, Sample,
    SampleExtractor, StreamItem, filter_chunk_refs_by_time,
};

/// Turns a [`ChunkBatch`] into an ordered stream of items.
pub trait WindowIteratorBuilder<T: StreamItem>: Send {
    fn build(&mut self, batch: &ChunkBatch) -> BatchResult<LabeledIter<T>>;
}

/// The series of a batch. Shuffled in tests, since nothing may depend on map order.
fn series_of(chunks_by_series: &ChunksBySeries) -> Vec<&Vec<DisjointSequence>> {
    let series = chunks_by_series.values().collect_vec();

    #[cfg(test)]
    let series = {
        use rand::seq::SliceRandom as _;
        let mut series = series;
        series.shuffle(&mut rand::rng());
        series
    };

    series
}

fn merge_series<T: StreamItem>(
    mut per_series: Vec<LabeledIter<T>>,
    direction: Direction,
) -> LabeledIter<T> {
    if per_series.len() == 1
        && let Some(series) = per_series.pop()
    {
        return series;
    }
    Box::new(MergeIterator::new(per_series, direction, MergeMode::Sort))
}

struct EntryWindowBuilder {
    pipeline: Arc<dyn Pipeline>,
    direction: Direction,
}

impl WindowIteratorBuilder<Entry> for EntryWindowBuilder {
    fn build(&mut self, batch: &ChunkBatch) -> BatchResult<LabeledIter<Entry>> {
        re_tracing::profile_function!();

        let next_chunk = batch.next_chunk.as_deref();

        let mut per_series = Vec::with_capacity(batch.chunks_by_series.len());
        for sequences in series_of(&batch.chunks_by_series) {
            re_tracing::profile_scope!("series");
            let Some(labels) = series_labels(sequences) else {
                continue;
            };
            let mut pipeline = self.pipeline.for_stream(&labels.without(METRIC_NAME_LABEL));

            let mut per_sequence = Vec::with_capacity(sequences.len());
            for sequence in sequences {
                let mut lists = Vec::with_capacity(sequence.len());
                for chunk in sequence.iter().filter(|chunk| chunk.is_valid()) {
                    lists.push(chunk.entries(
                        batch.bounds,
                        self.direction,
                        pipeline.as_mut(),
                        next_chunk,
                    )?);
                }
                if self.direction == Direction::Backward {
                    lists.reverse();
                }
                per_sequence.push(non_overlapping(lists));
            }

            per_series.push(Box::new(MergeIterator::new(
                per_sequence,
                self.direction,
                MergeMode::Dedupe,
            )) as LabeledIter<Entry>);
        }

        Ok(merge_series(per_series, self.direction))
    }
}

struct SampleWindowBuilder {
    extractors: Vec<Arc<dyn SampleExtractor>>,
}

impl WindowIteratorBuilder<Sample> for SampleWindowBuilder {
    fn build(&mut self, batch: &ChunkBatch) -> BatchResult<LabeledIter<Sample>> {
        re_tracing::profile_function!();

        let next_chunk = batch.next_chunk.as_deref();

        let mut per_series = Vec::with_capacity(batch.chunks_by_series.len());
        for sequences in series_of(&batch.chunks_by_series) {
            re_tracing::profile_scope!("series");
            let Some(labels) = series_labels(sequences) else {
                continue;
            };
            let labels = labels.without(METRIC_NAME_LABEL);
            let mut extractors = self
                .extractors
                .iter()
                .map(|extractor| extractor.for_stream(&labels))
                .collect_vec();

            let mut per_sequence = Vec::with_capacity(sequences.len());
            for sequence in sequences {
                let mut lists = Vec::with_capacity(sequence.len());
                for chunk in sequence.iter().filter(|chunk| chunk.is_valid()) {
                    lists.push(chunk.samples(batch.bounds, &mut extractors, next_chunk)?);
                }
                per_sequence.push(non_overlapping(lists));
            }

            per_series.push(Box::new(MergeIterator::new(
                per_sequence,
                Direction::Forward,
                MergeMode::Dedupe,
            )) as LabeledIter<Sample>);
        }

        Ok(Box::new(MergeIterator::new(
            per_series,
            Direction::Forward,
            MergeMode::Sort,
        )))
    }
}

// ---

/// A cursor over the ordered items of a query, hiding batch boundaries.
///
/// ```text
/// while it.next() {
///     let item = it.at();
/// }
/// it.err()
/// ```
///
/// Dropping the iterator closes it.
pub struct BatchIterator<T: StreamItem> {
    /// Cancelled by [`Self::close`].
    ctx: QueryContext,

    planner: BatchChunkIterator,
    builder: Box<dyn WindowIteratorBuilder<T>>,

    /// Items of the current batch.
    curr: Option<LabeledIter<T>>,
    at: Option<Labeled<T>>,
    err: Option<BatchError>,
}

/// Log entries, see [`new_log_batch_iterator`].
pub type EntryBatchIterator = BatchIterator<Entry>;

/// Metric samples, see [`new_sample_batch_iterator`].
pub type SampleBatchIterator = BatchIterator<Sample>;

impl<T: StreamItem> BatchIterator<T> {
    fn new(
        ctx: &QueryContext,
        keyer: Arc<dyn ExternalKeyer>,
        metrics: Arc<dyn ChunkMetrics>,
        mut query: ChunkBatchQuery,
        builder: Box<dyn WindowIteratorBuilder<T>>,
    ) -> Self {
        let ctx = ctx.child();

        query.chunks = filter_chunk_refs_by_time(
            std::mem::take(&mut query.chunks),
            query.start,
            query.end,
            metrics.as_ref(),
        );

        Self {
            planner: BatchChunkIterator::new(ctx.clone(), keyer, metrics, query),
            ctx,
            builder,
            curr: None,
            at: None,
            err: None,
        }
    }

    /// Moves to the next item. Returns `false` once exhausted, failed, or closed.
    pub fn next(&mut self) -> bool {
        self.at = None;

        if self.err.is_some() {
            return false;
        }

        while !self.ctx.is_done() {
            if let Some(item) = self.curr.as_mut().and_then(|curr| curr.next()) {
                self.at = Some(item);
                return true;
            }
            self.curr = None;

            let batch = match self.planner.next() {
                Some(Ok(batch)) => batch,
                Some(Err(err)) => {
                    self.err = Some(err);
                    return false;
                }
                None => return false,
            };

            match self.builder.build(&batch) {
                Ok(curr) => self.curr = Some(curr),
                Err(err) => {
                    self.err = Some(err);
                    return false;
                }
            }
        }

        false
    }

    /// The current item, once [`Self::next`] returned `true`.
    #[inline]
    pub fn at(&self) -> Option<&Labeled<T>> {
        self.at.as_ref()
    }

    /// The labels of the current item.
    #[inline]
    pub fn labels(&self) -> Option<&str> {
        self.at.as_ref().map(|item| item.labels.as_ref())
    }

    /// The stream hash of the current item.
    #[inline]
    pub fn stream_hash(&self) -> Option<u64> {
        self.at.as_ref().map(|item| item.stream_hash)
    }

    /// Why the stream stopped early, if it did.
    ///
    /// A plain cancellation, e.g. through [`Self::close`], is not an error.
    pub fn err(&self) -> Option<BatchError> {
        if let Some(err) = &self.err {
            return Some(err.clone());
        }

        self.ctx
            .err()
            .filter(|cause| cause.is_error())
            .map(BatchError::Cancelled)
    }

    /// Stops the background planning and releases the current batch.
    ///
    /// Idempotent.
    pub fn close(&mut self) {
        self.ctx.cancel();
        self.curr = None;
        self.at = None;
    }

    /// Consumes the remaining items.
    ///
    /// Check [`Self::err`] once this is exhausted.
    pub fn items(&mut self) -> impl Iterator<Item = Labeled<T>> + '_ {
        std::iter::from_fn(move || if self.next() { self.at.clone() } else { None })
    }
}

impl<T: StreamItem> Drop for BatchIterator<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// An ordered stream of the log entries of `query`, as produced by `pipeline`.
pub fn new_log_batch_iterator(
    ctx: &QueryContext,
    keyer: Arc<dyn ExternalKeyer>,
    metrics: Arc<dyn ChunkMetrics>,
    query: ChunkBatchQuery,
    pipeline: Arc<dyn Pipeline>,
) -> EntryBatchIterator {
    let builder = EntryWindowBuilder {
        pipeline,
        direction: query.direction,
    };
    BatchIterator::new(ctx, keyer, metrics, query, Box::new(builder))
}

/// An ordered stream of the samples of `query`, as produced by all `extractors`.
///
/// Samples are always iterated forward, whatever the direction of `query`.
pub fn new_sample_batch_iterator(
    ctx: &QueryContext,
    keyer: Arc<dyn ExternalKeyer>,
    metrics: Arc<dyn ChunkMetrics>,
    query: ChunkBatchQuery,
    extractors: Vec<Arc<dyn SampleExtractor>>,
) -> SampleBatchIterator {
    let query = query.with_direction(Direction::Forward);
    let builder = SampleWindowBuilder { extractors };
    BatchIterator::new(ctx, keyer, metrics, query, Box::new(builder))
}
