use std::sync::Arc;

use re_log::ResultExt as _;

use crate::{
    BatchIteratorConfig, ChunkMetrics, Direction, Filterer, LabelMatcher, LazyChunk, MatchStatus,
    TimeInt,
};

/// Everything a batched chunk stream needs to know about the query it serves.
#[derive(Clone)]
pub struct ChunkBatchQuery {
    pub chunks: Vec<Arc<LazyChunk>>,

    /// Chunk references fetched per batch, see [`BatchIteratorConfig::batch_size`].
    pub batch_size: usize,

    pub direction: Direction,

    /// Inclusive.
    pub start: TimeInt,

    /// Exclusive, unless equal to `start`.
    pub end: TimeInt,

    /// Series must satisfy all of these.
    pub matchers: Vec<LabelMatcher>,

    pub filterer: Option<Arc<dyn Filterer>>,
}

impl std::fmt::Debug for ChunkBatchQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkBatchQuery")
            .field("num_chunks", &self.chunks.len())
            .field("batch_size", &self.batch_size)
            .field("direction", &self.direction)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("matchers", &self.matchers)
            .field("has_filterer", &self.filterer.is_some())
            .finish()
    }
}

impl ChunkBatchQuery {
    /// A forward query over `[start, end)`, sized by [`BatchIteratorConfig::from_env`].
    pub fn new(
        chunks: Vec<Arc<LazyChunk>>,
        start: impl Into<TimeInt>,
        end: impl Into<TimeInt>,
    ) -> Self {
        let config = BatchIteratorConfig::from_env()
            .warn_on_err_once("Failed to read chunk batch config from environment")
            .unwrap_or_default();

        Self {
            chunks,
            batch_size: config.batch_size,
            direction: Direction::Forward,
            start: start.into(),
            end: end.into(),
            matchers: Vec::new(),
            filterer: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_matchers(mut self, matchers: impl IntoIterator<Item = LabelMatcher>) -> Self {
        self.matchers = matchers.into_iter().collect();
        self
    }

    #[inline]
    #[must_use]
    pub fn with_filterer(mut self, filterer: impl Filterer + 'static) -> Self {
        self.filterer = Some(Arc::new(filterer));
        self
    }
}

/// Drops the chunks whose span cannot intersect `[start, end]`.
///
/// Reports both kept and dropped chunks to [`ChunkMetrics::add_chunk_refs`].
pub fn filter_chunk_refs_by_time(
    chunks: Vec<Arc<LazyChunk>>,
    start: TimeInt,
    end: TimeInt,
    metrics: &dyn ChunkMetrics,
) -> Vec<Arc<LazyChunk>> {
    let num_chunks = chunks.len();

    let kept: Vec<_> = chunks
        .into_iter()
        .filter(|chunk| chunk.from() <= end && chunk.through() >= start)
        .collect();

    metrics.add_chunk_refs(MatchStatus::Matched, kept.len() as u64);
    metrics.add_chunk_refs(MatchStatus::Discarded, (num_chunks - kept.len()) as u64);

    kept
}
