//! Batched, overlap-aware iteration over lazily fetched log chunks.
//!
//! A query over many stored chunks is consumed in batches: a background planner walks the chunks
//! in time order, a fixed number at a time, loads their payloads and drops the series that do not
//! satisfy the query. [`BatchIterator`] then merges the items of every batch into a single
//! ordered stream, see [`new_log_batch_iterator`] and [`new_sample_batch_iterator`].
//!
//! Chunks that straddle two batches are carried over, so that overlapping chunks are always
//! iterated together and their duplicated entries emitted once.
//!
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

mod chunk;
mod config;
mod context;
mod error;
mod fetch;
mod item;
mod labels;
mod matcher;
mod merge;
mod metrics;
mod pipeline;
mod planner;
mod query;
mod stream;
mod time;

pub mod partition;

#[cfg(any(test, feature = "testing"))]
#[doc(hidden)]
pub mod test_util;

pub use self::chunk::{Block, ChunkData, ChunkRef, LazyChunk, RawEntry};
pub use self::config::BatchIteratorConfig;
pub use self::context::{CancelCause, QueryContext, QueryStats};
pub use self::error::{
    BatchError, BatchResult, ConfigError, ConfigResult, FetchError, FetchResult,
};
pub use self::fetch::{
    DefaultExternalKeyer, ExternalKeyer, FetchedChunk, Fetcher, SeriesFilter,
    fetch_chunks_by_series,
};
pub use self::item::{Entry, Labeled, Sample, StreamItem};
pub use self::labels::{Fingerprint, Labels, METRIC_NAME_LABEL, SHARD_LABEL};
pub use self::matcher::{LabelMatcher, MatchType, MatcherError, remove_reserved_matchers};
pub use self::merge::{LabeledIter, MergeIterator, MergeMode, non_overlapping};
pub use self::metrics::{ChunkMetrics, MatchStatus, NoopChunkMetrics, OtelChunkMetrics};
pub use self::partition::{ChunksBySeries, DisjointSequence};
pub use self::pipeline::{
    CountOverTimeExtractor, ExtractedSample, Filterer, IdentityPipeline, LineContainsPipeline,
    LineLengthExtractor, Pipeline, ProcessedLine, SampleExtractor, StreamPipeline,
    StreamSampleExtractor,
};
pub use self::planner::{BatchChunkIterator, ChunkBatch, sort_chunks};
pub use self::query::{ChunkBatchQuery, filter_chunk_refs_by_time};
pub use self::stream::{
    BatchIterator, EntryBatchIterator, SampleBatchIterator, WindowIteratorBuilder,
    new_log_batch_iterator, new_sample_batch_iterator,
};
pub use self::time::{Direction, TimeBounds, TimeInt};
