//! In-memory collaborators, for tests.

use std::ops::RangeInclusive;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    ChunkData, ChunkMetrics, ChunkRef, FetchError, FetchResult, FetchedChunk, Fetcher, Labels,
    LazyChunk, MatchStatus, QueryContext, RawEntry, TimeInt,
};

/// Serves chunks from memory, counting calls.
#[derive(Default)]
pub struct MemoryFetcher {
    chunks: Mutex<ahash::HashMap<ChunkRef, Arc<ChunkData>>>,
    error: Mutex<Option<FetchError>>,
    cancel_on: Mutex<Option<(usize, Option<&'static str>)>>,
    num_calls: Mutex<usize>,
    num_fetched_chunks: Mutex<usize>,
}

impl MemoryFetcher {
    pub fn insert(&self, chunk_ref: ChunkRef, data: ChunkData) {
        self.chunks.lock().insert(chunk_ref, Arc::new(data));
    }

    /// All following calls fail with `err`.
    pub fn fail_with(&self, err: FetchError) {
        *self.error.lock() = Some(err);
    }

    /// The `call`-th call cancels its query before returning, with `cause` if any.
    pub fn cancel_on_call(&self, call: usize, cause: Option<&'static str>) {
        *self.cancel_on.lock() = Some((call, cause));
    }

    pub fn num_calls(&self) -> usize {
        *self.num_calls.lock()
    }

    /// Sum of the chunks returned by all calls.
    pub fn num_fetched_chunks(&self) -> usize {
        *self.num_fetched_chunks.lock()
    }
}

impl Fetcher for MemoryFetcher {
    fn fetch_chunks(
        &self,
        ctx: &QueryContext,
        chunk_refs: &[ChunkRef],
    ) -> FetchResult<Vec<FetchedChunk>> {
        let call = {
            let mut num_calls = self.num_calls.lock();
            *num_calls += 1;
            *num_calls
        };

        if let Some((cancel_on, cause)) = *self.cancel_on.lock()
            && cancel_on == call
        {
            match cause {
                Some(cause) => ctx.cancel_with_cause(cause),
                None => ctx.cancel(),
            }
        }

        if let Some(err) = self.error.lock().clone() {
            return Err(err);
        }

        let chunks = self.chunks.lock();
        let fetched: Vec<_> = chunk_refs
            .iter()
            .filter_map(|chunk_ref| {
                chunks.get(chunk_ref).map(|data| FetchedChunk {
                    chunk_ref: chunk_ref.clone(),
                    data: data.clone(),
                })
            })
            .collect();

        *self.num_fetched_chunks.lock() += fetched.len();
        Ok(fetched)
    }
}

// ---

#[derive(Default)]
struct Counts {
    chunk_refs: ahash::HashMap<MatchStatus, u64>,
    series: ahash::HashMap<MatchStatus, u64>,
    chunks: ahash::HashMap<MatchStatus, u64>,
    batch_sizes: ahash::HashMap<MatchStatus, Vec<u64>>,
}

/// Keeps everything reported to it.
#[derive(Default)]
pub struct RecordingChunkMetrics {
    counts: Mutex<Counts>,
}

impl RecordingChunkMetrics {
    pub fn chunk_refs(&self, status: MatchStatus) -> u64 {
        self.counts
            .lock()
            .chunk_refs
            .get(&status)
            .copied()
            .unwrap_or(0)
    }

    pub fn series(&self, status: MatchStatus) -> u64 {
        self.counts.lock().series.get(&status).copied().unwrap_or(0)
    }

    pub fn chunks(&self, status: MatchStatus) -> u64 {
        self.counts.lock().chunks.get(&status).copied().unwrap_or(0)
    }

    /// Every observed batch size, in order.
    pub fn batch_sizes(&self, status: MatchStatus) -> Vec<u64> {
        self.counts
            .lock()
            .batch_sizes
            .get(&status)
            .cloned()
            .unwrap_or_default()
    }
}

impl ChunkMetrics for RecordingChunkMetrics {
    fn add_chunk_refs(&self, status: MatchStatus, count: u64) {
        *self.counts.lock().chunk_refs.entry(status).or_default() += count;
    }

    fn add_series(&self, status: MatchStatus, count: u64) {
        *self.counts.lock().series.entry(status).or_default() += count;
    }

    fn add_chunks(&self, status: MatchStatus, count: u64) {
        *self.counts.lock().chunks.entry(status).or_default() += count;
    }

    fn observe_batch_size(&self, status: MatchStatus, size: u64) {
        self.counts
            .lock()
            .batch_sizes
            .entry(status)
            .or_default()
            .push(size);
    }
}

// ---

/// A reference to the chunk of `labels` spanning `[from, through]`.
pub fn chunk_ref(labels: &Labels, from: i64, through: i64) -> ChunkRef {
    ChunkRef {
        user_id: "fake".into(),
        fingerprint: labels.fingerprint(),
        from: TimeInt::new(from),
        through: TimeInt::new(through),
        checksum: 0,
    }
}

/// One entry per nanosecond of `timestamps`, reading `line {ts}`.
pub fn chunk_data(
    labels: &Labels,
    timestamps: RangeInclusive<i64>,
    entries_per_block: usize,
) -> ChunkData {
    let entries = timestamps
        .map(|ts| RawEntry::new(ts, format!("line {ts}")))
        .collect();
    ChunkData::with_block_size(labels.clone(), entries, entries_per_block)
}

/// An already loaded chunk of `labels`, with one entry per nanosecond of `[from, through]`.
pub fn lazy_chunk(labels: &Labels, from: i64, through: i64) -> Arc<LazyChunk> {
    Arc::new(LazyChunk::loaded(
        chunk_ref(labels, from, through),
        Arc::new(MemoryFetcher::default()),
        Arc::new(chunk_data(labels, from..=through, 4)),
    ))
}
