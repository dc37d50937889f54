use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Whether the counted things satisfy the query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MatchStatus {
    Matched,
    Discarded,
}

impl MatchStatus {
    pub const ALL: [Self; 2] = [Self::Matched, Self::Discarded];

    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Matched => "matched",
            Self::Discarded => "discarded",
        }
    }

    fn otel_kvs(self) -> [KeyValue; 1] {
        [KeyValue::new("status", self.as_str())]
    }
}

impl std::fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_str().fmt(f)
    }
}

/// Where batched chunk iteration reports what it fetched and filtered.
///
/// Must be safe to call concurrently.
pub trait ChunkMetrics: Send + Sync {
    /// Chunk references, by whether they intersect the query bounds.
    fn add_chunk_refs(&self, status: MatchStatus, count: u64);

    /// Series, by whether they satisfy the matchers.
    fn add_series(&self, status: MatchStatus, count: u64);

    /// Chunks, by whether their series satisfy the matchers.
    fn add_chunks(&self, status: MatchStatus, count: u64);

    /// Number of chunks in a single batch.
    fn observe_batch_size(&self, status: MatchStatus, size: u64);
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopChunkMetrics;

impl ChunkMetrics for NoopChunkMetrics {
    fn add_chunk_refs(&self, _status: MatchStatus, _count: u64) {}

    fn add_series(&self, _status: MatchStatus, _count: u64) {}

    fn add_chunks(&self, _status: MatchStatus, _count: u64) {}

    fn observe_batch_size(&self, _status: MatchStatus, _size: u64) {}
}

// ---

/// Number of histogram buckets spread evenly over `[0, max_batch_size]`.
const NUM_BATCH_SIZE_BUCKETS: usize = 5;

/// Reports to OpenTelemetry.
#[derive(Clone)]
pub struct OtelChunkMetrics {
    refs: Counter<u64>,
    series: Counter<u64>,
    chunks: Counter<u64>,
    batches: Histogram<f64>,
}

impl OtelChunkMetrics {
    /// Uses the global `chunk_batch` meter.
    pub fn new(max_batch_size: usize) -> Self {
        Self::with_meter(&opentelemetry::global::meter("chunk_batch"), max_batch_size)
    }

    pub fn with_meter(meter: &Meter, max_batch_size: usize) -> Self {
        let refs = meter
            .u64_counter("index_chunk_refs_total")
            .with_description(
                "Number of chunks refs downloaded, partitioned by whether they intersect the query bounds.",
            )
            .build();
        let series = meter
            .u64_counter("store_series_total")
            .with_description(
                "Number of series referenced by a query, partitioned by whether they satisfy matchers.",
            )
            .build();
        let chunks = meter
            .u64_counter("store_chunks_downloaded_total")
            .with_description(
                "Number of chunks referenced or downloaded, partitioned by if they satisfy matchers.",
            )
            .build();
        let batches = meter
            .f64_histogram("store_chunks_per_batch")
            .with_description("The chunk batch size, partitioned by if they satisfy matchers.")
            .with_boundaries(batch_size_boundaries(max_batch_size))
            .build();

        Self {
            refs,
            series,
            chunks,
            batches,
        }
    }
}

/// `0, w, 2w, … 5w`, with `w` such that `5w` is close to `max_batch_size`.
fn batch_size_boundaries(max_batch_size: usize) -> Vec<f64> {
    let width = max_batch_size.max(NUM_BATCH_SIZE_BUCKETS) / NUM_BATCH_SIZE_BUCKETS;

    // One extra bucket so that the upper bound has its own.
    (0..=NUM_BATCH_SIZE_BUCKETS)
        .map(|i| (i * width) as f64)
        .collect()
}

impl ChunkMetrics for OtelChunkMetrics {
    fn add_chunk_refs(&self, status: MatchStatus, count: u64) {
        self.refs.add(count, &status.otel_kvs());
    }

    fn add_series(&self, status: MatchStatus, count: u64) {
        self.series.add(count, &status.otel_kvs());
    }

    fn add_chunks(&self, status: MatchStatus, count: u64) {
        self.chunks.add(count, &status.otel_kvs());
    }

    fn observe_batch_size(&self, status: MatchStatus, size: u64) {
        self.batches.record(size as f64, &status.otel_kvs());
    }
}
