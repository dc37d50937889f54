use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use nohash_hasher::IntMap;
use parking_lot::Mutex;

use crate::item::StreamLabels;
use crate::labels::hash64;
use crate::{
    BatchError, BatchResult, Direction, Entry, Fetcher, Fingerprint, Labeled, Labels, Sample,
    StreamItem, StreamPipeline, StreamSampleExtractor, TimeBounds, TimeInt,
};

/// Identifies a stored chunk.
///
/// The labels of the series are not part of the reference: they are only known once the payload
/// has been loaded.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChunkRef {
    pub user_id: Arc<str>,
    pub fingerprint: Fingerprint,

    /// Inclusive.
    pub from: TimeInt,

    /// Inclusive.
    pub through: TimeInt,

    pub checksum: u32,
}

impl std::fmt::Display for ChunkRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            user_id,
            fingerprint,
            from,
            through,
            checksum,
        } = self;
        write!(
            f,
            "{user_id}/{fingerprint:x}:{:x}:{:x}:{checksum:x}",
            from.as_i64(),
            through.as_i64()
        )
    }
}

// ---

/// One line of a decoded chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawEntry {
    pub timestamp: TimeInt,
    pub line: String,
}

impl RawEntry {
    pub fn new(timestamp: impl Into<TimeInt>, line: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp.into(),
            line: line.into(),
        }
    }
}

/// A run of entries in ascending time order: the unit of decoding within a chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    entries: Vec<RawEntry>,
    min_time: TimeInt,
    max_time: TimeInt,
}

impl Block {
    /// Returns `None` for an empty block.
    pub fn new(mut entries: Vec<RawEntry>) -> Option<Self> {
        entries.sort_by_key(|entry| entry.timestamp);
        let min_time = entries.first()?.timestamp;
        let max_time = entries.last()?.timestamp;
        Some(Self {
            entries,
            min_time,
            max_time,
        })
    }

    #[inline]
    pub fn entries(&self) -> &[RawEntry] {
        &self.entries
    }

    #[inline]
    pub fn min_time(&self) -> TimeInt {
        self.min_time
    }

    #[inline]
    pub fn max_time(&self) -> TimeInt {
        self.max_time
    }

    /// Will part of this block also be needed by the batch starting at `next`?
    pub fn is_overlapping(&self, next: &LazyChunk, direction: Direction) -> bool {
        match direction {
            Direction::Forward => self.max_time >= next.from(),
            Direction::Backward => self.min_time <= next.through(),
        }
    }
}

/// The decoded payload of a chunk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkData {
    labels: Labels,
    blocks: Vec<Block>,
}

impl ChunkData {
    pub fn new(labels: Labels, blocks: impl IntoIterator<Item = Block>) -> Self {
        Self {
            labels,
            blocks: blocks.into_iter().collect(),
        }
    }

    /// Splits time-ordered entries into blocks of at most `entries_per_block` entries.
    pub fn with_block_size(
        labels: Labels,
        mut entries: Vec<RawEntry>,
        entries_per_block: usize,
    ) -> Self {
        entries.sort_by_key(|entry| entry.timestamp);
        let blocks = entries
            .chunks(entries_per_block.max(1))
            .filter_map(|entries| Block::new(entries.to_vec()));
        Self::new(labels, blocks)
    }

    #[inline]
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    #[inline]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    #[inline]
    pub fn num_entries(&self) -> usize {
        self.blocks.iter().map(|block| block.entries.len()).sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_entries() == 0
    }
}

// ---

type BlockCache<T> = Mutex<IntMap<usize, Arc<[Labeled<T>]>>>;

/// A [`ChunkRef`] whose payload is fetched on demand.
///
/// The payload is written at most once, by the fetch step of the batch that first needs it.
/// Batches only read it after that step has joined.
pub struct LazyChunk {
    chunk_ref: ChunkRef,
    fetcher: Arc<dyn Fetcher>,

    data: OnceLock<Arc<ChunkData>>,

    /// Only set once a non-empty payload has been loaded.
    is_valid: AtomicBool,

    /// Processed output of the blocks that overlap the next batch, keyed by block offset.
    ///
    /// The next batch reads those blocks again, and reuses this instead of re-running the
    /// pipeline.
    entry_cache: BlockCache<Entry>,
    sample_cache: BlockCache<Sample>,
}

static_assertions::assert_impl_all!(LazyChunk: Send, Sync);

impl std::fmt::Debug for LazyChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyChunk")
            .field("chunk_ref", &self.chunk_ref)
            .field("is_loaded", &self.is_loaded())
            .field("is_valid", &self.is_valid())
            .finish_non_exhaustive()
    }
}

impl LazyChunk {
    pub fn new(chunk_ref: ChunkRef, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            chunk_ref,
            fetcher,
            data: OnceLock::new(),
            is_valid: AtomicBool::new(false),
            entry_cache: Mutex::default(),
            sample_cache: Mutex::default(),
        }
    }

    /// A chunk whose payload is already known, e.g. from a cache.
    pub fn loaded(chunk_ref: ChunkRef, fetcher: Arc<dyn Fetcher>, data: Arc<ChunkData>) -> Self {
        let chunk = Self::new(chunk_ref, fetcher);
        chunk.set_data(data);
        chunk.update_validity();
        chunk
    }

    #[inline]
    pub fn chunk_ref(&self) -> &ChunkRef {
        &self.chunk_ref
    }

    #[inline]
    pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
        &self.fetcher
    }

    #[inline]
    pub fn fingerprint(&self) -> Fingerprint {
        self.chunk_ref.fingerprint
    }

    #[inline]
    pub fn from(&self) -> TimeInt {
        self.chunk_ref.from
    }

    #[inline]
    pub fn through(&self) -> TimeInt {
        self.chunk_ref.through
    }

    #[inline]
    pub fn data(&self) -> Option<&Arc<ChunkData>> {
        self.data.get()
    }

    /// The labels of the series, once loaded.
    #[inline]
    pub fn labels(&self) -> Option<&Labels> {
        self.data().map(|data| data.labels())
    }

    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.data.get().is_some()
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.is_valid.load(Ordering::Acquire)
    }

    /// Returns `false` if a payload was already set, in which case it is kept.
    pub(crate) fn set_data(&self, data: Arc<ChunkData>) -> bool {
        self.data.set(data).is_ok()
    }

    pub(crate) fn update_validity(&self) {
        let is_valid = self.data().is_some_and(|data| !data.is_empty());
        self.is_valid.store(is_valid, Ordering::Release);
    }

    /// Does this chunk have entries the batch starting at `with` also needs?
    pub fn is_overlapping(&self, with: &Self, direction: Direction) -> bool {
        match direction {
            Direction::Forward => self.through() >= with.from(),
            Direction::Backward => self.from() <= with.through(),
        }
    }

    /// The entries of this chunk within `bounds`, in `direction` order.
    pub fn entries(
        &self,
        bounds: TimeBounds,
        direction: Direction,
        pipeline: &mut dyn StreamPipeline,
        next_chunk: Option<&Self>,
    ) -> BatchResult<Vec<Labeled<Entry>>> {
        let stream = StreamLabels::new(pipeline.base_labels());

        self.process_blocks(
            &self.entry_cache,
            bounds,
            direction,
            next_chunk,
            |raw, out| {
                if let Some(processed) = pipeline.process(raw.timestamp, &raw.line) {
                    out.push(stream.label(
                        processed.labels.as_ref(),
                        Entry {
                            timestamp: raw.timestamp,
                            line: processed.line,
                        },
                    ));
                }
            },
        )
    }

    /// The samples extracted from this chunk within `bounds`, in ascending time order.
    ///
    /// Samples of all `extractors` end up in the same list.
    pub fn samples(
        &self,
        bounds: TimeBounds,
        extractors: &mut [Box<dyn StreamSampleExtractor>],
        next_chunk: Option<&Self>,
    ) -> BatchResult<Vec<Labeled<Sample>>> {
        let streams = extractors
            .iter()
            .map(|extractor| StreamLabels::new(extractor.base_labels()))
            .collect::<Vec<_>>();

        self.process_blocks(
            &self.sample_cache,
            bounds,
            Direction::Forward,
            next_chunk,
            |raw, out| {
                let hash = hash64(raw.line.as_str());
                for (extractor, stream) in extractors.iter_mut().zip(&streams) {
                    if let Some(extracted) = extractor.process(raw.timestamp, &raw.line) {
                        out.push(stream.label(
                            extracted.labels.as_ref(),
                            Sample {
                                timestamp: raw.timestamp,
                                value: extracted.value,
                                hash,
                            },
                        ));
                    }
                }
            },
        )
    }

    fn process_blocks<T: StreamItem>(
        &self,
        cache: &BlockCache<T>,
        bounds: TimeBounds,
        direction: Direction,
        next_chunk: Option<&Self>,
        mut process: impl FnMut(&RawEntry, &mut Vec<Labeled<T>>),
    ) -> BatchResult<Vec<Labeled<T>>> {
        let data = self.data().ok_or_else(|| BatchError::ChunkNotLoaded {
            key: self.chunk_ref.to_string(),
        })?;

        let in_bounds = |item: &&Labeled<T>| bounds.contains(item.value.timestamp());

        let mut output = Vec::new();
        for (offset, block) in data.blocks().iter().enumerate() {
            if !bounds.intersects_span(block.min_time, block.max_time) {
                continue;
            }

            let cached = cache.lock().get(&offset).cloned();
            if let Some(cached) = cached {
                output.extend(cached.iter().filter(in_bounds).cloned());
                continue;
            }

            match next_chunk {
                Some(next) if block.is_overlapping(next, direction) => {
                    let mut processed = Vec::with_capacity(block.entries.len());
                    for raw in &block.entries {
                        process(raw, &mut processed);
                    }
                    let processed: Arc<[Labeled<T>]> = processed.into();
                    output.extend(processed.iter().filter(in_bounds).cloned());
                    cache.lock().insert(offset, processed);
                }

                Some(_) => {
                    cache.lock().remove(&offset);
                    let raws = block
                        .entries
                        .iter()
                        .filter(|raw| bounds.contains(raw.timestamp));
                    for raw in raws {
                        process(raw, &mut output);
                    }
                }

                None => {
                    let raws = block
                        .entries
                        .iter()
                        .filter(|raw| bounds.contains(raw.timestamp));
                    for raw in raws {
                        process(raw, &mut output);
                    }
                }
            }
        }

        output.sort_by(|lhs, rhs| lhs.cmp_in(rhs, direction));
        Ok(output)
    }

    #[cfg(test)]
    pub(crate) fn num_cached_blocks(&self) -> usize {
        self.entry_cache.lock().len() + self.sample_cache.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdentityPipeline;
    use crate::Pipeline as _;
    use crate::test_util::{MemoryFetcher, chunk_data, chunk_ref};

    fn lazy(labels: &Labels, from: i64, through: i64) -> LazyChunk {
        LazyChunk::loaded(
            chunk_ref(labels, from, through),
            Arc::new(MemoryFetcher::default()),
            Arc::new(chunk_data(labels, from..=through, 2)),
        )
    }

    fn timestamps(entries: &[Labeled<Entry>]) -> Vec<i64> {
        entries.iter().map(|e| e.value.timestamp.as_i64()).collect()
    }

    #[test]
    fn external_key_format() {
        let chunk_ref = ChunkRef {
            user_id: "fake".into(),
            fingerprint: Fingerprint::from_u64(0xab),
            from: TimeInt::new(16),
            through: TimeInt::new(32),
            checksum: 0xff,
        };
        assert_eq!(chunk_ref.to_string(), "fake/ab:10:20:ff");
    }

    #[test]
    fn chunk_overlap_is_direction_aware() {
        let labels = Labels::new([("app", "foo")]);
        let (a, b) = (lazy(&labels, 0, 10), lazy(&labels, 10, 20));
        assert!(a.is_overlapping(&b, Direction::Forward));
        assert!(!lazy(&labels, 0, 9).is_overlapping(&b, Direction::Forward));
        assert!(b.is_overlapping(&a, Direction::Backward));
        assert!(!lazy(&labels, 11, 20).is_overlapping(&a, Direction::Backward));
    }

    #[test]
    fn entries_are_clipped_and_ordered() -> anyhow::Result<()> {
        let labels = Labels::new([("app", "foo")]);
        let chunk = lazy(&labels, 0, 9);
        let mut pipeline = IdentityPipeline.for_stream(&labels);

        let bounds = TimeBounds::new(3.into(), 7.into());
        let forward = chunk.entries(bounds, Direction::Forward, pipeline.as_mut(), None)?;
        assert_eq!(timestamps(&forward), vec![3, 4, 5, 6]);

        let backward = chunk.entries(bounds, Direction::Backward, pipeline.as_mut(), None)?;
        assert_eq!(timestamps(&backward), vec![6, 5, 4, 3]);
        assert_eq!(forward[0].labels.as_ref(), r#"{app="foo"}"#);
        Ok(())
    }

    #[test]
    fn overlapping_blocks_are_cached() -> anyhow::Result<()> {
        let labels = Labels::new([("app", "foo")]);
        let chunk = lazy(&labels, 0, 9);
        let next = lazy(&labels, 5, 20);
        let mut pipeline = IdentityPipeline.for_stream(&labels);

        // Blocks are [0,1] [2,3] [4,5] [6,7] [8,9]:
        // only [4,5] is both in bounds and overlapping `next`.
        let first = chunk.entries(
            TimeBounds::new(0.into(), 5.into()),
            Direction::Forward,
            pipeline.as_mut(),
            Some(&next),
        )?;
        assert_eq!(timestamps(&first), vec![0, 1, 2, 3, 4]);
        assert_eq!(chunk.num_cached_blocks(), 1);

        let second = chunk.entries(
            TimeBounds::new(5.into(), 30.into()),
            Direction::Forward,
            pipeline.as_mut(),
            None,
        )?;
        assert_eq!(timestamps(&second), vec![5, 6, 7, 8, 9]);
        Ok(())
    }

    #[test]
    fn unloaded_chunks_cannot_be_iterated() {
        let labels = Labels::new([("app", "foo")]);
        let chunk = LazyChunk::new(chunk_ref(&labels, 0, 9), Arc::new(MemoryFetcher::default()));
        assert!(!chunk.is_valid());
        let mut pipeline = IdentityPipeline.for_stream(&labels);
        let err = chunk.entries(
            TimeBounds::new(0.into(), 10.into()),
            Direction::Forward,
            pipeline.as_mut(),
            None,
        );
        assert!(matches!(err, Err(BatchError::ChunkNotLoaded { .. })));
    }

    #[test]
    fn empty_payloads_are_not_valid() {
        let labels = Labels::new([("app", "foo")]);
        let chunk = LazyChunk::loaded(
            chunk_ref(&labels, 0, 9),
            Arc::new(MemoryFetcher::default()),
            Arc::new(ChunkData::new(labels.clone(), [])),
        );
        assert!(chunk.is_loaded());
        assert!(!chunk.is_valid());
    }
}
