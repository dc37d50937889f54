//! Splitting chunks into time-disjoint sequences, per series.

use std::sync::Arc;

use nohash_hasher::IntMap;

use crate::{Fingerprint, LazyChunk};

/// Chunks of a single series whose time spans do not overlap each other, ordered by start time.
pub type DisjointSequence = Vec<Arc<LazyChunk>>;

/// All the [`DisjointSequence`]s of each series.
pub type ChunksBySeries = IntMap<Fingerprint, Vec<DisjointSequence>>;

/// Groups chunks by series, then splits each series with [`partition_overlapping_chunks`].
pub fn partition_by_series(chunks: &[Arc<LazyChunk>]) -> ChunksBySeries {
    re_tracing::profile_function!();

    let mut chunks_by_fingerprint: IntMap<Fingerprint, Vec<Arc<LazyChunk>>> = IntMap::default();
    for chunk in chunks {
        chunks_by_fingerprint
            .entry(chunk.fingerprint())
            .or_default()
            .push(chunk.clone());
    }

    chunks_by_fingerprint
        .into_iter()
        .map(|(fingerprint, chunks)| (fingerprint, partition_overlapping_chunks(chunks)))
        .collect()
}

/// Splits the chunks of a single series into the fewest [`DisjointSequence`]s.
///
/// Chunks are taken in start order and appended to the first sequence that ends strictly before
/// they start, so there are as many sequences as the deepest overlap between chunks.
pub fn partition_overlapping_chunks(mut chunks: Vec<Arc<LazyChunk>>) -> Vec<DisjointSequence> {
    chunks.sort_by_key(|chunk| chunk.from());

    let mut sequences: Vec<DisjointSequence> = Vec::new();
    for chunk in chunks {
        let sequence = sequences.iter_mut().find(|sequence| {
            sequence
                .last()
                .is_some_and(|last| last.through() < chunk.from())
        });

        match sequence {
            Some(sequence) => sequence.push(chunk),
            None => sequences.push(vec![chunk]),
        }
    }

    sequences
}
