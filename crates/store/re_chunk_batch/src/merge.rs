//! Direction-aware k-way merging of ordered item streams.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::{Direction, Labeled, StreamItem};

/// An ordered stream of items, see [`Labeled::cmp_in`].
pub type LabeledIter<T> = Box<dyn Iterator<Item = Labeled<T>> + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeMode {
    /// Merges the sequences of a single series: items read from more than one overlapping chunk
    /// are emitted once.
    Dedupe,

    /// Merges distinct series: everything is kept.
    Sort,
}

/// Concatenates lists whose time ranges do not overlap, already ordered in the merge direction.
pub fn non_overlapping<T: StreamItem>(lists: Vec<Vec<Labeled<T>>>) -> LabeledIter<T> {
    Box::new(lists.into_iter().flatten())
}

struct HeapEntry<T> {
    item: Labeled<T>,
    source: usize,
    direction: Direction,
}

impl<T: StreamItem> HeapEntry<T> {
    fn cmp_in_order(&self, other: &Self) -> Ordering {
        self.item
            .cmp_in(&other.item, self.direction)
            .then_with(|| self.source.cmp(&other.source))
    }
}

impl<T: StreamItem> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_in_order(other).is_eq()
    }
}

impl<T: StreamItem> Eq for HeapEntry<T> {}

impl<T: StreamItem> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: StreamItem> Ord for HeapEntry<T> {
    // `BinaryHeap` is a max-heap: the item to emit first must compare greatest.
    fn cmp(&self, other: &Self) -> Ordering {
        other.cmp_in_order(self)
    }
}

/// Merges ordered streams into a single ordered stream.
///
/// Every source must already be ordered by [`Labeled::cmp_in`] for the same direction.
pub struct MergeIterator<T: StreamItem> {
    sources: Vec<LabeledIter<T>>,
    heap: BinaryHeap<HeapEntry<T>>,
    direction: Direction,
    mode: MergeMode,
}

impl<T: StreamItem> MergeIterator<T> {
    pub fn new(mut sources: Vec<LabeledIter<T>>, direction: Direction, mode: MergeMode) -> Self {
        let heap = sources
            .iter_mut()
            .enumerate()
            .filter_map(|(source, iter)| {
                iter.next().map(|item| HeapEntry {
                    item,
                    source,
                    direction,
                })
            })
            .collect();

        Self {
            sources,
            heap,
            direction,
            mode,
        }
    }

    fn pop(&mut self) -> Option<Labeled<T>> {
        let HeapEntry { item, source, .. } = self.heap.pop()?;
        if let Some(next) = self.sources[source].next() {
            self.heap.push(HeapEntry {
                item: next,
                source,
                direction: self.direction,
            });
        }
        Some(item)
    }
}

impl<T: StreamItem> Iterator for MergeIterator<T> {
    type Item = Labeled<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.pop()?;

        if self.mode == MergeMode::Dedupe {
            // Duplicates are adjacent in merge order.
            while self
                .heap
                .peek()
                .is_some_and(|next| next.item.is_duplicate_of(&item))
            {
                self.pop();
            }
        }

        Some(item)
    }
}
