use std::cmp::Ordering;
use std::sync::Arc;

use crate::{Direction, Labels, TimeInt};

/// Something a stream emits: a log [`Entry`] or a metric [`Sample`].
pub trait StreamItem: Clone + Send + 'static {
    fn timestamp(&self) -> TimeInt;

    /// Orders two items sharing a timestamp and labels.
    ///
    /// Items for which this returns [`Ordering::Equal`] are duplicates of each other.
    fn cmp_identity(&self, other: &Self) -> Ordering;
}

/// A single log line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub timestamp: TimeInt,
    pub line: Arc<str>,
}

impl StreamItem for Entry {
    #[inline]
    fn timestamp(&self) -> TimeInt {
        self.timestamp
    }

    #[inline]
    fn cmp_identity(&self, other: &Self) -> Ordering {
        self.line.cmp(&other.line)
    }
}

/// A single value extracted from a log line.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub timestamp: TimeInt,
    pub value: f64,

    /// Stable hash of the line the sample was extracted from.
    ///
    /// The same line read from two overlapping chunks yields the same sample, which is how those
    /// get de-duplicated.
    pub hash: u64,
}

impl StreamItem for Sample {
    #[inline]
    fn timestamp(&self) -> TimeInt {
        self.timestamp
    }

    #[inline]
    fn cmp_identity(&self, other: &Self) -> Ordering {
        self.hash
            .cmp(&other.hash)
            .then_with(|| self.value.total_cmp(&other.value))
    }
}

// ---

/// An item together with the stream it belongs to.
#[derive(Clone, Debug, PartialEq)]
pub struct Labeled<T> {
    /// The formatted labels of the stream, e.g. `{app="foo"}`.
    pub labels: Arc<str>,

    /// See [`Labels::stream_hash`].
    pub stream_hash: u64,

    pub value: T,
}

impl<T: StreamItem> Labeled<T> {
    /// The order in which items are emitted when walking time in `direction`.
    ///
    /// Timestamp first, then labels, then the items themselves and finally the stream hash.
    pub fn cmp_in(&self, other: &Self, direction: Direction) -> Ordering {
        direction
            .cmp_time(self.value.timestamp(), other.value.timestamp())
            .then_with(|| self.labels.cmp(&other.labels))
            .then_with(|| self.value.cmp_identity(&other.value))
            .then_with(|| self.stream_hash.cmp(&other.stream_hash))
    }

    /// Are these two the same item of the same stream?
    #[inline]
    pub fn is_duplicate_of(&self, other: &Self) -> bool {
        self.value.timestamp() == other.value.timestamp()
            && self.labels == other.labels
            && self.value.cmp_identity(&other.value).is_eq()
    }
}

/// Formats labels once, to be shared by every item of a stream.
#[derive(Clone, Debug)]
pub(crate) struct StreamLabels {
    pub labels: Arc<str>,
    pub stream_hash: u64,
}

impl StreamLabels {
    pub fn new(labels: &Labels) -> Self {
        Self {
            labels: labels.to_string().into(),
            stream_hash: labels.stream_hash(),
        }
    }

    /// Labels an item, preferring per-item labels over the stream's.
    pub fn label<T>(&self, overrides: Option<&Labels>, value: T) -> Labeled<T> {
        match overrides {
            Some(labels) => Labeled {
                labels: labels.to_string().into(),
                stream_hash: labels.stream_hash(),
                value,
            },
            None => Labeled {
                labels: self.labels.clone(),
                stream_hash: self.stream_hash,
                value,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(labels: &str, ts: i64, line: &str) -> Labeled<Entry> {
        Labeled {
            labels: labels.into(),
            stream_hash: 0,
            value: Entry {
                timestamp: ts.into(),
                line: line.into(),
            },
        }
    }

    #[test]
    fn entries_order_by_time_then_labels_then_line() {
        let a = entry("{app=\"a\"}", 1, "z");
        let b = entry("{app=\"b\"}", 1, "a");
        let c = entry("{app=\"a\"}", 2, "a");

        assert!(a.cmp_in(&b, Direction::Forward).is_lt());
        assert!(a.cmp_in(&c, Direction::Forward).is_lt());
        assert!(c.cmp_in(&a, Direction::Backward).is_lt());
        // Ties on time are broken the same way in both directions.
        assert!(a.cmp_in(&b, Direction::Backward).is_lt());
    }

    #[test]
    fn duplicates_ignore_stream_hash() {
        let a = entry("{app=\"a\"}", 1, "x");
        let mut b = a.clone();
        b.stream_hash = 42;
        assert!(a.is_duplicate_of(&b));
        assert!(!a.is_duplicate_of(&entry("{app=\"a\"}", 1, "y")));
    }

    #[test]
    fn samples_compare_by_hash_then_value() {
        let sample = |hash, value| Sample {
            timestamp: TimeInt::new(0),
            value,
            hash,
        };
        assert!(sample(1, 9.0).cmp_identity(&sample(2, 0.0)).is_lt());
        assert!(sample(1, 1.0).cmp_identity(&sample(1, 2.0)).is_lt());
        assert!(sample(1, 1.0).cmp_identity(&sample(1, 1.0)).is_eq());
    }
}
