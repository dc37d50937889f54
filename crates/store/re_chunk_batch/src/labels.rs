use smallvec::SmallVec;

/// The label that carries the metric name in upstream-compatible label sets.
///
/// It is constant for all log streams, so it is never used for filtering nor shown in output.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// The label injected by query sharding to address a subset of series.
pub const SHARD_LABEL: &str = "__cortex_shard__";

/// Fixed seeds so that fingerprints and stream hashes are stable across processes.
const HASH_RANDOM_STATE: ahash::RandomState = ahash::RandomState::with_seeds(0, 1, 2, 3);

/// Hashes the given value with [`HASH_RANDOM_STATE`].
#[inline]
pub(crate) fn hash64(value: impl std::hash::Hash) -> u64 {
    HASH_RANDOM_STATE.hash_one(value)
}

// ---

/// Identifies a series: a stable hash of its label set.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(u64);

impl nohash_hasher::IsEnabled for Fingerprint {}

impl Fingerprint {
    #[inline]
    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({:016x})", self.0)
    }
}

impl std::fmt::LowerHex for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.0, f)
    }
}

// ---

/// A set of `name=value` pairs identifying a series.
///
/// Always sorted by name, with unique names.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Labels(SmallVec<[(String, String); 4]>);

impl Labels {
    /// Builds a label set, sorting by name. On duplicate names, the last value wins.
    pub fn new<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        let mut labels: SmallVec<[(String, String); 4]> = SmallVec::new();
        for (name, value) in pairs {
            let (name, value) = (name.into(), value.into());
            match labels.binary_search_by(|(cur, _)| cur.as_str().cmp(&name)) {
                Ok(idx) => labels[idx].1 = value,
                Err(idx) => labels.insert(idx, (name, value)),
            }
        }
        Self(labels)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// The value of the given label, or `""` if absent.
    ///
    /// Matching an absent label against the empty string is what label matchers expect.
    pub fn get(&self, name: &str) -> &str {
        self.0
            .binary_search_by(|(cur, _)| cur.as_str().cmp(name))
            .map_or("", |idx| self.0[idx].1.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Returns a copy of this label set without the given label.
    #[must_use]
    pub fn without(&self, name: &str) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(cur, _)| cur != name)
                .cloned()
                .collect(),
        )
    }

    /// The series key of this label set.
    #[inline]
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint(hash64(&self.0))
    }

    /// The hash identifying the output stream these labels belong to.
    ///
    /// Streams are identified by their labels once reserved labels have been stripped, so this
    /// differs from [`Self::fingerprint`] as soon as [`METRIC_NAME_LABEL`] is present.
    #[inline]
    pub fn stream_hash(&self) -> u64 {
        hash64(self.without(METRIC_NAME_LABEL).0)
    }
}

impl<'a> IntoIterator for &'a Labels {
    type Item = (&'a str, &'a str);
    type IntoIter = std::iter::Map<
        std::slice::Iter<'a, (String, String)>,
        fn(&'a (String, String)) -> (&'a str, &'a str),
    >;

    fn into_iter(self) -> Self::IntoIter {
        self.0
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

impl std::fmt::Display for Labels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value:?}")?;
        }
        f.write_str("}")
    }
}

impl std::fmt::Debug for Labels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}
