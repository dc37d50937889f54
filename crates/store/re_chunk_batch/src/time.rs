/// A point in time, in nanoseconds since the Unix epoch.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeInt(i64);

impl TimeInt {
    pub const MIN: Self = Self(i64::MIN);
    pub const MAX: Self = Self(i64::MAX);

    #[inline]
    pub const fn new(nanos: i64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Shifts this time forward by the smallest representable step (one nanosecond).
    ///
    /// Saturates at [`Self::MAX`].
    #[inline]
    #[must_use]
    pub const fn inc(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl From<i64> for TimeInt {
    #[inline]
    fn from(nanos: i64) -> Self {
        Self(nanos)
    }
}

impl std::fmt::Debug for TimeInt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

impl std::fmt::Display for TimeInt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// ---

/// The order in which a query walks through time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Ascending timestamps.
    #[default]
    Forward,

    /// Descending timestamps.
    Backward,
}

impl Direction {
    /// Orders two timestamps the way this direction would emit them.
    #[inline]
    pub fn cmp_time(self, lhs: TimeInt, rhs: TimeInt) -> std::cmp::Ordering {
        match self {
            Self::Forward => lhs.cmp(&rhs),
            Self::Backward => rhs.cmp(&lhs),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Forward => "forward".fmt(f),
            Self::Backward => "backward".fmt(f),
        }
    }
}

// ---

/// The time window covered by a single batch of chunks.
///
/// This is a half-open `[from, through)` range, regardless of the query's [`Direction`]: backward
/// batches shift their bounds by one nanosecond upfront instead.
///
/// The one exception is `from == through`, which denotes the single instant `from`, inclusive.
/// This only happens for queries whose start and end are equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeBounds {
    pub from: TimeInt,
    pub through: TimeInt,
}

impl TimeBounds {
    #[inline]
    pub const fn new(from: TimeInt, through: TimeInt) -> Self {
        Self { from, through }
    }

    /// Is this the single-instant `[t, t]` range?
    #[inline]
    pub fn is_instant(&self) -> bool {
        self.from == self.through
    }

    #[inline]
    pub fn contains(&self, time: TimeInt) -> bool {
        if self.is_instant() {
            time == self.from
        } else {
            self.from <= time && time < self.through
        }
    }

    /// Does the inclusive span `[min, max]` have anything in common with these bounds?
    #[inline]
    pub fn intersects_span(&self, min: TimeInt, max: TimeInt) -> bool {
        if self.is_instant() {
            min <= self.from && self.from <= max
        } else {
            min < self.through && max >= self.from
        }
    }
}

impl std::fmt::Debug for TimeBounds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_instant() {
            write!(f, "[{}]", self.from)
        } else {
            write!(f, "[{}, {})", self.from, self.through)
        }
    }
}
