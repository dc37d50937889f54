//! Cancellation, deadlines and per-query statistics.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender};
use parking_lot::Mutex;

/// Why a [`QueryContext`] is done.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancelCause {
    /// Plain cancellation, e.g. the consumer closed the stream.
    ///
    /// Streams treat this as a clean stop, not as an error.
    Cancelled,

    /// The context's deadline passed.
    DeadlineExceeded,

    /// Cancelled with an explicit reason, which is surfaced to the consumer.
    Cause(Arc<str>),
}

impl CancelCause {
    /// Should a stream stopped for this reason report an error?
    #[inline]
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

impl std::fmt::Display for CancelCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => f.write_str("context canceled"),
            Self::DeadlineExceeded => f.write_str("context deadline exceeded"),
            Self::Cause(reason) => f.write_str(reason),
        }
    }
}

// ---

/// Counters accumulated over the lifetime of a query.
///
/// Shared by a context and all of its children.
#[derive(Debug, Default)]
pub struct QueryStats {
    chunks_downloaded: AtomicU64,
    chunks_download_time_nanos: AtomicU64,
    batches: AtomicU64,
}

impl QueryStats {
    pub fn add_chunks_downloaded(&self, count: u64) {
        self.chunks_downloaded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_chunks_download_time(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.chunks_download_time_nanos
            .fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn add_batches(&self, count: u64) {
        self.batches.fetch_add(count, Ordering::Relaxed);
    }

    /// How many chunk payloads were requested from storage.
    pub fn chunks_downloaded(&self) -> u64 {
        self.chunks_downloaded.load(Ordering::Relaxed)
    }

    /// Total wall time spent waiting on storage.
    pub fn chunks_download_time(&self) -> Duration {
        Duration::from_nanos(self.chunks_download_time_nanos.load(Ordering::Relaxed))
    }

    /// How many batches were planned.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }
}

// ---

struct State {
    cause: Option<CancelCause>,

    /// Dropped on cancellation, which wakes up everyone blocked on [`ContextInner::done_rx`].
    done_tx: Option<Sender<Infallible>>,

    children: Vec<Weak<ContextInner>>,
}

struct ContextInner {
    state: Mutex<State>,
    done_rx: Receiver<Infallible>,
    deadline: Option<Instant>,
    stats: Arc<QueryStats>,
}

impl ContextInner {
    fn new(deadline: Option<Instant>, stats: Arc<QueryStats>) -> Arc<Self> {
        let (done_tx, done_rx) = crossbeam::channel::bounded(0);
        Arc::new(Self {
            state: Mutex::new(State {
                cause: None,
                done_tx: Some(done_tx),
                children: Vec::new(),
            }),
            done_rx,
            deadline,
            stats,
        })
    }

    fn cancel(&self, cause: CancelCause) {
        let children = {
            let mut state = self.state.lock();
            if state.cause.is_some() {
                return;
            }
            state.cause = Some(cause.clone());
            state.done_tx = None;
            std::mem::take(&mut state.children)
        };

        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel(cause.clone());
        }
    }
}

/// The cancellation scope of a query.
///
/// Cheap to clone: all clones share the same state. A context is done once it is cancelled,
/// once its deadline passes, or once its parent is done.
#[derive(Clone)]
pub struct QueryContext {
    inner: Arc<ContextInner>,
}

impl Default for QueryContext {
    fn default() -> Self {
        Self::background()
    }
}

impl std::fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryContext")
            .field("deadline", &self.inner.deadline)
            .field("err", &self.err())
            .finish_non_exhaustive()
    }
}

impl QueryContext {
    /// A root context, with no deadline and fresh [`QueryStats`].
    pub fn background() -> Self {
        Self {
            inner: ContextInner::new(None, Arc::default()),
        }
    }

    /// A new context that is cancelled whenever `self` is, but can also be cancelled on its own.
    pub fn child(&self) -> Self {
        self.child_with_deadline(self.inner.deadline)
    }

    /// A child context that is also done at `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = self
            .inner
            .deadline
            .map_or(deadline, |parent| parent.min(deadline));
        self.child_with_deadline(Some(deadline))
    }

    /// A child context that is also done after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    fn child_with_deadline(&self, deadline: Option<Instant>) -> Self {
        let child = ContextInner::new(deadline, self.inner.stats.clone());

        let parent_cause = {
            let mut state = self.inner.state.lock();
            if state.cause.is_none() {
                state.children.retain(|child| child.strong_count() > 0);
                state.children.push(Arc::downgrade(&child));
            }
            state.cause.clone()
        };

        if let Some(cause) = parent_cause {
            child.cancel(cause);
        }

        Self { inner: child }
    }

    /// Cancels this context and all of its children.
    ///
    /// Only the first cancellation counts.
    pub fn cancel(&self) {
        self.inner.cancel(CancelCause::Cancelled);
    }

    /// Cancels this context and all of its children with an explicit reason.
    pub fn cancel_with_cause(&self, reason: impl Into<Arc<str>>) {
        self.inner.cancel(CancelCause::Cause(reason.into()));
    }

    /// Why this context is done, if it is.
    pub fn err(&self) -> Option<CancelCause> {
        if let Some(cause) = self.inner.state.lock().cause.clone() {
            return Some(cause);
        }

        if let Some(deadline) = self.inner.deadline
            && Instant::now() >= deadline
        {
            return Some(CancelCause::DeadlineExceeded);
        }

        None
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Becomes ready (disconnected) once the context is cancelled.
    ///
    /// Meant to be used in [`crossbeam::select!`], together with [`Self::deadline_rx`].
    #[inline]
    pub fn done(&self) -> &Receiver<Infallible> {
        &self.inner.done_rx
    }

    /// Fires once the deadline passes. Never fires if there is no deadline.
    pub fn deadline_rx(&self) -> Receiver<Instant> {
        match self.inner.deadline {
            Some(deadline) => crossbeam::channel::at(deadline),
            None => crossbeam::channel::never(),
        }
    }

    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    #[inline]
    pub fn stats(&self) -> &QueryStats {
        &self.inner.stats
    }
}

static_assertions::assert_impl_all!(QueryContext: Send, Sync);
