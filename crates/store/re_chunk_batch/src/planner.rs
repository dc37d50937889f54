//! Walks the chunks of a query in time-bounded batches, on a background thread.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender};
use crossbeam::select;

use crate::fetch::{SeriesFilter, fetch_chunks_by_series};
use crate::partition::ChunksBySeries;
use crate::{
    BatchError, BatchResult, ChunkBatchQuery, ChunkMetrics, Direction, ExternalKeyer, Filterer,
    LabelMatcher, LazyChunk, QueryContext, TimeBounds, TimeInt, remove_reserved_matchers,
};

/// One step of batched iteration: the chunks needed to produce all items within [`Self::bounds`].
#[derive(Debug)]
pub struct ChunkBatch {
    /// Loaded chunks of the series that satisfy the query.
    pub chunks_by_series: ChunksBySeries,

    /// Never extends past the query's `[start, end]`.
    pub bounds: TimeBounds,

    /// The first chunk of the following batch, if any.
    pub next_chunk: Option<Arc<LazyChunk>>,
}

/// Orders chunks the way a query in `direction` consumes them.
///
/// Forward: by start time, then fingerprint. Backward: by descending end time, then descending
/// fingerprint.
pub fn sort_chunks(chunks: &mut [Arc<LazyChunk>], direction: Direction) {
    match direction {
        Direction::Forward => {
            chunks.sort_by(|lhs, rhs| {
                lhs.from()
                    .cmp(&rhs.from())
                    .then_with(|| lhs.fingerprint().cmp(&rhs.fingerprint()))
            });
        }
        Direction::Backward => {
            chunks.sort_by(|lhs, rhs| {
                rhs.through()
                    .cmp(&lhs.through())
                    .then_with(|| rhs.fingerprint().cmp(&lhs.fingerprint()))
            });
        }
    }
}

// ---

/// The state of the planning thread.
struct Planner {
    ctx: QueryContext,
    keyer: Arc<dyn ExternalKeyer>,
    metrics: Arc<dyn ChunkMetrics>,

    /// Remaining chunks, see [`sort_chunks`].
    chunks: VecDeque<Arc<LazyChunk>>,
    batch_size: usize,
    direction: Direction,
    start: TimeInt,
    end: TimeInt,
    matchers: Vec<LabelMatcher>,
    filterer: Option<Arc<dyn Filterer>>,

    /// Chunks of the previous batch that are needed by the next one too.
    last_overlapping: Vec<Arc<LazyChunk>>,
}

impl Planner {
    fn run(mut self, tx: &Sender<BatchResult<ChunkBatch>>) {
        loop {
            if self.chunks.is_empty() || self.ctx.is_done() {
                break;
            }

            let batch = match std::panic::catch_unwind(AssertUnwindSafe(|| self.next_batch())) {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    re_log::error!("panic while fetching chunks: {reason}");
                    Err(BatchError::Panic { reason })
                }
            };

            // A cancelled fetch leaves chunks unloaded: that batch must not be seen.
            if self.ctx.is_done() {
                break;
            }

            let is_err = batch.is_err();
            let deadline = self.ctx.deadline_rx();
            select! {
                send(tx, batch) -> res => {
                    if res.is_err() {
                        break; // The consumer is gone.
                    }
                }
                recv(self.ctx.done()) -> _ => break,
                recv(deadline) -> _ => break,
            }

            if is_err {
                break;
            }
        }

        re_log::debug!("chunk batch planner done");
    }

    /// Returns `None` once there is nothing left to read within the query bounds.
    fn next_batch(&mut self) -> Option<BatchResult<ChunkBatch>> {
        re_tracing::profile_function!();

        let Self {
            ctx,
            keyer,
            metrics,
            chunks,
            batch_size,
            direction,
            start,
            end,
            matchers,
            filterer,
            last_overlapping,
        } = self;
        let (direction, start, end) = (*direction, *start, *end);

        let head = chunks.front()?.clone();
        let (mut from, mut through) = (start, end);
        let mut batch = Vec::with_capacity(*batch_size + last_overlapping.len());
        let mut next_chunk = None;
        let mut includes_overlap = false;

        while !chunks.is_empty() {
            // Keep the batch sorted: carried chunks come first going forward, last going backward.
            if !includes_overlap && direction == Direction::Forward {
                batch.append(last_overlapping);
            }
            let num_popped = (*batch_size).min(chunks.len());
            batch.extend(chunks.drain(..num_popped));
            if !includes_overlap && direction == Direction::Backward {
                batch.append(last_overlapping);
            }
            includes_overlap = true;

            next_chunk = chunks.front().cloned();

            match direction {
                Direction::Forward => {
                    from = head.from();

                    // The end of the query is exclusive, unless it is also its start.
                    if from == end && start != end {
                        return None;
                    }
                    from = from.max(start);

                    through = next_chunk.as_ref().map_or(end, |next| next.from());
                }

                Direction::Backward => {
                    // Backward batches are `(from, through]`: shifted by one to make them
                    // `[from, through)`, except where they meet the bounds of the query.
                    through = head.through().min(end);
                    if through != end {
                        through = through.inc();
                    }

                    // `start` itself is left to the batch of the last chunk ending there.
                    from = next_chunk
                        .as_ref()
                        .map_or(start, |next| next.through().inc().max(start));
                }
            }

            // Chunks might overlap so much that the batch has no width yet: pop more.
            if through > from {
                break;
            }
        }

        if through <= from {
            re_log::debug!(
                "all {} remaining chunks overlap, batch covers the rest of the query",
                batch.len()
            );
            match direction {
                Direction::Forward => through = end,
                Direction::Backward => from = start,
            }
        }

        if let Some(next) = &next_chunk {
            last_overlapping.extend(
                batch
                    .iter()
                    .filter(|chunk| chunk.is_overlapping(next, direction))
                    .cloned(),
            );
        }

        ctx.stats().add_batches(1);

        let filter = SeriesFilter {
            matchers,
            filterer: filterer.as_deref(),
        };
        let chunks_by_series =
            match fetch_chunks_by_series(ctx, keyer.as_ref(), metrics.as_ref(), &batch, filter) {
                Ok(chunks_by_series) => chunks_by_series,
                Err(err) => return Some(Err(err)),
            };

        Some(Ok(ChunkBatch {
            chunks_by_series,
            bounds: TimeBounds::new(from, through),
            next_chunk,
        }))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

// ---

/// Produces the [`ChunkBatch`]es of a query, one at a time.
///
/// Planning happens on a background thread, started by the first call to [`Self::next`]. It hands
/// batches over through a rendezvous channel, so it is never more than one batch ahead of the
/// consumer.
pub struct BatchChunkIterator {
    ctx: QueryContext,

    /// Taken when the planning thread starts.
    planner: Option<Planner>,
    rx: Option<Receiver<BatchResult<ChunkBatch>>>,
}

impl BatchChunkIterator {
    /// `query.chunks` are expected to already be filtered by time, see
    /// [`crate::filter_chunk_refs_by_time`].
    pub fn new(
        ctx: QueryContext,
        keyer: Arc<dyn ExternalKeyer>,
        metrics: Arc<dyn ChunkMetrics>,
        query: ChunkBatchQuery,
    ) -> Self {
        let ChunkBatchQuery {
            chunks,
            batch_size,
            direction,
            start,
            end,
            matchers,
            filterer,
        } = query;

        let mut chunks = chunks;
        sort_chunks(&mut chunks, direction);

        let planner = Planner {
            ctx: ctx.clone(),
            keyer,
            metrics,
            chunks: chunks.into(),
            batch_size: batch_size.max(1),
            direction,
            start,
            end,
            matchers: remove_reserved_matchers(&matchers),
            filterer,
            last_overlapping: Vec::new(),
        };

        Self {
            ctx,
            planner: Some(planner),
            rx: None,
        }
    }

    /// Starts the planning thread, if not already started.
    fn start(&mut self) -> BatchResult<()> {
        let Some(planner) = self.planner.take() else {
            return Ok(());
        };

        let (tx, rx) = crossbeam::channel::bounded(0);
        std::thread::Builder::new()
            .name("chunk_batch_planner".into())
            .spawn(move || planner.run(&tx))
            .map_err(|err| BatchError::Spawn(Arc::new(err)))?;
        self.rx = Some(rx);

        Ok(())
    }

    /// Blocks until the next batch is ready.
    ///
    /// Returns `None` once all chunks were consumed, or once the context is done.
    pub fn next(&mut self) -> Option<BatchResult<ChunkBatch>> {
        if self.ctx.is_done() {
            return None;
        }

        if let Err(err) = self.start() {
            return Some(Err(err));
        }
        let rx = self.rx.as_ref()?;

        re_tracing::profile_wait!("chunk_batch");
        let deadline = self.ctx.deadline_rx();
        select! {
            recv(rx) -> batch => batch.ok(),
            recv(self.ctx.done()) -> _ => None,
            recv(deadline) -> _ => None,
        }
    }
}
