//! In-memory audit queues.
//!
//! [`Queue`] is a plain FIFO owned by one worker at a time. [`QueuePair`] is
//! the shared double buffer between the reservoir chore (single producer)
//! and the audit workers: the producer may stage exactly one batch ahead and
//! must wait for the swap before staging another, so workers never starve
//! and the producer never queues unboundedly.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use orbit_common::{Error, Position, Result, StreamId};

/// One segment scheduled for audit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub stream_id: StreamId,
    pub position: Position,
    /// Expiration of the owning object; expired entries are skipped
    pub expires_at: Option<DateTime<Utc>>,
    pub encrypted_size: i32,
}

impl From<&orbit_metabase::Segment> for Segment {
    fn from(segment: &orbit_metabase::Segment) -> Self {
        Self {
            stream_id: segment.stream_id,
            position: segment.position,
            expires_at: segment.expires_at,
            encrypted_size: segment.encrypted_size,
        }
    }
}

impl Segment {
    /// Check whether the owning object has expired as of `now`
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires) if expires <= now)
    }
}

/// A batch of segments to audit, drained by a single worker.
///
/// Not safe for concurrent use; ownership transfers to one worker via
/// [`QueuePair::fetch`].
#[derive(Debug, Default)]
pub struct Queue {
    segments: VecDeque<Segment>,
}

impl Queue {
    /// Create a queue over a batch of segments
    #[must_use]
    pub fn new(segments: Vec<Segment>) -> Self {
        Self {
            segments: segments.into(),
        }
    }

    /// Pop the next segment; [`Error::EmptyQueue`] once drained.
    pub fn next(&mut self) -> Result<Segment> {
        self.segments.pop_front().ok_or(Error::EmptyQueue)
    }

    /// Number of segments left
    #[must_use]
    pub fn size(&self) -> usize {
        self.segments.len()
    }

    /// Check whether the queue is drained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// A staged batch waiting for the active queue to drain. Executing the swap
/// installs the queue and wakes every [`QueuePair::wait_for_swap`] caller.
struct PendingSwap {
    queue: Queue,
    swapped: watch::Sender<()>,
}

impl PendingSwap {
    fn execute(self) -> Queue {
        let _ = self.swapped.send(());
        self.queue
    }
}

struct PairState {
    active: Queue,
    pending: Option<PendingSwap>,
}

/// Double-buffered handoff between one producer and many consumers.
///
/// All three operations mutate under one mutex and the critical sections
/// only move pointers; no I/O happens under the lock.
pub struct QueuePair {
    state: Mutex<PairState>,
}

impl QueuePair {
    /// Create an empty pair
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PairState {
                active: Queue::default(),
                pending: None,
            }),
        }
    }

    /// Take the active queue for draining and install the next one.
    ///
    /// If a staged batch is waiting it is swapped in exactly once: either
    /// the caller receives it (the active queue was already empty) or it
    /// becomes the next active queue.
    pub fn fetch(&self) -> Queue {
        let mut state = self.state.lock();

        if state.active.is_empty() {
            if let Some(pending) = state.pending.take() {
                state.active = pending.execute();
            }
        }

        let returned = std::mem::take(&mut state.active);

        if let Some(pending) = state.pending.take() {
            state.active = pending.execute();
        }

        returned
    }

    /// Stage `segments` as the next active queue.
    ///
    /// Replaces the active queue immediately when it is empty; otherwise the
    /// batch is staged until a `fetch` drains the active queue. Only one
    /// staged batch may exist: a second push fails with
    /// [`Error::QueueInProgress`].
    pub fn push(&self, segments: Vec<Segment>) -> Result<()> {
        let mut state = self.state.lock();

        // only one reservoir chore may produce batches
        if state.pending.is_some() {
            return Err(Error::QueueInProgress);
        }

        if state.active.is_empty() {
            state.active = Queue::new(segments);
            return Ok(());
        }

        let (swapped, _) = watch::channel(());
        state.pending = Some(PendingSwap {
            queue: Queue::new(segments),
            swapped,
        });
        Ok(())
    }

    /// Block until the staged batch is swapped in, or until cancelled.
    /// Returns immediately when nothing is staged.
    pub async fn wait_for_swap(&self, cancel: &CancellationToken) -> Result<()> {
        let mut swapped = {
            let state = self.state.lock();
            match &state.pending {
                None => return Ok(()),
                Some(pending) => pending.swapped.subscribe(),
            }
        };

        tokio::select! {
            _ = swapped.changed() => Ok(()),
            () = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Number of segments in the active queue
    #[must_use]
    pub fn active_size(&self) -> usize {
        self.state.lock().active.size()
    }
}

impl Default for QueuePair {
    fn default() -> Self {
        Self::new()
    }
}
