//! Reservoir chore: the single producer feeding the audit queues.
//!
//! The sampling algorithm itself lives elsewhere; the chore consumes its
//! output, normalizes it, and hands batches to the [`QueuePair`] with
//! one-slot backpressure (wait for the previous swap, then push).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use orbit_common::Result;

use crate::queue::{QueuePair, Segment};

/// Producer of segments to audit (the reservoir output)
#[async_trait]
pub trait SegmentSampler: Send + Sync {
    /// Produce the next batch of segments to audit.
    async fn sample_segments(&self, cancel: &CancellationToken) -> Result<Vec<Segment>>;
}

/// Periodically samples segments and stages them for the audit workers
pub struct ReservoirChore {
    queues: Arc<QueuePair>,
    sampler: Arc<dyn SegmentSampler>,
    interval: Duration,
}

impl ReservoirChore {
    /// Create the chore
    pub fn new(
        queues: Arc<QueuePair>,
        sampler: Arc<dyn SegmentSampler>,
        interval: Duration,
    ) -> Self {
        Self {
            queues,
            sampler,
            interval,
        }
    }

    /// Run the production loop until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = cancel.cancelled() => {
                    info!("reservoir chore stopping");
                    return;
                }
            }

            if let Err(err) = self.run_once(&cancel).await {
                if err.is_cancelled() {
                    info!("reservoir chore stopping");
                    return;
                }
                error!(%err, "reservoir cycle failed");
            }
        }
    }

    /// One production cycle: wait out the previous swap, sample, push.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<()> {
        // one-slot backpressure: the previous batch must have been swapped
        // in before we stage another
        self.queues.wait_for_swap(cancel).await?;

        let mut segments = self.sampler.sample_segments(cancel).await?;
        sort_and_dedup(&mut segments);
        if segments.is_empty() {
            debug!("reservoir produced no segments");
            return Ok(());
        }

        let count = segments.len();
        self.queues.push(segments)?;
        debug!(count, "staged audit batch");
        Ok(())
    }
}

/// Canonical batch order: by stream then position, duplicates collapsed.
pub(crate) fn sort_and_dedup(segments: &mut Vec<Segment>) {
    segments.sort_by(|a, b| {
        (a.stream_id, a.position).cmp(&(b.stream_id, b.position))
    });
    segments.dedup_by(|a, b| a.stream_id == b.stream_id && a.position == b.position);
}
