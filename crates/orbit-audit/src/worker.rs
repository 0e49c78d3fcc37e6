//! Audit and reverification workers.
//!
//! Thin control loops over the queues: the audit worker drains fetched
//! queues through the stripe auditor and forwards unanswered pieces to the
//! reverify queue; the reverify worker claims jobs and lets the
//! [`Reverifier`] decide their fate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use orbit_common::{Error, NodeId, PieceLocator, Result};

use crate::queue::{QueuePair, Segment};
use crate::reverifier::Reverifier;
use crate::reverify_queue::ReverifyQueue;

/// Result of one stripe audit across a segment's pieces
#[derive(Clone, Debug, Default)]
pub struct AuditReport {
    pub successes: Vec<NodeId>,
    pub failures: Vec<NodeId>,
    pub offlines: Vec<NodeId>,
    pub unknown: Vec<NodeId>,
    /// Pieces that did not answer promptly and need per-piece follow-up
    pub pending_audits: Vec<PieceLocator>,
}

/// The stripe-level verifier: downloads a stripe across a segment's pieces
/// and checks that the shares agree. Lives outside this crate.
#[async_trait]
pub trait StripeAuditor: Send + Sync {
    async fn audit_segment(
        &self,
        cancel: &CancellationToken,
        segment: &Segment,
    ) -> Result<AuditReport>;
}

/// Drains audit queues and feeds the reverify queue
pub struct AuditWorker {
    queues: Arc<QueuePair>,
    auditor: Arc<dyn StripeAuditor>,
    reverify_queue: Arc<dyn ReverifyQueue>,
    poll_interval: Duration,
}

impl AuditWorker {
    /// Create a worker
    pub fn new(
        queues: Arc<QueuePair>,
        auditor: Arc<dyn StripeAuditor>,
        reverify_queue: Arc<dyn ReverifyQueue>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queues,
            auditor,
            reverify_queue,
            poll_interval,
        }
    }

    /// Run until cancelled, fetching and draining one queue at a time.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            match self.process_queue(&cancel).await {
                Ok(()) => {}
                Err(err) if err.is_cancelled() => {
                    info!("audit worker stopping");
                    return;
                }
                Err(err) => warn!(%err, "audit pass failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                () = cancel.cancelled() => {
                    info!("audit worker stopping");
                    return;
                }
            }
        }
    }

    /// Fetch the active queue and audit every segment in it.
    pub async fn process_queue(&self, cancel: &CancellationToken) -> Result<()> {
        let mut queue = self.queues.fetch();
        debug!(size = queue.size(), "fetched audit queue");

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let segment = match queue.next() {
                Ok(segment) => segment,
                Err(Error::EmptyQueue) => return Ok(()),
                Err(err) => return Err(err),
            };
            if segment.is_expired(Utc::now()) {
                debug!(stream_id = %segment.stream_id, "skipping expired segment");
                continue;
            }

            let report = match self.auditor.audit_segment(cancel, &segment).await {
                Ok(report) => report,
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    warn!(%err, stream_id = %segment.stream_id, "segment audit failed");
                    continue;
                }
            };
            for locator in &report.pending_audits {
                self.reverify_queue.insert(cancel, locator).await?;
            }
        }
    }
}

/// Claims reverification jobs and applies the reverifier's verdicts
pub struct ReverifyWorker {
    reverifier: Arc<Reverifier>,
    queue: Arc<dyn ReverifyQueue>,
    poll_interval: Duration,
}

impl ReverifyWorker {
    /// Create a worker
    pub fn new(
        reverifier: Arc<Reverifier>,
        queue: Arc<dyn ReverifyQueue>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            reverifier,
            queue,
            poll_interval,
        }
    }

    /// Run until cancelled, processing jobs as they become claimable.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            match self.process_one(&cancel).await {
                // processed a job; immediately try the next
                Ok(true) => continue,
                // queue empty; back off
                Ok(false) => {}
                Err(err) if err.is_cancelled() => {
                    info!("reverify worker stopping");
                    return;
                }
                Err(err) => warn!(%err, "reverification pass failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                () = cancel.cancelled() => {
                    info!("reverify worker stopping");
                    return;
                }
            }
        }
    }

    /// Claim and process one job. Returns false when nothing was claimable.
    pub async fn process_one(&self, cancel: &CancellationToken) -> Result<bool> {
        let job = match self.queue.get_next_job(cancel).await {
            Ok(job) => job,
            Err(Error::EmptyQueue) => return Ok(false),
            Err(err) => return Err(err),
        };

        let keep = self.reverifier.reverify_piece(cancel, &job).await;
        if keep {
            // transient outcome: reinsert to bump the job's counter
            self.queue.insert(cancel, &job.locator).await?;
        } else {
            self.queue.remove(cancel, &job.locator).await?;
        }
        Ok(true)
    }
}
