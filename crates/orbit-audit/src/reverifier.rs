//! Piece reverification.
//!
//! A reverification decides the fate of one physical piece: fetch it from
//! its node, check the satellite's signature on the order limit, the content
//! hash, and the upload key's signature on the piece hash. Transport
//! problems map to transient outcomes; any cryptographic mismatch is
//! terminal.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use orbit_common::{PieceLocator, Result};
use orbit_metabase::Metabase;
use orbit_proto::signing::{
    hash_piece_content, verify_order_limit, verify_piece_hash, verifying_key_from_bytes,
};
use orbit_proto::{HashAlgorithm, PieceHash, VerifyingKey};

use crate::config::AuditConfig;
use crate::pieces::{PieceStore, PieceStoreError, ReputationReporter};
use crate::reverify_queue::ReverificationJob;

/// Terminal classification of one piece audit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The piece checked out, or there is nothing left to audit
    Success,
    /// The node answered with bad data; terminal
    Failure,
    /// The node could not be reached
    NodeOffline,
    /// The node was reached but did not answer in time
    TimedOut,
    /// Something prevented a verdict; retry later
    Unknown,
}

impl Outcome {
    /// Check whether the outcome ends the job
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

/// Performs piece reverifications and reports their outcomes
pub struct Reverifier {
    metabase: Metabase,
    piece_store: Arc<dyn PieceStore>,
    reporter: Arc<dyn ReputationReporter>,
    satellite_key: VerifyingKey,
    max_reverify_count: i32,
}

impl Reverifier {
    /// Create a reverifier
    pub fn new(
        metabase: Metabase,
        piece_store: Arc<dyn PieceStore>,
        reporter: Arc<dyn ReputationReporter>,
        satellite_key: VerifyingKey,
        config: &AuditConfig,
    ) -> Self {
        Self {
            metabase,
            piece_store,
            reporter,
            satellite_key,
            max_reverify_count: config.max_reverify_count,
        }
    }

    /// Reverify one piece and report the outcome.
    ///
    /// Returns whether the job should stay in the queue: false on a terminal
    /// outcome, and false once the job's reinsertion count has reached the
    /// ceiling (the node is then surfaced for disqualification).
    pub async fn reverify_piece(
        &self,
        cancel: &CancellationToken,
        job: &ReverificationJob,
    ) -> bool {
        let outcome = match self.do_reverify_piece(cancel, &job.locator).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(%err, node_id = %job.locator.node_id, "could not reverify piece");
                return true;
            }
        };

        self.reporter.report(job.locator.node_id, outcome).await;

        if outcome.is_terminal() {
            return false;
        }
        if job.reverify_count >= self.max_reverify_count {
            warn!(
                node_id = %job.locator.node_id,
                count = job.reverify_count,
                "reverification ceiling reached"
            );
            self.reporter.report_reverify_exceeded(&job.locator).await;
            return false;
        }
        true
    }

    /// Determine the audit outcome of one piece.
    ///
    /// Errors are bug-class only; every expected condition maps to an
    /// [`Outcome`].
    pub async fn do_reverify_piece(
        &self,
        cancel: &CancellationToken,
        locator: &PieceLocator,
    ) -> Result<Outcome> {
        // 1. resolve the segment; gone means there is nothing to audit
        let segment = match self
            .metabase
            .get_segment_by_position(cancel, locator.stream_id, locator.position)
            .await
        {
            Ok(segment) => segment,
            Err(err) if err.is_cancelled() => return Ok(Outcome::Unknown),
            Err(err) if err.is_not_found() => {
                debug!(stream_id = %locator.stream_id, "segment gone; audit moot");
                return Ok(Outcome::Success);
            }
            Err(err) => return Err(err),
        };

        // 2. the piece may have been reallocated away from this node
        let holds_piece = segment
            .pieces
            .by_number(locator.piece_num)
            .is_some_and(|piece| piece.storage_node == locator.node_id);
        if !holds_piece {
            debug!(
                node_id = %locator.node_id,
                piece_num = locator.piece_num,
                "piece no longer on node; audit moot"
            );
            return Ok(Outcome::Success);
        }

        // 3-4. fetch the piece
        let piece_id = segment.root_piece_id.derive(locator.node_id, locator.piece_num);
        let mut reader = match self
            .piece_store
            .open_piece(cancel, locator.node_id, piece_id)
            .await
        {
            Ok(reader) => reader,
            Err(err) => return Ok(transport_outcome(&err, locator)),
        };
        let header = reader.header().clone();
        let content = match reader.read_all().await {
            Ok(content) => content,
            Err(err) => return Ok(transport_outcome(&err, locator)),
        };
        if cancel.is_cancelled() {
            return Ok(Outcome::Unknown);
        }

        // 5. validate; any mismatch is terminal
        let Some(order_limit) = header.order_limit else {
            debug!(node_id = %locator.node_id, "piece header carries no order limit");
            return Ok(Outcome::Failure);
        };
        if verify_order_limit(&self.satellite_key, &order_limit).is_err() {
            debug!(node_id = %locator.node_id, "order limit signature invalid");
            return Ok(Outcome::Failure);
        }

        let algorithm = HashAlgorithm::from_wire(header.hash_algorithm);
        if hash_piece_content(algorithm, &content) != header.hash {
            debug!(node_id = %locator.node_id, "piece content does not match header hash");
            return Ok(Outcome::Failure);
        }

        let upload_key = match verifying_key_from_bytes(&order_limit.uplink_public_key) {
            Ok(key) => key,
            Err(_) => return Ok(Outcome::Failure),
        };
        let piece_hash = PieceHash {
            piece_id: piece_id.as_bytes().to_vec(),
            hash: header.hash.clone(),
            piece_size: content.len() as i64,
            timestamp: header.creation,
            signature: header.signature.clone(),
            hash_algorithm: header.hash_algorithm,
        };
        if verify_piece_hash(&upload_key, &piece_hash).is_err() {
            debug!(node_id = %locator.node_id, "piece hash signature invalid");
            return Ok(Outcome::Failure);
        }

        Ok(Outcome::Success)
    }
}

fn transport_outcome(err: &PieceStoreError, locator: &PieceLocator) -> Outcome {
    let outcome = match err {
        PieceStoreError::Unreachable(_) => Outcome::NodeOffline,
        PieceStoreError::Timeout => Outcome::TimedOut,
        // the node answered, just not with the piece it committed to hold
        PieceStoreError::PieceNotFound | PieceStoreError::Malformed(_) => Outcome::Failure,
        PieceStoreError::Transport(_) => Outcome::Unknown,
    };
    debug!(%err, node_id = %locator.node_id, ?outcome, "piece fetch failed");
    outcome
}
