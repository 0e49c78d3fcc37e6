//! Interfaces to the storage-node piece protocol and the reputation system.
//!
//! Both live outside this crate; the reverifier only consumes these seams.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use orbit_common::{NodeId, PieceId, PieceLocator};
use orbit_proto::PieceHeader;

use crate::reverifier::Outcome;

/// Transport-level failures when fetching a piece
#[derive(Debug, Error)]
pub enum PieceStoreError {
    /// The node could not be dialed at all
    #[error("node unreachable: {0}")]
    Unreachable(String),

    /// The node was dialed but did not answer in time
    #[error("contact timed out")]
    Timeout,

    /// The node answered but does not hold the piece
    #[error("piece not found")]
    PieceNotFound,

    /// The node returned data that does not parse as a piece
    #[error("malformed piece: {0}")]
    Malformed(String),

    /// Any other transport failure
    #[error("transport error: {0}")]
    Transport(String),
}

/// Client side of the storage-node piece protocol
#[async_trait]
pub trait PieceStore: Send + Sync {
    /// Open a piece on a node for reading.
    async fn open_piece(
        &self,
        cancel: &CancellationToken,
        node_id: NodeId,
        piece_id: PieceId,
    ) -> Result<Box<dyn PieceReader>, PieceStoreError>;
}

/// Reader over one opened piece
#[async_trait]
pub trait PieceReader: Send {
    /// The piece header stored by the node
    fn header(&self) -> &PieceHeader;

    /// Read the full piece content.
    async fn read_all(&mut self) -> Result<Bytes, PieceStoreError>;
}

/// Sink for audit outcomes; consumed by the reputation subsystem
#[async_trait]
pub trait ReputationReporter: Send + Sync {
    /// Record one audit outcome for a node. Fire-and-forget: the caller
    /// never observes reputation state.
    async fn report(&self, node_id: NodeId, outcome: Outcome);

    /// A job exhausted its reinsertion budget without a terminal answer;
    /// the node is due for disqualification review.
    async fn report_reverify_exceeded(&self, locator: &PieceLocator);
}
