//! Orbit common — shared identifiers, data model and error types.
//!
//! Everything in here is consumed by both the metabase and the audit
//! subsystem; keep it free of any storage or network concern.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    CipherSuite, EncryptionParameters, NodeId, ObjectStream, Piece, PieceId, PieceLocator, Pieces,
    Position, ProjectId, RedundancyScheme, StreamId, NEXT_VERSION,
};
