//! Orbit protocol — piece wire-format messages.
//!
//! These messages are hand-maintained prost structs rather than generated
//! code: only the message encoding is part of the satellite core (the node
//! RPC transport lives elsewhere), and the field tags below are frozen.
//! Signatures cover the canonical prost encoding of these messages, so any
//! change to tags or field types is a wire break.

pub mod signing;

pub use signing::{SigningError, SigningKey, VerifyingKey};

/// Piece content hash algorithm
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum HashAlgorithm {
    /// SHA-256
    Sha256 = 0,
}

impl HashAlgorithm {
    /// Decode from the wire value, falling back to SHA-256.
    #[must_use]
    pub fn from_wire(value: i32) -> Self {
        Self::try_from(value).unwrap_or(Self::Sha256)
    }
}

/// What a piece order authorizes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PieceAction {
    Invalid = 0,
    Put = 1,
    Get = 2,
    GetAudit = 3,
    GetRepair = 4,
    PutRepair = 5,
    Delete = 6,
}

/// Satellite-signed authorization for one piece transfer.
///
/// The satellite signs the canonical encoding with `satellite_signature`
/// cleared; storage nodes keep the limit alongside the piece and return it
/// in the piece header so auditors can re-check provenance.
#[derive(Clone, PartialEq, prost::Message)]
pub struct OrderLimit {
    #[prost(bytes = "vec", tag = "1")]
    pub serial_number: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub satellite_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub storage_node_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub piece_id: Vec<u8>,
    /// Maximum number of bytes the order allows to transfer
    #[prost(int64, tag = "5")]
    pub limit: i64,
    #[prost(enumeration = "PieceAction", tag = "6")]
    pub action: i32,
    /// Order creation time, unix microseconds
    #[prost(int64, tag = "7")]
    pub order_creation: i64,
    /// Piece expiration time, unix microseconds; 0 = never
    #[prost(int64, tag = "8")]
    pub piece_expiration: i64,
    /// Public key committed for this upload; verifies the piece hash signature
    #[prost(bytes = "vec", tag = "9")]
    pub uplink_public_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "10")]
    pub satellite_signature: Vec<u8>,
}

/// Signed summary of one stored piece.
///
/// This is the message the per-upload key signs; the signature travels in
/// `PieceHeader::signature` and the remaining fields are reconstructed from
/// the header and the downloaded content during verification.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PieceHash {
    #[prost(bytes = "vec", tag = "1")]
    pub piece_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub hash: Vec<u8>,
    #[prost(int64, tag = "3")]
    pub piece_size: i64,
    /// Creation time, unix microseconds
    #[prost(int64, tag = "4")]
    pub timestamp: i64,
    #[prost(bytes = "vec", tag = "5")]
    pub signature: Vec<u8>,
    #[prost(enumeration = "HashAlgorithm", tag = "6")]
    pub hash_algorithm: i32,
}

/// Header stored by a node in front of the piece content
#[derive(Clone, PartialEq, prost::Message)]
pub struct PieceHeader {
    #[prost(int32, tag = "1")]
    pub format_version: i32,
    /// Hash of the piece content, using `hash_algorithm`
    #[prost(bytes = "vec", tag = "2")]
    pub hash: Vec<u8>,
    /// Signature by the upload key over the canonical `PieceHash` bytes
    #[prost(bytes = "vec", tag = "3")]
    pub signature: Vec<u8>,
    /// Piece creation time, unix microseconds
    #[prost(int64, tag = "4")]
    pub creation: i64,
    #[prost(message, optional, tag = "5")]
    pub order_limit: Option<OrderLimit>,
    #[prost(enumeration = "HashAlgorithm", tag = "6")]
    pub hash_algorithm: i32,
}

/// Current piece header format version
pub const PIECE_HEADER_FORMAT_V1: i32 = 1;

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_order_limit_roundtrip() {
        let limit = OrderLimit {
            serial_number: vec![1, 2, 3],
            satellite_id: vec![9; 16],
            storage_node_id: vec![7; 16],
            piece_id: vec![5; 32],
            limit: 65536,
            action: PieceAction::GetAudit as i32,
            order_creation: 1_700_000_000_000_000,
            piece_expiration: 0,
            uplink_public_key: vec![4; 32],
            satellite_signature: vec![8; 64],
        };

        let bytes = limit.encode_to_vec();
        let decoded = OrderLimit::decode(bytes.as_slice()).unwrap();
        assert_eq!(limit, decoded);
    }

    #[test]
    fn test_hash_algorithm_from_wire() {
        assert_eq!(HashAlgorithm::from_wire(0), HashAlgorithm::Sha256);
        // unknown values fall back instead of failing the decode path
        assert_eq!(HashAlgorithm::from_wire(42), HashAlgorithm::Sha256);
    }
}
