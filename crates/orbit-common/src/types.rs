//! Core type definitions for the orbit satellite.
//!
//! Identifiers, segment addressing and the upload stream identity shared by
//! the metabase and the audit subsystem.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Version sentinel requesting automatic version assignment.
pub const NEXT_VERSION: i64 = 0;

/// Unique identifier for a project
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectId(Uuid);

impl ProjectId {
    /// Generate a new random project ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Create from bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Check whether this is the all-zero ID
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProjectId({})", self.0)
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque unique identifier of one object version's segment stream
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId(Uuid);

impl StreamId {
    /// Generate a new random stream ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Create from bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Check whether this is the all-zero ID
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self.0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a storage node
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generate a new random node ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Create from bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Check whether this is the all-zero ID
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one erasure-coded piece family.
///
/// A segment stores one root piece ID; the ID of the physical piece held by
/// a given node is derived from the root, so the satellite never has to
/// store per-piece IDs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PieceId([u8; 32]);

impl PieceId {
    /// Generate a new random piece ID
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        bytes[..16].copy_from_slice(Uuid::new_v4().as_bytes());
        bytes[16..].copy_from_slice(Uuid::new_v4().as_bytes());
        Self(bytes)
    }

    /// Create from bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check whether this is the all-zero ID
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Derive the physical piece ID for one node from this root piece ID.
    #[must_use]
    pub fn derive(&self, node_id: NodeId, piece_num: u16) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        hasher.update(node_id.as_bytes());
        hasher.update(piece_num.to_be_bytes());
        Self(hasher.finalize().into())
    }
}

impl fmt::Debug for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PieceId({})", hex::encode(self.0))
    }
}

impl fmt::Display for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Position of a segment within a stream.
///
/// Ordered by part first, then index; this is the canonical iteration order
/// for reconstructing a stream.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Position {
    /// Part number (one multipart upload part per value)
    pub part: u32,
    /// Index within the part
    pub index: u32,
}

impl Position {
    /// Create a new position
    #[must_use]
    pub const fn new(part: u32, index: u32) -> Self {
        Self { part, index }
    }

    /// Big-endian encoding; lexicographic byte order equals position order.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&self.part.to_be_bytes());
        out[4..].copy_from_slice(&self.index.to_be_bytes());
        out
    }

    /// Decode from the big-endian encoding
    #[must_use]
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            part: u32::from_be_bytes(bytes[..4].try_into().expect("4 bytes")),
            index: u32::from_be_bytes(bytes[4..].try_into().expect("4 bytes")),
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.part, self.index)
    }
}

/// One erasure-coded piece placement
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Piece {
    /// Piece number within the redundancy scheme
    pub number: u16,
    /// Node holding the piece
    pub storage_node: NodeId,
}

/// The piece placements of one remote segment
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pieces(Vec<Piece>);

impl Pieces {
    /// Create from a list of placements
    #[must_use]
    pub fn new(pieces: Vec<Piece>) -> Self {
        Self(pieces)
    }

    /// Number of placements
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if there are no placements
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the placements
    pub fn iter(&self) -> std::slice::Iter<'_, Piece> {
        self.0.iter()
    }

    /// Find the placement with the given piece number
    #[must_use]
    pub fn by_number(&self, piece_num: u16) -> Option<&Piece> {
        self.0.iter().find(|p| p.number == piece_num)
    }

    /// Validate the placement set: non-empty and piece numbers unique.
    pub fn verify(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(Error::invalid_request("pieces missing"));
        }
        let mut numbers: Vec<u16> = self.0.iter().map(|p| p.number).collect();
        numbers.sort_unstable();
        for pair in numbers.windows(2) {
            if pair[0] == pair[1] {
                return Err(Error::invalid_request(format!(
                    "duplicate piece number {}",
                    pair[0]
                )));
            }
        }
        Ok(())
    }

    /// Validate against a redundancy scheme: `verify` plus numbers in range.
    pub fn verify_within(&self, redundancy: &RedundancyScheme) -> Result<()> {
        self.verify()?;
        for piece in &self.0 {
            if piece.number >= redundancy.total {
                return Err(Error::invalid_request(format!(
                    "piece number {} out of range for {} total shares",
                    piece.number, redundancy.total
                )));
            }
        }
        Ok(())
    }
}

impl From<Vec<Piece>> for Pieces {
    fn from(pieces: Vec<Piece>) -> Self {
        Self(pieces)
    }
}

impl FromIterator<Piece> for Pieces {
    fn from_iter<I: IntoIterator<Item = Piece>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Pieces {
    type Item = &'a Piece;
    type IntoIter = std::slice::Iter<'a, Piece>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Erasure coding parameters of a remote segment
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundancyScheme {
    /// Erasure share size in bytes
    pub share_size: i32,
    /// Minimum shares required to reconstruct
    pub required: u16,
    /// Below this many healthy shares the segment is repaired
    pub repair: u16,
    /// Target number of shares after upload
    pub optimal: u16,
    /// Total shares in the scheme
    pub total: u16,
}

impl RedundancyScheme {
    /// Create a new scheme
    #[must_use]
    pub const fn new(share_size: i32, required: u16, repair: u16, optimal: u16, total: u16) -> Self {
        Self {
            share_size,
            required,
            repair,
            optimal,
            total,
        }
    }

    /// Check whether the scheme is unset
    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Encryption cipher suite
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherSuite {
    /// Not specified; invalid for uploads
    #[default]
    Unspecified,
    /// AES-256-GCM
    AesGcm,
    /// XSalsa20-Poly1305
    SecretBox,
}

/// Encryption parameters of an object
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionParameters {
    /// Cipher suite used for segment data
    pub cipher_suite: CipherSuite,
    /// Encryption block size in bytes
    pub block_size: i32,
}

impl EncryptionParameters {
    /// Check whether the parameters are unset
    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Full identity of one object version's upload stream
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectStream {
    /// Owning project
    pub project_id: ProjectId,
    /// Bucket name (raw bytes)
    pub bucket_name: Vec<u8>,
    /// Object key within the bucket (raw bytes)
    pub object_key: Vec<u8>,
    /// Object version; `NEXT_VERSION` requests auto-assignment
    pub version: i64,
    /// Opaque stream identifier
    pub stream_id: StreamId,
}

impl ObjectStream {
    /// Validate the stream identity fields.
    pub fn verify(&self) -> Result<()> {
        if self.project_id.is_zero() {
            return Err(Error::invalid_request("ProjectID missing"));
        }
        if self.bucket_name.is_empty() {
            return Err(Error::invalid_request("BucketName missing"));
        }
        if self.object_key.is_empty() {
            return Err(Error::invalid_request("ObjectKey missing"));
        }
        if self.version < 0 {
            return Err(Error::invalid_request(format!(
                "Version invalid: {}",
                self.version
            )));
        }
        if self.stream_id.is_zero() {
            return Err(Error::invalid_request("StreamID missing"));
        }
        Ok(())
    }

    /// Human-readable location, for log and error messages
    #[must_use]
    pub fn location(&self) -> String {
        format!(
            "{}/{}/{} v{}",
            self.project_id,
            String::from_utf8_lossy(&self.bucket_name),
            String::from_utf8_lossy(&self.object_key),
            self.version
        )
    }
}

/// Address of one physical piece on one storage node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PieceLocator {
    /// Stream the piece's segment belongs to
    pub stream_id: StreamId,
    /// Position of the segment within the stream
    pub position: Position,
    /// Node that holds the piece
    pub node_id: NodeId,
    /// Piece number within the segment's redundancy scheme
    pub piece_num: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> ObjectStream {
        ObjectStream {
            project_id: ProjectId::new(),
            bucket_name: b"testbucket".to_vec(),
            object_key: b"test/key".to_vec(),
            version: 1,
            stream_id: StreamId::new(),
        }
    }

    #[test]
    fn test_position_order() {
        assert!(Position::new(0, 5) < Position::new(1, 0));
        assert!(Position::new(1, 0) < Position::new(1, 1));
        assert_eq!(Position::new(2, 3), Position::from_bytes(Position::new(2, 3).to_bytes()));
    }

    #[test]
    fn test_position_byte_order_matches_logical_order() {
        let a = Position::new(0, u32::MAX);
        let b = Position::new(1, 0);
        assert!(a < b);
        assert!(a.to_bytes() < b.to_bytes());
    }

    #[test]
    fn test_pieces_verify() {
        let node = NodeId::new();
        assert!(Pieces::new(vec![]).verify().is_err());

        let dup = Pieces::new(vec![
            Piece { number: 1, storage_node: node },
            Piece { number: 1, storage_node: NodeId::new() },
        ]);
        assert!(dup.verify().is_err());

        let ok = Pieces::new(vec![
            Piece { number: 0, storage_node: node },
            Piece { number: 1, storage_node: NodeId::new() },
        ]);
        assert!(ok.verify().is_ok());

        let rs = RedundancyScheme::new(256, 1, 1, 2, 2);
        assert!(ok.verify_within(&rs).is_ok());
        let out_of_range = Pieces::new(vec![Piece { number: 2, storage_node: node }]);
        assert!(out_of_range.verify_within(&rs).is_err());
    }

    #[test]
    fn test_object_stream_verify() {
        assert!(stream().verify().is_ok());

        let mut s = stream();
        s.bucket_name.clear();
        assert!(s.verify().is_err());

        let mut s = stream();
        s.version = -1;
        assert!(s.verify().is_err());

        let mut s = stream();
        s.stream_id = StreamId::from_bytes([0u8; 16]);
        assert!(s.verify().is_err());

        let mut s = stream();
        s.version = NEXT_VERSION;
        assert!(s.verify().is_ok());
    }

    #[test]
    fn test_piece_id_derive() {
        let root = PieceId::random();
        let node = NodeId::new();

        // deterministic
        assert_eq!(root.derive(node, 3), root.derive(node, 3));
        // distinct per piece number and per node
        assert_ne!(root.derive(node, 3), root.derive(node, 4));
        assert_ne!(root.derive(node, 3), root.derive(NodeId::new(), 3));
        assert_ne!(root.derive(node, 3), root);
    }
}
