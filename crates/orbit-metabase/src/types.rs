//! Object and segment records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orbit_common::{
    EncryptionParameters, ObjectStream, PieceId, Pieces, Position, RedundancyScheme, StreamId,
};

/// Observable state of an object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectStatus {
    /// Upload in progress; segments may attach
    Pending,
    /// Upload finished; the object and its segments are immutable
    Committed,
}

/// One object version
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Object {
    /// Full stream identity of this object version
    pub stream: ObjectStream,
    pub status: ObjectStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Deadline after which an abandoned pending upload may be reaped;
    /// cleared on commit
    pub zombie_deletion_deadline: Option<DateTime<Utc>>,
    pub encryption: EncryptionParameters,
    pub segment_count: i32,
    pub encrypted_metadata_nonce: Vec<u8>,
    pub encrypted_metadata: Vec<u8>,
    pub encrypted_metadata_encrypted_key: Vec<u8>,
    pub total_plain_size: i64,
    pub total_encrypted_size: i64,
    /// Shared encrypted size of all non-final segments, -1 when mixed,
    /// 0 when the object has no segments
    pub fixed_segment_size: i32,
}

impl Object {
    /// Check whether the object has been committed
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.status == ObjectStatus::Committed
    }
}

/// One segment of a stream, either remote (erasure-coded pieces) or inline
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub stream_id: StreamId,
    pub position: Position,
    pub created_at: DateTime<Utc>,
    /// Mirrors the owning object's expiration
    pub expires_at: Option<DateTime<Utc>>,
    pub root_piece_id: PieceId,
    pub encrypted_key_nonce: Vec<u8>,
    pub encrypted_key: Vec<u8>,
    pub encrypted_size: i32,
    /// Offset of this segment in the plain data stream
    pub plain_offset: i64,
    pub plain_size: i32,
    pub redundancy: RedundancyScheme,
    /// Inline payload; set exactly when the segment has no pieces
    pub inline_data: Option<Vec<u8>>,
    pub pieces: Pieces,
}

impl Segment {
    /// Check whether the segment stores its data inline
    #[must_use]
    pub fn is_inline(&self) -> bool {
        self.inline_data.is_some()
    }

    /// Check whether the segment's owning object has expired as of `now`
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires) if expires <= now)
    }
}

// ── stored forms ──────────────────────────────────────────────────────────────
//
// Rows keep timestamps as unix microseconds so the encoding stays stable
// independent of chrono's serde representation.

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct ObjectRecord {
    pub stream_id: [u8; 16],
    pub status: ObjectStatus,
    pub created_at_micros: i64,
    pub expires_at_micros: Option<i64>,
    pub zombie_deadline_micros: Option<i64>,
    pub encryption: EncryptionParameters,
    pub segment_count: i32,
    pub encrypted_metadata_nonce: Vec<u8>,
    pub encrypted_metadata: Vec<u8>,
    pub encrypted_metadata_encrypted_key: Vec<u8>,
    pub total_plain_size: i64,
    pub total_encrypted_size: i64,
    pub fixed_segment_size: i32,
}

impl ObjectRecord {
    pub fn into_object(self, stream: ObjectStream) -> Object {
        Object {
            stream,
            status: self.status,
            created_at: datetime_from_micros(self.created_at_micros),
            expires_at: self.expires_at_micros.map(datetime_from_micros),
            zombie_deletion_deadline: self.zombie_deadline_micros.map(datetime_from_micros),
            encryption: self.encryption,
            segment_count: self.segment_count,
            encrypted_metadata_nonce: self.encrypted_metadata_nonce,
            encrypted_metadata: self.encrypted_metadata,
            encrypted_metadata_encrypted_key: self.encrypted_metadata_encrypted_key,
            total_plain_size: self.total_plain_size,
            total_encrypted_size: self.total_encrypted_size,
            fixed_segment_size: self.fixed_segment_size,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct SegmentRecord {
    pub created_at_micros: i64,
    pub expires_at_micros: Option<i64>,
    pub root_piece_id: PieceId,
    pub encrypted_key_nonce: Vec<u8>,
    pub encrypted_key: Vec<u8>,
    pub encrypted_size: i32,
    pub plain_offset: i64,
    pub plain_size: i32,
    pub redundancy: RedundancyScheme,
    pub inline_data: Option<Vec<u8>>,
    pub pieces: Pieces,
}

impl SegmentRecord {
    pub fn into_segment(self, stream_id: StreamId, position: Position) -> Segment {
        Segment {
            stream_id,
            position,
            created_at: datetime_from_micros(self.created_at_micros),
            expires_at: self.expires_at_micros.map(datetime_from_micros),
            root_piece_id: self.root_piece_id,
            encrypted_key_nonce: self.encrypted_key_nonce,
            encrypted_key: self.encrypted_key,
            encrypted_size: self.encrypted_size,
            plain_offset: self.plain_offset,
            plain_size: self.plain_size,
            redundancy: self.redundancy,
            inline_data: self.inline_data,
            pieces: self.pieces,
        }
    }
}

pub(crate) fn datetime_from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}
