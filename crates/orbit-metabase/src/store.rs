//! Metabase storage backend.
//!
//! Backed by redb: serializable ACID transactions, typed tables, range
//! scans. Table keys are hand-encoded big-endian composites so that
//! lexicographic key order equals the logical order the commit protocol
//! iterates in (versions per object key, positions per stream).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, TableDefinition};
use tracing::info;

use orbit_common::{Position, ProjectId, Result, StreamId};

/// Objects: object_key() → bincode(ObjectRecord)
pub(crate) const OBJECTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("objects");
/// Segments: segment_key() → bincode(SegmentRecord)
pub(crate) const SEGMENTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("segments");
/// Stream index: stream_id bytes → object_key()
pub(crate) const STREAMS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("streams");
/// Node events: node_event_key() → bincode(NodeEventRecord)
pub(crate) const NODE_EVENTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("node_events");

/// Handle to the satellite's object/segment metadata store
#[derive(Clone)]
pub struct Metabase {
    pub(crate) db: Arc<Database>,
}

impl Metabase {
    /// Open (or create) the metabase at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path.as_ref())?;

        // Ensure all tables exist
        let wtx = db.begin_write()?;
        wtx.open_table(OBJECTS)?;
        wtx.open_table(SEGMENTS)?;
        wtx.open_table(STREAMS)?;
        wtx.open_table(NODE_EVENTS)?;
        wtx.commit()?;

        info!("opened metabase at {:?}", path.as_ref());
        Ok(Self { db: Arc::new(db) })
    }
}

// ── key encodings ─────────────────────────────────────────────────────────────

/// `project(16) | len(bucket) | bucket | len(key) | key | version` with
/// big-endian lengths and version; all versions of one object key are
/// adjacent and version-ordered.
pub(crate) fn object_key(
    project_id: &ProjectId,
    bucket_name: &[u8],
    object_key: &[u8],
    version: i64,
) -> Vec<u8> {
    let mut out = object_key_prefix(project_id, bucket_name, object_key);
    out.extend_from_slice(&(version as u64).to_be_bytes());
    out
}

/// The version-less prefix of [`object_key`]
pub(crate) fn object_key_prefix(
    project_id: &ProjectId,
    bucket_name: &[u8],
    object_key: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + 4 + bucket_name.len() + 4 + object_key.len() + 8);
    out.extend_from_slice(project_id.as_bytes());
    out.extend_from_slice(&(bucket_name.len() as u32).to_be_bytes());
    out.extend_from_slice(bucket_name);
    out.extend_from_slice(&(object_key.len() as u32).to_be_bytes());
    out.extend_from_slice(object_key);
    out
}

/// Decode the version from the trailing 8 bytes of an object table key
pub(crate) fn version_from_object_key(key: &[u8]) -> i64 {
    let tail: [u8; 8] = key[key.len() - 8..].try_into().expect("8-byte version");
    u64::from_be_bytes(tail) as i64
}

/// `stream_id(16) | position(8)`; a stream's segments are adjacent and
/// position-ordered.
pub(crate) fn segment_key(stream_id: &StreamId, position: Position) -> [u8; 24] {
    let mut out = [0u8; 24];
    out[..16].copy_from_slice(stream_id.as_bytes());
    out[16..].copy_from_slice(&position.to_bytes());
    out
}

/// Decode the position from the trailing 8 bytes of a segment table key
pub(crate) fn position_from_segment_key(key: &[u8]) -> Position {
    let tail: [u8; 8] = key[key.len() - 8..].try_into().expect("8-byte position");
    Position::from_bytes(tail)
}

/// `created_at_micros(8) | id(16)`; events are adjacent in creation order.
pub(crate) fn node_event_key(created_at_micros: i64, id: &uuid::Uuid) -> [u8; 24] {
    let mut out = [0u8; 24];
    out[..8].copy_from_slice(&(created_at_micros as u64).to_be_bytes());
    out[8..].copy_from_slice(id.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_version_order() {
        let project = ProjectId::new();
        let k1 = object_key(&project, b"bucket", b"key", 1);
        let k2 = object_key(&project, b"bucket", b"key", 2);
        let prefix = object_key_prefix(&project, b"bucket", b"key");

        assert!(k1 < k2);
        assert!(k1.starts_with(&prefix));
        assert_eq!(version_from_object_key(&k1), 1);
        assert_eq!(version_from_object_key(&k2), 2);
    }

    #[test]
    fn test_object_key_no_prefix_collision() {
        // ("ab", "c") and ("a", "bc") must not encode to the same key
        let project = ProjectId::new();
        let k1 = object_key(&project, b"ab", b"c", 1);
        let k2 = object_key(&project, b"a", b"bc", 1);
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_segment_key_position_order() {
        let stream = StreamId::new();
        let a = segment_key(&stream, Position::new(0, 7));
        let b = segment_key(&stream, Position::new(1, 0));
        assert!(a < b);
        assert_eq!(position_from_segment_key(&b), Position::new(1, 0));
    }
}
