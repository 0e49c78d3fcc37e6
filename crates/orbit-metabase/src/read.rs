//! Metabase reads used by the audit path.

use chrono::Utc;
use redb::ReadableTable;
use tokio_util::sync::CancellationToken;

use orbit_common::{Error, ObjectStream, Position, Result, StreamId};

use crate::store::{object_key, position_from_segment_key, segment_key, Metabase, OBJECTS, SEGMENTS};
use crate::types::{Object, ObjectRecord, Segment, SegmentRecord};

impl Metabase {
    /// Fetch the object addressed by the exact stream identity, regardless
    /// of status.
    pub async fn get_object(
        &self,
        cancel: &CancellationToken,
        stream: &ObjectStream,
    ) -> Result<Object> {
        stream.verify()?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let rtx = self.db.begin_read()?;
        let objects = rtx.open_table(OBJECTS)?;
        let key = object_key(
            &stream.project_id,
            &stream.bucket_name,
            &stream.object_key,
            stream.version,
        );
        let record: ObjectRecord = match objects.get(key.as_slice())? {
            Some(guard) => bincode::deserialize(guard.value())?,
            None => return Err(Error::object_not_found("object missing")),
        };
        if record.stream_id != *stream.stream_id.as_bytes() {
            return Err(Error::object_not_found("object missing"));
        }
        Ok(record.into_object(stream.clone()))
    }

    /// Resolve one segment by stream and position.
    ///
    /// A segment whose owning object has expired counts as gone: the caller
    /// (the reverifier in particular) must not fault nodes for data that is
    /// due for collection.
    pub async fn get_segment_by_position(
        &self,
        cancel: &CancellationToken,
        stream_id: StreamId,
        position: Position,
    ) -> Result<Segment> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let rtx = self.db.begin_read()?;
        let segments = rtx.open_table(SEGMENTS)?;
        let key = segment_key(&stream_id, position);
        let record: SegmentRecord = match segments.get(key.as_slice())? {
            Some(guard) => bincode::deserialize(guard.value())?,
            None => return Err(Error::segment_not_found("segment missing")),
        };

        let segment = record.into_segment(stream_id, position);
        if segment.is_expired(Utc::now()) {
            return Err(Error::segment_not_found("segment expired"));
        }
        Ok(segment)
    }

    /// List all segments of a stream in position order.
    pub async fn list_segments(
        &self,
        cancel: &CancellationToken,
        stream_id: StreamId,
    ) -> Result<Vec<Segment>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let rtx = self.db.begin_read()?;
        let segments = rtx.open_table(SEGMENTS)?;
        let prefix = *stream_id.as_bytes();

        let mut out = Vec::new();
        for entry in segments.range(prefix.as_slice()..)? {
            let (key, value) = entry?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            let position = position_from_segment_key(key.value());
            let record: SegmentRecord = bincode::deserialize(value.value())?;
            out.push(record.into_segment(stream_id, position));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::{BeginObjectExactVersion, CommitSegment};
    use chrono::Duration;
    use orbit_common::{
        CipherSuite, EncryptionParameters, Piece, PieceId, Pieces, ProjectId, RedundancyScheme,
    };
    use tempfile::TempDir;

    fn open_metabase() -> (TempDir, Metabase) {
        let dir = TempDir::new().unwrap();
        let metabase = Metabase::open(dir.path().join("metabase.redb")).unwrap();
        (dir, metabase)
    }

    fn stream() -> ObjectStream {
        ObjectStream {
            project_id: ProjectId::new(),
            bucket_name: b"testbucket".to_vec(),
            object_key: b"test/object".to_vec(),
            version: 1,
            stream_id: StreamId::new(),
        }
    }

    async fn begin_object(
        metabase: &Metabase,
        stream: &ObjectStream,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) {
        metabase
            .begin_object_exact_version(
                &CancellationToken::new(),
                BeginObjectExactVersion {
                    stream: stream.clone(),
                    encryption: EncryptionParameters {
                        cipher_suite: CipherSuite::AesGcm,
                        block_size: 256,
                    },
                    expires_at,
                    zombie_deletion_deadline: None,
                },
            )
            .await
            .unwrap();
    }

    async fn commit_segment_at(metabase: &Metabase, stream: &ObjectStream, position: Position) {
        metabase
            .commit_segment(
                &CancellationToken::new(),
                CommitSegment {
                    stream: stream.clone(),
                    position,
                    root_piece_id: PieceId::random(),
                    encrypted_key_nonce: vec![1; 24],
                    encrypted_key: vec![2; 48],
                    plain_offset: 0,
                    plain_size: 100,
                    encrypted_size: 256,
                    redundancy: RedundancyScheme::new(256, 3, 4, 4, 5),
                    pieces: vec![Piece {
                        number: 0,
                        storage_node: orbit_common::NodeId::new(),
                    }]
                    .into(),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_get_segment_by_position() {
        let (_dir, metabase) = open_metabase();
        let cancel = CancellationToken::new();

        let s = stream();
        begin_object(&metabase, &s, None).await;
        commit_segment_at(&metabase, &s, Position::new(0, 0)).await;

        let segment = metabase
            .get_segment_by_position(&cancel, s.stream_id, Position::new(0, 0))
            .await
            .unwrap();
        assert_eq!(segment.stream_id, s.stream_id);
        assert_eq!(segment.position, Position::new(0, 0));
        assert!(!segment.is_inline());

        let err = metabase
            .get_segment_by_position(&cancel, s.stream_id, Position::new(0, 1))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_expired_segment_is_gone() {
        let (_dir, metabase) = open_metabase();
        let cancel = CancellationToken::new();

        let s = stream();
        begin_object(&metabase, &s, Some(Utc::now() - Duration::hours(1))).await;
        commit_segment_at(&metabase, &s, Position::new(0, 0)).await;

        let err = metabase
            .get_segment_by_position(&cancel, s.stream_id, Position::new(0, 0))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_segments_position_order() {
        let (_dir, metabase) = open_metabase();
        let cancel = CancellationToken::new();

        let s = stream();
        begin_object(&metabase, &s, None).await;
        commit_segment_at(&metabase, &s, Position::new(1, 0)).await;
        commit_segment_at(&metabase, &s, Position::new(0, 1)).await;
        commit_segment_at(&metabase, &s, Position::new(0, 0)).await;

        let segments = metabase.list_segments(&cancel, s.stream_id).await.unwrap();
        let positions: Vec<Position> = segments.iter().map(|s| s.position).collect();
        assert_eq!(
            positions,
            vec![Position::new(0, 0), Position::new(0, 1), Position::new(1, 0)]
        );
    }

    #[tokio::test]
    async fn test_committed_object_read_back() {
        let (_dir, metabase) = open_metabase();
        let cancel = CancellationToken::new();

        let s = stream();
        begin_object(&metabase, &s, None).await;
        commit_segment_at(&metabase, &s, Position::new(0, 0)).await;

        let committed = metabase
            .commit_object(
                &cancel,
                crate::commit::CommitObject {
                    stream: s.clone(),
                    encrypted_metadata_nonce: vec![1; 24],
                    encrypted_metadata: vec![2; 64],
                    encrypted_metadata_encrypted_key: vec![3; 48],
                },
            )
            .await
            .unwrap();

        let read_back = metabase.get_object(&cancel, &s).await.unwrap();
        assert_eq!(read_back, committed);
        assert!(read_back.is_committed());
        assert_eq!(read_back.total_plain_size, 100);
        assert_eq!(read_back.total_encrypted_size, 256);
    }

    #[tokio::test]
    async fn test_get_object_requires_matching_stream() {
        let (_dir, metabase) = open_metabase();
        let cancel = CancellationToken::new();

        let s = stream();
        begin_object(&metabase, &s, None).await;

        assert!(metabase.get_object(&cancel, &s).await.is_ok());

        let mut wrong = s.clone();
        wrong.stream_id = StreamId::new();
        let err = metabase.get_object(&cancel, &wrong).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
