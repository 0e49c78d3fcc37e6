//! The upload state machine: begin object, attach segments, commit.
//!
//! Each operation validates its arguments up front and then runs exactly one
//! write transaction. Readers never observe a half-committed object: the
//! aggregate recomputation and the status flip in [`Metabase::commit_object`]
//! are a single transaction.

use chrono::{DateTime, Utc};
use redb::ReadableTable;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use orbit_common::{
    CipherSuite, EncryptionParameters, Error, ObjectStream, PieceId, Pieces, Position,
    RedundancyScheme, Result, NEXT_VERSION,
};

use crate::store::{object_key, segment_key, version_from_object_key, Metabase, OBJECTS, SEGMENTS, STREAMS};
use crate::types::{Object, ObjectRecord, ObjectStatus, SegmentRecord};

/// Arguments for starting an object upload with an auto-assigned version
#[derive(Clone, Debug)]
pub struct BeginObjectNextVersion {
    pub stream: ObjectStream,
    pub encryption: EncryptionParameters,
    pub expires_at: Option<DateTime<Utc>>,
    pub zombie_deletion_deadline: Option<DateTime<Utc>>,
}

/// Arguments for starting an object upload at a caller-chosen version
#[derive(Clone, Debug)]
pub struct BeginObjectExactVersion {
    pub stream: ObjectStream,
    pub encryption: EncryptionParameters,
    pub expires_at: Option<DateTime<Utc>>,
    pub zombie_deletion_deadline: Option<DateTime<Utc>>,
}

/// Arguments for the pre-flight check before a segment upload
#[derive(Clone, Debug)]
pub struct BeginSegment {
    pub stream: ObjectStream,
    pub position: Position,
    pub root_piece_id: PieceId,
    pub pieces: Pieces,
}

/// Arguments for committing a remote segment
#[derive(Clone, Debug)]
pub struct CommitSegment {
    pub stream: ObjectStream,
    pub position: Position,
    pub root_piece_id: PieceId,
    pub encrypted_key_nonce: Vec<u8>,
    pub encrypted_key: Vec<u8>,
    /// Offset in the plain data stream
    pub plain_offset: i64,
    /// Size before encryption
    pub plain_size: i32,
    /// Segment size after encryption
    pub encrypted_size: i32,
    pub redundancy: RedundancyScheme,
    pub pieces: Pieces,
}

/// Arguments for committing an inline segment
#[derive(Clone, Debug)]
pub struct CommitInlineSegment {
    pub stream: ObjectStream,
    pub position: Position,
    pub encrypted_key_nonce: Vec<u8>,
    pub encrypted_key: Vec<u8>,
    pub plain_offset: i64,
    pub plain_size: i32,
    pub inline_data: Vec<u8>,
}

/// Arguments for committing an object
#[derive(Clone, Debug)]
pub struct CommitObject {
    pub stream: ObjectStream,
    pub encrypted_metadata_nonce: Vec<u8>,
    pub encrypted_metadata: Vec<u8>,
    pub encrypted_metadata_encrypted_key: Vec<u8>,
}

/// Arguments for replacing a committed object's metadata
#[derive(Clone, Debug)]
pub struct UpdateObjectMetadata {
    pub stream: ObjectStream,
    pub encrypted_metadata_nonce: Vec<u8>,
    pub encrypted_metadata: Vec<u8>,
    pub encrypted_metadata_encrypted_key: Vec<u8>,
}

fn verify_encryption(encryption: &EncryptionParameters) -> Result<()> {
    if encryption.is_zero() || encryption.cipher_suite == CipherSuite::Unspecified {
        return Err(Error::invalid_request("Encryption is missing"));
    }
    if encryption.block_size <= 0 {
        return Err(Error::invalid_request(
            "Encryption.BlockSize is negative or zero",
        ));
    }
    Ok(())
}

fn check_cancel(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

impl Metabase {
    /// Insert a pending object, assigning `max(version) + 1` for its key.
    ///
    /// Returns the assigned version.
    pub async fn begin_object_next_version(
        &self,
        cancel: &CancellationToken,
        opts: BeginObjectNextVersion,
    ) -> Result<i64> {
        opts.stream.verify()?;
        verify_encryption(&opts.encryption)?;
        if opts.stream.version != NEXT_VERSION {
            return Err(Error::invalid_request("Version should be NextVersion"));
        }
        check_cancel(cancel)?;

        let wtx = self.db.begin_write()?;
        let version = {
            let mut objects = wtx.open_table(OBJECTS)?;
            let mut streams = wtx.open_table(STREAMS)?;

            let start = object_key(
                &opts.stream.project_id,
                &opts.stream.bucket_name,
                &opts.stream.object_key,
                0,
            );
            let end = object_key(
                &opts.stream.project_id,
                &opts.stream.bucket_name,
                &opts.stream.object_key,
                i64::MAX,
            );
            let version = match objects.range(start.as_slice()..=end.as_slice())?.next_back() {
                Some(entry) => {
                    let (key, _) = entry?;
                    version_from_object_key(key.value()) + 1
                }
                None => 1,
            };

            let key = object_key(
                &opts.stream.project_id,
                &opts.stream.bucket_name,
                &opts.stream.object_key,
                version,
            );
            let record = pending_record(&opts.stream, &opts.encryption, opts.expires_at, opts.zombie_deletion_deadline);
            objects.insert(key.as_slice(), bincode::serialize(&record)?.as_slice())?;
            streams.insert(opts.stream.stream_id.as_bytes().as_slice(), key.as_slice())?;
            version
        };
        check_cancel(cancel)?;
        wtx.commit()?;

        debug!(location = %opts.stream.location(), version, "began object upload");
        Ok(version)
    }

    /// Insert a pending object at the caller-chosen version.
    ///
    /// A row already occupying `(project, bucket, key, version)` fails with
    /// [`Error::Conflict`]. Returns the version.
    pub async fn begin_object_exact_version(
        &self,
        cancel: &CancellationToken,
        opts: BeginObjectExactVersion,
    ) -> Result<i64> {
        opts.stream.verify()?;
        verify_encryption(&opts.encryption)?;
        if opts.stream.version == NEXT_VERSION {
            return Err(Error::invalid_request("Version should not be NextVersion"));
        }
        check_cancel(cancel)?;

        let wtx = self.db.begin_write()?;
        {
            let mut objects = wtx.open_table(OBJECTS)?;
            let mut streams = wtx.open_table(STREAMS)?;

            let key = object_key(
                &opts.stream.project_id,
                &opts.stream.bucket_name,
                &opts.stream.object_key,
                opts.stream.version,
            );
            if objects.get(key.as_slice())?.is_some() {
                return Err(Error::conflict("object already exists"));
            }
            let record = pending_record(&opts.stream, &opts.encryption, opts.expires_at, opts.zombie_deletion_deadline);
            objects.insert(key.as_slice(), bincode::serialize(&record)?.as_slice())?;
            streams.insert(opts.stream.stream_id.as_bytes().as_slice(), key.as_slice())?;
        }
        check_cancel(cancel)?;
        wtx.commit()?;

        debug!(location = %opts.stream.location(), "began object upload");
        Ok(opts.stream.version)
    }

    /// Verify that a segment upload may start: arguments are sound and the
    /// identified object is pending. Persists nothing.
    pub async fn begin_segment(
        &self,
        cancel: &CancellationToken,
        opts: BeginSegment,
    ) -> Result<()> {
        opts.stream.verify()?;
        opts.pieces.verify()?;
        if opts.root_piece_id.is_zero() {
            return Err(Error::invalid_request("RootPieceID missing"));
        }
        check_cancel(cancel)?;

        let rtx = self.db.begin_read()?;
        let objects = rtx.open_table(OBJECTS)?;
        fetch_pending(&objects, &opts.stream)?;
        Ok(())
    }

    /// Attach a remote segment to a pending object.
    pub async fn commit_segment(
        &self,
        cancel: &CancellationToken,
        opts: CommitSegment,
    ) -> Result<()> {
        opts.stream.verify()?;
        opts.pieces.verify_within(&opts.redundancy)?;
        if opts.root_piece_id.is_zero() {
            return Err(Error::invalid_request("RootPieceID missing"));
        }
        if opts.encrypted_key.is_empty() {
            return Err(Error::invalid_request("EncryptedKey missing"));
        }
        if opts.encrypted_key_nonce.is_empty() {
            return Err(Error::invalid_request("EncryptedKeyNonce missing"));
        }
        if opts.encrypted_size <= 0 {
            return Err(Error::invalid_request("EncryptedSize negative or zero"));
        }
        if opts.plain_size <= 0 {
            return Err(Error::invalid_request("PlainSize negative or zero"));
        }
        if opts.plain_offset < 0 {
            return Err(Error::invalid_request("PlainOffset negative"));
        }
        if opts.redundancy.is_zero() {
            return Err(Error::invalid_request("Redundancy zero"));
        }
        check_cancel(cancel)?;

        let wtx = self.db.begin_write()?;
        {
            let objects = wtx.open_table(OBJECTS)?;
            let mut segments = wtx.open_table(SEGMENTS)?;

            let object = fetch_pending(&objects, &opts.stream)?;

            let key = segment_key(&opts.stream.stream_id, opts.position);
            if segments.get(key.as_slice())?.is_some() {
                return Err(Error::conflict("segment already exists"));
            }
            let record = SegmentRecord {
                created_at_micros: Utc::now().timestamp_micros(),
                expires_at_micros: object.expires_at_micros,
                root_piece_id: opts.root_piece_id,
                encrypted_key_nonce: opts.encrypted_key_nonce,
                encrypted_key: opts.encrypted_key,
                encrypted_size: opts.encrypted_size,
                plain_offset: opts.plain_offset,
                plain_size: opts.plain_size,
                redundancy: opts.redundancy,
                inline_data: None,
                pieces: opts.pieces,
            };
            segments.insert(key.as_slice(), bincode::serialize(&record)?.as_slice())?;
        }
        check_cancel(cancel)?;
        wtx.commit()?;
        Ok(())
    }

    /// Attach an inline segment to a pending object.
    pub async fn commit_inline_segment(
        &self,
        cancel: &CancellationToken,
        opts: CommitInlineSegment,
    ) -> Result<()> {
        opts.stream.verify()?;
        if opts.inline_data.is_empty() {
            return Err(Error::invalid_request("InlineData missing"));
        }
        if opts.encrypted_key.is_empty() {
            return Err(Error::invalid_request("EncryptedKey missing"));
        }
        if opts.encrypted_key_nonce.is_empty() {
            return Err(Error::invalid_request("EncryptedKeyNonce missing"));
        }
        if opts.plain_size <= 0 {
            return Err(Error::invalid_request("PlainSize negative or zero"));
        }
        if opts.plain_offset < 0 {
            return Err(Error::invalid_request("PlainOffset negative"));
        }
        check_cancel(cancel)?;

        let wtx = self.db.begin_write()?;
        {
            let objects = wtx.open_table(OBJECTS)?;
            let mut segments = wtx.open_table(SEGMENTS)?;

            let object = fetch_pending(&objects, &opts.stream)?;

            let key = segment_key(&opts.stream.stream_id, opts.position);
            if segments.get(key.as_slice())?.is_some() {
                return Err(Error::conflict("segment already exists"));
            }
            let record = SegmentRecord {
                created_at_micros: Utc::now().timestamp_micros(),
                expires_at_micros: object.expires_at_micros,
                root_piece_id: PieceId::from_bytes([0u8; 32]),
                encrypted_key_nonce: opts.encrypted_key_nonce,
                encrypted_key: opts.encrypted_key,
                encrypted_size: opts.inline_data.len() as i32,
                plain_offset: opts.plain_offset,
                plain_size: opts.plain_size,
                redundancy: RedundancyScheme::default(),
                inline_data: Some(opts.inline_data),
                pieces: Pieces::default(),
            };
            segments.insert(key.as_slice(), bincode::serialize(&record)?.as_slice())?;
        }
        check_cancel(cancel)?;
        wtx.commit()?;
        Ok(())
    }

    /// Flip a pending object to committed, recomputing its aggregates from
    /// the attached segments. Returns the committed object.
    pub async fn commit_object(
        &self,
        cancel: &CancellationToken,
        opts: CommitObject,
    ) -> Result<Object> {
        opts.stream.verify()?;
        check_cancel(cancel)?;

        let wtx = self.db.begin_write()?;
        let object = {
            let mut objects = wtx.open_table(OBJECTS)?;
            let segments = wtx.open_table(SEGMENTS)?;

            let stream_segments = collect_stream_segments(&segments, &opts.stream)?;

            #[cfg(feature = "strict-contiguity")]
            verify_contiguous(&stream_segments)?;

            let segment_count = stream_segments.len() as i32;
            let mut total_plain_size: i64 = 0;
            let mut total_encrypted_size: i64 = 0;
            for (_, segment) in &stream_segments {
                total_plain_size += i64::from(segment.plain_size);
                total_encrypted_size += i64::from(segment.encrypted_size);
            }
            let fixed_segment_size = if stream_segments.is_empty() {
                0
            } else {
                let first = stream_segments[0].1.encrypted_size;
                let all_but_last = &stream_segments[..stream_segments.len() - 1];
                if all_but_last.iter().all(|(_, s)| s.encrypted_size == first) {
                    first
                } else {
                    -1
                }
            };

            let key = object_key(
                &opts.stream.project_id,
                &opts.stream.bucket_name,
                &opts.stream.object_key,
                opts.stream.version,
            );
            let mut record: ObjectRecord = match objects.get(key.as_slice())? {
                Some(guard) => bincode::deserialize(guard.value())?,
                None => {
                    return Err(Error::object_not_found(
                        "object with specified version and pending status is missing",
                    ))
                }
            };
            if record.stream_id != *opts.stream.stream_id.as_bytes()
                || record.status != ObjectStatus::Pending
            {
                return Err(Error::object_not_found(
                    "object with specified version and pending status is missing",
                ));
            }

            record.status = ObjectStatus::Committed;
            record.segment_count = segment_count;
            record.encrypted_metadata_nonce = opts.encrypted_metadata_nonce;
            record.encrypted_metadata = opts.encrypted_metadata;
            record.encrypted_metadata_encrypted_key = opts.encrypted_metadata_encrypted_key;
            record.total_plain_size = total_plain_size;
            record.total_encrypted_size = total_encrypted_size;
            record.fixed_segment_size = fixed_segment_size;
            record.zombie_deadline_micros = None;
            objects.insert(key.as_slice(), bincode::serialize(&record)?.as_slice())?;

            record.into_object(opts.stream.clone())
        };
        check_cancel(cancel)?;
        wtx.commit()?;

        debug!(
            location = %opts.stream.location(),
            segments = object.segment_count,
            "committed object"
        );
        Ok(object)
    }

    /// Replace the metadata of a committed object.
    pub async fn update_object_metadata(
        &self,
        cancel: &CancellationToken,
        opts: UpdateObjectMetadata,
    ) -> Result<()> {
        opts.stream.verify()?;
        if opts.stream.version <= 0 {
            return Err(Error::invalid_request(format!(
                "Version invalid: {}",
                opts.stream.version
            )));
        }
        check_cancel(cancel)?;

        let wtx = self.db.begin_write()?;
        {
            let mut objects = wtx.open_table(OBJECTS)?;

            let key = object_key(
                &opts.stream.project_id,
                &opts.stream.bucket_name,
                &opts.stream.object_key,
                opts.stream.version,
            );
            let mut record: ObjectRecord = match objects.get(key.as_slice())? {
                Some(guard) => bincode::deserialize(guard.value())?,
                None => {
                    return Err(Error::object_not_found(
                        "object with specified version and committed status is missing",
                    ))
                }
            };
            if record.stream_id != *opts.stream.stream_id.as_bytes()
                || record.status != ObjectStatus::Committed
            {
                return Err(Error::object_not_found(
                    "object with specified version and committed status is missing",
                ));
            }

            record.encrypted_metadata_nonce = opts.encrypted_metadata_nonce;
            record.encrypted_metadata = opts.encrypted_metadata;
            record.encrypted_metadata_encrypted_key = opts.encrypted_metadata_encrypted_key;
            objects.insert(key.as_slice(), bincode::serialize(&record)?.as_slice())?;
        }
        check_cancel(cancel)?;
        wtx.commit()?;
        Ok(())
    }
}

fn pending_record(
    stream: &ObjectStream,
    encryption: &EncryptionParameters,
    expires_at: Option<DateTime<Utc>>,
    zombie_deletion_deadline: Option<DateTime<Utc>>,
) -> ObjectRecord {
    ObjectRecord {
        stream_id: *stream.stream_id.as_bytes(),
        status: ObjectStatus::Pending,
        created_at_micros: Utc::now().timestamp_micros(),
        expires_at_micros: expires_at.map(|t| t.timestamp_micros()),
        zombie_deadline_micros: zombie_deletion_deadline.map(|t| t.timestamp_micros()),
        encryption: *encryption,
        segment_count: 0,
        encrypted_metadata_nonce: Vec::new(),
        encrypted_metadata: Vec::new(),
        encrypted_metadata_encrypted_key: Vec::new(),
        total_plain_size: 0,
        total_encrypted_size: 0,
        fixed_segment_size: 0,
    }
}

/// Fetch the object row for `stream`, requiring pending status and a
/// matching stream ID.
fn fetch_pending(
    objects: &impl ReadableTable<&'static [u8], &'static [u8]>,
    stream: &ObjectStream,
) -> Result<ObjectRecord> {
    let key = object_key(
        &stream.project_id,
        &stream.bucket_name,
        &stream.object_key,
        stream.version,
    );
    let record: ObjectRecord = match objects.get(key.as_slice())? {
        Some(guard) => bincode::deserialize(guard.value())?,
        None => return Err(Error::object_not_found("pending object missing")),
    };
    if record.stream_id != *stream.stream_id.as_bytes() || record.status != ObjectStatus::Pending {
        return Err(Error::object_not_found("pending object missing"));
    }
    Ok(record)
}

/// Read all of a stream's segments in position order.
fn collect_stream_segments(
    segments: &impl ReadableTable<&'static [u8], &'static [u8]>,
    stream: &ObjectStream,
) -> Result<Vec<(Position, SegmentRecord)>> {
    let prefix = *stream.stream_id.as_bytes();
    let mut out = Vec::new();
    for entry in segments.range(prefix.as_slice()..)? {
        let (key, value) = entry?;
        if !key.value().starts_with(&prefix) {
            break;
        }
        let position = crate::store::position_from_segment_key(key.value());
        let record: SegmentRecord = bincode::deserialize(value.value())?;
        out.push((position, record));
    }
    Ok(out)
}

#[cfg(feature = "strict-contiguity")]
fn verify_contiguous(segments: &[(Position, SegmentRecord)]) -> Result<()> {
    let mut offset: i64 = 0;
    for (i, (position, segment)) in segments.iter().enumerate() {
        if position.part == 0 && position.index != i as u32 {
            return Err(Error::invalid_request(format!(
                "expected segment (0,{}), found ({},{})",
                i, position.part, position.index
            )));
        }
        if segment.plain_offset != offset {
            return Err(Error::invalid_request(format!(
                "segment {} should be at plain offset {}, offset is {}",
                position, offset, segment.plain_offset
            )));
        }
        offset += i64::from(segment.plain_size);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_common::{Piece, ProjectId, StreamId};
    use tempfile::TempDir;

    fn open_metabase() -> (TempDir, Metabase) {
        let dir = TempDir::new().unwrap();
        let metabase = Metabase::open(dir.path().join("metabase.redb")).unwrap();
        (dir, metabase)
    }

    fn encryption() -> EncryptionParameters {
        EncryptionParameters {
            cipher_suite: CipherSuite::AesGcm,
            block_size: 256,
        }
    }

    fn stream(version: i64) -> ObjectStream {
        ObjectStream {
            project_id: ProjectId::new(),
            bucket_name: b"testbucket".to_vec(),
            object_key: b"test/object".to_vec(),
            version,
            stream_id: StreamId::new(),
        }
    }

    fn redundancy() -> RedundancyScheme {
        RedundancyScheme::new(256, 3, 4, 4, 5)
    }

    fn pieces() -> Pieces {
        (0..5u16)
            .map(|number| Piece {
                number,
                storage_node: orbit_common::NodeId::new(),
            })
            .collect()
    }

    async fn begin_exact(metabase: &Metabase, stream: &ObjectStream) {
        metabase
            .begin_object_exact_version(
                &CancellationToken::new(),
                BeginObjectExactVersion {
                    stream: stream.clone(),
                    encryption: encryption(),
                    expires_at: None,
                    zombie_deletion_deadline: None,
                },
            )
            .await
            .unwrap();
    }

    async fn commit_remote_segment(
        metabase: &Metabase,
        stream: &ObjectStream,
        position: Position,
        plain_offset: i64,
        plain_size: i32,
        encrypted_size: i32,
    ) {
        metabase
            .commit_segment(
                &CancellationToken::new(),
                CommitSegment {
                    stream: stream.clone(),
                    position,
                    root_piece_id: PieceId::random(),
                    encrypted_key_nonce: vec![1; 24],
                    encrypted_key: vec![2; 48],
                    plain_offset,
                    plain_size,
                    encrypted_size,
                    redundancy: redundancy(),
                    pieces: pieces(),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_version_auto_assignment() {
        let (_dir, metabase) = open_metabase();
        let cancel = CancellationToken::new();

        let base = stream(NEXT_VERSION);
        for expected in 1..=3i64 {
            let mut s = base.clone();
            s.stream_id = StreamId::new();
            let version = metabase
                .begin_object_next_version(
                    &cancel,
                    BeginObjectNextVersion {
                        stream: s,
                        encryption: encryption(),
                        expires_at: None,
                        zombie_deletion_deadline: None,
                    },
                )
                .await
                .unwrap();
            assert_eq!(version, expected);
        }
    }

    #[tokio::test]
    async fn test_begin_object_next_version_validation() {
        let (_dir, metabase) = open_metabase();
        let cancel = CancellationToken::new();

        // missing encryption
        let err = metabase
            .begin_object_next_version(
                &cancel,
                BeginObjectNextVersion {
                    stream: stream(NEXT_VERSION),
                    encryption: EncryptionParameters::default(),
                    expires_at: None,
                    zombie_deletion_deadline: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        // explicit version not allowed
        let err = metabase
            .begin_object_next_version(
                &cancel,
                BeginObjectNextVersion {
                    stream: stream(4),
                    encryption: encryption(),
                    expires_at: None,
                    zombie_deletion_deadline: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        // zero block size
        let err = metabase
            .begin_object_next_version(
                &cancel,
                BeginObjectNextVersion {
                    stream: stream(NEXT_VERSION),
                    encryption: EncryptionParameters {
                        cipher_suite: CipherSuite::AesGcm,
                        block_size: 0,
                    },
                    expires_at: None,
                    zombie_deletion_deadline: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_begin_object_exact_version_conflict() {
        let (_dir, metabase) = open_metabase();
        let cancel = CancellationToken::new();

        let s = stream(5);
        begin_exact(&metabase, &s).await;

        // same key and version again, different stream
        let mut duplicate = s.clone();
        duplicate.stream_id = StreamId::new();
        let err = metabase
            .begin_object_exact_version(
                &cancel,
                BeginObjectExactVersion {
                    stream: duplicate,
                    encryption: encryption(),
                    expires_at: None,
                    zombie_deletion_deadline: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // sentinel version rejected
        let err = metabase
            .begin_object_exact_version(
                &cancel,
                BeginObjectExactVersion {
                    stream: stream(NEXT_VERSION),
                    encryption: encryption(),
                    expires_at: None,
                    zombie_deletion_deadline: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_next_version_continues_after_exact() {
        let (_dir, metabase) = open_metabase();
        let cancel = CancellationToken::new();

        let s = stream(5);
        begin_exact(&metabase, &s).await;

        let mut next = s.clone();
        next.version = NEXT_VERSION;
        next.stream_id = StreamId::new();
        let version = metabase
            .begin_object_next_version(
                &cancel,
                BeginObjectNextVersion {
                    stream: next,
                    encryption: encryption(),
                    expires_at: None,
                    zombie_deletion_deadline: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(version, 6);
    }

    #[tokio::test]
    async fn test_begin_segment() {
        let (_dir, metabase) = open_metabase();
        let cancel = CancellationToken::new();

        let s = stream(1);
        begin_exact(&metabase, &s).await;

        metabase
            .begin_segment(
                &cancel,
                BeginSegment {
                    stream: s.clone(),
                    position: Position::new(0, 0),
                    root_piece_id: PieceId::random(),
                    pieces: pieces(),
                },
            )
            .await
            .unwrap();

        // zero root piece id
        let err = metabase
            .begin_segment(
                &cancel,
                BeginSegment {
                    stream: s.clone(),
                    position: Position::new(0, 0),
                    root_piece_id: PieceId::from_bytes([0u8; 32]),
                    pieces: pieces(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        // unknown object
        let err = metabase
            .begin_segment(
                &cancel,
                BeginSegment {
                    stream: stream(1),
                    position: Position::new(0, 0),
                    root_piece_id: PieceId::random(),
                    pieces: pieces(),
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_commit_segment_conflict_on_duplicate_position() {
        let (_dir, metabase) = open_metabase();
        let cancel = CancellationToken::new();

        let s = stream(1);
        begin_exact(&metabase, &s).await;
        commit_remote_segment(&metabase, &s, Position::new(0, 0), 0, 100, 256).await;

        let err = metabase
            .commit_segment(
                &cancel,
                CommitSegment {
                    stream: s.clone(),
                    position: Position::new(0, 0),
                    root_piece_id: PieceId::random(),
                    encrypted_key_nonce: vec![1; 24],
                    encrypted_key: vec![2; 48],
                    plain_offset: 0,
                    plain_size: 100,
                    encrypted_size: 256,
                    redundancy: redundancy(),
                    pieces: pieces(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_commit_segment_requires_pending_object() {
        let (_dir, metabase) = open_metabase();
        let cancel = CancellationToken::new();

        let s = stream(1);
        begin_exact(&metabase, &s).await;
        metabase
            .commit_object(
                &cancel,
                CommitObject {
                    stream: s.clone(),
                    encrypted_metadata_nonce: Vec::new(),
                    encrypted_metadata: Vec::new(),
                    encrypted_metadata_encrypted_key: Vec::new(),
                },
            )
            .await
            .unwrap();

        let err = metabase
            .commit_segment(
                &cancel,
                CommitSegment {
                    stream: s.clone(),
                    position: Position::new(0, 0),
                    root_piece_id: PieceId::random(),
                    encrypted_key_nonce: vec![1; 24],
                    encrypted_key: vec![2; 48],
                    plain_offset: 0,
                    plain_size: 100,
                    encrypted_size: 256,
                    redundancy: redundancy(),
                    pieces: pieces(),
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_commit_object_aggregates() {
        let (_dir, metabase) = open_metabase();
        let cancel = CancellationToken::new();

        let s = stream(1);
        begin_exact(&metabase, &s).await;
        commit_remote_segment(&metabase, &s, Position::new(0, 0), 0, 100, 256).await;
        commit_remote_segment(&metabase, &s, Position::new(0, 1), 100, 100, 256).await;
        commit_remote_segment(&metabase, &s, Position::new(0, 2), 200, 50, 128).await;

        let object = metabase
            .commit_object(
                &cancel,
                CommitObject {
                    stream: s.clone(),
                    encrypted_metadata_nonce: vec![7; 24],
                    encrypted_metadata: vec![8; 64],
                    encrypted_metadata_encrypted_key: vec![9; 48],
                },
            )
            .await
            .unwrap();

        assert_eq!(object.status, ObjectStatus::Committed);
        assert_eq!(object.segment_count, 3);
        assert_eq!(object.total_plain_size, 250);
        assert_eq!(object.total_encrypted_size, 640);
        assert_eq!(object.fixed_segment_size, 256);
        assert_eq!(object.encrypted_metadata, vec![8; 64]);
        assert!(object.zombie_deletion_deadline.is_none());
    }

    #[tokio::test]
    async fn test_commit_object_mixed_sizes() {
        let (_dir, metabase) = open_metabase();
        let cancel = CancellationToken::new();

        let s = stream(1);
        begin_exact(&metabase, &s).await;
        commit_remote_segment(&metabase, &s, Position::new(0, 0), 0, 100, 256).await;
        commit_remote_segment(&metabase, &s, Position::new(0, 1), 100, 100, 200).await;
        commit_remote_segment(&metabase, &s, Position::new(0, 2), 200, 50, 128).await;

        let object = metabase
            .commit_object(
                &cancel,
                CommitObject {
                    stream: s.clone(),
                    encrypted_metadata_nonce: Vec::new(),
                    encrypted_metadata: Vec::new(),
                    encrypted_metadata_encrypted_key: Vec::new(),
                },
            )
            .await
            .unwrap();
        assert_eq!(object.fixed_segment_size, -1);
    }

    #[tokio::test]
    async fn test_commit_object_without_segments() {
        let (_dir, metabase) = open_metabase();
        let cancel = CancellationToken::new();

        let s = stream(1);
        begin_exact(&metabase, &s).await;

        let object = metabase
            .commit_object(
                &cancel,
                CommitObject {
                    stream: s.clone(),
                    encrypted_metadata_nonce: Vec::new(),
                    encrypted_metadata: Vec::new(),
                    encrypted_metadata_encrypted_key: Vec::new(),
                },
            )
            .await
            .unwrap();

        assert_eq!(object.segment_count, 0);
        assert_eq!(object.total_plain_size, 0);
        assert_eq!(object.total_encrypted_size, 0);
        assert_eq!(object.fixed_segment_size, 0);
    }

    #[tokio::test]
    async fn test_commit_object_only_once() {
        let (_dir, metabase) = open_metabase();
        let cancel = CancellationToken::new();

        let s = stream(1);
        begin_exact(&metabase, &s).await;

        metabase
            .commit_object(
                &cancel,
                CommitObject {
                    stream: s.clone(),
                    encrypted_metadata_nonce: Vec::new(),
                    encrypted_metadata: Vec::new(),
                    encrypted_metadata_encrypted_key: Vec::new(),
                },
            )
            .await
            .unwrap();

        let err = metabase
            .commit_object(
                &cancel,
                CommitObject {
                    stream: s.clone(),
                    encrypted_metadata_nonce: Vec::new(),
                    encrypted_metadata: Vec::new(),
                    encrypted_metadata_encrypted_key: Vec::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_commit_inline_segment_sets_encrypted_size() {
        let (_dir, metabase) = open_metabase();
        let cancel = CancellationToken::new();

        let s = stream(1);
        begin_exact(&metabase, &s).await;
        metabase
            .commit_inline_segment(
                &cancel,
                CommitInlineSegment {
                    stream: s.clone(),
                    position: Position::new(0, 0),
                    encrypted_key_nonce: vec![1; 24],
                    encrypted_key: vec![2; 48],
                    plain_offset: 0,
                    plain_size: 64,
                    inline_data: vec![3; 80],
                },
            )
            .await
            .unwrap();

        let object = metabase
            .commit_object(
                &cancel,
                CommitObject {
                    stream: s.clone(),
                    encrypted_metadata_nonce: Vec::new(),
                    encrypted_metadata: Vec::new(),
                    encrypted_metadata_encrypted_key: Vec::new(),
                },
            )
            .await
            .unwrap();
        assert_eq!(object.total_encrypted_size, 80);
        assert_eq!(object.total_plain_size, 64);
        assert_eq!(object.fixed_segment_size, 80);
    }

    #[tokio::test]
    async fn test_update_object_metadata() {
        let (_dir, metabase) = open_metabase();
        let cancel = CancellationToken::new();

        let s = stream(1);
        begin_exact(&metabase, &s).await;

        // pending object cannot be updated
        let err = metabase
            .update_object_metadata(
                &cancel,
                UpdateObjectMetadata {
                    stream: s.clone(),
                    encrypted_metadata_nonce: vec![1],
                    encrypted_metadata: vec![2],
                    encrypted_metadata_encrypted_key: vec![3],
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        metabase
            .commit_object(
                &cancel,
                CommitObject {
                    stream: s.clone(),
                    encrypted_metadata_nonce: Vec::new(),
                    encrypted_metadata: Vec::new(),
                    encrypted_metadata_encrypted_key: Vec::new(),
                },
            )
            .await
            .unwrap();

        // repeated identical updates are idempotent
        for _ in 0..2 {
            metabase
                .update_object_metadata(
                    &cancel,
                    UpdateObjectMetadata {
                        stream: s.clone(),
                        encrypted_metadata_nonce: vec![1],
                        encrypted_metadata: vec![2],
                        encrypted_metadata_encrypted_key: vec![3],
                    },
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_cancelled_operation_has_no_effect() {
        let (_dir, metabase) = open_metabase();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = metabase
            .begin_object_exact_version(
                &cancel,
                BeginObjectExactVersion {
                    stream: stream(1),
                    encryption: encryption(),
                    expires_at: None,
                    zombie_deletion_deadline: None,
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
