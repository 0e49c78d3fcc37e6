//! Durable verify queue.
//!
//! The persistent sibling of the in-memory [`QueuePair`]: used when the
//! sampling rate exceeds what memory buffers should hold. Rows are claimed
//! oldest-first; a claim deletes the row in the same transaction, so under
//! concurrent workers each row is handed to exactly one caller.
//!
//! [`QueuePair`]: crate::queue::QueuePair

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use orbit_common::{Error, Position, Result, StreamId};

use crate::queue::Segment;

/// Claim-ordered rows: `inserted_at(8) | stream_id(16) | position(8)` →
/// bincode(VerifyEntryRecord)
const VERIFY_BY_TIME: TableDefinition<&[u8], &[u8]> = TableDefinition::new("verify_queue");
/// Idempotence index: `stream_id(16) | position(8)` → time key
const VERIFY_INDEX: TableDefinition<&[u8], &[u8]> = TableDefinition::new("verify_queue_index");

/// Durable queue of segments awaiting audit
#[async_trait]
pub trait VerifyQueue: Send + Sync {
    /// Enqueue segments, at most `max_batch_size` rows per transaction.
    /// Segments already queued are silently ignored.
    async fn push(
        &self,
        cancel: &CancellationToken,
        segments: &[Segment],
        max_batch_size: usize,
    ) -> Result<()>;

    /// Claim and delete the oldest row. [`Error::EmptyQueue`] when drained.
    async fn next(&self, cancel: &CancellationToken) -> Result<Segment>;
}

#[derive(Serialize, Deserialize)]
struct VerifyEntryRecord {
    expires_at_micros: Option<i64>,
    encrypted_size: i32,
}

/// redb-backed [`VerifyQueue`]
#[derive(Clone)]
pub struct DurableVerifyQueue {
    db: Arc<Database>,
}

impl DurableVerifyQueue {
    /// Open (or create) the queue at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path.as_ref())?;

        let wtx = db.begin_write()?;
        wtx.open_table(VERIFY_BY_TIME)?;
        wtx.open_table(VERIFY_INDEX)?;
        wtx.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Number of queued segments
    pub fn len(&self) -> Result<u64> {
        let rtx = self.db.begin_read()?;
        let index = rtx.open_table(VERIFY_INDEX)?;
        Ok(index.len()?)
    }

    /// Check whether the queue is empty
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn time_key(inserted_at_micros: i64, stream_id: &StreamId, position: Position) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[..8].copy_from_slice(&(inserted_at_micros as u64).to_be_bytes());
    out[8..24].copy_from_slice(stream_id.as_bytes());
    out[24..].copy_from_slice(&position.to_bytes());
    out
}

fn index_key(stream_id: &StreamId, position: Position) -> [u8; 24] {
    let mut out = [0u8; 24];
    out[..16].copy_from_slice(stream_id.as_bytes());
    out[16..].copy_from_slice(&position.to_bytes());
    out
}

fn segment_from_time_key(key: &[u8], record: &VerifyEntryRecord) -> Segment {
    let stream: [u8; 16] = key[8..24].try_into().expect("16-byte stream id");
    let position: [u8; 8] = key[24..32].try_into().expect("8-byte position");
    Segment {
        stream_id: StreamId::from_bytes(stream),
        position: Position::from_bytes(position),
        expires_at: record
            .expires_at_micros
            .map(|micros| chrono::DateTime::from_timestamp_micros(micros).unwrap_or_default()),
        encrypted_size: record.encrypted_size,
    }
}

#[async_trait]
impl VerifyQueue for DurableVerifyQueue {
    async fn push(
        &self,
        cancel: &CancellationToken,
        segments: &[Segment],
        max_batch_size: usize,
    ) -> Result<()> {
        if max_batch_size == 0 {
            return Err(Error::invalid_request("max_batch_size must be positive"));
        }

        for chunk in segments.chunks(max_batch_size) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let wtx = self.db.begin_write()?;
            {
                let mut by_time = wtx.open_table(VERIFY_BY_TIME)?;
                let mut index = wtx.open_table(VERIFY_INDEX)?;

                let now_micros = Utc::now().timestamp_micros();
                for segment in chunk {
                    let ikey = index_key(&segment.stream_id, segment.position);
                    if index.get(ikey.as_slice())?.is_some() {
                        continue;
                    }
                    let tkey = time_key(now_micros, &segment.stream_id, segment.position);
                    let record = VerifyEntryRecord {
                        expires_at_micros: segment.expires_at.map(|t| t.timestamp_micros()),
                        encrypted_size: segment.encrypted_size,
                    };
                    by_time.insert(tkey.as_slice(), bincode::serialize(&record)?.as_slice())?;
                    index.insert(ikey.as_slice(), tkey.as_slice())?;
                }
            }
            wtx.commit()?;
        }

        debug!(count = segments.len(), "pushed segments into verify queue");
        Ok(())
    }

    async fn next(&self, cancel: &CancellationToken) -> Result<Segment> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let wtx = self.db.begin_write()?;
        let segment = {
            let mut by_time = wtx.open_table(VERIFY_BY_TIME)?;
            let mut index = wtx.open_table(VERIFY_INDEX)?;

            let head: Option<(Vec<u8>, VerifyEntryRecord)> = {
                let mut rows = by_time.iter()?;
                match rows.next() {
                    Some(entry) => {
                        let (key, value) = entry?;
                        Some((key.value().to_vec(), bincode::deserialize(value.value())?))
                    }
                    None => None,
                }
            };

            let Some((key, record)) = head else {
                return Err(Error::EmptyQueue);
            };
            let segment = segment_from_time_key(&key, &record);

            by_time.remove(key.as_slice())?;
            index.remove(index_key(&segment.stream_id, segment.position).as_slice())?;
            segment
        };
        wtx.commit()?;
        Ok(segment)
    }
}
