//! Durable reverification queue.
//!
//! Pieces that failed to answer promptly during audit wait here for
//! follow-up. Claims are leases: a claimed job becomes claimable again once
//! the lease expires, bounding the damage of a crashed worker. Re-inserting
//! a queued locator merges into the existing job and bumps its reinsertion
//! counter, which is what eventually surfaces a never-answering node for
//! disqualification.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use orbit_common::{Error, NodeId, PieceLocator, Position, Result, StreamId};

/// Jobs: `stream_id(16) | position(8) | node_id(16) | piece_num(2)` →
/// bincode(JobRecord)
const REVERIFY_JOBS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("reverify_queue");

/// One queued reverification
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReverificationJob {
    pub locator: PieceLocator,
    pub inserted_at: DateTime<Utc>,
    /// When the job was last claimed
    pub last_attempt: Option<DateTime<Utc>>,
    /// How many times the locator was re-inserted while already queued
    pub reverify_count: i32,
}

/// Durable queue of pieces awaiting reverification
#[async_trait]
pub trait ReverifyQueue: Send + Sync {
    /// Queue a piece for reverification; a duplicate locator merges into the
    /// existing job, incrementing its reinsertion counter.
    async fn insert(&self, cancel: &CancellationToken, piece: &PieceLocator) -> Result<()>;

    /// Claim the oldest job whose lease is free. Concurrent claimants never
    /// receive the same job. [`Error::EmptyQueue`] when nothing is
    /// claimable.
    async fn get_next_job(&self, cancel: &CancellationToken) -> Result<ReverificationJob>;

    /// Delete the job for `piece`; returns whether a row existed.
    async fn remove(&self, cancel: &CancellationToken, piece: &PieceLocator) -> Result<bool>;
}

#[derive(Clone, Serialize, Deserialize)]
struct JobRecord {
    inserted_at_micros: i64,
    last_attempt_micros: Option<i64>,
    reverify_count: i32,
}

impl JobRecord {
    fn into_job(self, locator: PieceLocator) -> ReverificationJob {
        ReverificationJob {
            locator,
            inserted_at: datetime_from_micros(self.inserted_at_micros),
            last_attempt: self.last_attempt_micros.map(datetime_from_micros),
            reverify_count: self.reverify_count,
        }
    }
}

fn datetime_from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

fn job_key(locator: &PieceLocator) -> [u8; 42] {
    let mut out = [0u8; 42];
    out[..16].copy_from_slice(locator.stream_id.as_bytes());
    out[16..24].copy_from_slice(&locator.position.to_bytes());
    out[24..40].copy_from_slice(locator.node_id.as_bytes());
    out[40..].copy_from_slice(&locator.piece_num.to_be_bytes());
    out
}

fn locator_from_job_key(key: &[u8]) -> PieceLocator {
    let stream: [u8; 16] = key[..16].try_into().expect("16-byte stream id");
    let position: [u8; 8] = key[16..24].try_into().expect("8-byte position");
    let node: [u8; 16] = key[24..40].try_into().expect("16-byte node id");
    let piece_num: [u8; 2] = key[40..42].try_into().expect("2-byte piece number");
    PieceLocator {
        stream_id: StreamId::from_bytes(stream),
        position: Position::from_bytes(position),
        node_id: NodeId::from_bytes(node),
        piece_num: u16::from_be_bytes(piece_num),
    }
}

/// redb-backed [`ReverifyQueue`]
#[derive(Clone)]
pub struct DurableReverifyQueue {
    db: Arc<Database>,
    lease_micros: i64,
}

impl DurableReverifyQueue {
    /// Open (or create) the queue at `path`. `retry_interval` is the claim
    /// lease duration.
    pub fn open(path: impl AsRef<Path>, retry_interval: Duration) -> Result<Self> {
        let db = Database::create(path.as_ref())?;

        let wtx = db.begin_write()?;
        wtx.open_table(REVERIFY_JOBS)?;
        wtx.commit()?;

        Ok(Self {
            db: Arc::new(db),
            lease_micros: retry_interval.as_micros() as i64,
        })
    }
}

#[async_trait]
impl ReverifyQueue for DurableReverifyQueue {
    async fn insert(&self, cancel: &CancellationToken, piece: &PieceLocator) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let key = job_key(piece);
        let wtx = self.db.begin_write()?;
        {
            let mut jobs = wtx.open_table(REVERIFY_JOBS)?;

            let record = match jobs.get(key.as_slice())? {
                Some(guard) => {
                    let mut existing: JobRecord = bincode::deserialize(guard.value())?;
                    existing.reverify_count += 1;
                    existing
                }
                None => JobRecord {
                    inserted_at_micros: Utc::now().timestamp_micros(),
                    last_attempt_micros: None,
                    reverify_count: 0,
                },
            };
            jobs.insert(key.as_slice(), bincode::serialize(&record)?.as_slice())?;
        }
        wtx.commit()?;

        debug!(node_id = %piece.node_id, piece_num = piece.piece_num, "queued reverification");
        Ok(())
    }

    async fn get_next_job(&self, cancel: &CancellationToken) -> Result<ReverificationJob> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let now_micros = Utc::now().timestamp_micros();

        let wtx = self.db.begin_write()?;
        let job = {
            let mut jobs = wtx.open_table(REVERIFY_JOBS)?;

            // oldest job whose lease is free
            let claimed: Option<(Vec<u8>, JobRecord)> = {
                let mut best: Option<(Vec<u8>, JobRecord)> = None;
                for entry in jobs.iter()? {
                    let (key, value) = entry?;
                    let record: JobRecord = bincode::deserialize(value.value())?;
                    let leased = matches!(
                        record.last_attempt_micros,
                        Some(at) if at + self.lease_micros > now_micros
                    );
                    if leased {
                        continue;
                    }
                    let older = match &best {
                        Some((_, current)) => {
                            record.inserted_at_micros < current.inserted_at_micros
                        }
                        None => true,
                    };
                    if older {
                        best = Some((key.value().to_vec(), record));
                    }
                }
                best
            };

            let Some((key, mut record)) = claimed else {
                return Err(Error::EmptyQueue);
            };
            record.last_attempt_micros = Some(now_micros);
            jobs.insert(key.as_slice(), bincode::serialize(&record)?.as_slice())?;
            record.into_job(locator_from_job_key(&key))
        };
        wtx.commit()?;
        Ok(job)
    }

    async fn remove(&self, cancel: &CancellationToken, piece: &PieceLocator) -> Result<bool> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let key = job_key(piece);
        let wtx = self.db.begin_write()?;
        let existed = {
            let mut jobs = wtx.open_table(REVERIFY_JOBS)?;
            let removed = jobs.remove(key.as_slice())?.is_some();
            removed
        };
        wtx.commit()?;
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_queue(retry_interval: Duration) -> (TempDir, DurableReverifyQueue) {
        let dir = TempDir::new().unwrap();
        let queue =
            DurableReverifyQueue::open(dir.path().join("reverify.redb"), retry_interval).unwrap();
        (dir, queue)
    }

    fn locator(piece_num: u16) -> PieceLocator {
        PieceLocator {
            stream_id: StreamId::new(),
            position: Position::new(0, 0),
            node_id: NodeId::new(),
            piece_num,
        }
    }

    #[tokio::test]
    async fn test_insert_and_claim() {
        let (_dir, queue) = open_queue(Duration::from_secs(3600));
        let cancel = CancellationToken::new();

        let piece = locator(0);
        queue.insert(&cancel, &piece).await.unwrap();

        let job = queue.get_next_job(&cancel).await.unwrap();
        assert_eq!(job.locator, piece);
        assert_eq!(job.reverify_count, 0);
        assert!(job.last_attempt.is_some());

        // claimed: nothing else claimable within the lease
        assert!(matches!(
            queue.get_next_job(&cancel).await,
            Err(Error::EmptyQueue)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_insert_merges() {
        let (_dir, queue) = open_queue(Duration::from_secs(3600));
        let cancel = CancellationToken::new();

        let piece = locator(0);
        queue.insert(&cancel, &piece).await.unwrap();
        queue.insert(&cancel, &piece).await.unwrap();

        // one row with a bumped counter, not two rows
        let job = queue.get_next_job(&cancel).await.unwrap();
        assert_eq!(job.reverify_count, 1);
        assert!(matches!(
            queue.get_next_job(&cancel).await,
            Err(Error::EmptyQueue)
        ));
    }

    #[tokio::test]
    async fn test_lease_expiry_reclaims() {
        let (_dir, queue) = open_queue(Duration::from_millis(10));
        let cancel = CancellationToken::new();

        let piece = locator(0);
        queue.insert(&cancel, &piece).await.unwrap();

        queue.get_next_job(&cancel).await.unwrap();
        assert!(matches!(
            queue.get_next_job(&cancel).await,
            Err(Error::EmptyQueue)
        ));

        tokio::time::sleep(Duration::from_millis(30)).await;
        let reclaimed = queue.get_next_job(&cancel).await.unwrap();
        assert_eq!(reclaimed.locator, piece);
    }

    #[tokio::test]
    async fn test_claims_oldest_first() {
        let (_dir, queue) = open_queue(Duration::from_secs(3600));
        let cancel = CancellationToken::new();

        let first = locator(0);
        queue.insert(&cancel, &first).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = locator(1);
        queue.insert(&cancel, &second).await.unwrap();

        assert_eq!(queue.get_next_job(&cancel).await.unwrap().locator, first);
        assert_eq!(queue.get_next_job(&cancel).await.unwrap().locator, second);
    }

    #[tokio::test]
    async fn test_remove_reports_existence() {
        let (_dir, queue) = open_queue(Duration::from_secs(3600));
        let cancel = CancellationToken::new();

        let piece = locator(0);
        queue.insert(&cancel, &piece).await.unwrap();

        assert!(queue.remove(&cancel, &piece).await.unwrap());
        assert!(!queue.remove(&cancel, &piece).await.unwrap());
    }
}
