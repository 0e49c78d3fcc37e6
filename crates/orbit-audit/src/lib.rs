//! Orbit audit — audit orchestration and piece reverification.
//!
//! A reservoir chore periodically samples segments and hands batches to the
//! in-memory [`QueuePair`] (or the durable [`VerifyQueue`]). Audit workers
//! drain one queue at a time; pieces that fail to answer promptly get a
//! [`PieceLocator`] queued for reverification, where the [`Reverifier`]
//! decides the terminal outcome.
//!
//! [`PieceLocator`]: orbit_common::PieceLocator

pub mod chore;
pub mod config;
pub mod pieces;
pub mod queue;
pub mod reverifier;
pub mod reverify_queue;
pub mod verify_queue;
pub mod worker;

pub use chore::{ReservoirChore, SegmentSampler};
pub use config::AuditConfig;
pub use pieces::{PieceReader, PieceStore, PieceStoreError, ReputationReporter};
pub use queue::{Queue, QueuePair, Segment};
pub use reverifier::{Outcome, Reverifier};
pub use reverify_queue::{DurableReverifyQueue, ReverificationJob, ReverifyQueue};
pub use verify_queue::{DurableVerifyQueue, VerifyQueue};
pub use worker::{AuditReport, AuditWorker, ReverifyWorker, StripeAuditor};
