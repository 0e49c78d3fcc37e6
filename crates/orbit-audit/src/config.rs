//! Audit subsystem configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the audit chore, workers and queues
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditConfig {
    /// How often the reservoir chore produces a new batch
    pub queue_interval: Duration,
    /// Number of concurrent audit workers
    pub worker_concurrency: usize,
    /// Delay before an idle worker polls the queues again
    pub worker_poll_interval: Duration,
    /// Claim lease on reverification jobs; a crashed worker's claim expires
    /// after this long
    pub reverification_retry_interval: Duration,
    /// Transient reverification outcomes beyond this count surface the node
    /// for disqualification
    pub max_reverify_count: i32,
    /// Row-batch size for pushes into the durable verify queue
    pub verify_push_batch_size: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            queue_interval: Duration::from_secs(60 * 60),
            worker_concurrency: 2,
            worker_poll_interval: Duration::from_secs(10),
            reverification_retry_interval: Duration::from_secs(4 * 60 * 60),
            max_reverify_count: 3,
            verify_push_batch_size: 1000,
        }
    }
}
