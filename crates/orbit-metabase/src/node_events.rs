//! Node-event outbox.
//!
//! Events about storage nodes (offline, disqualified, ...) are queued here
//! and drained by an external email worker. `get_next_batch` hands out one
//! (email, event) group at a time so a single notification can cover all
//! affected nodes of one operator.

use chrono::{DateTime, Utc};
use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use orbit_common::{Error, NodeId, Result};

use crate::store::{node_event_key, Metabase, NODE_EVENTS};
use crate::types::datetime_from_micros;

/// What happened to a node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeEventType {
    Online,
    Offline,
    Disqualified,
    UnknownAuditSuspended,
    UnknownAuditUnsuspended,
    OfflineSuspended,
    OfflineUnsuspended,
    BelowMinVersion,
}

/// One outbox row
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeEvent {
    pub id: Uuid,
    pub email: String,
    pub node_id: NodeId,
    pub event: NodeEventType,
    pub created_at: DateTime<Utc>,
    pub email_sent: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct NodeEventRecord {
    id: [u8; 16],
    email: String,
    node_id: [u8; 16],
    event: NodeEventType,
    created_at_micros: i64,
    email_sent_micros: Option<i64>,
}

impl NodeEventRecord {
    fn into_event(self) -> NodeEvent {
        NodeEvent {
            id: Uuid::from_bytes(self.id),
            email: self.email,
            node_id: NodeId::from_bytes(self.node_id),
            event: self.event,
            created_at: datetime_from_micros(self.created_at_micros),
            email_sent: self.email_sent_micros.map(datetime_from_micros),
        }
    }
}

impl Metabase {
    /// Queue a node event.
    pub async fn insert_node_event(
        &self,
        cancel: &CancellationToken,
        email: &str,
        node_id: NodeId,
        event: NodeEventType,
    ) -> Result<NodeEvent> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let record = NodeEventRecord {
            id: *Uuid::new_v4().as_bytes(),
            email: email.to_string(),
            node_id: *node_id.as_bytes(),
            event,
            created_at_micros: Utc::now().timestamp_micros(),
            email_sent_micros: None,
        };
        let key = node_event_key(record.created_at_micros, &Uuid::from_bytes(record.id));

        let wtx = self.db.begin_write()?;
        {
            let mut events = wtx.open_table(NODE_EVENTS)?;
            events.insert(key.as_slice(), bincode::serialize(&record)?.as_slice())?;
        }
        wtx.commit()?;

        debug!(%node_id, ?event, "queued node event");
        Ok(record.into_event())
    }

    /// Latest queued event for an (email, event) pair.
    pub async fn get_latest_by_email_and_event(
        &self,
        cancel: &CancellationToken,
        email: &str,
        event: NodeEventType,
    ) -> Result<NodeEvent> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let rtx = self.db.begin_read()?;
        let events = rtx.open_table(NODE_EVENTS)?;
        for entry in events.iter()?.rev() {
            let (_, value) = entry?;
            let record: NodeEventRecord = bincode::deserialize(value.value())?;
            if record.email == email && record.event == event {
                return Ok(record.into_event());
            }
        }
        Err(Error::object_not_found("node event missing"))
    }

    /// Next batch of events to combine into one email: all unsent events
    /// sharing the (email, event) pair of the oldest unsent event first seen
    /// before `first_seen_before`.
    pub async fn get_next_batch(
        &self,
        cancel: &CancellationToken,
        first_seen_before: DateTime<Utc>,
    ) -> Result<Vec<NodeEvent>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let cutoff_micros = first_seen_before.timestamp_micros();

        let rtx = self.db.begin_read()?;
        let events = rtx.open_table(NODE_EVENTS)?;

        // The table iterates in creation order, so the first unsent row old
        // enough defines the group.
        let mut group: Option<(String, NodeEventType)> = None;
        let mut batch = Vec::new();
        for entry in events.iter()? {
            let (_, value) = entry?;
            let record: NodeEventRecord = bincode::deserialize(value.value())?;
            if record.email_sent_micros.is_some() {
                continue;
            }
            match &group {
                None => {
                    if record.created_at_micros <= cutoff_micros {
                        group = Some((record.email.clone(), record.event));
                        batch.push(record.into_event());
                    }
                }
                Some((email, event)) => {
                    if record.email == *email && record.event == *event {
                        batch.push(record.into_event());
                    }
                }
            }
        }
        Ok(batch)
    }

    /// Mark a group of events as emailed.
    pub async fn update_email_sent(
        &self,
        cancel: &CancellationToken,
        ids: &[Uuid],
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let wtx = self.db.begin_write()?;
        {
            let mut events = wtx.open_table(NODE_EVENTS)?;

            let mut updates: Vec<(Vec<u8>, NodeEventRecord)> = Vec::new();
            for entry in events.iter()? {
                let (key, value) = entry?;
                let record: NodeEventRecord = bincode::deserialize(value.value())?;
                if ids.contains(&Uuid::from_bytes(record.id)) {
                    updates.push((key.value().to_vec(), record));
                }
            }
            for (key, mut record) in updates {
                record.email_sent_micros = Some(timestamp.timestamp_micros());
                events.insert(key.as_slice(), bincode::serialize(&record)?.as_slice())?;
            }
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        wtx.commit()?;
        Ok(())
    }
}
