//! # Reader
//!
//! Pulls batches of vote events for one consumer of one consumer group.
use std::time::Duration;

use tracing::{debug, info};
use vote_common::stream::{EventLog, GroupRead, GroupStatus, StreamError, StreamMessage};

/// Reads batches from a consumer group, one round trip per call.
///
/// Before each blocking read the reader claims messages that have been pending in the group
/// for at least `claim_idle`, whichever consumer they were delivered to, so events left
/// unacknowledged after exhausting their retries (or owned by a consumer that died) are
/// delivered again.
pub struct MessageReader<'a, E: EventLog> {
    event_log: &'a E,
    stream: String,
    group: String,
    consumer: String,
    batch_size: usize,
    block: Duration,
    claim_idle: Option<Duration>,
}

impl<'a, E: EventLog> MessageReader<'a, E> {
    pub fn new(
        event_log: &'a E,
        stream: &str,
        group: &str,
        consumer: &str,
        batch_size: usize,
        block: Duration,
    ) -> Self {
        Self {
            event_log,
            stream: stream.to_owned(),
            group: group.to_owned(),
            consumer: consumer.to_owned(),
            batch_size,
            block,
            claim_idle: None,
        }
    }

    /// Enable claiming messages pending for at least `idle`.
    pub fn claim_pending_after(mut self, idle: Duration) -> Self {
        self.claim_idle = Some(idle);
        self
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    fn group_read(&self) -> GroupRead<'_> {
        GroupRead {
            stream: &self.stream,
            group: &self.group,
            consumer: &self.consumer,
            count: self.batch_size,
            block: self.block,
        }
    }

    /// Create the consumer group if it does not exist yet.
    pub async fn ensure_group(&self) -> Result<GroupStatus, StreamError> {
        let status = self
            .event_log
            .ensure_group(&self.stream, &self.group)
            .await?;

        match status {
            GroupStatus::Created => info!(
                stream = self.stream,
                group = self.group,
                "consumer group created"
            ),
            GroupStatus::AlreadyExists => info!(
                stream = self.stream,
                group = self.group,
                "consumer group already exists"
            ),
        }

        Ok(status)
    }

    /// Return the next batch for this consumer, empty if nothing arrived within the block
    /// duration. Errors are returned as-is, never retried here.
    pub async fn next_batch(&self) -> Result<Vec<StreamMessage>, StreamError> {
        let read = self.group_read();

        if let Some(idle) = self.claim_idle {
            let claimed = self.event_log.claim_pending(&read, idle).await?;
            if !claimed.is_empty() {
                info!(
                    consumer = self.consumer,
                    count = claimed.len(),
                    "claimed pending messages"
                );
                metrics::counter!("vote_consumer_messages_claimed_total")
                    .increment(claimed.len() as u64);
                return Ok(claimed);
            }
        }

        let batch = self.event_log.read_group(&read).await?;
        debug!(consumer = self.consumer, count = batch.len(), "batch read");

        Ok(batch)
    }

    pub async fn ack(&self, message_id: &str) -> Result<(), StreamError> {
        self.event_log
            .ack(&self.stream, &self.group, message_id)
            .await
    }
}
