//! # Stream
//!
//! Client for the vote event log: a Redis Stream read through a consumer group.
//!
//! Reads are at-least-once. Anything returned by `read_group` or `claim_pending` stays
//! pending in the group until `ack` is called for its id, and may be handed out again.
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, RedisError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::vote::VoteEvent;

/// Extra time granted to a blocking read on top of its BLOCK argument before the client
/// gives up on the response.
const RESPONSE_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Enumeration of errors for operations against the event log.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: RedisError },
    #[error("{command} failed with: {error}")]
    CommandError {
        command: &'static str,
        error: RedisError,
    },
    #[error("event log is unavailable: {0}")]
    Unavailable(String),
}

impl StreamError {
    fn command(command: &'static str) -> impl FnOnce(RedisError) -> StreamError {
        move |error| StreamError::CommandError { command, error }
    }
}

/// Milliseconds in `duration`, saturating at `max` when they do not fit a command argument.
fn clamped_millis<T: TryFrom<u128>>(duration: Duration, max: T) -> T {
    T::try_from(duration.as_millis()).unwrap_or(max)
}

/// One entry of the stream, as delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Broker-assigned id, unique and increasing within the stream.
    pub id: String,
    /// Field/value pairs of the entry. Values that are not valid strings are dropped.
    pub fields: HashMap<String, String>,
}

impl From<StreamId> for StreamMessage {
    fn from(entry: StreamId) -> Self {
        let fields = entry
            .map
            .iter()
            .filter_map(|(field, value)| match redis::from_redis_value::<String>(value) {
                Ok(value) => Some((field.clone(), value)),
                Err(error) => {
                    warn!(message_id = entry.id, field, %error, "dropping undecodable stream field");
                    None
                }
            })
            .collect();

        StreamMessage {
            id: entry.id,
            fields,
        }
    }
}

/// Whether `ensure_group` created the consumer group or found it in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Created,
    AlreadyExists,
}

/// Parameters of a single consumer group read.
#[derive(Debug, Clone)]
pub struct GroupRead<'a> {
    pub stream: &'a str,
    pub group: &'a str,
    pub consumer: &'a str,
    /// Upper bound on the number of messages returned.
    pub count: usize,
    /// How long to wait for new messages. Zero means do not wait at all.
    pub block: Duration,
}

/// The event log operations the vote pipeline relies on.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Create the consumer group (and the stream) unless the group already exists.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupStatus, StreamError>;

    /// Read messages never delivered to any consumer of the group.
    /// Returns an empty batch if none arrive within `read.block`.
    async fn read_group(&self, read: &GroupRead<'_>) -> Result<Vec<StreamMessage>, StreamError>;

    /// Transfer to `read.consumer` up to `read.count` messages that have been pending in the
    /// group for at least `min_idle`, and return them. Never blocks.
    async fn claim_pending(
        &self,
        read: &GroupRead<'_>,
        min_idle: Duration,
    ) -> Result<Vec<StreamMessage>, StreamError>;

    /// Acknowledge a message, removing it from the group's pending entries.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StreamError>;

    /// Append a vote to the stream, returning its id. This is what producers call.
    async fn append(&self, stream: &str, event: &VoteEvent) -> Result<String, StreamError>;

    /// Release the client. No further calls can be made.
    async fn close(self);
}

/// An `EventLog` backed by Redis Streams over a multiplexed connection.
pub struct RedisEventLog {
    connection: MultiplexedConnection,
}

impl RedisEventLog {
    /// Connect to Redis and verify the connection with a PING.
    ///
    /// `max_block` is the longest BLOCK any read will use; the response timeout is set above
    /// it so blocking reads are not cut short by the client.
    pub async fn connect(url: &str, max_block: Duration) -> Result<Self, StreamError> {
        let client =
            redis::Client::open(url).map_err(|error| StreamError::ConnectionError { error })?;

        let config = redis::AsyncConnectionConfig::new()
            .set_connection_timeout(CONNECTION_TIMEOUT)
            .set_response_timeout(max_block + RESPONSE_TIMEOUT_MARGIN);

        let mut connection = client
            .get_multiplexed_async_connection_with_config(&config)
            .await
            .map_err(|error| StreamError::ConnectionError { error })?;

        redis::cmd("PING")
            .query_async::<String>(&mut connection)
            .await
            .map_err(|error| StreamError::ConnectionError { error })?;

        info!("redis event log client connected");

        Ok(Self { connection })
    }
}

#[async_trait]
impl EventLog for RedisEventLog {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupStatus, StreamError> {
        let mut conn = self.connection.clone();

        match conn
            .xgroup_create_mkstream::<_, _, _, ()>(stream, group, "0")
            .await
        {
            Ok(()) => Ok(GroupStatus::Created),
            Err(error) if error.code() == Some("BUSYGROUP") => Ok(GroupStatus::AlreadyExists),
            Err(error) => Err(StreamError::CommandError {
                command: "XGROUP CREATE",
                error,
            }),
        }
    }

    async fn read_group(&self, read: &GroupRead<'_>) -> Result<Vec<StreamMessage>, StreamError> {
        let mut conn = self.connection.clone();

        let mut options = StreamReadOptions::default()
            .group(read.group, read.consumer)
            .count(read.count);
        if !read.block.is_zero() {
            options = options.block(clamped_millis(read.block, usize::MAX));
        }

        // A BLOCK that times out replies with nil rather than an empty array.
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[read.stream], &[">"], &options)
            .await
            .map_err(StreamError::command("XREADGROUP"))?;

        let messages: Vec<StreamMessage> = reply
            .into_iter()
            .flat_map(|reply| reply.keys)
            .flat_map(|key| key.ids)
            .map(StreamMessage::from)
            .collect();

        debug!(
            stream = read.stream,
            count = messages.len(),
            "messages read"
        );

        Ok(messages)
    }

    async fn claim_pending(
        &self,
        read: &GroupRead<'_>,
        min_idle: Duration,
    ) -> Result<Vec<StreamMessage>, StreamError> {
        let mut conn = self.connection.clone();

        let options = StreamAutoClaimOptions::default().count(read.count);
        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(
                read.stream,
                read.group,
                read.consumer,
                clamped_millis(min_idle, u64::MAX),
                "0-0",
                options,
            )
            .await
            .map_err(StreamError::command("XAUTOCLAIM"))?;

        if !reply.deleted_ids.is_empty() {
            // Entries trimmed from the stream while pending can never be processed.
            warn!(
                stream = read.stream,
                deleted = reply.deleted_ids.len(),
                "pending entries no longer exist in the stream"
            );
        }

        Ok(reply
            .claimed
            .into_iter()
            .map(StreamMessage::from)
            .collect())
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StreamError> {
        let mut conn = self.connection.clone();

        conn.xack::<_, _, _, i64>(stream, group, &[id])
            .await
            .map_err(StreamError::command("XACK"))?;

        debug!(message_id = id, "message acked");

        Ok(())
    }

    async fn append(&self, stream: &str, event: &VoteEvent) -> Result<String, StreamError> {
        let mut conn = self.connection.clone();

        let fields = event.to_fields();
        let id: String = conn
            .xadd(stream, "*", fields.as_slice())
            .await
            .map_err(StreamError::command("XADD"))?;

        Ok(id)
    }

    async fn close(self) {
        info!("closing redis event log client");
        drop(self.connection);
        info!("redis event log client closed");
    }
}
