use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vote_common::counter::CounterStore;
use vote_common::health::HealthHandle;
use vote_common::retry::RetryPolicy;
use vote_common::stream::{EventLog, GroupStatus, StreamError};

use crate::config::Config;
use crate::processor::MessageProcessor;
use crate::reader::MessageReader;

/// Extra time granted on top of the longest expected iteration before liveness fails.
const LIVENESS_MARGIN: Duration = Duration::from_secs(30);

/// Pause after an empty non-blocking read, so an idle stream is not polled in a busy loop.
const IDLE_PAUSE: Duration = Duration::from_millis(100);

/// Everything the consumption loop needs to know, independent of where it came from.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub batch_size: usize,
    pub block: Duration,
    pub claim_idle: Option<Duration>,
    pub retry_policy: RetryPolicy,
    pub read_error_backoff: Duration,
}

impl ConsumerSettings {
    /// How long one loop iteration may take at worst: a full block, or a read error pause,
    /// followed by a batch where every event exhausts its retries.
    pub fn liveness_deadline(&self) -> Duration {
        let batch_backoff = self
            .retry_policy
            .total_backoff()
            .saturating_mul(self.batch_size.try_into().unwrap_or(u32::MAX));

        self.block.max(self.read_error_backoff) + batch_backoff + LIVENESS_MARGIN
    }
}

impl From<&Config> for ConsumerSettings {
    fn from(config: &Config) -> Self {
        Self {
            stream: config.stream_name.as_str().to_owned(),
            group: config.consumer_group.as_str().to_owned(),
            consumer: config.consumer_name.as_str().to_owned(),
            batch_size: config.batch_size.get(),
            block: config.block.0,
            claim_idle: config.claim_idle(),
            retry_policy: config.retry_policy(),
            read_error_backoff: config.read_error_backoff.0,
        }
    }
}

/// What happened to the events seen by one run of the loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerSummary {
    /// Non-empty batches read.
    pub batches: u64,
    /// Events that reached a disposition.
    pub processed: u64,
    pub acked: u64,
    /// Events whose ack was attempted and failed. They stay pending.
    pub ack_failures: u64,
    /// Events left pending because their retries were exhausted.
    pub left_pending: u64,
    /// Events of the last batch skipped because a stop was requested.
    pub unprocessed: u64,
    pub read_errors: u64,
}

/// Reads batches and processes their events in order, acknowledging every event that
/// reached a terminal disposition, until asked to stop.
pub struct ConsumerLoop<'a, E: EventLog, C: CounterStore> {
    reader: MessageReader<'a, E>,
    processor: MessageProcessor<'a, C>,
    read_error_backoff: Duration,
    /// Wait between empty reads. Zero when the read itself blocks.
    idle_pause: Duration,
    liveness: HealthHandle,
}

impl<'a, E: EventLog, C: CounterStore> ConsumerLoop<'a, E, C> {
    pub fn new(
        event_log: &'a E,
        counter: &'a C,
        settings: &ConsumerSettings,
        liveness: HealthHandle,
    ) -> Self {
        let mut reader = MessageReader::new(
            event_log,
            &settings.stream,
            &settings.group,
            &settings.consumer,
            settings.batch_size,
            settings.block,
        );
        if let Some(idle) = settings.claim_idle {
            reader = reader.claim_pending_after(idle);
        }

        Self {
            reader,
            processor: MessageProcessor::new(counter, settings.retry_policy.clone()),
            read_error_backoff: settings.read_error_backoff,
            idle_pause: if settings.block.is_zero() {
                IDLE_PAUSE
            } else {
                Duration::ZERO
            },
            liveness,
        }
    }

    pub async fn ensure_group(&self) -> Result<GroupStatus, StreamError> {
        self.reader.ensure_group().await
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// A stop request is only observed between events and between reads: a blocking read
    /// or an event in its retry loop always completes first. Events of the current batch
    /// not yet processed when the stop is observed are left pending.
    pub async fn run(&self, shutdown: CancellationToken) -> ConsumerSummary {
        let mut summary = ConsumerSummary::default();

        info!(
            stream = self.reader.stream(),
            group = self.reader.group(),
            consumer = self.reader.consumer(),
            "starting consumer loop"
        );

        while !shutdown.is_cancelled() {
            self.liveness.report_healthy();

            let batch = match self.reader.next_batch().await {
                Ok(batch) => batch,
                Err(error) => {
                    error!(%error, "failed to read batch, will retry");
                    metrics::counter!("vote_consumer_read_errors_total").increment(1);
                    summary.read_errors += 1;

                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(self.read_error_backoff) => {}
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                if !self.idle_pause.is_zero() {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(self.idle_pause) => {}
                    }
                }
                continue;
            }

            summary.batches += 1;
            metrics::histogram!("vote_consumer_batch_size").record(batch.len() as f64);

            for (position, message) in batch.iter().enumerate() {
                if shutdown.is_cancelled() {
                    let remaining = batch.len() - position;
                    info!(remaining, "stop requested, leaving rest of batch pending");
                    summary.unprocessed += remaining as u64;
                    break;
                }

                let disposition = self.processor.process(message).await;
                summary.processed += 1;

                if !disposition.should_ack() {
                    summary.left_pending += 1;
                    continue;
                }

                match self.reader.ack(&message.id).await {
                    Ok(()) => {
                        metrics::counter!("vote_consumer_acks_total").increment(1);
                        summary.acked += 1;
                    }
                    Err(error) => {
                        warn!(message_id = message.id, %error, "failed to ack message");
                        metrics::counter!("vote_consumer_ack_failures_total").increment(1);
                        summary.ack_failures += 1;
                    }
                }
            }
        }

        info!(
            processed = summary.processed,
            acked = summary.acked,
            left_pending = summary.left_pending,
            unprocessed = summary.unprocessed,
            "consumer loop stopped"
        );

        summary
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;
    use std::time::Instant;

    use vote_common::health::HealthRegistry;
    use vote_common::test_utils::{MemoryCounterStore, MemoryEventLog};
    use vote_common::vote::VoteOption;

    use super::*;

    fn settings() -> ConsumerSettings {
        ConsumerSettings {
            stream: "votes".to_owned(),
            group: "vote-processors".to_owned(),
            consumer: "consumer-1".to_owned(),
            batch_size: 10,
            block: Duration::from_millis(10),
            claim_idle: None,
            retry_policy: RetryPolicy::build(NonZeroU32::new(3).unwrap())
                .base_delay(Duration::from_millis(1))
                .provide(),
            read_error_backoff: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_liveness_deadline_covers_worst_iteration() {
        let settings = ConsumerSettings {
            block: Duration::from_secs(5),
            batch_size: 10,
            retry_policy: RetryPolicy::default(),
            ..settings()
        };

        // 5s block + 10 events * (0.5s + 1s) of backoff + margin
        assert_eq!(
            settings.liveness_deadline(),
            Duration::from_secs(5 + 15) + LIVENESS_MARGIN
        );
    }

    #[tokio::test]
    async fn test_zero_block_pauses_between_empty_reads() {
        let log = MemoryEventLog::new();
        let store = MemoryCounterStore::new();
        let settings = ConsumerSettings {
            block: Duration::ZERO,
            ..settings()
        };
        let registry = HealthRegistry::new("liveness");
        let consumer = ConsumerLoop::new(
            &log,
            &store,
            &settings,
            registry.register("consumer", Duration::from_secs(30)),
        );
        consumer.ensure_group().await.unwrap();

        let token = CancellationToken::new();
        let stopper = async {
            tokio::time::sleep(Duration::from_millis(250)).await;
            token.cancel();
        };
        let start = Instant::now();
        tokio::join!(consumer.run(token.clone()), stopper);

        // One read per idle pause, and the pause does not delay the stop.
        assert!(log.reads() >= 1);
        assert!(log.reads() <= 4, "idle loop read {} times", log.reads());
        assert!(start.elapsed() < Duration::from_millis(250) + IDLE_PAUSE);
    }

    #[tokio::test]
    async fn test_zero_block_still_picks_up_new_events() {
        let log = MemoryEventLog::new();
        let store = MemoryCounterStore::new();
        let settings = ConsumerSettings {
            block: Duration::ZERO,
            ..settings()
        };
        let registry = HealthRegistry::new("liveness");
        let consumer = ConsumerLoop::new(
            &log,
            &store,
            &settings,
            registry.register("consumer", Duration::from_secs(30)),
        );
        consumer.ensure_group().await.unwrap();

        let token = CancellationToken::new();
        let producer = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            log.append_fields("votes", &[("option", "dogs")]);
            while log.acked().is_empty() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            token.cancel();
        };
        let (summary, ()) = tokio::join!(consumer.run(token.clone()), producer);

        assert_eq!(summary.acked, 1);
        assert_eq!(store.count(VoteOption::Dogs), 1);
    }

    #[tokio::test]
    async fn test_stops_immediately_when_already_cancelled() {
        let log = MemoryEventLog::new();
        let store = MemoryCounterStore::new();
        let registry = HealthRegistry::new("liveness");
        let consumer = ConsumerLoop::new(
            &log,
            &store,
            &settings(),
            registry.register("consumer", Duration::from_secs(30)),
        );
        consumer.ensure_group().await.unwrap();
        log.append_fields("votes", &[("option", "cats")]);

        let token = CancellationToken::new();
        token.cancel();
        let summary = consumer.run(token).await;

        assert_eq!(summary, ConsumerSummary::default());
        assert_eq!(log.reads(), 0);
        assert_eq!(store.count(VoteOption::Cats), 0);
    }

    #[tokio::test]
    async fn test_reports_liveness_while_running() {
        let log = MemoryEventLog::new();
        let store = MemoryCounterStore::new();
        let registry = HealthRegistry::new("liveness");
        let consumer = ConsumerLoop::new(
            &log,
            &store,
            &settings(),
            registry.register("consumer", Duration::from_secs(30)),
        );
        consumer.ensure_group().await.unwrap();
        assert!(!registry.get_status().healthy);

        let token = CancellationToken::new();
        let stopper = async {
            while log.reads() == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            assert!(registry.get_status().healthy);
            token.cancel();
        };

        tokio::join!(consumer.run(token.clone()), stopper);
    }
}
