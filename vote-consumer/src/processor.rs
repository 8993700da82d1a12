//! # Processor
//!
//! Turns one stream message into exactly one `Disposition`.
use std::time::Instant;

use tracing::{error, info, warn};
use vote_common::counter::{CounterError, CounterStore};
use vote_common::retry::RetryPolicy;
use vote_common::stream::StreamMessage;
use vote_common::vote::{VoteEvent, VoteEventError, VoteOption};

/// The terminal outcome of processing one message.
#[derive(Debug)]
pub enum Disposition {
    /// The vote was counted.
    Success { option: VoteOption, new_count: i64 },
    /// The message can never be counted, no matter how many times it is delivered.
    PermanentlyInvalid(VoteEventError),
    /// Every increment attempt failed. A later delivery may still succeed.
    RetriesExhausted {
        attempts: u32,
        last_error: CounterError,
    },
}

impl Disposition {
    /// Whether the message is done with and should be removed from the pending entries.
    pub fn should_ack(&self) -> bool {
        match self {
            Disposition::Success { .. } | Disposition::PermanentlyInvalid(_) => true,
            Disposition::RetriesExhausted { .. } => false,
        }
    }

    /// Label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Disposition::Success { .. } => "success",
            Disposition::PermanentlyInvalid(_) => "permanently_invalid",
            Disposition::RetriesExhausted { .. } => "retries_exhausted",
        }
    }
}

/// Validates vote messages and applies them to a `CounterStore`, retrying failed increments
/// with linear backoff.
pub struct MessageProcessor<'a, C: CounterStore> {
    counter: &'a C,
    retry_policy: RetryPolicy,
}

impl<'a, C: CounterStore> MessageProcessor<'a, C> {
    pub fn new(counter: &'a C, retry_policy: RetryPolicy) -> Self {
        Self {
            counter,
            retry_policy,
        }
    }

    pub async fn process(&self, message: &StreamMessage) -> Disposition {
        let start = Instant::now();

        let disposition = match VoteEvent::from_fields(&message.fields) {
            Ok(event) => self.count_vote(&message.id, &event).await,
            Err(error) => {
                warn!(message_id = message.id, %error, "dropping invalid vote event");
                Disposition::PermanentlyInvalid(error)
            }
        };

        let labels = [("disposition", disposition.label())];
        metrics::counter!("vote_consumer_events_total", &labels).increment(1);
        metrics::histogram!("vote_consumer_processing_duration_seconds", &labels)
            .record(start.elapsed().as_secs_f64());

        disposition
    }

    async fn count_vote(&self, message_id: &str, event: &VoteEvent) -> Disposition {
        let mut attempt = 1;

        loop {
            metrics::counter!("vote_consumer_increment_attempts_total").increment(1);

            match self.counter.increment(event.option).await {
                Ok(count) => {
                    info!(
                        message_id,
                        option = %count.option,
                        new_count = count.count,
                        attempt,
                        request_id = event.request_id.as_deref(),
                        captured_at = ?event.captured_at(),
                        "vote counted"
                    );
                    return Disposition::Success {
                        option: count.option,
                        new_count: count.count,
                    };
                }
                Err(error) if self.retry_policy.has_attempts_left(attempt) => {
                    let wait = self.retry_policy.retry_interval(attempt);
                    warn!(
                        message_id,
                        option = %event.option,
                        attempt,
                        %error,
                        "increment failed, retrying in {:?}",
                        wait
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(error) => {
                    error!(
                        message_id,
                        option = %event.option,
                        attempts = attempt,
                        %error,
                        "increment failed on every attempt, leaving event pending"
                    );
                    return Disposition::RetriesExhausted {
                        attempts: attempt,
                        last_error: error,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;
    use std::time::Duration;

    use vote_common::test_utils::MemoryCounterStore;

    use super::*;

    fn policy(attempts: u32, base_delay_ms: u64) -> RetryPolicy {
        RetryPolicy::build(NonZeroU32::new(attempts).unwrap())
            .base_delay(Duration::from_millis(base_delay_ms))
            .provide()
    }

    fn message(id: &str, fields: &[(&str, &str)]) -> StreamMessage {
        StreamMessage {
            id: id.to_owned(),
            fields: fields
                .iter()
                .map(|(field, value)| (field.to_string(), value.to_string()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_valid_vote_is_counted() {
        let store = MemoryCounterStore::with_counts(&[(VoteOption::Cats, 5), (VoteOption::Dogs, 3)]);
        let processor = MessageProcessor::new(&store, policy(3, 1));

        let disposition = processor
            .process(&message("1-0", &[("option", "cats"), ("request_id", "r1")]))
            .await;

        assert!(matches!(
            disposition,
            Disposition::Success {
                option: VoteOption::Cats,
                new_count: 6
            }
        ));
        assert!(disposition.should_ack());
        assert_eq!(store.count(VoteOption::Dogs), 3);
    }

    #[tokio::test]
    async fn test_invalid_votes_never_touch_the_store() {
        let store = MemoryCounterStore::new();
        let processor = MessageProcessor::new(&store, policy(3, 1));

        let unknown = processor
            .process(&message("1-0", &[("option", "parrots")]))
            .await;
        let missing = processor
            .process(&message("2-0", &[("timestamp", "1700000000000")]))
            .await;
        let wrong_case = processor.process(&message("3-0", &[("option", "Cats")])).await;

        assert!(matches!(
            unknown,
            Disposition::PermanentlyInvalid(VoteEventError::UnknownOption(ref o)) if o == "parrots"
        ));
        assert!(matches!(
            missing,
            Disposition::PermanentlyInvalid(VoteEventError::MissingOption)
        ));
        assert!(matches!(wrong_case, Disposition::PermanentlyInvalid(_)));
        assert!(unknown.should_ack() && missing.should_ack());
        assert!(store.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_metadata_is_not_invalid() {
        let store = MemoryCounterStore::new();
        let processor = MessageProcessor::new(&store, policy(1, 1));

        let disposition = processor
            .process(&message(
                "1-0",
                &[("option", "dogs"), ("timestamp", "yesterday"), ("request_id", "")],
            ))
            .await;

        assert!(matches!(disposition, Disposition::Success { new_count: 1, .. }));
    }

    #[tokio::test]
    async fn test_succeeds_on_later_attempt() {
        let store = MemoryCounterStore::new();
        store.fail_next(2);
        let processor = MessageProcessor::new(&store, policy(3, 1));

        let disposition = processor.process(&message("1-0", &[("option", "dogs")])).await;

        assert!(matches!(disposition, Disposition::Success { new_count: 1, .. }));
        assert_eq!(store.attempts().len(), 3);
        assert_eq!(store.count(VoteOption::Dogs), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_with_linear_backoff() {
        let base = Duration::from_millis(20);
        let store = MemoryCounterStore::new();
        store.set_unavailable(true);
        let processor = MessageProcessor::new(&store, policy(3, 20));

        let start = Instant::now();
        let disposition = processor.process(&message("1-0", &[("option", "dogs")])).await;
        let elapsed = start.elapsed();

        assert!(matches!(
            disposition,
            Disposition::RetriesExhausted { attempts: 3, .. }
        ));
        assert!(!disposition.should_ack());
        assert!(elapsed >= base * 3);
        assert_eq!(store.count(VoteOption::Dogs), 0);

        let attempts = store.attempts();
        assert_eq!(attempts.len(), 3);
        let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps[0] >= base);
        assert!(gaps[1] >= base * 2);
    }

    #[tokio::test]
    async fn test_single_attempt_does_not_sleep() {
        let store = MemoryCounterStore::new();
        store.set_unavailable(true);
        let processor = MessageProcessor::new(&store, policy(1, 10_000));

        let start = Instant::now();
        let disposition = processor.process(&message("1-0", &[("option", "cats")])).await;

        assert!(matches!(
            disposition,
            Disposition::RetriesExhausted { attempts: 1, .. }
        ));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
