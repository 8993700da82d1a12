//! Startup and shutdown ordering of the vote consumer.
//!
//! Resources are opened in order (event log, then counter store), the consumer group is
//! ensured, and the consumption loop runs until the shutdown token is cancelled. Whatever
//! was opened is then closed in the same order: event log first, counter store last.
use std::future::Future;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use vote_common::counter::{CounterStore, PgCounterStore};
use vote_common::health::HealthHandle;
use vote_common::stream::{EventLog, RedisEventLog};

use crate::config::Config;
use crate::consumer::{ConsumerLoop, ConsumerSettings, ConsumerSummary};
use crate::error::ConsumerError;

/// Cancel `shutdown` on the first SIGINT or SIGTERM.
pub fn install_shutdown_signals(shutdown: CancellationToken) -> Result<(), ConsumerError> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|error| ConsumerError::SignalHandler("SIGTERM", error))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|error| ConsumerError::SignalHandler("SIGINT", error))?;

    let received = async move {
        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    };
    tokio::spawn(cancel_on(received, shutdown));

    Ok(())
}

/// Wait for `signal` to resolve, then request a cooperative shutdown.
pub async fn cancel_on<F: Future<Output = ()>>(signal: F, shutdown: CancellationToken) {
    signal.await;
    info!("shutdown requested, finishing current work");
    shutdown.cancel();
}

/// Connect to Redis and PostgreSQL as configured and run the consumer until shutdown.
pub async fn start(
    config: &Config,
    shutdown: CancellationToken,
    liveness: HealthHandle,
) -> Result<ConsumerSummary, ConsumerError> {
    let settings = ConsumerSettings::from(config);

    let event_log = RedisEventLog::connect(&config.redis_url, settings.block).await?;

    let counter = match PgCounterStore::connect(&config.database_url, &config.pool_config()).await
    {
        Ok(counter) => counter,
        Err(error) => {
            event_log.close().await;
            return Err(error.into());
        }
    };

    run_pipeline(event_log, counter, &settings, shutdown, liveness).await
}

/// Run the consumer over already opened resources, and close them once it stops.
///
/// Both resources are closed whether the run succeeded or failed to start, event log first.
pub async fn run_pipeline<E: EventLog, C: CounterStore>(
    event_log: E,
    counter: C,
    settings: &ConsumerSettings,
    shutdown: CancellationToken,
    liveness: HealthHandle,
) -> Result<ConsumerSummary, ConsumerError> {
    let outcome = consume(&event_log, &counter, settings, shutdown, liveness).await;

    if let Err(error) = &outcome {
        error!(%error, "vote consumer failed to start");
    }

    event_log.close().await;
    counter.close().await;
    info!("vote consumer resources closed");

    outcome
}

async fn consume<E: EventLog, C: CounterStore>(
    event_log: &E,
    counter: &C,
    settings: &ConsumerSettings,
    shutdown: CancellationToken,
    liveness: HealthHandle,
) -> Result<ConsumerSummary, ConsumerError> {
    for tally in counter.counts().await? {
        info!(
            option = %tally.option,
            count = tally.count,
            updated_at = %tally.updated_at,
            "current tally"
        );
    }

    let consumer = ConsumerLoop::new(event_log, counter, settings, liveness);
    consumer.ensure_group().await?;

    Ok(consumer.run(shutdown).await)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_signal_cancels_token() {
        let shutdown = CancellationToken::new();

        cancel_on(std::future::ready(()), shutdown.clone()).await;

        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_token_untouched_until_signal() {
        let shutdown = CancellationToken::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(cancel_on(
            async move {
                rx.await.unwrap();
            },
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!shutdown.is_cancelled());

        tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(shutdown.is_cancelled());
    }
}
